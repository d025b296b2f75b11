use std::path::PathBuf;

use anyhow::{anyhow, Result};
use candle_core::Device;
use hf_hub::api::tokio::Api;

use crate::chat::{ChatSpec, Glm4Loader};
use crate::flux::{self, FluxLoader, FluxSpec};
use crate::{ChatLike, Loader, ModelLike};

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    Flux,
    Glm4,
}

impl ModelType {
    /// Detect model type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("GLM") {
            Some(ModelType::Glm4)
        } else if name_upper.contains("FLUX")
            || name_upper.contains("SCHNELL")
            || names_dev_variant(&name_upper)
        {
            Some(ModelType::Flux)
        } else {
            None
        }
    }
}

/// `dev` on its own or as the `-dev`/`.dev` tail of a hub id, so names that
/// merely contain the letters (e.g. "device") do not match.
fn names_dev_variant(name_upper: &str) -> bool {
    let last = name_upper.rsplit('/').next().unwrap_or(name_upper);
    last == "DEV" || last.ends_with("-DEV") || last.ends_with(".DEV") || last.ends_with("_DEV")
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    Flux(flux::FluxVariant),
    Glm4,
}

impl ModelVariant {
    /// Detect model variant from model name. Bare aliases (`schnell`, `dev`)
    /// are accepted as well as hub ids.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        match ModelType::from_name(model_name)? {
            ModelType::Glm4 => Some(ModelVariant::Glm4),
            ModelType::Flux => Some(ModelVariant::Flux(if name_upper.contains("SCHNELL") {
                flux::FluxVariant::Schnell
            } else if names_dev_variant(&name_upper) {
                flux::FluxVariant::Dev
            } else {
                flux::FluxVariant::Schnell // Default to Schnell if no specific variant is found
            })),
        }
    }
}

/// Load an image model based on its name, automatically detecting the
/// appropriate loader
pub async fn load_image_model(
    model_name: &str,
    quantize: bool,
    local_path: Option<PathBuf>,
    loras: Vec<(PathBuf, f64)>,
    api: Api,
    device: Device,
) -> Result<Box<dyn ModelLike>> {
    let model_type = ModelType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model type: {}", model_name))?;
    let model_variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    tracing::info!(
        model = model_name,
        kind = ?model_type,
        variant = ?model_variant,
        "loading image model"
    );

    match model_variant {
        ModelVariant::Flux(variant) => {
            let spec = FluxSpec {
                variant,
                quantize,
                local_path,
                loras,
            };
            let model = FluxLoader::load(spec, api, device).await?;
            Ok(Box::new(model))
        }
        ModelVariant::Glm4 => Err(anyhow!(
            "Model type {:?}/variant {:?} is a chat model, not an image model",
            model_type,
            model_variant
        )),
    }
}

/// Load a chat model; only GLM-4 checkpoints are recognized.
pub async fn load_chat_model(
    spec: ChatSpec,
    api: Api,
    device: Device,
) -> Result<Box<dyn ChatLike>> {
    match ModelType::from_name(&spec.model_id) {
        Some(ModelType::Glm4) => {
            tracing::info!(model = %spec.model_id, "loading chat model");
            let model = Glm4Loader::load(spec, api, device).await?;
            Ok(Box::new(model))
        }
        other => Err(anyhow!(
            "Model {} (detected type: {:?}) is not a supported chat model",
            spec.model_id,
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FluxVariant;

    #[test]
    fn hub_ids_and_aliases_resolve() {
        assert_eq!(
            ModelVariant::from_name("black-forest-labs/FLUX.1-dev"),
            Some(ModelVariant::Flux(FluxVariant::Dev))
        );
        assert_eq!(
            ModelVariant::from_name("black-forest-labs/FLUX.1-schnell"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
        assert_eq!(
            ModelVariant::from_name("schnell"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
        assert_eq!(
            ModelVariant::from_name("flux"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
        assert_eq!(
            ModelVariant::from_name("THUDM/glm-4-9b-chat"),
            Some(ModelVariant::Glm4)
        );
        assert_eq!(ModelVariant::from_name("stable-diffusion-v1-5"), None);
    }

    #[test]
    fn dev_only_matches_as_a_variant_name() {
        assert_eq!(
            ModelVariant::from_name("dev"),
            Some(ModelVariant::Flux(FluxVariant::Dev))
        );
        assert_eq!(
            ModelVariant::from_name("someone/flux1-dev"),
            Some(ModelVariant::Flux(FluxVariant::Dev))
        );
        assert_eq!(ModelType::from_name("my-device-model"), None);
        assert_eq!(ModelType::from_name("devops/sdxl"), None);
        // a FLUX repo whose name mentions "device" is still schnell
        assert_eq!(
            ModelVariant::from_name("flux-on-device"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
    }
}
