use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::preview::COMPOSITE_SUFFIX;
use crate::{FlueError, FluxVariant, GenerationRequest, InitImage, ModelVariant};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub paths: Vec<PathBuf>,
    pub scales: Vec<f64>,
    /// Words the adapter was trained on; prepended to the prompt.
    pub triggers: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Img2ImgConfig {
    pub path: PathBuf,
    #[serde(default = "default_init_strength")]
    pub strength: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlnetConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub save_canny: bool,
    #[serde(default = "default_controlnet_strength")]
    pub strength: f64,
}

fn default_init_strength() -> f64 {
    0.3
}

fn default_controlnet_strength() -> f64 {
    1.0
}

/// Settings for a batch of image jobs. Loadable from JSON; any field left out
/// keeps its default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageJobConfig {
    pub prompt: String,
    /// Variant alias (`schnell`, `dev`) or a hub id such as
    /// `black-forest-labs/FLUX.1-dev`.
    pub model: String,
    pub quantize: bool,
    pub local_path: Option<PathBuf>,
    /// Base output path; each job inserts its index before the extension.
    pub output: PathBuf,
    pub width: usize,
    pub height: usize,
    /// Defaults to the variant's usual step count.
    pub steps: Option<usize>,
    pub guidance: f64,
    /// Defaults to the current UNIX time, per job.
    pub seed: Option<u64>,
    /// Write a JSON sidecar describing the request next to every image.
    pub metadata: bool,
    /// Per-job folders of intermediate images. `None` turns stepwise output
    /// and the live preview off.
    pub stepwise_output_dir: Option<PathBuf>,
    pub composite_suffix: String,
    pub preview_interval_ms: u64,
    pub lora: LoraConfig,
    pub img2img: Option<Img2ImgConfig>,
    pub controlnet: Option<ControlnetConfig>,
    /// Carry on with the next job after a failed one.
    pub keep_going: bool,
}

impl Default for ImageJobConfig {
    fn default() -> Self {
        Self {
            prompt: "a photograph of an astronaut riding a horse".to_string(),
            model: FluxVariant::Schnell.to_string(),
            quantize: true,
            local_path: None,
            output: PathBuf::from("img.png"),
            width: 512,
            height: 512,
            steps: None,
            guidance: 3.5,
            seed: None,
            metadata: false,
            stepwise_output_dir: Some(PathBuf::from("output_stepwise")),
            composite_suffix: COMPOSITE_SUFFIX.to_string(),
            preview_interval_ms: 1000,
            lora: LoraConfig::default(),
            img2img: None,
            controlnet: None,
            keep_going: false,
        }
    }
}

impl ImageJobConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read job config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse job config {}", path.display()))
    }

    pub fn variant(&self) -> Result<FluxVariant, FlueError> {
        match ModelVariant::from_name(&self.model) {
            Some(ModelVariant::Flux(variant)) => Ok(variant),
            _ => Err(FlueError::InvalidConfig(format!(
                "'{}' is not a FLUX model",
                self.model
            ))),
        }
    }

    pub fn num_inference_steps(&self) -> Result<usize, FlueError> {
        Ok(match self.steps {
            Some(steps) => steps,
            None => self.variant()?.default_steps(),
        })
    }

    /// The prompt handed to the model: LoRA trigger words first.
    pub fn final_prompt(&self) -> String {
        if self.lora.triggers.is_empty() {
            self.prompt.clone()
        } else {
            format!("{}, {}", self.lora.triggers.join(", "), self.prompt)
        }
    }

    /// LoRA files paired with their scales; a missing scale list means 1.0.
    pub fn lora_weights(&self) -> Vec<(PathBuf, f64)> {
        self.lora
            .paths
            .iter()
            .enumerate()
            .map(|(i, path)| (path.clone(), self.lora.scales.get(i).copied().unwrap_or(1.0)))
            .collect()
    }

    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(self.preview_interval_ms)
    }

    /// Rejects settings that cannot work before any weights are loaded.
    pub fn validate(&self) -> Result<(), FlueError> {
        let invalid = |msg: String| -> Result<(), FlueError> {
            Err(FlueError::InvalidConfig(msg))
        };

        self.variant()?;
        if self.width == 0 || self.height == 0 {
            return invalid(format!(
                "image size must be non-zero, got {}x{}",
                self.width, self.height
            ));
        }
        if self.steps == Some(0) {
            return invalid("steps must be at least 1".to_string());
        }
        if !self.guidance.is_finite() || self.guidance < 0.0 {
            return invalid(format!("guidance must be >= 0, got {}", self.guidance));
        }
        if self.output.file_name().is_none() {
            return invalid(format!("output {} has no file name", self.output.display()));
        }
        if self.composite_suffix.is_empty() {
            return invalid("composite suffix must not be empty".to_string());
        }
        if self.preview_interval_ms == 0 {
            return invalid("preview interval must be at least 1ms".to_string());
        }
        if !self.lora.scales.is_empty() && self.lora.scales.len() != self.lora.paths.len() {
            return invalid(format!(
                "{} LoRA scales given for {} LoRA files",
                self.lora.scales.len(),
                self.lora.paths.len()
            ));
        }
        if self.img2img.is_some() && self.controlnet.is_some() {
            return invalid("img2img cannot be combined with controlnet".to_string());
        }
        if let Some(img2img) = &self.img2img {
            if !(0.0..=1.0).contains(&img2img.strength) {
                return invalid(format!(
                    "init image strength must be within [0, 1], got {}",
                    img2img.strength
                ));
            }
        }
        if let Some(controlnet) = &self.controlnet {
            if !controlnet.strength.is_finite() || controlnet.strength < 0.0 {
                return invalid(format!(
                    "controlnet strength must be >= 0, got {}",
                    controlnet.strength
                ));
            }
        }
        Ok(())
    }

    /// Builds the request for one job; without a fixed seed the clock is used.
    pub fn request(&self) -> Result<GenerationRequest, FlueError> {
        let seed = self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
        });
        Ok(GenerationRequest {
            prompt: self.final_prompt(),
            width: Some(self.width),
            height: Some(self.height),
            steps: Some(self.num_inference_steps()?),
            guidance: Some(self.guidance),
            seed: Some(seed),
            init_image: self.img2img.as_ref().map(|img2img| InitImage {
                path: img2img.path.clone(),
                strength: img2img.strength,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn triggers_lead_the_prompt() {
        let mut config = ImageJobConfig {
            prompt: "a night scene in Menton".to_string(),
            ..Default::default()
        };
        assert_eq!(config.final_prompt(), "a night scene in Menton");

        config.lora.triggers = vec!["sketched style".to_string(), "crayon".to_string()];
        assert_eq!(
            config.final_prompt(),
            "sketched style, crayon, a night scene in Menton"
        );
    }

    #[test]
    fn lora_files_pair_with_their_scales() {
        let mut config = ImageJobConfig::default();
        config.lora.paths = vec!["a.safetensors".into(), "b.safetensors".into()];
        assert_eq!(
            config.lora_weights(),
            vec![("a.safetensors".into(), 1.0), ("b.safetensors".into(), 1.0)]
        );

        config.lora.scales = vec![0.8, 0.5];
        assert_eq!(config.lora_weights()[1], ("b.safetensors".into(), 0.5));
    }

    #[test]
    fn steps_default_per_variant() {
        let mut config = ImageJobConfig::default();
        assert_eq!(config.num_inference_steps().unwrap(), 4);
        config.model = "black-forest-labs/FLUX.1-dev".to_string();
        assert_eq!(config.num_inference_steps().unwrap(), 16);
        config.steps = Some(7);
        assert_eq!(config.num_inference_steps().unwrap(), 7);
    }

    #[test]
    fn default_config_is_valid() {
        ImageJobConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_settings_are_rejected() {
        let base = ImageJobConfig::default();
        let cases = [
            ImageJobConfig {
                width: 0,
                ..base.clone()
            },
            ImageJobConfig {
                steps: Some(0),
                ..base.clone()
            },
            ImageJobConfig {
                model: "glm-4-9b-chat".to_string(),
                ..base.clone()
            },
            ImageJobConfig {
                img2img: Some(Img2ImgConfig {
                    path: "refer.jpg".into(),
                    strength: 0.3,
                }),
                controlnet: Some(ControlnetConfig {
                    path: "canny.png".into(),
                    save_canny: true,
                    strength: 1.0,
                }),
                ..base.clone()
            },
            ImageJobConfig {
                img2img: Some(Img2ImgConfig {
                    path: "refer.jpg".into(),
                    strength: 1.5,
                }),
                ..base.clone()
            },
            ImageJobConfig {
                lora: LoraConfig {
                    paths: vec!["a.safetensors".into()],
                    scales: vec![1.0, 0.5],
                    triggers: vec![],
                },
                ..base.clone()
            },
        ];
        for config in cases {
            assert_matches!(config.validate(), Err(FlueError::InvalidConfig(_)));
        }
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ImageJobConfig = serde_json::from_str(
            r#"{
                "prompt": "a midnight blue BMW E34 Touring",
                "model": "dev",
                "output": "outputs/gen_img.png",
                "lora": {"triggers": ["sketched style"]},
                "img2img": {"path": "resource/refer.jpg"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.variant().unwrap(), FluxVariant::Dev);
        assert_eq!(config.width, 512);
        assert_eq!(config.img2img.as_ref().unwrap().strength, 0.3);
        assert_eq!(
            config.stepwise_output_dir,
            Some(PathBuf::from("output_stepwise"))
        );
        config.validate().unwrap();
    }

    #[test]
    fn request_carries_the_job_settings() {
        let config = ImageJobConfig {
            seed: Some(42),
            width: 256,
            height: 256,
            lora: LoraConfig {
                triggers: vec!["sketched style".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let request = config.request().unwrap();
        assert_eq!(request.seed, Some(42));
        assert_eq!(request.steps, Some(4));
        assert_eq!((request.width, request.height), (Some(256), Some(256)));
        assert!(request.prompt.starts_with("sketched style, "));
        assert!(request.init_image.is_none());

        let clocked = ImageJobConfig::default().request().unwrap();
        assert!(clocked.seed.unwrap() > 0);
    }
}
