use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::clip::text_model::{self, ClipTextConfig, ClipTextTransformer};
use candle_transformers::models::flux::{
    autoencoder::{self, AutoEncoder},
    model, quantized_model, sampling, WithForward,
};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

mod lora;
mod stepwise;

pub use stepwise::StepwiseWriter;

use crate::{
    fetch_file, image_to_tensor, tensor_to_image, AbortSignal, FlueError, GenerationRequest,
    Loader, ModelLike, StepwiseTarget,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FluxVariant {
    #[default]
    Schnell,
    Dev,
}

serde_plain::derive_display_from_serialize!(FluxVariant);
serde_plain::derive_fromstr_from_deserialize!(FluxVariant);

impl FluxVariant {
    pub fn default_steps(self) -> usize {
        match self {
            Self::Schnell => 4,
            Self::Dev => 16,
        }
    }

    fn repo(self) -> &'static str {
        match self {
            Self::Schnell => "black-forest-labs/FLUX.1-schnell",
            Self::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn weights_file(self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    fn gguf_file(self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.gguf",
            Self::Dev => "flux1-dev.gguf",
        }
    }

    fn model_config(self) -> model::Config {
        match self {
            Self::Schnell => model::Config::schnell(),
            Self::Dev => model::Config::dev(),
        }
    }

    fn autoencoder_config(self) -> autoencoder::Config {
        match self {
            Self::Schnell => autoencoder::Config::schnell(),
            Self::Dev => autoencoder::Config::dev(),
        }
    }
}

/// Everything [`FluxLoader`] needs to know about the weights to fetch.
#[derive(Clone, Debug, Default)]
pub struct FluxSpec {
    pub variant: FluxVariant,
    pub quantize: bool,
    /// Directory checked for the transformer and autoencoder files before the
    /// hub is asked for them.
    pub local_path: Option<PathBuf>,
    /// LoRA files and their scales, merged into the transformer at load time.
    pub loras: Vec<(PathBuf, f64)>,
}

const QUANTIZED_REPO: &str = "lmz/candle-flux";
const T5_MAX_TOKENS: usize = 256;

enum Transformer {
    Full(model::Flux),
    Quantized(quantized_model::Flux),
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    transformer: Transformer,
}

/// Start position in the schedule for img2img: higher strength keeps more of
/// the init image. At least one step is skipped, at least one is run.
pub fn init_image_start_step(steps: usize, strength: f64) -> usize {
    let start = (steps as f64 * strength.clamp(0.0, 1.0)).floor() as usize;
    start.max(1).min(steps.saturating_sub(1))
}

impl FluxModel {
    fn encode_prompt(&self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_MAX_TOKENS, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self
            .t5_model
            .lock()
            .map_err(|_| Error::msg("T5 encoder lock poisoned"))?
            .forward(&input_token_ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;
        Ok((t5_emb, clip_emb))
    }

    fn decode(&self, latent: &Tensor, height: usize, width: usize) -> Result<DynamicImage> {
        let unpacked = sampling::unpack(&latent.to_dtype(self.dtype)?, height, width)?;
        let decoded = self.autoencoder.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    /// Flow-matching Euler loop. Between steps it honours the abort signal
    /// and, when asked to, publishes the decoded intermediate image.
    #[allow(clippy::too_many_arguments)]
    fn denoise<M: WithForward>(
        &self,
        model: &M,
        state: &sampling::State,
        timesteps: &[f64],
        start: usize,
        guidance: f64,
        (height, width): (usize, usize),
        mut stepwise: Option<&mut StepwiseWriter>,
        abort: &AbortSignal,
    ) -> Result<Tensor> {
        let b_sz = state.img.dim(0)?;
        let dev = state.img.device();
        let guidance = Tensor::full(guidance as f32, b_sz, dev)?;
        let mut img = state.img.clone();
        for (step, window) in timesteps.windows(2).enumerate().skip(start) {
            abort.check()?;
            let (t_curr, t_prev) = (window[0], window[1]);
            let t_vec = Tensor::full(t_curr as f32, b_sz, dev)?;
            let pred = model.forward(
                &img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &t_vec,
                &state.vec,
                Some(&guidance),
            )?;
            img = (img + pred * (t_prev - t_curr))?;
            tracing::debug!(step = step + 1, total = timesteps.len() - 1, "denoised");

            if let Some(writer) = stepwise.as_deref_mut() {
                writer.record(step + 1, &self.decode(&img, height, width)?)?;
            }
        }
        Ok(img)
    }
}

impl ModelLike for FluxModel {
    fn run(
        &self,
        request: GenerationRequest,
        stepwise: Option<StepwiseTarget<'_>>,
        abort: &AbortSignal,
    ) -> Result<DynamicImage> {
        let width = request.width.unwrap_or(1360);
        let height = request.height.unwrap_or(768);
        let steps = request.steps.unwrap_or(self.variant.default_steps());
        let guidance = request.guidance.unwrap_or(0.0);
        if steps == 0 {
            return Err(FlueError::InvalidConfig("steps must be at least 1".into()).into());
        }

        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let (t5_emb, clip_emb) = self.encode_prompt(&request.prompt)?;
        abort.check()?;

        let noise = sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;
        let (latent_h, latent_w) = (noise.dim(2)?, noise.dim(3)?);
        let timesteps = match self.variant {
            FluxVariant::Schnell => sampling::get_schedule(steps, None),
            FluxVariant::Dev => {
                sampling::get_schedule(steps, Some((latent_h * latent_w / 4, 0.5, 1.15)))
            }
        };

        let (latent, start) = match &request.init_image {
            None => (noise, 0),
            Some(init) => {
                let start = init_image_start_step(steps, init.strength);
                let pixels = image_to_tensor(
                    &init.path,
                    latent_w * 8,
                    latent_h * 8,
                    self.dtype,
                    &self.device,
                )?;
                let encoded = self.autoencoder.encode(&pixels)?;
                let t = timesteps[start];
                let mixed = ((noise * t)? + (encoded * (1.0 - t))?)?;
                tracing::info!(start, steps, "img2img: starting from encoded init image");
                (mixed, start)
            }
        };

        let mut writer = stepwise.map(|target| {
            StepwiseWriter::new(
                target.dir,
                request.seed.unwrap_or_default(),
                steps,
                target.composite_suffix,
            )
        });

        let latent_img = match &self.transformer {
            Transformer::Full(flux) => {
                let state = sampling::State::new(&t5_emb, &clip_emb, &latent)?;
                self.denoise(
                    flux,
                    &state,
                    &timesteps,
                    start,
                    guidance,
                    (height, width),
                    writer.as_mut(),
                    abort,
                )?
            }
            Transformer::Quantized(flux) => {
                let state = sampling::State::new(
                    &t5_emb.to_dtype(DType::F32)?,
                    &clip_emb.to_dtype(DType::F32)?,
                    &latent.to_dtype(DType::F32)?,
                )?;
                self.denoise(
                    flux,
                    &state,
                    &timesteps,
                    start,
                    guidance,
                    (height, width),
                    writer.as_mut(),
                    abort,
                )?
            }
        };
        tracing::info!("generated latent image");

        let image = self.decode(&latent_img, height, width)?;
        tracing::info!("decoded image");
        Ok(image)
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Spec = FluxSpec;
    type Model = FluxModel;

    async fn load(spec: FluxSpec, api: Api, device: Device) -> Result<Self::Model> {
        let FluxSpec {
            variant,
            quantize,
            local_path,
            loras,
        } = spec;
        let dtype = device.bf16_default_to_f32();
        tracing::info!(%variant, quantize, ?dtype, "loading flux pipeline");

        // --- Load T5 Model and Tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- Load CLIP Model and Tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Load Autoencoder ---
        let bf_repo = api.repo(hf_hub::Repo::model(variant.repo().to_string()));
        let local_path = local_path.as_deref();
        let autoencoder_model_file = fetch_file(&bf_repo, local_path, "ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[autoencoder_model_file],
                dtype,
                &device,
            )
            .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Load Flux Model ---
        let flux_config = variant.model_config();
        let transformer = if quantize {
            let gguf_repo = api.repo(hf_hub::Repo::model(QUANTIZED_REPO.to_string()));
            let gguf_file = fetch_file(&gguf_repo, local_path, variant.gguf_file())
                .await
                .context("failed to get quantized flux model file")?;
            let vb = candle_transformers::quantized_var_builder::VarBuilder::from_gguf(
                &gguf_file, &device,
            )
            .context("failed to read quantized flux weights")?;
            Transformer::Quantized(
                quantized_model::Flux::new(&flux_config, vb)
                    .context("failed to load quantized flux model")?,
            )
        } else {
            let flux_model_file = fetch_file(&bf_repo, local_path, variant.weights_file())
                .await
                .context("failed to get flux model file")?;
            let flux_vb = if loras.is_empty() {
                unsafe {
                    candle_nn::VarBuilder::from_mmaped_safetensors(
                        &[flux_model_file],
                        dtype,
                        &device,
                    )
                    .context("failed to build flux var builder")?
                }
            } else {
                let weights = lora::load_merged(&flux_model_file, &loras, &device)?;
                candle_nn::VarBuilder::from_tensors(weights, dtype, &device)
            };
            Transformer::Full(
                model::Flux::new(&flux_config, flux_vb).context("failed to load flux model")?,
            )
        };
        tracing::info!(%variant, "flux pipeline ready");

        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_model: Mutex::new(t5_model),
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            transformer,
        })
    }
}

/// Guards the FLUX-specific options the candle backend cannot honour.
/// LoRA files are merged into full-precision weights only.
pub(crate) fn check_supported(
    lora_paths: &[PathBuf],
    quantize: bool,
    controlnet: Option<&Path>,
) -> Result<(), FlueError> {
    if quantize && !lora_paths.is_empty() {
        return Err(FlueError::Unsupported {
            feature: "LoRA on quantized (GGUF) weights",
        });
    }
    if controlnet.is_some() {
        return Err(FlueError::Unsupported {
            feature: "ControlNet conditioning",
        });
    }
    Ok(())
}
