//! GLM-4 chat completion on candle.

use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::glm4;
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;

use crate::{hub_load_safetensors, AbortSignal, ChatLike, Loader};

pub const DEFAULT_CHAT_MODEL: &str = "THUDM/glm-4-9b-chat";
/// The chat repo only ships a tiktoken vocabulary; this one carries the same
/// vocabulary as `tokenizer.json`.
pub const DEFAULT_TOKENIZER_REPO: &str = "THUDM/codegeex4-all-9b";

const STOP_TOKENS: [&str; 3] = ["<|endoftext|>", "<|user|>", "<|observation|>"];

#[derive(Clone, Debug)]
pub struct ChatSpec {
    pub model_id: String,
    pub revision: String,
    /// Repo to take `tokenizer.json` from, when the model repo lacks one.
    pub tokenizer_repo: Option<String>,
    pub tokenizer_file: Option<PathBuf>,
    pub max_new_tokens: usize,
    pub seed: u64,
}

impl Default for ChatSpec {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_CHAT_MODEL.to_string(),
            revision: "main".to_string(),
            tokenizer_repo: Some(DEFAULT_TOKENIZER_REPO.to_string()),
            tokenizer_file: None,
            max_new_tokens: 50,
            seed: 299792458,
        }
    }
}

/// Wraps one user turn in the GLM-4 chat template.
pub fn chat_prompt(query: &str) -> String {
    format!("[gMASK]<sop><|user|>\n{query}<|assistant|>")
}

/// Logits of the last position, whatever the batch/sequence layout.
fn last_position(logits: &Tensor) -> Result<Tensor> {
    let logits = match logits.rank() {
        3 => logits.i((0, logits.dim(1)? - 1))?,
        2 => logits.i(logits.dim(0)? - 1)?,
        _ => logits.clone(),
    };
    Ok(logits.to_dtype(DType::F32)?)
}

/// Greedy decoding driver. `next` is fed the whole prompt first, then only the
/// token produced last, and returns the following token id. The abort signal
/// is checked before every token.
fn decode_tokens<F>(
    prompt: &[u32],
    max_new_tokens: usize,
    stop_ids: &[u32],
    abort: &AbortSignal,
    mut next: F,
) -> Result<Vec<u32>>
where
    F: FnMut(&[u32]) -> Result<u32>,
{
    let mut generated: Vec<u32> = Vec::new();
    for _ in 0..max_new_tokens {
        abort.check()?;
        let ctxt = match generated.last() {
            Some(last) => std::slice::from_ref(last),
            None => prompt,
        };
        let token = next(ctxt)?;
        if stop_ids.contains(&token) {
            break;
        }
        generated.push(token);
    }
    Ok(generated)
}

pub struct Glm4Chat {
    device: Device,
    config: glm4::Config,
    vb: VarBuilder<'static>,
    tokenizer: Tokenizer,
    stop_ids: Vec<u32>,
    max_new_tokens: usize,
    seed: u64,
}

impl ChatLike for Glm4Chat {
    /// Every turn starts from an empty KV cache; the model is rebuilt from the
    /// memory-mapped weights so earlier turns leave no state behind.
    fn infer(&self, query: &str, abort: &AbortSignal) -> Result<String> {
        let prompt = chat_prompt(query);
        let tokens = self
            .tokenizer
            .encode(prompt.as_str(), false)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let mut model =
            glm4::Model::new(&self.config, self.vb.clone()).context("failed to build GLM-4")?;
        let mut logits_processor = LogitsProcessor::from_sampling(self.seed, Sampling::ArgMax);

        let generated = decode_tokens(
            &tokens,
            self.max_new_tokens,
            &self.stop_ids,
            abort,
            |ctxt| {
                let input = Tensor::new(ctxt, &self.device)?.unsqueeze(0)?;
                let logits = last_position(&model.forward(&input)?)?;
                Ok(logits_processor.sample(&logits)?)
            },
        )?;
        tracing::debug!(
            prompt_tokens = tokens.len(),
            generated = generated.len(),
            "chat turn done"
        );

        self.tokenizer
            .decode(&generated, true)
            .map_err(Error::msg)
            .map(|text| text.trim().to_string())
    }
}

pub struct Glm4Loader;

impl Loader for Glm4Loader {
    type Spec = ChatSpec;
    type Model = Glm4Chat;

    async fn load(spec: ChatSpec, api: Api, device: Device) -> Result<Self::Model> {
        let dtype = device.bf16_default_to_f32();
        tracing::info!(model = %spec.model_id, ?dtype, "initialize tokenizer");

        let repo = api.repo(hf_hub::Repo::with_revision(
            spec.model_id.clone(),
            hf_hub::RepoType::Model,
            spec.revision.clone(),
        ));
        let tokenizer_filename = match (&spec.tokenizer_file, &spec.tokenizer_repo) {
            (Some(file), _) => file.clone(),
            (None, Some(other)) => api
                .model(other.clone())
                .get("tokenizer.json")
                .await
                .context("failed to get GLM-4 tokenizer")?,
            (None, None) => repo
                .get("tokenizer.json")
                .await
                .context("failed to get GLM-4 tokenizer")?,
        };
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load GLM-4 tokenizer")?;
        let stop_ids = STOP_TOKENS
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect::<Vec<_>>();
        if stop_ids.is_empty() {
            tracing::warn!("tokenizer knows none of the GLM-4 stop tokens");
        }

        tracing::info!("start load model");
        let config_filename = repo
            .get("config.json")
            .await
            .context("failed to get GLM-4 config")?;
        let config: glm4::Config = serde_json::from_slice(
            &std::fs::read(&config_filename).context("failed to read GLM-4 config")?,
        )
        .context("failed to parse GLM-4 config")?;
        let weights = hub_load_safetensors(&repo, "model.safetensors.index.json").await?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)
                .context("failed to build GLM-4 var builder")?
        };
        // fail at load time rather than on the first query
        glm4::Model::new(&config, vb.clone()).context("failed to load GLM-4 model")?;
        tracing::info!(model = %spec.model_id, "chat model ready");

        Ok(Glm4Chat {
            device,
            config,
            vb,
            tokenizer,
            stop_ids,
            max_new_tokens: spec.max_new_tokens,
            seed: spec.seed,
        })
    }
}
