pub mod abort;
pub mod chat;
pub mod config;
pub mod device_map;
pub mod error;
pub mod flux;
pub mod loader;
mod loader_factory;
pub mod preview;
pub mod session;
mod util;
pub mod workdir;

use std::path::{Path, PathBuf};

pub use abort::AbortSignal;
pub use config::{ControlnetConfig, ImageJobConfig, Img2ImgConfig, LoraConfig};
pub use device_map::*;
pub use error::FlueError;
pub use flux::{FluxLoader, FluxVariant};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use preview::{LogOnly, PreviewCoordinator, PreviewDisplay, SystemViewer};
use serde::{Deserialize, Serialize};
pub use session::{ImageSession, JobFailure, JobReport};
pub(crate) use util::*;
pub use util::{image_to_tensor, select_best_device, tensor_to_image};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct InitImage {
    pub path: PathBuf,
    pub strength: f64,
}

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_image: Option<InitImage>,
}

/// Where the backend should publish intermediate images for one job.
#[derive(Debug, Clone, Copy)]
pub struct StepwiseTarget<'a> {
    pub dir: &'a Path,
    pub composite_suffix: &'a str,
}

pub trait ModelLike: Send + Sync {
    fn run(
        &self,
        request: GenerationRequest,
        stepwise: Option<StepwiseTarget<'_>>,
        abort: &AbortSignal,
    ) -> anyhow::Result<DynamicImage>;
}

pub trait ChatLike: Send + Sync {
    /// Answers a single user turn; no history is carried between calls.
    /// Fails with [`FlueError::Interrupted`] once `abort` is triggered.
    fn infer(&self, query: &str, abort: &AbortSignal) -> anyhow::Result<String>;
}
