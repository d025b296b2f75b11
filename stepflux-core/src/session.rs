//! Runs a batch of image jobs against one loaded pipeline.
//!
//! Per job the order is fixed: prepare the job folder, start the preview
//! poller, generate, save, stop and join the poller, then prune the folder
//! down to its composite. The poller is stopped on every path out of a job,
//! and the pipeline is released when the batch ends however it ends.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use candle_core::Device;
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use serde::Serialize;

use crate::preview::PreviewCoordinator;
use crate::workdir::{indexed_output_path, job_folder, prepare_folder, remove_files_except_suffix};
use crate::{
    flux, load_image_model, AbortSignal, FlueError, GenerationRequest, ImageJobConfig, ModelLike,
    PreviewDisplay, StepwiseTarget,
};

#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub index: usize,
    pub message: String,
}

/// Outcome of [`ImageSession::generate_images`].
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub requested: usize,
    pub completed: Vec<PathBuf>,
    pub failures: Vec<JobFailure>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.failures.is_empty() && self.completed.len() == self.requested
    }
}

#[derive(Serialize)]
struct ImageMetadata<'a> {
    model: &'a str,
    quantize: bool,
    #[serde(flatten)]
    request: &'a GenerationRequest,
    lora_triggers: &'a [String],
}

pub struct ImageSession {
    config: ImageJobConfig,
    pipeline: Option<Box<dyn ModelLike>>,
    preview: Option<PreviewCoordinator>,
    abort: AbortSignal,
    started_at: Option<Instant>,
}

impl std::fmt::Debug for ImageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSession")
            .field("config", &self.config)
            .field("pipeline_loaded", &self.pipeline.is_some())
            .field("abort", &self.abort)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl ImageSession {
    /// Validates `config` up front. `display` is only used when stepwise
    /// output is enabled; `None` disables the live preview.
    pub fn new(
        config: ImageJobConfig,
        display: Option<Arc<dyn PreviewDisplay>>,
        abort: AbortSignal,
    ) -> Result<Self, FlueError> {
        config.validate()?;
        let preview = match (display, &config.stepwise_output_dir) {
            (Some(display), Some(_)) => Some(PreviewCoordinator::with_options(
                display,
                config.composite_suffix.clone(),
                config.preview_interval(),
            )),
            _ => None,
        };
        Ok(Self {
            config,
            pipeline: None,
            preview,
            abort,
            started_at: None,
        })
    }

    pub fn config(&self) -> &ImageJobConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Loads the FLUX pipeline named by the config onto `device`. The run
    /// timer starts here so the reported time includes loading.
    pub async fn load(&mut self, api: Api, device: Device) -> Result<()> {
        self.started_at = Some(Instant::now());
        flux::check_supported(
            &self.config.lora.paths,
            self.config.quantize,
            self.config.controlnet.as_ref().map(|c| c.path.as_path()),
        )?;
        let pipeline = load_image_model(
            &self.config.model,
            self.config.quantize,
            self.config.local_path.clone(),
            self.config.lora_weights(),
            api,
            device,
        )
        .await?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Installs an already built pipeline.
    pub fn set_pipeline(&mut self, pipeline: Box<dyn ModelLike>) {
        self.started_at.get_or_insert_with(Instant::now);
        self.pipeline = Some(pipeline);
    }

    /// Generates `count` images. Takes the pipeline out of the session and
    /// drops it before returning; call `load` again for another batch.
    pub fn generate_images(&mut self, count: usize) -> Result<JobReport, FlueError> {
        let pipeline = self.pipeline.take().ok_or(FlueError::NotLoaded)?;
        tracing::info!(count, "start generating images");

        let mut report = JobReport {
            requested: count,
            ..Default::default()
        };
        for index in 0..count {
            if self.abort.is_triggered() {
                tracing::warn!(index, "abort requested, skipping remaining images");
                report.interrupted = true;
                break;
            }
            match self.run_job(pipeline.as_ref(), index) {
                Ok(path) => report.completed.push(path),
                Err(err) if FlueError::is_interrupted(&err) => {
                    tracing::warn!(index, "failed to generate image: {err:#}");
                    report.interrupted = true;
                    break;
                }
                Err(err) => {
                    tracing::error!(index, "failed to generate image: {err:#}");
                    report.failures.push(JobFailure {
                        index,
                        message: format!("{err:#}"),
                    });
                    if !self.config.keep_going {
                        break;
                    }
                }
            }
        }

        report.elapsed = log_elapsed(self.started_at.take());
        drop(pipeline);
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failures.len(),
            interrupted = report.interrupted,
            "finish all"
        );
        Ok(report)
    }

    fn run_job(&mut self, pipeline: &dyn ModelLike, index: usize) -> Result<PathBuf> {
        let folder = match &self.config.stepwise_output_dir {
            Some(root) => {
                let folder = job_folder(root, index);
                prepare_folder(&folder)
                    .with_context(|| format!("failed to prepare {}", folder.display()))?;
                Some(folder)
            }
            None => None,
        };

        if let (Some(preview), Some(folder)) = (self.preview.as_mut(), folder.as_deref()) {
            preview
                .start(folder)
                .context("failed to start preview poller")?;
        }

        let outcome = self.generate_and_save(pipeline, index, folder.as_deref());

        if let Some(preview) = self.preview.as_mut() {
            preview.stop();
        }
        if let Some(folder) = &folder {
            if let Err(e) = remove_files_except_suffix(folder, &self.config.composite_suffix) {
                tracing::warn!(
                    folder = %folder.display(),
                    error = %e,
                    "failed to prune stepwise images"
                );
            }
        }
        outcome
    }

    fn generate_and_save(
        &self,
        pipeline: &dyn ModelLike,
        index: usize,
        folder: Option<&Path>,
    ) -> Result<PathBuf> {
        let request = self.config.request()?;
        tracing::info!(index, seed = ?request.seed, "generating image");

        let stepwise = folder.map(|dir| StepwiseTarget {
            dir,
            composite_suffix: &self.config.composite_suffix,
        });
        let image = pipeline.run(request.clone(), stepwise, &self.abort)?;

        let output = indexed_output_path(&self.config.output, index);
        tracing::info!(index, path = %output.display(), "saving image");
        self.save_image(&image, &output, &request)?;
        Ok(output)
    }

    fn save_image(
        &self,
        image: &DynamicImage,
        path: &Path,
        request: &GenerationRequest,
    ) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        image
            .save(path)
            .with_context(|| format!("failed to save {}", path.display()))?;

        if self.config.metadata {
            let sidecar = path.with_extension("json");
            let metadata = ImageMetadata {
                model: &self.config.model,
                quantize: self.config.quantize,
                request,
                lora_triggers: &self.config.lora.triggers,
            };
            let file = File::create(&sidecar)
                .with_context(|| format!("failed to create {}", sidecar.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), &metadata)
                .with_context(|| format!("failed to write {}", sidecar.display()))?;
        }
        Ok(())
    }
}

fn log_elapsed(started_at: Option<Instant>) -> Duration {
    match started_at {
        Some(start) => {
            let elapsed = start.elapsed();
            tracing::info!(
                "timer: took {:.2} minutes totally",
                elapsed.as_secs_f64() / 60.0
            );
            elapsed
        }
        None => {
            tracing::warn!("no start time recorded, elapsed time cannot be computed");
            Duration::ZERO
        }
    }
}
