use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use hf_hub::api::tokio::Api;
use stepflux_core::chat::ChatSpec;
use stepflux_core::{
    load_chat_model, select_best_device, AbortSignal, ControlnetConfig, DeviceMap, FlueError,
    ImageJobConfig, ImageSession, Img2ImgConfig, LogOnly, PreviewDisplay, SystemViewer,
};
use tokio::{self, task};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "FLUX image generation and GLM-4 chat runner")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    /// Accelerator ordinal to run on
    #[arg(long, global = true, default_value_t = 0)]
    device: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate images with FLUX.1, previewing every step as it is produced
    Image(ImageArgs),
    /// Ask GLM-4 one or more independent questions
    Chat(ChatArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PreviewMode {
    /// Open the composite in the system image viewer
    Window,
    /// Only log the composite's path
    Log,
    /// No live preview
    Off,
}

#[derive(ClapArgs, Debug)]
struct ImageArgs {
    /// JSON job file; flags given on the command line override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    prompt: Option<String>,

    /// Model variant (`schnell`, `dev`) or hub id
    #[arg(long)]
    model: Option<String>,

    /// Use full-precision weights instead of the quantized GGUF ones
    #[arg(long)]
    full_precision: bool,

    /// Directory with local weight files, checked before the hub
    #[arg(long)]
    local_path: Option<PathBuf>,

    /// Output path; the job index is inserted before the extension
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    width: Option<usize>,

    #[arg(long)]
    height: Option<usize>,

    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    guidance: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Number of images to generate
    #[arg(long, short = 'n', default_value_t = 1)]
    count: usize,

    /// Write a JSON sidecar with the generation settings next to each image
    #[arg(long)]
    metadata: bool,

    /// Folder for per-step images
    #[arg(long)]
    stepwise_dir: Option<PathBuf>,

    /// Do not write per-step images (also disables the preview)
    #[arg(long)]
    no_stepwise: bool,

    #[arg(long, value_enum, default_value_t = PreviewMode::Window)]
    preview: PreviewMode,

    /// LoRA trigger word, prepended to the prompt (repeatable)
    #[arg(long = "lora-trigger")]
    lora_triggers: Vec<String>,

    /// LoRA weight file (repeatable)
    #[arg(long = "lora-path")]
    lora_paths: Vec<PathBuf>,

    /// Scale of the matching --lora-path (repeatable)
    #[arg(long = "lora-scale")]
    lora_scales: Vec<f64>,

    /// Start from this image instead of pure noise
    #[arg(long)]
    init_image: Option<PathBuf>,

    /// How much of the init image to keep, 0..=1
    #[arg(long, default_value_t = 0.3)]
    init_strength: f64,

    /// ControlNet conditioning image
    #[arg(long)]
    controlnet_image: Option<PathBuf>,

    #[arg(long, default_value_t = 1.0)]
    controlnet_strength: f64,

    #[arg(long)]
    controlnet_save_canny: bool,

    /// Continue with the next image after a failed one
    #[arg(long)]
    keep_going: bool,
}

impl ImageArgs {
    fn job_config(&self) -> Result<ImageJobConfig> {
        let mut config = match &self.config {
            Some(path) => ImageJobConfig::from_json_file(path)?,
            None => ImageJobConfig::default(),
        };
        if let Some(prompt) = &self.prompt {
            config.prompt = prompt.clone();
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if self.full_precision {
            config.quantize = false;
        }
        if let Some(local_path) = &self.local_path {
            config.local_path = Some(local_path.clone());
        }
        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        config.width = self.width.unwrap_or(config.width);
        config.height = self.height.unwrap_or(config.height);
        config.steps = self.steps.or(config.steps);
        config.guidance = self.guidance.unwrap_or(config.guidance);
        config.seed = self.seed.or(config.seed);
        config.metadata |= self.metadata;
        config.keep_going |= self.keep_going;
        if let Some(dir) = &self.stepwise_dir {
            config.stepwise_output_dir = Some(dir.clone());
        }
        if self.no_stepwise {
            config.stepwise_output_dir = None;
        }
        if !self.lora_triggers.is_empty() {
            config.lora.triggers = self.lora_triggers.clone();
        }
        if !self.lora_paths.is_empty() {
            config.lora.paths = self.lora_paths.clone();
            config.lora.scales = self.lora_scales.clone();
        }
        if let Some(path) = &self.init_image {
            config.img2img = Some(Img2ImgConfig {
                path: path.clone(),
                strength: self.init_strength,
            });
        }
        if let Some(path) = &self.controlnet_image {
            config.controlnet = Some(ControlnetConfig {
                path: path.clone(),
                save_canny: self.controlnet_save_canny,
                strength: self.controlnet_strength,
            });
        }
        Ok(config)
    }

    fn display(&self) -> Option<Arc<dyn PreviewDisplay>> {
        match self.preview {
            PreviewMode::Window => Some(Arc::new(SystemViewer::new())),
            PreviewMode::Log => Some(Arc::new(LogOnly)),
            PreviewMode::Off => None,
        }
    }
}

#[derive(ClapArgs, Debug)]
struct ChatArgs {
    /// Questions to ask, answered one after another without shared history
    #[arg(required = true)]
    queries: Vec<String>,

    #[arg(long, default_value = stepflux_core::chat::DEFAULT_CHAT_MODEL)]
    model: String,

    #[arg(long, default_value = "main")]
    revision: String,

    /// Hub repo to take tokenizer.json from
    #[arg(long, default_value = stepflux_core::chat::DEFAULT_TOKENIZER_REPO)]
    tokenizer_repo: Option<String>,

    /// Local tokenizer.json
    #[arg(long)]
    tokenizer_file: Option<PathBuf>,

    #[arg(long, default_value_t = 50)]
    max_new_tokens: usize,

    #[arg(long, default_value_t = 299792458)]
    seed: u64,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// The first Ctrl-C asks the running work to stop at the next step or token;
/// a second one exits right away.
fn install_interrupt_handler(abort: AbortSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("interrupt received, stopping (press Ctrl-C again to quit now)");
        abort.trigger();
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("second interrupt, exiting");
            std::process::exit(130);
        }
    });
}

async fn run_image(args: ImageArgs, device_map: DeviceMap, abort: AbortSignal) -> Result<()> {
    let config = args.job_config()?;
    let count = args.count;
    tracing::info!(prompt = %config.final_prompt(), model = %config.model, "image job");

    let mut session = ImageSession::new(config, args.display(), abort.clone())?;
    let device = select_best_device(device_map).context("failed to set up device")?;
    let api = Api::new()?;
    // weights can take a long time to download; do not hold Ctrl-C until then
    tokio::select! {
        loaded = session.load(api, device) => loaded?,
        _ = tokio::signal::ctrl_c() => abort.trigger(),
    }
    if abort.is_triggered() {
        tracing::warn!("interrupted while loading, nothing generated");
        return Ok(());
    }

    let report = task::spawn_blocking(move || session.generate_images(count)).await??;
    for path in &report.completed {
        println!("{}", path.display());
    }
    if !report.failures.is_empty() {
        anyhow::bail!(
            "{} of {} images failed, first error: {}",
            report.failures.len(),
            report.requested,
            report.failures[0].message
        );
    }
    Ok(())
}

async fn run_chat(args: ChatArgs, device_map: DeviceMap, abort: AbortSignal) -> Result<()> {
    let spec = ChatSpec {
        model_id: args.model,
        revision: args.revision,
        tokenizer_repo: args.tokenizer_repo,
        tokenizer_file: args.tokenizer_file,
        max_new_tokens: args.max_new_tokens,
        seed: args.seed,
    };
    let device = select_best_device(device_map).context("failed to set up device")?;
    let api = Api::new()?;
    let chat = tokio::select! {
        loaded = load_chat_model(spec, api, device) => loaded?,
        _ = tokio::signal::ctrl_c() => {
            abort.trigger();
            tracing::warn!("interrupted while loading, nothing asked");
            return Ok(());
        }
    };

    let queries = args.queries;
    task::spawn_blocking(move || -> Result<()> {
        for query in &queries {
            tracing::info!("start inference");
            match chat.infer(query, &abort) {
                Ok(reply) => println!("glm-4-9b: {reply}"),
                Err(err) if FlueError::is_interrupted(&err) => {
                    tracing::warn!("chat interrupted, skipping remaining queries");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    })
    .await?
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    #[cfg(feature = "cuda")]
    {
        candle_core::quantized::cuda::set_force_dmmv(false);
    }

    let device_map = DeviceMap::from_flags(args.cpu, args.device);
    let abort = AbortSignal::new();
    install_interrupt_handler(abort.clone());

    match args.command {
        Command::Image(image) => run_image(image, device_map, abort).await,
        Command::Chat(chat) => run_chat(chat, device_map, abort).await,
    }
}
