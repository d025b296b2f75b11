/// Failures the job driver distinguishes between. Everything else travels as
/// a plain `anyhow::Error` and is treated as a per-job failure.
#[derive(Debug, thiserror::Error)]
pub enum FlueError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{feature} is not supported by the candle flux backend")]
    Unsupported { feature: &'static str },

    #[error("pipeline is not loaded, call load() first")]
    NotLoaded,

    #[error("image generation interrupted")]
    Interrupted,
}

impl FlueError {
    /// True when `err` wraps [`FlueError::Interrupted`] anywhere in its chain.
    pub fn is_interrupted(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<FlueError>(),
                Some(FlueError::Interrupted)
            )
        })
    }
}
