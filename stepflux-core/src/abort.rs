use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::FlueError;

/// Operator-requested abort, shared between the Ctrl-C handler and the
/// denoising loop. Checked between steps; a running step is never cut short.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), FlueError> {
        if self.is_triggered() {
            Err(FlueError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let signal = AbortSignal::new();
        let handler_side = signal.clone();
        assert!(signal.check().is_ok());

        handler_side.trigger();
        assert!(signal.is_triggered());
        assert!(matches!(signal.check(), Err(FlueError::Interrupted)));
    }
}
