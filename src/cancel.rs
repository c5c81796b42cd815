//! Cooperative cancellation flag shared between a caller and a running task.

use crate::error::{BandCalcError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation flag. All clones observe the same state.
///
/// Long operations call [`CancellationToken::check`] at coarse checkpoints
/// (after open, after read, before persisting output), never per pixel.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    canceled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// `Err(Canceled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(BandCalcError::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());

        other.cancel();
        assert!(token.is_canceled());
        assert!(matches!(token.check(), Err(BandCalcError::Canceled)));
    }
}
