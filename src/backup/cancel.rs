use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Cancelled;

/// Per-run stop flag. Set once by the stop caller, read by every worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call set the flag.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_and_set_once() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(observer.check().is_ok());

        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(observer.is_cancelled());
        assert_eq!(observer.check(), Err(Cancelled));
    }
}
