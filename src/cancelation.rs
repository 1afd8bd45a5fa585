//! Cooperative cancellation for long-running door and rack movements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read side of a cancellation flag.
///
/// A default token is not bound to any source and never reports cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelationToken {
    flag: Option<Arc<AtomicBool>>,
}

impl CancelationToken {
    /// Token that can never be canceled
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.flag
            .as_ref()
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

/// Owner of a cancellation flag. Only the source may cancel.
#[derive(Debug, Clone)]
pub struct CancelationTokenSource {
    flag: Arc<AtomicBool>,
}

impl CancelationTokenSource {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn token(&self) -> CancelationToken {
        CancelationToken {
            flag: Some(Arc::clone(&self.flag)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Default for CancelationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn tokens_observe_cancel() {
        let source = CancelationTokenSource::new();
        let before = source.token();
        assert!(!before.is_canceled());

        source.cancel();
        source.cancel();

        let after = source.token();
        assert!(before.is_canceled());
        assert!(after.is_canceled());
    }

    #[test]
    fn default_token_is_never_canceled() {
        let token = CancelationToken::default();
        assert!(!token.is_canceled());
        assert!(!CancelationToken::none().is_canceled());
    }

    #[test]
    fn cancel_from_another_thread() {
        let source = CancelationTokenSource::new();
        let token = source.token();
        let handle = thread::spawn(move || source.cancel());
        handle.join().unwrap();
        assert!(token.is_canceled());
    }
}
