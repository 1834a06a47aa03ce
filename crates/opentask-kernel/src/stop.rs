//! Cooperative cancellation flag.
//!
//! A [`StopFlag`] is shared between the task loop and any surface that wants
//! to interrupt it (another thread, a UI callback, a signal handler).  The
//! loop polls the flag between rounds; in-flight work is allowed to finish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop signal readable from any thread.
#[derive(Clone, Debug, Default)]
pub struct StopFlag {
    stopped: Arc<AtomicBool>,
}

impl StopFlag {
    /// Create a flag in the not-stopped state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.  Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Clear the flag so the holder can be driven again.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear() {
        let flag = StopFlag::new();
        assert!(!flag.is_stopped());
    }

    #[test]
    fn stop_is_visible_through_clones() {
        let flag = StopFlag::new();
        let observer = flag.clone();

        flag.stop();
        assert!(observer.is_stopped());

        observer.reset();
        assert!(!flag.is_stopped());
    }

    #[tokio::test]
    async fn stop_from_another_task() {
        let flag = StopFlag::new();
        let setter = flag.clone();

        let handle = tokio::spawn(async move {
            setter.stop();
        });
        handle.await.unwrap();

        assert!(flag.is_stopped());
    }
}
