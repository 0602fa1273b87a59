// SPDX-License-Identifier: MIT OR Apache-2.0
//! One-shot cancellation token for launch requests.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Notify;

/// One-shot cancellation token attached to a [`LaunchRequest`].
///
/// Cloneable and backed by an `Arc`; calling [`cancel`](CancelToken::cancel)
/// on any clone signals all waiters. The executor observes the token at two
/// points only: before the spawn call (abort cleanly, no process created)
/// and after a successful start (best-effort kill of the running process).
///
/// [`LaunchRequest`]: crate::LaunchRequest
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    /// Create a new, non-cancelled token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signal cancellation to all waiters.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns `true` if cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is signalled (returns immediately if already
    /// cancelled).
    pub async fn cancelled(&self) {
        // Register before re-checking the flag so a cancel landing in
        // between cannot be missed.
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let tok = CancelToken::new();
        assert!(!tok.is_cancelled());
    }

    #[test]
    fn clone_observes_cancel() {
        let tok = CancelToken::new();
        let other = tok.clone();
        tok.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_set() {
        let tok = CancelToken::new();
        tok.cancel();
        tok.cancelled().await;
    }

    #[tokio::test]
    async fn cancelled_wakes_waiter() {
        let tok = CancelToken::new();
        let waiter = tok.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        tok.cancel();
        task.await.expect("waiter task panicked");
    }
}
