//! Cooperative cancellation for running operations.
//!
//! The dispatcher hands one token to every invocation. A cancellation notice
//! from the frontend flips it; handlers either poll [`CancellationToken::is_cancelled`]
//! or race their work against [`CancellationToken::cancelled`]. Nothing is
//! preempted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cancellation token shared between the dispatcher and one invocation.
///
/// # Example
///
/// ```
/// use conduit_core::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
///
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Wakes every task waiting in [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Return [`CancelledError`] once cancellation has been requested.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Error returned when an operation observes cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::ConduitError {
    fn from(_: CancelledError) -> Self {
        crate::error::ConduitError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
        assert_eq!(token2.check(), Err(CancelledError));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();

        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let woke = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(woke);
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-cancelled token should not wait");
    }

    #[test]
    fn test_cancelled_error_display() {
        assert_eq!(CancelledError.to_string(), "Operation was cancelled");
    }
}
