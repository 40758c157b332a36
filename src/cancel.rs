//! Hierarchical cancellation scopes with optional deadlines.
//!
//! A token is cancelled either explicitly or when its deadline passes.
//! Cancelling a token cancels every child derived from it; children never
//! cancel their parent.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Why a token stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// `cancel()` was called on the token or one of its ancestors.
    Cancelled,
    /// The token's deadline, or an ancestor's, has passed.
    DeadlineExceeded,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
    parent: Option<CancellationToken>,
}

#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// A root token that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(None, Some(Instant::now() + timeout))
    }

    fn build(parent: Option<CancellationToken>, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                deadline,
                parent,
            }),
        }
    }

    /// Derives a token that is cancelled together with `self`.
    pub fn child(&self) -> Self {
        Self::build(Some(self.clone()), None)
    }

    /// Derives a token that is cancelled with `self` or after `timeout`,
    /// whichever comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self::build(Some(self.clone()), Some(Instant::now() + timeout))
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// Returns why the token stopped, or `None` while it is still live.
    ///
    /// An explicit cancellation anywhere in the chain wins over an expired
    /// deadline.
    pub fn cause(&self) -> Option<CancelCause> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Some(CancelCause::Cancelled);
        }
        if let Some(cause) = self.inner.parent.as_ref().and_then(|p| p.cause()) {
            return Some(cause);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    /// The earliest deadline in this token's chain.
    pub fn deadline(&self) -> Option<Instant> {
        let parent = self.inner.parent.as_ref().and_then(|p| p.deadline());
        match (self.inner.deadline, parent) {
            (Some(own), Some(parent)) => Some(own.min(parent)),
            (own, parent) => own.or(parent),
        }
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Resolves once the token is cancelled or its deadline passes.
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = CancelCause> + Send + '_>> {
        Box::pin(async move {
            loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(cause) = self.cause() {
                    return cause;
                }

                let parent = async {
                    match &self.inner.parent {
                        Some(parent) => {
                            parent.cancelled().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                let expiry = async {
                    match self.inner.deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = notified => {}
                    _ = parent => {}
                    _ = expiry => {}
                }
            }
        })
    }

    /// Runs `fut` unless the token stops first, in which case `fut` is dropped.
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Returns a guard that cancels this token when dropped.
    pub fn drop_guard(self) -> DropGuard {
        DropGuard { token: Some(self) }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels its token on drop unless disarmed.
#[derive(Debug)]
pub struct DropGuard {
    token: Option<CancellationToken>,
}

impl DropGuard {
    pub fn disarm(mut self) -> CancellationToken {
        match self.token.take() {
            Some(token) => token,
            None => CancellationToken::new(),
        }
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

/// Returns a token cancelled on Ctrl-C.
///
/// Must be called from within a Tokio runtime.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received, cancelling pending lock operations");
            signalled.cancel();
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();

        assert!(!grandchild.is_cancelled());
        parent.cancel();

        assert_eq!(grandchild.cancelled().await, CancelCause::Cancelled);
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_alone() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_deadline_exceeded() {
        let token = CancellationToken::new().child_with_timeout(Duration::from_millis(100));
        let start = Instant::now();

        let cause = token.cancelled().await;

        assert_eq!(cause, CancelCause::DeadlineExceeded);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_inherits_earlier_parent_deadline() {
        let parent = CancellationToken::with_timeout(Duration::from_millis(50));
        let child = parent.child_with_timeout(Duration::from_secs(10));

        let deadline = child.deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_millis(50));
        assert_eq!(child.cancelled().await, CancelCause::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_drop_guard_cancels() {
        let token = CancellationToken::new();
        {
            let _guard = token.clone().drop_guard();
        }
        assert!(token.is_cancelled());

        let other = CancellationToken::new();
        let guard = other.clone().drop_guard();
        let _ = guard.disarm();
        assert!(!other.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_until_cancelled_skips_work_when_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(token.run_until_cancelled(async { 7 }).await, Some(7));

        token.cancel();
        assert_eq!(token.run_until_cancelled(async { 7 }).await, None);
    }
}
