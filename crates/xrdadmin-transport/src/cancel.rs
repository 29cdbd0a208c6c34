//! Cooperative cancellation shared by every sub-request of an operation.
//!
//! A `CancelToken` is cheap to clone. Child tokens are cancelled with their
//! parent but can also be cancelled on their own, which lets a batch cancel
//! its members without touching the caller's token.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Reasons for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// The caller-supplied deadline expired.
    DeadlineExceeded,
    /// The client is shutting down.
    Shutdown,
    /// Explicit caller cancellation.
    #[default]
    UserRequested,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::UserRequested => write!(f, "UserRequested"),
        }
    }
}

/// Cloneable cancellation token carrying the first reason it was cancelled with.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels this token and all of its children.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut r = self.reason.lock();
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.inner.cancel();
    }

    /// Whether this token (or an ancestor) has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// The reason this token was cancelled, inherited from the nearest
    /// cancelled ancestor when it was not cancelled directly.
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        if let Some(reason) = *self.reason.lock() {
            return Some(reason);
        }
        self.parent
            .as_ref()
            .and_then(|p| p.reason())
            .or(Some(CancelReason::default()))
    }

    /// Creates a child token cancelled together with this one.
    pub fn child(&self) -> CancelToken {
        CancelToken {
            inner: self.inner.child_token(),
            reason: Arc::new(Mutex::new(None)),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Completes once the token is cancelled and yields the reason.
    pub async fn cancelled(&self) -> CancelReason {
        self.inner.cancelled().await;
        self.reason().unwrap_or_default()
    }

    /// Cancels this token with `DeadlineExceeded` once `after` has elapsed,
    /// unless it is cancelled earlier. Must be called inside a tokio runtime.
    pub fn cancel_after(&self, after: Duration) {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.inner.cancelled() => {}
                _ = tokio::time::sleep(after) => token.cancel(CancelReason::DeadlineExceeded),
            }
        });
    }
}
