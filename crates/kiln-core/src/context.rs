//! Per-build cancellation and deadline.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Bounds one build: cancelled when the parent token is cancelled, and
/// expired once `timeout` has elapsed since creation.
#[derive(Debug, Clone)]
pub struct BuildContext {
    cancel: CancellationToken,
    deadline: Instant,
    timeout: Duration,
}

impl BuildContext {
    /// Derive a context from a parent token with a wall-clock budget.
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel: parent.child_token(),
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// A context that is never cancelled by a parent.
    pub fn detached(timeout: Duration) -> Self {
        Self::new(&CancellationToken::new(), timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel this context (and only this context).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Error describing why the context is done, if it is.
    pub fn done_reason(&self) -> Option<Error> {
        if self.cancel.is_cancelled() {
            Some(Error::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(self.deadline_error())
        } else {
            None
        }
    }

    /// Drive `fut` until it finishes, the context is cancelled, or the
    /// deadline passes. Cancellation wins over a simultaneous completion.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(self.deadline_error()),
            res = fut => res,
        }
    }

    fn deadline_error(&self) -> Error {
        Error::Timeout(format!(
            "build exceeded its {}s deadline",
            self.timeout.as_secs()
        ))
    }
}
