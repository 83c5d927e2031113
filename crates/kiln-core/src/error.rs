//! Error types for Kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("watch stream for job {0} closed before a terminal condition")]
    WatchClosed(String),

    #[error("{stage} stage failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error came from the build deadline or a cancellation.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
