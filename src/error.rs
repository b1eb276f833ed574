//! Error type shared by every tidepool component.
//!
//! Caller faults (`InvalidArgument`, `InvalidState`, `NotFound`) are rejected
//! synchronously and never retried. Store and executor failures are transient:
//! the recorder's `end` may be retried with the same trajectory id, and the
//! automation loop logs them and moves on to the next tick.

use thiserror::Error;

/// Errors produced by the recorder, the store, and the training orchestration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument was rejected (e.g. an empty window id).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the current state (unknown or closed
    /// trajectory, step op without an open step, a second in-flight batch).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The durable store failed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A bounded operation did not finish in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Handing a batch to the external training executor failed.
    #[error("training executor failure: {0}")]
    Executor(String),

    /// A structured blob could not be encoded or decoded.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::Timeout { .. } | Self::Executor(_)
        )
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
