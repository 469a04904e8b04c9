//! Worker-specific error types.

use std::io;
use thiserror::Error;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can occur during worker communication.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Failed to spawn the worker process.
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Failed to write to worker stdin.
    #[error("failed to write to worker: {0}")]
    WriteFailed(#[source] io::Error),

    /// Failed to read from worker stdout.
    #[error("failed to read from worker: {0}")]
    ReadFailed(#[source] io::Error),

    /// Failed to serialize a message to JSON.
    #[error("failed to serialize message: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// Failed to deserialize a response payload.
    #[error("failed to deserialize response: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// Request timed out waiting for response.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// The worker channel closed while the request was outstanding.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// The worker completed the request but reported a logical error.
    #[error("{message}")]
    Operation { message: String },
}

impl WorkerError {
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
        }
    }

    /// Transport failure: the worker went away, not the operation.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed { .. } | Self::WriteFailed(_) | Self::ReadFailed(_)
        )
    }

    /// Logical failure reported inside a normal `response`.
    pub fn is_operation_failure(&self) -> bool {
        matches!(self, Self::Operation { .. })
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::DeserializeFailed(err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WorkerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::closed("response channel dropped")
    }
}
