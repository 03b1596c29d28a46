//! Worker shim error types

use thiserror::Error;

/// Errors surfaced by the worker proxy and bridge
///
/// Every failure is raised synchronously to whichever frame invoked the
/// failing operation; nothing is retried or swallowed. A missing message
/// callback is not an error.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The host refused to create an execution context. The payload is
    /// whatever the host primitive signaled; no validation or wrapping
    /// happens on this side of the seam.
    #[error("Execution context creation failed: {0}")]
    Spawn(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The payload handed to `post_message` is not representable as JSON.
    #[error("Payload is not JSON-serializable: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The host handed a wire string that is not a JSON object.
    #[error("Malformed message envelope: {0}")]
    Deserialize(#[source] serde_json::Error),
}

impl WorkerError {
    /// Spawn failure from a plain message, for hosts without a richer
    /// error type of their own.
    pub fn spawn(msg: impl Into<String>) -> Self {
        WorkerError::Spawn(msg.into().into())
    }
}

/// Result type for worker shim operations
pub type WorkerResult<T> = Result<T, WorkerError>;
