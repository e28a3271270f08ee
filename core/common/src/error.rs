//! Common error types for shelfsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which kind of write a group denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteScope {
    /// Object metadata (collections, items, searches, tags).
    Metadata,
    /// Attachment files.
    Files,
}

impl fmt::Display for WriteScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteScope::Metadata => write!(f, "metadata"),
            WriteScope::Files => write!(f, "files"),
        }
    }
}

/// Top-level error type for shelfsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network failure or timeout talking to the remote. Retryable.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// Server supplied retry hint, in seconds.
        retry_after: Option<f64>,
    },

    /// The remote library advanced past the version an upload was based on.
    #[error("Version conflict: local version {local_version}, remote version {remote_version}")]
    VersionConflict {
        local_version: i64,
        remote_version: i64,
    },

    /// The remote refused a write to a group.
    #[error("Permission denied: {scope} writes to group {group_id}")]
    Permission { group_id: i64, scope: WriteScope },

    /// Local store transaction failed. Not retried.
    #[error("Store error: {0}")]
    Store(String),

    /// A conflict resolution could not be applied atomically.
    #[error(
        "Resolution error{}: {reason}",
        key.as_ref().map(|k| format!(" for {k}")).unwrap_or_default()
    )]
    Resolution { key: Option<String>, reason: String },

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A state machine was asked for a transition it does not allow.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A new session was requested before the failure backoff expired.
    #[error("Sync backoff active, retry in {retry_in_secs} seconds")]
    Backoff { retry_in_secs: u64 },

    /// The operation observed cancellation.
    #[error("Cancelled")]
    Cancelled,

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a transport error without a retry hint.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Build a resolution error for a specific key.
    pub fn resolution(key: Option<String>, reason: impl Into<String>) -> Self {
        Error::Resolution {
            key,
            reason: reason.into(),
        }
    }

    /// Whether the scheduler may retry the failed request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(Error::transport("connection reset").is_retryable());
        assert!(!Error::Store("disk full".to_string()).is_retryable());
        assert!(!Error::VersionConflict {
            local_version: 1,
            remote_version: 2
        }
        .is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_resolution_message_names_key() {
        let err = Error::resolution(Some("ABCD2345".to_string()), "object not found");
        assert_eq!(
            err.to_string(),
            "Resolution error for ABCD2345: object not found"
        );

        let err = Error::resolution(None, "library mismatch");
        assert_eq!(err.to_string(), "Resolution error: library mismatch");
    }
}
