//! Common error types for the token KMS.

use thiserror::Error;

/// Top-level error type for KMS and codec operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed id, oversized input or otherwise invalid argument.
    #[error("Invalid parameter: {0}")]
    Parameter(String),

    /// Missing user, group, key or file.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation requires a role the session does not have.
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Illegal state for the requested operation (e.g. key status transition).
    #[error("Invalid state: {0}")]
    State(String),

    /// Operation refused until a pending update or recovery is processed.
    #[error("Blocked pending update: {0}")]
    Blocked(String),

    /// Sector signature mismatch or structurally corrupt sector.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Update file missing, unreadable or malformed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Update record counter skipped ahead of the stored counter.
    #[error("Update out of sequence: stored counter {stored}, record counter {found}")]
    OutOfSequence {
        /// Counter currently stored on the device.
        stored: u64,
        /// Counter carried by the offending record.
        found: u64,
    },

    /// The store's rollback could not be confirmed; the process must restart.
    #[error("Restart required: {0}")]
    RestartRequired(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Relational store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether simply retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_) | Error::Transport(_))
    }

    /// Whether the remedy is a full recovery rather than a retry.
    pub fn needs_recovery(&self) -> bool {
        matches!(self, Error::Blocked(_) | Error::OutOfSequence { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_is_not_retryable() {
        let blocked = Error::Blocked("U2 awaits recovery".to_string());
        assert!(!blocked.is_retryable());
        assert!(blocked.needs_recovery());

        let transient = Error::Storage("database is locked".to_string());
        assert!(transient.is_retryable());
        assert!(!transient.needs_recovery());
    }

    #[test]
    fn test_out_of_sequence_message() {
        let err = Error::OutOfSequence { stored: 3, found: 5 };
        assert!(err.to_string().contains("stored counter 3"));
        assert!(err.needs_recovery());
    }
}
