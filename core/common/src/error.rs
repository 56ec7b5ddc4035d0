//! Common error types for ledgersync.

use thiserror::Error;

/// Top-level error type for ledgersync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable read or write failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// No network connectivity.
    #[error("Offline: {0}")]
    Offline(String),

    /// Transient transport failure talking to the remote authority.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote authority rejected a create, update or delete.
    #[error("Remote rejected commit: {0}")]
    RemoteCommit(String),

    /// Conflict awaiting a human decision.
    #[error("Unresolved conflict for entity {entity_id}")]
    UnresolvedConflict { entity_id: String },

    /// Payload does not match its recorded checksum.
    #[error("Integrity check failed for change {change_id}")]
    Integrity { change_id: String },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
