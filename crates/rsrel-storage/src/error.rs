//! Storage error types.

use thiserror::Error;

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Namespace not found at the requested revision.
    #[error("namespace not found: {name}")]
    NamespaceNotFound { name: String },

    /// Caveat not found at the requested revision.
    #[error("caveat not found: {name}")]
    CaveatNotFound { name: String },

    /// A `Create` update hit an existing relationship.
    #[error("duplicate relationship: {relationship}")]
    DuplicateRelationship { relationship: String },

    /// The revision is newer than anything committed.
    #[error("invalid revision {revision}: head revision is {head}")]
    InvalidRevision { revision: u64, head: u64 },

    /// The store has been closed.
    #[error("datastore is closed")]
    Closed,

    /// Transaction error.
    #[error("transaction error: {message}")]
    TransactionError { message: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Serialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError {
            message: err.to_string(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
