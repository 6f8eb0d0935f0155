//! Domain error types for relationship and schema operations.

use thiserror::Error;

/// Domain-specific errors for relationship and schema handling.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid object-and-relation text, e.g. a missing `#`.
    #[error("invalid object and relation: {value}")]
    InvalidObjectAndRelation { value: String },

    /// Invalid relationship text or structure.
    #[error("invalid relationship `{value}`: {reason}")]
    InvalidRelationship { value: String, reason: String },

    /// Invalid caveat context attached to a relationship.
    #[error("invalid caveat context for `{caveat}`: {reason}")]
    InvalidCaveatContext { caveat: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
