//! Dispatch error types.

use thiserror::Error;

use crate::membership::MembershipError;

/// Every failure the dispatcher can report.
///
/// The set is closed so callers can classify errors with one exhaustive match.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Traversal went deeper than the configured limit.
    #[error(
        "max depth exceeded: reached the limit of {max_depth} while resolving `{resource}`; \
         this usually indicates a recursive or too deep data dependency"
    )]
    MaxDepthExceeded { max_depth: u32, resource: String },

    /// A referenced object type does not exist.
    #[error("object definition `{namespace}` not found")]
    UnknownNamespace { namespace: String },

    /// A referenced relation does not exist on its object type.
    #[error("relation/permission `{relation}` not found under definition `{namespace}`")]
    UnknownRelation { namespace: String, relation: String },

    /// A relation reference is invalid for where it is used.
    #[error("invalid relation reference: {message}")]
    InvalidRelationReference { message: String },

    /// The request's cancellation token fired.
    #[error("request canceled")]
    Canceled,

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The requested revision is not readable.
    #[error("invalid revision: {message}")]
    InvalidRevision { message: String },

    /// A relation has no type information where some is required.
    #[error("relation `{relation}` under definition `{namespace}` is missing type information")]
    RelationMissingTypeInfo { namespace: String, relation: String },

    /// Internal sentinel that always fails; only reachable in tests.
    #[error("always fail")]
    AlwaysFail,

    #[error("dispatch timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("storage error: {message}")]
    Storage { message: String },

    /// The dispatcher has been closed.
    #[error("dispatcher is closed")]
    Closed,

    #[error(transparent)]
    Membership(#[from] MembershipError),
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
