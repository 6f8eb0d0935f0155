//! Membership error types

use thiserror::Error;

/// Errors raised while building or rendering found-subject sets.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    /// A configuration that has no defined semantics yet, such as a caveated
    /// exclusion or the canonical form of a conditional subject.
    #[error("not yet supported: {feature}")]
    Unsupported { feature: String },

    /// Exclusions were attached to a subject that is not a wildcard.
    #[error("subject `{subject}` is not a wildcard and cannot carry exclusions")]
    ExclusionOnConcreteSubject { subject: String },

    /// An expansion tree does not have the shape its operation requires.
    #[error("malformed expansion tree for `{resource}`: {message}")]
    MalformedExpansion { resource: String, message: String },
}

impl MembershipError {
    pub(crate) fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }
}

/// Result type for membership operations.
pub type MembershipResult<T> = Result<T, MembershipError>;
