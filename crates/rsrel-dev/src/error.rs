//! Error types for the developer sandbox.
//!
//! Two families of errors leave this crate:
//!
//! - [`DeveloperError`]: user-actionable diagnostics about the schema, the
//!   test relationships or the assertions, located in the source text when
//!   possible. These are accumulated and returned as a batch.
//! - [`DevError`]: infrastructural failures. Dispatch failures that are not
//!   the developer's fault are rewritten into a [`Status`] with a transport
//!   code.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rsrel_domain::dispatch::DispatchError;
use rsrel_domain::membership::MembershipError;
use rsrel_domain::model::SourcePosition;
use rsrel_storage::StorageError;

/// Which input a developer error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSource {
    Schema,
    Relationship,
    Assertion,
    ValidationYaml,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSource::Schema => "SCHEMA",
            ErrorSource::Relationship => "RELATIONSHIP",
            ErrorSource::Assertion => "ASSERTION",
            ErrorSource::ValidationYaml => "VALIDATION_YAML",
        };
        f.write_str(name)
    }
}

/// Category of a developer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ParseError,
    SchemaIssue,
    UnknownObjectType,
    UnknownRelation,
    MaximumRecursion,
    AssertionFailed,
    MissingExpectedSubject,
    ExtraSubjectFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::SchemaIssue => "SCHEMA_ISSUE",
            ErrorKind::UnknownObjectType => "UNKNOWN_OBJECT_TYPE",
            ErrorKind::UnknownRelation => "UNKNOWN_RELATION",
            ErrorKind::MaximumRecursion => "MAXIMUM_RECURSION",
            ErrorKind::AssertionFailed => "ASSERTION_FAILED",
            ErrorKind::MissingExpectedSubject => "MISSING_EXPECTED_SUBJECT",
            ErrorKind::ExtraSubjectFound => "EXTRA_SUBJECT_FOUND",
        };
        f.write_str(name)
    }
}

/// A user-actionable diagnostic.
///
/// `line` and `column` are 1-based and only present when the problem can be
/// traced to a location in the input text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeveloperError {
    pub message: String,
    pub source: ErrorSource,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// Source text or definition name the error refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl DeveloperError {
    pub fn new(message: impl Into<String>, source: ErrorSource, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            source,
            kind,
            line: None,
            column: None,
            context: None,
        }
    }

    pub fn with_location(mut self, line: Option<u32>, column: Option<u32>) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_position(self, position: Option<SourcePosition>) -> Self {
        match position {
            Some(position) => self.with_location(Some(position.line), Some(position.column)),
            None => self,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for DeveloperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.source, self.kind)?;
        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, " {line}:{column}")?;
        }
        write!(f, " {}", self.message)?;
        if let Some(context) = &self.context {
            write!(f, " ({context})")?;
        }
        Ok(())
    }
}

impl std::error::Error for DeveloperError {}

/// Transport status codes for infrastructural errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Canceled,
    InvalidArgument,
    OutOfRange,
    FailedPrecondition,
    Internal,
    Unknown,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Canceled => "CANCELED",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// An error mapped to a transport status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Canceled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(StatusCode::OutOfRange, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

/// Infrastructural errors of the developer sandbox.
#[derive(Debug, Error)]
pub enum DevError {
    #[error(transparent)]
    Status(#[from] Status),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A dispatch error that has no transport mapping, propagated unchanged.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// The schema compiler failed for a reason unrelated to the schema text.
    #[error("schema compilation failed: {message}")]
    Compile { message: String },

    /// A stored definition could not be decoded.
    #[error("failed to decode stored {kind} `{name}`: {message}")]
    Decode {
        kind: &'static str,
        name: String,
        message: String,
    },

    /// The request envelope is malformed.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl DevError {
    /// The transport status code this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DevError::Status(status) => status.code,
            DevError::InvalidRequest { .. } => StatusCode::InvalidArgument,
            DevError::Membership(MembershipError::Unsupported { .. }) => {
                StatusCode::FailedPrecondition
            }
            DevError::Storage(_)
            | DevError::Dispatch(_)
            | DevError::Membership(_)
            | DevError::Compile { .. }
            | DevError::Decode { .. } => StatusCode::Unknown,
        }
    }
}

/// Result type for sandbox operations.
pub type DevResult<T> = Result<T, DevError>;

/// Why a sandbox could not be built.
#[derive(Debug, Error)]
pub enum DevContextError {
    /// The schema or relationships have problems the developer must fix.
    #[error("{} developer error(s) in the request", .0.len())]
    Developer(Vec<DeveloperError>),

    #[error(transparent)]
    Infrastructure(#[from] DevError),
}

impl DevContextError {
    /// The developer errors, if this failure is developer-actionable.
    pub fn developer_errors(&self) -> Option<&[DeveloperError]> {
        match self {
            DevContextError::Developer(errors) => Some(errors),
            DevContextError::Infrastructure(_) => None,
        }
    }
}
