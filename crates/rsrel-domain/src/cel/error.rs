//! CEL-specific error types

use thiserror::Error;

/// Errors that can occur while compiling caveats and evaluating CEL expressions
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CelError {
    /// Failed to parse the CEL expression
    #[error("failed to parse CEL expression: {message}")]
    ParseError {
        /// The expression that failed to parse
        expression: String,
        /// Description of the parse error
        message: String,
    },

    /// Failed to evaluate the CEL expression
    #[error("failed to evaluate CEL expression: {message}")]
    EvaluationError {
        /// The expression that failed to evaluate
        expression: String,
        /// Description of the evaluation error
        message: String,
    },

    /// Type mismatch during evaluation
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeError {
        /// Expected type
        expected: String,
        /// Actual type received
        actual: String,
    },

    /// A caveat parameter declares an unsupported type
    #[error("unknown type `{type_name}` for parameter `{parameter}`")]
    InvalidParameterType { parameter: String, type_name: String },

    /// A caveat declares the same parameter twice
    #[error("duplicate parameter `{parameter}`")]
    DuplicateParameter { parameter: String },

    /// A context value does not match the declared parameter type
    #[error("invalid value for parameter `{parameter}`: {message}")]
    InvalidContextValue { parameter: String, message: String },
}
