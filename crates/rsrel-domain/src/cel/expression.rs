//! Compiled caveat expressions.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use cel_interpreter::{Program, Value};

use super::context::CelContext;
use super::{CelError, CelResult};

/// A caveat body compiled to a CEL program. Evaluation must produce a bool.
pub struct CelExpression {
    source: String,
    program: Program,
}

impl fmt::Debug for CelExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CelExpression").field(&self.source).finish()
    }
}

impl CelExpression {
    /// Compiles `source`.
    ///
    /// The interpreter's parser panics on some malformed input; that is
    /// reported as a `CelError::ParseError` like any other syntax error.
    pub fn parse(source: &str) -> CelResult<Self> {
        let parse_error = |message: String| CelError::ParseError {
            expression: source.to_string(),
            message,
        };

        let program = catch_unwind(AssertUnwindSafe(|| Program::compile(source)))
            .map_err(|_| parse_error("expression could not be parsed".to_string()))?
            .map_err(|e| parse_error(e.to_string()))?;

        Ok(Self {
            source: source.to_string(),
            program,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Runs the program against `bindings`.
    pub fn evaluate(&self, bindings: &CelContext) -> CelResult<bool> {
        let result = self
            .program
            .execute(&bindings.to_interpreter())
            .map_err(|e| CelError::EvaluationError {
                expression: self.source.clone(),
                message: e.to_string(),
            })?;

        match result {
            Value::Bool(b) => Ok(b),
            other => Err(CelError::TypeError {
                expected: "bool".to_string(),
                actual: format!("{other:?}"),
            }),
        }
    }
}
