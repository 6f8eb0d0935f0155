//! Assertions run against a sandbox.
//!
//! An assertion names a relationship-shaped check and the outcome it expects:
//!
//! ```text
//! assertTrue:     document:readme#view@user:alice
//! assertFalse:    document:readme#view@user:mallory
//! assertCaveated: document:readme#view@user:bob
//! assertTrue:     document:readme#view@user:bob with {"ip": "10.0.0.1"}
//! ```
//!
//! `with {json}` supplies caveat context for the check.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use rsrel_domain::dispatch::Permissionship;
use rsrel_domain::model::{ObjectAndRelation, Relationship};

use crate::classify::{classify, Classification};
use crate::context::DevContext;
use crate::error::{DevResult, DeveloperError, ErrorKind, ErrorSource};

/// The outcome an assertion expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssertionKind {
    #[serde(rename = "assertTrue")]
    True,
    #[serde(rename = "assertFalse")]
    False,
    #[serde(rename = "assertCaveated")]
    Caveated,
}

impl AssertionKind {
    fn expected(self) -> Permissionship {
        match self {
            AssertionKind::True => Permissionship::HasPermission,
            AssertionKind::False => Permissionship::NoPermission,
            AssertionKind::Caveated => Permissionship::ConditionalPermission,
        }
    }

    fn expectation(self) -> &'static str {
        match self {
            AssertionKind::True => "to exist",
            AssertionKind::False => "to not exist",
            AssertionKind::Caveated => "to be caveated",
        }
    }
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssertionKind::True => "assertTrue",
            AssertionKind::False => "assertFalse",
            AssertionKind::Caveated => "assertCaveated",
        };
        f.write_str(name)
    }
}

/// One assertion and where it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub kind: AssertionKind,
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
    pub context: Map<String, Value>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl Assertion {
    pub fn new(
        kind: AssertionKind,
        resource: ObjectAndRelation,
        subject: ObjectAndRelation,
    ) -> Self {
        Self {
            kind,
            resource,
            subject,
            context: Map::new(),
            line: None,
            column: None,
        }
    }

    /// Parses `resource#relation@subject[ with {json}]`.
    pub fn parse(kind: AssertionKind, text: &str) -> Result<Self, DeveloperError> {
        let parse_error = |message: String| {
            DeveloperError::new(message, ErrorSource::Assertion, ErrorKind::ParseError)
                .with_context(text.trim())
        };

        let (check, context) = match text.split_once(" with ") {
            Some((check, context)) => {
                let value: Value = serde_json::from_str(context.trim())
                    .map_err(|e| parse_error(format!("invalid assertion context: {e}")))?;
                match value {
                    Value::Object(map) => (check, map),
                    _ => {
                        return Err(parse_error(
                            "assertion context must be a JSON object".to_string(),
                        ))
                    }
                }
            }
            None => (text, Map::new()),
        };

        let relationship = Relationship::parse(check)
            .and_then(|r| r.validate().map(|()| r))
            .map_err(|e| parse_error(e.to_string()))?;
        if relationship.caveat.is_some() {
            return Err(parse_error(
                "assertions take caveat context with `with {...}`, not a caveat".to_string(),
            ));
        }

        Ok(Self {
            context,
            ..Self::new(kind, relationship.resource, relationship.subject)
        })
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}",
            self.resource.namespace, self.resource.object_id, self.resource.relation, self.subject
        )?;
        if !self.context.is_empty() {
            write!(f, " with {}", Value::Object(self.context.clone()))?;
        }
        Ok(())
    }
}

/// Runs `assertions` against the sandbox.
///
/// Failed assertions and developer-actionable dispatch errors are returned
/// as developer errors; any other dispatch error aborts the run.
#[instrument(skip_all, fields(scope = %ctx.scope().id(), assertions = assertions.len()))]
pub async fn run_assertions(
    ctx: &DevContext,
    assertions: &[Assertion],
) -> DevResult<Vec<DeveloperError>> {
    let mut errors = Vec::new();

    for assertion in assertions {
        let text = assertion.to_string();
        let result = ctx
            .check(&assertion.resource, &assertion.subject, assertion.context.clone())
            .await;

        let permissionship = match result {
            Ok(result) => result.permissionship,
            Err(err) => {
                match classify(
                    err,
                    ErrorSource::Assertion,
                    assertion.line,
                    assertion.column,
                    Some(&text),
                    ctx.reporter(),
                    ctx.scope(),
                ) {
                    Classification::Developer(developer) => {
                        errors.push(developer);
                        continue;
                    }
                    Classification::Infrastructure(err) => return Err(err),
                }
            }
        };

        if permissionship != assertion.kind.expected() {
            let actual = match permissionship {
                Permissionship::HasPermission => "it exists",
                Permissionship::NoPermission => "it does not exist",
                Permissionship::ConditionalPermission => "it is caveated",
            };
            errors.push(
                DeveloperError::new(
                    format!(
                        "Expected relation or permission {text} {}, but {actual}",
                        assertion.kind.expectation()
                    ),
                    ErrorSource::Assertion,
                    ErrorKind::AssertionFailed,
                )
                .with_location(assertion.line, assertion.column)
                .with_context(text),
            );
        }
    }

    debug!(failures = errors.len(), "assertions run");
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assertion_with_context() {
        let assertion = Assertion::parse(
            AssertionKind::True,
            r#"document:readme#view@user:bob with {"ip": "10.0.0.1"}"#,
        )
        .unwrap()
        .at(4, 7);

        assert_eq!(assertion.resource, ObjectAndRelation::parse("document:readme#view").unwrap());
        assert_eq!(assertion.subject, ObjectAndRelation::terminal("user", "bob"));
        assert_eq!(assertion.context["ip"], "10.0.0.1");
        assert_eq!(assertion.line, Some(4));
        assert_eq!(
            assertion.to_string(),
            r#"document:readme#view@user:bob with {"ip":"10.0.0.1"}"#
        );
    }

    #[test]
    fn test_parse_rejects_malformed_assertions() {
        for text in [
            "document:readme@user:bob",
            "document:readme#view@user:bob with [1]",
            "document:readme#view@user:bob with {",
            "document:readme#view@user:bob[on_network]",
        ] {
            let err = Assertion::parse(AssertionKind::False, text).unwrap_err();
            assert_eq!(err.kind, ErrorKind::ParseError, "{text}");
            assert_eq!(err.source, ErrorSource::Assertion);
        }
    }

    #[test]
    fn test_kind_serializes_as_yaml_keys() {
        assert_eq!(
            serde_json::to_value(AssertionKind::Caveated).unwrap(),
            "assertCaveated"
        );
        assert_eq!(AssertionKind::True.to_string(), "assertTrue");
    }
}
