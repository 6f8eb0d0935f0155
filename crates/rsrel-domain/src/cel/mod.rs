//! CEL (Common Expression Language) evaluation for caveats
//!
//! Caveats are named CEL conditions declared in the schema:
//!
//! ```text
//! condition on_network(allowed: list<string>, ip: string) {
//!     ip in allowed
//! }
//! ```
//!
//! A relationship may reference a caveat and capture part of its context.
//! The remaining parameters come from the request context at check time.
//!
//! # Architecture
//!
//! ```text
//! CaveatDefinition ──compile──► CompiledCaveat ──evaluate──► CaveatOutcome
//!                                  │    ▲
//!                   CelExpression ◄┘    └ CelContext (typed CelValue bindings)
//! ```

mod caveat;
mod context;
mod error;
mod expression;

pub use caveat::{is_valid_parameter_type, CaveatOutcome, CompiledCaveat};
pub use context::{CelContext, CelValue};
pub use error::CelError;
pub use expression::CelExpression;

pub type CelResult<T> = Result<T, CelError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(values: Vec<(&str, CelValue)>) -> CelContext {
        values.into_iter().collect()
    }

    // ========== Section 1: Parsing ==========

    #[test]
    fn test_parses_caveat_expressions() {
        for source in [
            "ip == allowed",
            "a && b || !c",
            "ip in allowed",
            "[1, 2, 3].exists(x, x > limit)",
            "name.startsWith(\"prefix\")",
            "timestamp(\"2024-01-01T00:00:00Z\") < now",
        ] {
            let expr = CelExpression::parse(source)
                .unwrap_or_else(|e| panic!("`{source}` should parse: {e}"));
            assert_eq!(expr.source(), source);
        }
    }

    /// Includes input the interpreter's parser panics on.
    #[test]
    fn test_invalid_syntax_is_a_parse_error() {
        for source in ["a ==", "&&", "(a", "[1, 2,", "\"unclosed string"] {
            match CelExpression::parse(source) {
                Err(CelError::ParseError { expression, message }) => {
                    assert_eq!(expression, source);
                    assert!(!message.is_empty());
                }
                other => panic!("expected parse error for `{source}`, got {other:?}"),
            }
        }
    }

    // ========== Section 2: Evaluation ==========

    #[test]
    fn test_evaluates_against_bindings() {
        let expr = CelExpression::parse("ip in allowed && !blocked").unwrap();
        let mut ctx = bindings(vec![
            ("ip", CelValue::String("10.0.0.1".to_string())),
            (
                "allowed",
                CelValue::List(vec![CelValue::String("10.0.0.1".to_string())]),
            ),
            ("blocked", CelValue::Bool(false)),
        ]);
        assert!(expr.evaluate(&ctx).unwrap());

        ctx.bind("blocked", CelValue::Bool(true));
        assert!(!expr.evaluate(&ctx).unwrap());
        assert_eq!(ctx.len(), 3);
    }

    #[test]
    fn test_timestamps_compare() {
        let expr = CelExpression::parse("now < expires").unwrap();
        let at = |s: &str| CelValue::Timestamp(chrono::DateTime::parse_from_rfc3339(s).unwrap());
        let ctx = bindings(vec![
            ("now", at("2026-01-01T00:00:00Z")),
            ("expires", at("2026-06-01T00:00:00Z")),
        ]);
        assert!(expr.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_non_boolean_result_is_type_error() {
        let expr = CelExpression::parse("x + 1").unwrap();
        let ctx = bindings(vec![("x", CelValue::Int(1))]);
        assert!(matches!(expr.evaluate(&ctx), Err(CelError::TypeError { .. })));
    }

    #[test]
    fn test_unbound_variable_is_evaluation_error() {
        let expr = CelExpression::parse("missing == true").unwrap();
        assert!(matches!(
            expr.evaluate(&CelContext::new()),
            Err(CelError::EvaluationError { .. })
        ));
    }

    #[test]
    fn test_untyped_json_prefers_signed_integers() {
        let value = CelValue::from_json(&serde_json::json!({
            "n": 1,
            "big": u64::MAX,
            "l": [true, null]
        }));
        let CelValue::Map(map) = value else {
            panic!("expected map");
        };
        assert_eq!(map.get("n"), Some(&CelValue::Int(1)));
        assert_eq!(map.get("big"), Some(&CelValue::UInt(u64::MAX)));
        assert_eq!(
            map.get("l"),
            Some(&CelValue::List(vec![CelValue::Bool(true), CelValue::Null]))
        );
    }
}
