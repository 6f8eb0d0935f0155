//! Caveat compilation and evaluation.
//!
//! A [`CompiledCaveat`] pairs a caveat definition with its parsed CEL program.
//! Context values are converted according to the declared parameter types
//! before evaluation.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::model::{CaveatDefinition, CaveatParameter};

use super::context::{CelContext, CelValue};
use super::{CelError, CelExpression, CelResult};

const SCALAR_TYPES: &[&str] = &[
    "any",
    "bool",
    "int",
    "uint",
    "double",
    "string",
    "bytes",
    "duration",
    "timestamp",
    "ipaddress",
];

/// Returns true when `type_name` is a supported caveat parameter type.
pub fn is_valid_parameter_type(type_name: &str) -> bool {
    let type_name = type_name.trim();
    if SCALAR_TYPES.contains(&type_name) {
        return true;
    }
    ["list", "map"].iter().any(|generic| {
        type_name
            .strip_prefix(generic)
            .and_then(|rest| rest.strip_prefix('<'))
            .and_then(|rest| rest.strip_suffix('>'))
            .is_some_and(is_valid_parameter_type)
    })
}

/// Result of evaluating a caveat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaveatOutcome {
    True,
    False,
    /// Declared parameters had no value, so the caveat could not be decided.
    Conditional { missing: Vec<String> },
}

/// A validated caveat definition with its compiled expression.
#[derive(Debug)]
pub struct CompiledCaveat {
    definition: CaveatDefinition,
    expression: CelExpression,
}

impl CompiledCaveat {
    /// Validates the parameters and compiles the expression.
    pub fn compile(definition: &CaveatDefinition) -> CelResult<Self> {
        let mut seen = HashSet::new();
        for parameter in &definition.parameters {
            if !seen.insert(parameter.name.as_str()) {
                return Err(CelError::DuplicateParameter {
                    parameter: parameter.name.clone(),
                });
            }
            if !is_valid_parameter_type(&parameter.type_name) {
                return Err(CelError::InvalidParameterType {
                    parameter: parameter.name.clone(),
                    type_name: parameter.type_name.clone(),
                });
            }
        }

        let expression = CelExpression::parse(&definition.expression)?;
        Ok(Self {
            definition: definition.clone(),
            expression,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &CaveatDefinition {
        &self.definition
    }

    /// Checks context written with a relationship: every key must be a
    /// declared parameter and convertible to its type.
    pub fn validate_context(&self, context: &Map<String, Value>) -> CelResult<()> {
        for (key, value) in context {
            let parameter =
                self.definition
                    .parameter(key)
                    .ok_or_else(|| CelError::InvalidContextValue {
                        parameter: key.clone(),
                        message: format!("not a parameter of caveat `{}`", self.definition.name),
                    })?;
            typed_value(parameter, &parameter.type_name, value)?;
        }
        Ok(())
    }

    /// Evaluates the caveat.
    ///
    /// Relationship context takes precedence over request context for the
    /// same key.
    pub fn evaluate(
        &self,
        relationship_context: &Map<String, Value>,
        request_context: &Map<String, Value>,
    ) -> CelResult<CaveatOutcome> {
        let mut ctx = CelContext::new();
        let mut missing = Vec::new();

        for parameter in &self.definition.parameters {
            let value = relationship_context
                .get(&parameter.name)
                .or_else(|| request_context.get(&parameter.name));
            match value {
                Some(value) => {
                    ctx.bind(
                        parameter.name.clone(),
                        typed_value(parameter, &parameter.type_name, value)?,
                    );
                }
                None => missing.push(parameter.name.clone()),
            }
        }

        if !missing.is_empty() {
            return Ok(CaveatOutcome::Conditional { missing });
        }

        if self.expression.evaluate(&ctx)? {
            Ok(CaveatOutcome::True)
        } else {
            Ok(CaveatOutcome::False)
        }
    }
}

fn typed_value(parameter: &CaveatParameter, type_name: &str, value: &Value) -> CelResult<CelValue> {
    let mismatch = || CelError::InvalidContextValue {
        parameter: parameter.name.clone(),
        message: format!("expected {type_name}, found {value}"),
    };

    if let Some(inner) = generic_argument(type_name, "list") {
        let items = value.as_array().ok_or_else(mismatch)?;
        return items
            .iter()
            .map(|item| typed_value(parameter, inner, item))
            .collect::<CelResult<Vec<_>>>()
            .map(CelValue::List);
    }
    if let Some(inner) = generic_argument(type_name, "map") {
        let entries = value.as_object().ok_or_else(mismatch)?;
        return entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), typed_value(parameter, inner, v)?)))
            .collect::<CelResult<HashMap<_, _>>>()
            .map(CelValue::Map);
    }

    let converted = match type_name {
        "any" => Some(CelValue::from_json(value)),
        "bool" => value.as_bool().map(CelValue::Bool),
        "int" => value.as_i64().map(CelValue::Int),
        "uint" => value.as_u64().map(CelValue::UInt),
        "double" => value.as_f64().map(CelValue::Float),
        "string" | "ipaddress" => value.as_str().map(|s| CelValue::String(s.to_string())),
        "bytes" => value.as_str().map(|s| CelValue::Bytes(s.as_bytes().to_vec())),
        "timestamp" => value
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(CelValue::Timestamp),
        "duration" => value.as_str().and_then(parse_duration).map(CelValue::Duration),
        _ => None,
    };
    converted.ok_or_else(mismatch)
}

fn generic_argument<'a>(type_name: &'a str, generic: &str) -> Option<&'a str> {
    type_name
        .strip_prefix(generic)?
        .strip_prefix('<')?
        .strip_suffix('>')
}

/// Parses durations such as `90s`, `1h30m` or `250ms`.
fn parse_duration(text: &str) -> Option<chrono::Duration> {
    let mut total = chrono::Duration::zero();
    let mut rest = text.trim();
    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let amount: i64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let (unit, len) = if rest.starts_with("ms") {
            (chrono::Duration::milliseconds(amount), 2)
        } else if rest.starts_with('h') {
            (chrono::Duration::hours(amount), 1)
        } else if rest.starts_with('m') {
            (chrono::Duration::minutes(amount), 1)
        } else if rest.starts_with('s') {
            (chrono::Duration::seconds(amount), 1)
        } else {
            return None;
        };
        total = total + unit;
        rest = &rest[len..];
    }

    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(params: &[(&str, &str)], expression: &str) -> CaveatDefinition {
        CaveatDefinition::new(
            "test",
            params
                .iter()
                .map(|(n, t)| CaveatParameter::new(*n, *t))
                .collect(),
            expression,
        )
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_parameter_types() {
        for valid in ["int", "list<string>", "map<list<int>>", "ipaddress", "any"] {
            assert!(is_valid_parameter_type(valid), "{valid}");
        }
        for invalid in ["integer", "list", "list<>", "map<foo>", "set<int>"] {
            assert!(!is_valid_parameter_type(invalid), "{invalid}");
        }
    }

    #[test]
    fn test_compile_rejects_bad_parameters() {
        let err = CompiledCaveat::compile(&definition(&[("a", "int"), ("a", "int")], "a > 1"))
            .unwrap_err();
        assert!(matches!(err, CelError::DuplicateParameter { .. }));

        let err = CompiledCaveat::compile(&definition(&[("a", "integer")], "a > 1")).unwrap_err();
        assert!(matches!(err, CelError::InvalidParameterType { .. }));
    }

    #[test]
    fn test_compile_rejects_bad_expression() {
        let err = CompiledCaveat::compile(&definition(&[("a", "int")], "a >")).unwrap_err();
        assert!(matches!(err, CelError::ParseError { .. }));
    }

    #[test]
    fn test_evaluate_true_and_false() {
        let caveat = CompiledCaveat::compile(&definition(&[("a", "int")], "a > 1")).unwrap();
        assert_eq!(
            caveat.evaluate(&map(json!({"a": 2})), &Map::new()).unwrap(),
            CaveatOutcome::True
        );
        assert_eq!(
            caveat.evaluate(&Map::new(), &map(json!({"a": 0}))).unwrap(),
            CaveatOutcome::False
        );
    }

    #[test]
    fn test_relationship_context_overrides_request() {
        let caveat =
            CompiledCaveat::compile(&definition(&[("limit", "int")], "limit < 10")).unwrap();
        let outcome = caveat
            .evaluate(&map(json!({"limit": 5})), &map(json!({"limit": 500})))
            .unwrap();
        assert_eq!(outcome, CaveatOutcome::True);
    }

    #[test]
    fn test_missing_parameter_is_conditional() {
        let caveat = CompiledCaveat::compile(&definition(
            &[("ip", "string"), ("allowed", "list<string>")],
            "ip in allowed",
        ))
        .unwrap();
        let outcome = caveat
            .evaluate(&map(json!({"allowed": ["10.0.0.1"]})), &Map::new())
            .unwrap();
        assert_eq!(
            outcome,
            CaveatOutcome::Conditional {
                missing: vec!["ip".to_string()]
            }
        );
    }

    #[test]
    fn test_validate_context() {
        let caveat = CompiledCaveat::compile(&definition(&[("a", "int")], "a > 1")).unwrap();
        assert!(caveat.validate_context(&map(json!({"a": 3}))).is_ok());
        assert!(caveat.validate_context(&map(json!({"a": "three"}))).is_err());
        assert!(caveat.validate_context(&map(json!({"b": 3}))).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s"), Some(chrono::Duration::seconds(90)));
        assert_eq!(parse_duration("1h30m"), Some(chrono::Duration::minutes(90)));
        assert_eq!(parse_duration("250ms"), Some(chrono::Duration::milliseconds(250)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }
}
