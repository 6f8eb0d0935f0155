//! Caveat expressions attached to relationships and found subjects.
//!
//! A caveat expression is a boolean formula over named caveats. It is never
//! evaluated here; the dispatcher evaluates it against CEL definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named caveat together with the context captured when it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextualizedCaveat {
    pub name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl ContextualizedCaveat {
    /// Creates a caveat reference without context.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: Map::new(),
        }
    }

    /// Creates a caveat reference with captured context.
    pub fn with_context(name: impl Into<String>, context: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            context,
        }
    }
}

impl fmt::Display for ContextualizedCaveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}({})", self.name, Value::Object(self.context.clone()))
        }
    }
}

/// A boolean formula over caveats.
///
/// `And` and `Or` keep their operands flattened, deduplicated and sorted by
/// their rendering, so combining the same operands in any order gives equal
/// expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaveatExpression {
    Caveat(ContextualizedCaveat),
    And(Vec<CaveatExpression>),
    Or(Vec<CaveatExpression>),
    Not(Box<CaveatExpression>),
}

impl CaveatExpression {
    /// Wraps a single caveat.
    pub fn caveat(caveat: ContextualizedCaveat) -> Self {
        Self::Caveat(caveat)
    }

    /// Logical OR of two expressions.
    pub fn or(self, other: CaveatExpression) -> Self {
        let mut operands = Vec::new();
        for expr in [self, other] {
            match expr {
                Self::Or(children) => operands.extend(children),
                expr => operands.push(expr),
            }
        }
        Self::normalized(operands, Self::Or)
    }

    /// Logical AND of two expressions.
    pub fn and(self, other: CaveatExpression) -> Self {
        let mut operands = Vec::new();
        for expr in [self, other] {
            match expr {
                Self::And(children) => operands.extend(children),
                expr => operands.push(expr),
            }
        }
        Self::normalized(operands, Self::And)
    }

    /// Logical negation; double negation collapses.
    pub fn invert(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            expr => Self::Not(Box::new(expr)),
        }
    }

    fn normalized(mut operands: Vec<CaveatExpression>, build: fn(Vec<Self>) -> Self) -> Self {
        operands.sort_by_cached_key(|expr| expr.to_string());
        operands.dedup();
        if operands.len() == 1 {
            operands.remove(0)
        } else {
            build(operands)
        }
    }

    /// Names of every caveat referenced by the expression, in rendering order.
    pub fn caveat_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Self::Caveat(caveat) => {
                if !names.contains(&caveat.name.as_str()) {
                    names.push(&caveat.name);
                }
            }
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_names(names);
                }
            }
            Self::Not(inner) => inner.collect_names(names),
        }
    }
}

impl fmt::Display for CaveatExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caveat(caveat) => write!(f, "{caveat}"),
            Self::And(children) | Self::Or(children) => {
                let separator = if matches!(self, Self::And(_)) {
                    " && "
                } else {
                    " || "
                };
                write!(f, "(")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{separator}")?;
                    }
                    write!(f, "{child}")?;
                }
                write!(f, ")")
            }
            Self::Not(inner) => write!(f, "!{inner}"),
        }
    }
}

/// OR of two optional conditions, where `None` means unconditional.
///
/// An unconditional side makes the result unconditional.
pub fn or_optional(
    left: Option<&CaveatExpression>,
    right: Option<&CaveatExpression>,
) -> Option<CaveatExpression> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.clone().or(right.clone())),
        _ => None,
    }
}

/// AND of two optional conditions, where `None` means unconditional.
pub fn and_optional(
    left: Option<&CaveatExpression>,
    right: Option<&CaveatExpression>,
) -> Option<CaveatExpression> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.clone().and(right.clone())),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}
