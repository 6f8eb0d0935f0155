//! Compiled schema structures: namespaces, relations, rewrites and caveats.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 1-based line/column location in schema source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: u32,
    pub column: u32,
}

impl SourcePosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    /// Computes the position of a byte offset within `source`.
    pub fn from_offset(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let before = &source[..offset];
        let line = before.matches('\n').count() as u32 + 1;
        let column = match before.rfind('\n') {
            Some(newline) => before[newline + 1..].chars().count(),
            None => before.chars().count(),
        } as u32
            + 1;
        Self { line, column }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Output of schema compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledSchema {
    pub namespaces: Vec<NamespaceDefinition>,
    pub caveats: Vec<CaveatDefinition>,
}

impl CompiledSchema {
    pub fn namespace(&self, name: &str) -> Option<&NamespaceDefinition> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }

    pub fn caveat(&self, name: &str) -> Option<&CaveatDefinition> {
        self.caveats.iter().find(|c| c.name == name)
    }
}

/// An object type and its relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDefinition {
    pub name: String,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<SourcePosition>,
}

impl NamespaceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relations: Vec::new(),
            position: None,
        }
    }

    pub fn with_relation(mut self, relation: RelationDefinition) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// A relation on a namespace: its allowed subject types and its rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    #[serde(default)]
    pub type_constraints: Vec<TypeConstraint>,
    pub rewrite: Userset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<SourcePosition>,
}

impl RelationDefinition {
    /// A directly assignable relation (`[types]`).
    pub fn direct(name: impl Into<String>, type_constraints: Vec<TypeConstraint>) -> Self {
        Self {
            name: name.into(),
            type_constraints,
            rewrite: Userset::This,
            position: None,
        }
    }

    /// A relation with an explicit rewrite.
    pub fn computed(name: impl Into<String>, rewrite: Userset) -> Self {
        Self {
            name: name.into(),
            type_constraints: Vec::new(),
            rewrite,
            position: None,
        }
    }

    pub fn with_type_constraints(mut self, type_constraints: Vec<TypeConstraint>) -> Self {
        self.type_constraints = type_constraints;
        self
    }

    /// Returns true when relationships may be written for this relation.
    pub fn is_directly_assignable(&self) -> bool {
        self.rewrite.contains_this()
    }
}

/// One entry of a relation's allowed subject types, e.g. `user`, `user:*`,
/// `group#member` or `user with on_network`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeConstraint {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default)]
    pub wildcard: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<String>,
}

impl TypeConstraint {
    pub fn terminal(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            relation: None,
            wildcard: false,
            caveat: None,
        }
    }

    pub fn wildcard(namespace: impl Into<String>) -> Self {
        Self {
            wildcard: true,
            ..Self::terminal(namespace)
        }
    }

    pub fn userset(namespace: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            relation: Some(relation.into()),
            ..Self::terminal(namespace)
        }
    }

    pub fn with_caveat(mut self, caveat: impl Into<String>) -> Self {
        self.caveat = Some(caveat.into());
        self
    }
}

impl fmt::Display for TypeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace)?;
        if self.wildcard {
            write!(f, ":*")?;
        }
        if let Some(relation) = &self.relation {
            write!(f, "#{relation}")?;
        }
        if let Some(caveat) = &self.caveat {
            write!(f, " with {caveat}")?;
        }
        Ok(())
    }
}

/// Userset rewrite tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Userset {
    /// Direct assignment from stored relationships.
    This,
    /// Another relation on the same object.
    ComputedUserset { relation: String },
    /// `computed_userset from tupleset`: follow the tupleset relation and check
    /// the computed relation on each target.
    TupleToUserset {
        tupleset: String,
        computed_userset: String,
    },
    Union { children: Vec<Userset> },
    Intersection { children: Vec<Userset> },
    Exclusion {
        base: Box<Userset>,
        subtract: Box<Userset>,
    },
}

impl Userset {
    /// Returns true when `This` appears anywhere in the rewrite.
    pub fn contains_this(&self) -> bool {
        match self {
            Userset::This => true,
            Userset::ComputedUserset { .. } | Userset::TupleToUserset { .. } => false,
            Userset::Union { children } | Userset::Intersection { children } => {
                children.iter().any(Userset::contains_this)
            }
            Userset::Exclusion { base, subtract } => {
                base.contains_this() || subtract.contains_this()
            }
        }
    }
}

/// A named CEL condition with typed parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatDefinition {
    pub name: String,
    pub parameters: Vec<CaveatParameter>,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<SourcePosition>,
    /// Location of the expression body, used to offset CEL errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression_position: Option<SourcePosition>,
}

impl CaveatDefinition {
    pub fn new(
        name: impl Into<String>,
        parameters: Vec<CaveatParameter>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters,
            expression: expression.into(),
            position: None,
            expression_position: None,
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&CaveatParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// A caveat parameter declaration, e.g. `allowed: list<string>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatParameter {
    pub name: String,
    pub type_name: String,
}

impl CaveatParameter {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_position_from_offset() {
        let source = "type user\ntype doc\n  relations";
        assert_eq!(SourcePosition::from_offset(source, 0), SourcePosition::new(1, 1));
        assert_eq!(SourcePosition::from_offset(source, 10), SourcePosition::new(2, 1));
        assert_eq!(SourcePosition::from_offset(source, 21), SourcePosition::new(3, 3));
    }

    #[test]
    fn test_source_position_clamps_offset() {
        let pos = SourcePosition::from_offset("ab", 100);
        assert_eq!(pos, SourcePosition::new(1, 3));
    }

    #[test]
    fn test_userset_contains_this() {
        let rewrite = Userset::Union {
            children: vec![
                Userset::This,
                Userset::ComputedUserset {
                    relation: "owner".to_string(),
                },
            ],
        };
        assert!(rewrite.contains_this());
        assert!(!Userset::ComputedUserset {
            relation: "owner".to_string()
        }
        .contains_this());
    }

    #[test]
    fn test_type_constraint_display() {
        assert_eq!(TypeConstraint::wildcard("user").to_string(), "user:*");
        assert_eq!(TypeConstraint::userset("group", "member").to_string(), "group#member");
        assert_eq!(
            TypeConstraint::terminal("user").with_caveat("on_network").to_string(),
            "user with on_network"
        );
    }

    #[test]
    fn test_namespace_definition_serde_roundtrip_keeps_rewrite() {
        let ns = NamespaceDefinition::new("document").with_relation(RelationDefinition::computed(
            "viewer",
            Userset::TupleToUserset {
                tupleset: "parent".to_string(),
                computed_userset: "viewer".to_string(),
            },
        ));
        let json = serde_json::to_string(&ns).unwrap();
        let back: NamespaceDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ns);
    }
}
