//! Per-namespace type systems.
//!
//! A [`NamespaceTypeSystem`] wraps one namespace definition and resolves the
//! namespaces and caveats it references through a [`DefinitionResolver`].
//! Validation produces a [`ValidatedNamespaceTypeSystem`] which answers the
//! write-time questions: may relationships be written for a relation, and is
//! a given subject type allowed on it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::schema::{
    CaveatDefinition, NamespaceDefinition, RelationDefinition, SourcePosition, TypeConstraint,
    Userset,
};
use super::types::ELLIPSIS;

/// A schema problem found while building or validating a type system.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SchemaError {
    pub message: String,
    pub position: Option<SourcePosition>,
    /// The definition or relation name the error refers to.
    pub context: Option<String>,
}

impl SchemaError {
    fn at(
        message: impl Into<String>,
        position: Option<SourcePosition>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            position,
            context: Some(context.into()),
        }
    }
}

/// Resolves namespace and caveat definitions by name.
pub trait DefinitionResolver: Send + Sync {
    fn namespace(&self, name: &str) -> Option<Arc<NamespaceDefinition>>;

    fn caveat(&self, name: &str) -> Option<Arc<CaveatDefinition>>;
}

/// A resolver over definitions that are being loaded together, so forward
/// references between them resolve.
#[derive(Debug, Default, Clone)]
pub struct PredefinedDefinitions {
    namespaces: HashMap<String, Arc<NamespaceDefinition>>,
    caveats: HashMap<String, Arc<CaveatDefinition>>,
}

impl PredefinedDefinitions {
    pub fn new(namespaces: Vec<NamespaceDefinition>, caveats: Vec<CaveatDefinition>) -> Self {
        Self {
            namespaces: namespaces
                .into_iter()
                .map(|ns| (ns.name.clone(), Arc::new(ns)))
                .collect(),
            caveats: caveats
                .into_iter()
                .map(|c| (c.name.clone(), Arc::new(c)))
                .collect(),
        }
    }
}

impl DefinitionResolver for PredefinedDefinitions {
    fn namespace(&self, name: &str) -> Option<Arc<NamespaceDefinition>> {
        self.namespaces.get(name).cloned()
    }

    fn caveat(&self, name: &str) -> Option<Arc<CaveatDefinition>> {
        self.caveats.get(name).cloned()
    }
}

/// Type information for a single namespace.
///
/// # Example
///
/// ```ignore
/// let resolver = Arc::new(PredefinedDefinitions::new(schema.namespaces.clone(), schema.caveats.clone()));
/// let ts = NamespaceTypeSystem::new(Arc::new(document), resolver)?;
/// let validated = ts.validate()?;
/// assert!(validated.is_directly_assignable("viewer"));
/// ```
pub struct NamespaceTypeSystem {
    definition: Arc<NamespaceDefinition>,
    relations: HashMap<String, RelationDefinition>,
    resolver: Arc<dyn DefinitionResolver>,
}

impl fmt::Debug for NamespaceTypeSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceTypeSystem")
            .field("namespace", &self.definition.name)
            .finish_non_exhaustive()
    }
}

impl NamespaceTypeSystem {
    /// Builds the type system, rejecting duplicate relation names.
    pub fn new(
        definition: Arc<NamespaceDefinition>,
        resolver: Arc<dyn DefinitionResolver>,
    ) -> Result<Self, SchemaError> {
        let mut relations = HashMap::with_capacity(definition.relations.len());
        for relation in &definition.relations {
            if relations
                .insert(relation.name.clone(), relation.clone())
                .is_some()
            {
                return Err(SchemaError::at(
                    format!(
                        "found duplicate relation/permission name `{}` under definition `{}`",
                        relation.name, definition.name
                    ),
                    relation.position,
                    relation.name.clone(),
                ));
            }
        }

        Ok(Self {
            definition,
            relations,
            resolver,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.definition.name
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.get(name)
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    /// Validates every relation of the namespace.
    pub fn validate(self) -> Result<ValidatedNamespaceTypeSystem, SchemaError> {
        for relation in &self.definition.relations {
            self.validate_relation(relation)?;
        }
        self.detect_cycles()?;
        Ok(ValidatedNamespaceTypeSystem { inner: self })
    }

    fn validate_relation(&self, relation: &RelationDefinition) -> Result<(), SchemaError> {
        let uses_this = relation.rewrite.contains_this();
        if uses_this && relation.type_constraints.is_empty() {
            return Err(SchemaError::at(
                format!(
                    "relation `{}` on `{}` must declare at least one allowed subject type",
                    relation.name, self.definition.name
                ),
                relation.position,
                relation.name.clone(),
            ));
        }
        if !uses_this && !relation.type_constraints.is_empty() {
            return Err(SchemaError::at(
                format!(
                    "relation `{}` on `{}` declares allowed types but is not directly assignable",
                    relation.name, self.definition.name
                ),
                relation.position,
                relation.name.clone(),
            ));
        }

        for constraint in &relation.type_constraints {
            self.validate_type_constraint(relation, constraint)?;
        }
        self.validate_rewrite(relation, &relation.rewrite)
    }

    fn validate_type_constraint(
        &self,
        relation: &RelationDefinition,
        constraint: &TypeConstraint,
    ) -> Result<(), SchemaError> {
        let error = |message: String| {
            SchemaError::at(message, relation.position, constraint.to_string())
        };

        if constraint.wildcard && constraint.relation.is_some() {
            return Err(error(format!(
                "wildcard type `{constraint}` on relation `{}` cannot specify a relation",
                relation.name
            )));
        }

        let target = self.lookup_namespace(&constraint.namespace).ok_or_else(|| {
            error(format!(
                "could not find definition `{}` referenced by relation `{}`",
                constraint.namespace, relation.name
            ))
        })?;

        if let Some(subject_relation) = &constraint.relation {
            if subject_relation != ELLIPSIS && target.relation(subject_relation).is_none() {
                return Err(error(format!(
                    "relation `{}` not found under definition `{}`",
                    subject_relation, constraint.namespace
                )));
            }
        }

        if let Some(caveat) = &constraint.caveat {
            if self.resolver.caveat(caveat).is_none() {
                return Err(error(format!(
                    "could not find caveat `{caveat}` referenced by relation `{}`",
                    relation.name
                )));
            }
        }

        Ok(())
    }

    fn validate_rewrite(
        &self,
        relation: &RelationDefinition,
        rewrite: &Userset,
    ) -> Result<(), SchemaError> {
        match rewrite {
            Userset::This => Ok(()),
            Userset::ComputedUserset { relation: target } => {
                if !self.has_relation(target) {
                    return Err(SchemaError::at(
                        format!(
                            "relation/permission `{target}` not found under definition `{}`",
                            self.definition.name
                        ),
                        relation.position,
                        target.clone(),
                    ));
                }
                Ok(())
            }
            Userset::TupleToUserset {
                tupleset,
                computed_userset,
            } => self.validate_arrow(relation, tupleset, computed_userset),
            Userset::Union { children } | Userset::Intersection { children } => {
                for child in children {
                    self.validate_rewrite(relation, child)?;
                }
                Ok(())
            }
            Userset::Exclusion { base, subtract } => {
                self.validate_rewrite(relation, base)?;
                self.validate_rewrite(relation, subtract)
            }
        }
    }

    fn validate_arrow(
        &self,
        relation: &RelationDefinition,
        tupleset: &str,
        computed_userset: &str,
    ) -> Result<(), SchemaError> {
        let tupleset_relation = self.relation(tupleset).ok_or_else(|| {
            SchemaError::at(
                format!(
                    "relation `{tupleset}` used in arrow not found under definition `{}`",
                    self.definition.name
                ),
                relation.position,
                tupleset.to_string(),
            )
        })?;

        if !tupleset_relation.is_directly_assignable() {
            return Err(SchemaError::at(
                format!(
                    "relation `{tupleset}` used in arrow under definition `{}` must be directly assignable",
                    self.definition.name
                ),
                relation.position,
                tupleset.to_string(),
            ));
        }

        if tupleset_relation
            .type_constraints
            .iter()
            .any(|c| c.relation.as_deref().is_some_and(|r| r != ELLIPSIS))
        {
            return Err(SchemaError::at(
                format!(
                    "relation `{tupleset}` used in arrow under definition `{}` may not allow subject relations",
                    self.definition.name
                ),
                relation.position,
                tupleset.to_string(),
            ));
        }

        let found = tupleset_relation.type_constraints.iter().any(|constraint| {
            self.lookup_namespace(&constraint.namespace)
                .is_some_and(|target| target.relation(computed_userset).is_some())
        });
        if !found {
            return Err(SchemaError::at(
                format!(
                    "`{computed_userset}` not found on any type reachable through `{tupleset}` under definition `{}`",
                    self.definition.name
                ),
                relation.position,
                format!("{computed_userset} from {tupleset}"),
            ));
        }
        Ok(())
    }

    fn lookup_namespace(&self, name: &str) -> Option<Arc<NamespaceDefinition>> {
        if name == self.definition.name {
            return Some(Arc::clone(&self.definition));
        }
        self.resolver.namespace(name)
    }

    /// Rejects computed-userset cycles between relations of this namespace.
    fn detect_cycles(&self) -> Result<(), SchemaError> {
        let mut graph: HashMap<&str, HashSet<&str>> = HashMap::new();
        for relation in &self.definition.relations {
            let mut refs = HashSet::new();
            collect_computed_relations(&relation.rewrite, &mut refs);
            graph.insert(relation.name.as_str(), refs);
        }

        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        // Visit in definition order so the reported cycle is stable.
        for relation in &self.definition.relations {
            if dfs_cycle_detect(
                relation.name.as_str(),
                &graph,
                &mut visited,
                &mut on_stack,
                &mut path,
            ) {
                return Err(SchemaError::at(
                    format!(
                        "under definition `{}`, relation `{}` is part of a cycle: {}",
                        self.definition.name,
                        relation.name,
                        path.join(" -> ")
                    ),
                    relation.position,
                    relation.name.clone(),
                ));
            }
        }
        Ok(())
    }
}

fn collect_computed_relations<'a>(userset: &'a Userset, refs: &mut HashSet<&'a str>) {
    match userset {
        Userset::ComputedUserset { relation } => {
            refs.insert(relation.as_str());
        }
        // Arrows leave the object, so they cannot close a local cycle.
        Userset::This | Userset::TupleToUserset { .. } => {}
        Userset::Union { children } | Userset::Intersection { children } => {
            for child in children {
                collect_computed_relations(child, refs);
            }
        }
        Userset::Exclusion { base, subtract } => {
            collect_computed_relations(base, refs);
            collect_computed_relations(subtract, refs);
        }
    }
}

fn dfs_cycle_detect<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, HashSet<&'a str>>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    if on_stack.contains(node) {
        path.push(node);
        return true;
    }
    if !visited.insert(node) {
        return false;
    }

    on_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(node) {
        let mut neighbors: Vec<&str> = neighbors.iter().copied().collect();
        neighbors.sort_unstable();
        for neighbor in neighbors {
            if graph.contains_key(neighbor)
                && dfs_cycle_detect(neighbor, graph, visited, on_stack, path)
            {
                return true;
            }
        }
    }

    on_stack.remove(node);
    path.pop();
    false
}

/// A namespace type system that passed validation.
#[derive(Debug)]
pub struct ValidatedNamespaceTypeSystem {
    inner: NamespaceTypeSystem,
}

impl ValidatedNamespaceTypeSystem {
    pub fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    pub fn definition(&self) -> &NamespaceDefinition {
        &self.inner.definition
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.inner.relation(name)
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.inner.has_relation(name)
    }

    /// Returns true when relationships may be written for `relation`.
    pub fn is_directly_assignable(&self, relation: &str) -> bool {
        self.relation(relation)
            .is_some_and(RelationDefinition::is_directly_assignable)
    }

    /// Returns true when `relation` allows subjects of the given shape.
    ///
    /// `subject_relation` is `None` (or the ellipsis) for terminal subjects.
    /// The caveat must match the allowed type exactly: an uncaveated
    /// relationship needs an uncaveated entry and vice versa.
    pub fn allows_subject(
        &self,
        relation: &str,
        subject_namespace: &str,
        subject_relation: Option<&str>,
        wildcard: bool,
        caveat: Option<&str>,
    ) -> bool {
        let Some(definition) = self.relation(relation) else {
            return false;
        };
        let subject_relation = subject_relation.filter(|r| *r != ELLIPSIS);

        definition.type_constraints.iter().any(|constraint| {
            constraint.namespace == subject_namespace
                && constraint.wildcard == wildcard
                && constraint.relation.as_deref().filter(|r| *r != ELLIPSIS) == subject_relation
                && constraint.caveat.as_deref() == caveat
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::compile;

    fn build(source: &str, namespace: &str) -> Result<ValidatedNamespaceTypeSystem, SchemaError> {
        let schema = compile(source).expect("schema should compile");
        let definition = Arc::new(schema.namespace(namespace).unwrap().clone());
        let resolver = Arc::new(PredefinedDefinitions::new(
            schema.namespaces.clone(),
            schema.caveats.clone(),
        ));
        NamespaceTypeSystem::new(definition, resolver)?.validate()
    }

    const SCHEMA: &str = r#"
type user
type group
  relations
    define member: [user, group#member]
type folder
  relations
    define viewer: [user]
type document
  relations
    define parent: [folder]
    define owner: [user]
    define viewer: [user, user:*, group#member, user with on_network] or owner or viewer from parent
    define can_view: viewer
condition on_network(ip: string) { ip == "10.0.0.1" }
"#;

    // ========== Section 1: Valid Schemas ==========

    #[test]
    fn test_valid_schema_validates() {
        let ts = build(SCHEMA, "document").unwrap();
        assert_eq!(ts.namespace(), "document");
        assert!(ts.is_directly_assignable("viewer"));
        assert!(!ts.is_directly_assignable("can_view"));
        assert!(!ts.is_directly_assignable("missing"));
    }

    #[test]
    fn test_allows_subject_matches_shape_exactly() {
        let ts = build(SCHEMA, "document").unwrap();
        assert!(ts.allows_subject("viewer", "user", None, false, None));
        assert!(ts.allows_subject("viewer", "user", Some(ELLIPSIS), false, None));
        assert!(ts.allows_subject("viewer", "user", None, true, None));
        assert!(ts.allows_subject("viewer", "group", Some("member"), false, None));
        assert!(ts.allows_subject("viewer", "user", None, false, Some("on_network")));

        assert!(!ts.allows_subject("viewer", "group", None, false, None));
        assert!(!ts.allows_subject("viewer", "user", None, false, Some("other")));
        assert!(!ts.allows_subject("owner", "user", None, true, None));
        assert!(!ts.allows_subject("owner", "user", None, false, Some("on_network")));
    }

    // ========== Section 2: Invalid Schemas ==========

    #[test]
    fn test_duplicate_relation_rejected() {
        let definition = NamespaceDefinition::new("document")
            .with_relation(RelationDefinition::direct(
                "owner",
                vec![TypeConstraint::terminal("document")],
            ))
            .with_relation(RelationDefinition::direct(
                "owner",
                vec![TypeConstraint::terminal("document")],
            ));
        let err = NamespaceTypeSystem::new(
            Arc::new(definition),
            Arc::new(PredefinedDefinitions::default()),
        )
        .unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn test_unknown_subject_type_rejected_with_position() {
        let err =
            build("type document\n  relations\n    define viewer: [usr]", "document").unwrap_err();
        assert!(err.message.contains("usr"));
        assert_eq!(err.position, Some(SourcePosition::new(3, 5)));
    }

    #[test]
    fn test_unknown_subject_relation_rejected() {
        let err = build(
            "type group\ntype document\n  relations\n    define viewer: [group#member]",
            "document",
        )
        .unwrap_err();
        assert!(err.message.contains("member"));
    }

    #[test]
    fn test_unknown_caveat_rejected() {
        let err = build(
            "type user\ntype document\n  relations\n    define viewer: [user with nope]",
            "document",
        )
        .unwrap_err();
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn test_unknown_computed_relation_rejected() {
        let err = build(
            "type user\ntype document\n  relations\n    define viewer: editor",
            "document",
        )
        .unwrap_err();
        assert_eq!(err.context.as_deref(), Some("editor"));
    }

    #[test]
    fn test_arrow_over_userset_tupleset_rejected() {
        let err = build(
            "type group\n  relations\n    define member: [group]\ntype document\n  relations\n    define parent: [group#member]\n    define viewer: member from parent",
            "document",
        )
        .unwrap_err();
        assert!(err.message.contains("subject relations"));
    }

    #[test]
    fn test_arrow_computed_relation_must_exist_somewhere() {
        let err = build(
            "type folder\ntype document\n  relations\n    define parent: [folder]\n    define viewer: viewer from parent",
            "document",
        )
        .unwrap_err();
        assert!(err.message.contains("not found on any type"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = build(
            "type document\n  relations\n    define a: b\n    define b: a",
            "document",
        )
        .unwrap_err();
        assert!(err.message.contains("cycle"));
        assert!(err.message.contains("a -> b -> a"));
    }

    #[test]
    fn test_this_without_types_rejected() {
        let definition = NamespaceDefinition::new("document")
            .with_relation(RelationDefinition::direct("viewer", Vec::new()));
        let err = NamespaceTypeSystem::new(
            Arc::new(definition),
            Arc::new(PredefinedDefinitions::default()),
        )
        .unwrap()
        .validate()
        .unwrap_err();
        assert!(err.message.contains("allowed subject type"));
    }
}
