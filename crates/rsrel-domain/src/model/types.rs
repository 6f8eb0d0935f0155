//! Core value types: object-and-relation identities, relationships and revisions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

use super::caveat::ContextualizedCaveat;

/// Object id marking a wildcard subject: every object of the namespace.
pub const WILDCARD_ID: &str = "*";

/// Relation used for terminal subjects (`user:alice`), omitted when rendered.
pub const ELLIPSIS: &str = "...";

const MAX_IDENTIFIER_LEN: usize = 64;
const MAX_OBJECT_ID_LEN: usize = 1024;

/// An object-and-relation triple, e.g. `document:readme#viewer`.
///
/// Equality, ordering and hashing are structural over all three fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectAndRelation {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
}

impl ObjectAndRelation {
    /// Creates a new object-and-relation.
    pub fn new(
        namespace: impl Into<String>,
        object_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            object_id: object_id.into(),
            relation: relation.into(),
        }
    }

    /// Creates a terminal subject (`namespace:object_id` with the ellipsis relation).
    pub fn terminal(namespace: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self::new(namespace, object_id, ELLIPSIS)
    }

    /// Creates the wildcard subject for a namespace.
    pub fn wildcard(namespace: impl Into<String>) -> Self {
        Self::new(namespace, WILDCARD_ID, ELLIPSIS)
    }

    /// Parses `ns:id#rel` or `ns:id` (ellipsis relation).
    pub fn parse(value: &str) -> DomainResult<Self> {
        let invalid = || DomainError::InvalidObjectAndRelation {
            value: value.to_string(),
        };

        let (object, relation) = match value.split_once('#') {
            Some((object, relation)) => (object, relation),
            None => (value, ELLIPSIS),
        };
        let (namespace, object_id) = object.split_once(':').ok_or_else(invalid)?;

        if !is_valid_namespace(namespace)
            || !is_valid_object_id(object_id)
            || !is_valid_relation(relation)
        {
            return Err(invalid());
        }

        Ok(Self::new(namespace, object_id, relation))
    }

    /// Returns true when this names every object of its namespace.
    pub fn is_wildcard(&self) -> bool {
        self.object_id == WILDCARD_ID
    }

    /// Returns true when the relation is the ellipsis.
    pub fn is_terminal(&self) -> bool {
        self.relation == ELLIPSIS
    }

    /// Returns the same object with a different relation.
    pub fn with_relation(&self, relation: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), self.object_id.clone(), relation)
    }
}

impl fmt::Display for ObjectAndRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_terminal() {
            write!(f, "{}:{}", self.namespace, self.object_id)
        } else {
            write!(f, "{}:{}#{}", self.namespace, self.object_id, self.relation)
        }
    }
}

impl FromStr for ObjectAndRelation {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A relationship between a resource relation and a subject, optionally caveated.
///
/// Text form: `document:readme#viewer@user:alice[on_network:{"allowed":"10.0.0.1"}]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<ContextualizedCaveat>,
}

impl Relationship {
    /// Creates an uncaveated relationship.
    pub fn new(resource: ObjectAndRelation, subject: ObjectAndRelation) -> Self {
        Self {
            resource,
            subject,
            caveat: None,
        }
    }

    /// Attaches a caveat to the relationship.
    pub fn with_caveat(mut self, caveat: ContextualizedCaveat) -> Self {
        self.caveat = Some(caveat);
        self
    }

    /// Parses the relationship text form.
    ///
    /// Parsing only splits the text; call [`Relationship::validate`] for the
    /// identifier grammar.
    pub fn parse(value: &str) -> DomainResult<Self> {
        let invalid = |reason: &str| DomainError::InvalidRelationship {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = value.trim();
        let (body, caveat) = match trimmed.find('[') {
            Some(start) => {
                let inner = trimmed[start + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| invalid("unterminated caveat"))?;
                (&trimmed[..start], Some(parse_caveat(inner, value)?))
            }
            None => (trimmed, None),
        };

        let (resource, subject) = body
            .split_once('@')
            .ok_or_else(|| invalid("missing `@` between resource and subject"))?;
        let (resource_object, resource_relation) = resource
            .split_once('#')
            .ok_or_else(|| invalid("missing resource relation"))?;
        let (resource_namespace, resource_id) = resource_object
            .split_once(':')
            .ok_or_else(|| invalid("missing resource object id"))?;

        let subject = match subject.split_once('#') {
            Some((object, relation)) => {
                let (namespace, id) = object
                    .split_once(':')
                    .ok_or_else(|| invalid("missing subject object id"))?;
                ObjectAndRelation::new(namespace, id, relation)
            }
            None => {
                let (namespace, id) = subject
                    .split_once(':')
                    .ok_or_else(|| invalid("missing subject object id"))?;
                ObjectAndRelation::terminal(namespace, id)
            }
        };

        Ok(Self {
            resource: ObjectAndRelation::new(resource_namespace, resource_id, resource_relation),
            subject,
            caveat,
        })
    }

    /// Validates the relationship structure.
    ///
    /// Checks identifier grammar on every field, forbids wildcard resources and
    /// ellipsis resource relations, and forbids relations on wildcard subjects.
    pub fn validate(&self) -> DomainResult<()> {
        let invalid = |reason: String| DomainError::InvalidRelationship {
            value: self.to_string(),
            reason,
        };

        if !is_valid_namespace(&self.resource.namespace) {
            return Err(invalid(format!(
                "invalid resource namespace `{}`",
                self.resource.namespace
            )));
        }
        if self.resource.is_wildcard() {
            return Err(invalid("resource object id cannot be a wildcard".to_string()));
        }
        if !is_valid_object_id(&self.resource.object_id) {
            return Err(invalid(format!(
                "invalid resource object id `{}`",
                self.resource.object_id
            )));
        }
        if self.resource.is_terminal() || !is_valid_relation(&self.resource.relation) {
            return Err(invalid(format!(
                "invalid resource relation `{}`",
                self.resource.relation
            )));
        }
        if !is_valid_namespace(&self.subject.namespace) {
            return Err(invalid(format!(
                "invalid subject namespace `{}`",
                self.subject.namespace
            )));
        }
        if !is_valid_object_id(&self.subject.object_id) {
            return Err(invalid(format!(
                "invalid subject object id `{}`",
                self.subject.object_id
            )));
        }
        if !is_valid_relation(&self.subject.relation) {
            return Err(invalid(format!(
                "invalid subject relation `{}`",
                self.subject.relation
            )));
        }
        if self.subject.is_wildcard() && !self.subject.is_terminal() {
            return Err(invalid("wildcard subjects cannot carry a relation".to_string()));
        }
        if let Some(caveat) = &self.caveat {
            if !is_valid_identifier(&caveat.name) {
                return Err(invalid(format!("invalid caveat name `{}`", caveat.name)));
            }
        }
        Ok(())
    }
}

fn parse_caveat(inner: &str, original: &str) -> DomainResult<ContextualizedCaveat> {
    match inner.split_once(':') {
        Some((name, context)) => {
            let value: serde_json::Value =
                serde_json::from_str(context).map_err(|e| DomainError::InvalidCaveatContext {
                    caveat: name.to_string(),
                    reason: e.to_string(),
                })?;
            match value {
                serde_json::Value::Object(map) => Ok(ContextualizedCaveat::with_context(name, map)),
                _ => Err(DomainError::InvalidCaveatContext {
                    caveat: name.to_string(),
                    reason: "context must be a JSON object".to_string(),
                }),
            }
        }
        None if inner.is_empty() => Err(DomainError::InvalidRelationship {
            value: original.to_string(),
            reason: "empty caveat".to_string(),
        }),
        None => Ok(ContextualizedCaveat::new(inner)),
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}",
            self.resource.namespace, self.resource.object_id, self.resource.relation, self.subject
        )?;
        if let Some(caveat) = &self.caveat {
            if caveat.context.is_empty() {
                write!(f, "[{}]", caveat.name)?;
            } else {
                let context = serde_json::Value::Object(caveat.context.clone());
                write!(f, "[{}:{}]", caveat.name, context)?;
            }
        }
        Ok(())
    }
}

/// A consistency checkpoint: a monotonically increasing commit counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    /// Returns the revision that precedes any commit.
    pub fn zero() -> Self {
        Self(0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checks the `[a-z][a-z0-9_]*` identifier grammar used for relations and caveats.
pub fn is_valid_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    value.len() <= MAX_IDENTIFIER_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Checks a namespace name, allowing a single `prefix/` segment.
pub fn is_valid_namespace(value: &str) -> bool {
    match value.split_once('/') {
        Some((prefix, name)) => is_valid_identifier(prefix) && is_valid_identifier(name),
        None => is_valid_identifier(value),
    }
}

/// Checks a relation name; the ellipsis is a valid relation.
pub fn is_valid_relation(value: &str) -> bool {
    value == ELLIPSIS || is_valid_identifier(value)
}

/// Checks an object id; the wildcard marker is a valid object id.
pub fn is_valid_object_id(value: &str) -> bool {
    if value == WILDCARD_ID {
        return true;
    }
    !value.is_empty()
        && value.len() <= MAX_OBJECT_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '|' | '-' | '=' | '+'))
}
