//! DataStore and transaction trait definitions.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Subject relation used for terminal subjects.
pub const ELLIPSIS: &str = "...";

/// A committed state of the store: the number of commits so far.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A namespace definition, serialized as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNamespace {
    pub name: String,
    pub definition: String,
}

/// A namespace together with the revision it was last written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadNamespace {
    pub namespace: StoredNamespace,
    pub revision: Revision,
}

/// A caveat definition, serialized as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCaveat {
    pub name: String,
    pub definition: String,
}

/// A stored relationship row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRelationship {
    pub resource_type: String,
    pub resource_id: String,
    pub relation: String,
    pub subject_type: String,
    pub subject_id: String,
    /// `...` for terminal subjects.
    pub subject_relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat_context: Option<serde_json::Value>,
}

impl StoredRelationship {
    /// The identity of the row; caveats are not part of it.
    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            resource_type: self.resource_type.clone(),
            resource_id: self.resource_id.clone(),
            relation: self.relation.clone(),
            subject_type: self.subject_type.clone(),
            subject_id: self.subject_id.clone(),
            subject_relation: self.subject_relation.clone(),
        }
    }
}

impl fmt::Display for StoredRelationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}:{}",
            self.resource_type, self.resource_id, self.relation, self.subject_type, self.subject_id
        )?;
        if self.subject_relation != ELLIPSIS {
            write!(f, "#{}", self.subject_relation)?;
        }
        Ok(())
    }
}

/// Identity of a relationship row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipKey {
    pub resource_type: String,
    pub resource_id: String,
    pub relation: String,
    pub subject_type: String,
    pub subject_id: String,
    pub subject_relation: String,
}

/// Kind of relationship update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperation {
    /// Create the relationship or replace its caveat.
    Touch,
    /// Create the relationship; fails if it exists.
    Create,
    /// Delete the relationship if it exists.
    Delete,
}

/// One relationship write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipUpdate {
    pub operation: UpdateOperation,
    pub relationship: StoredRelationship,
}

impl RelationshipUpdate {
    pub fn touch(relationship: StoredRelationship) -> Self {
        Self {
            operation: UpdateOperation::Touch,
            relationship,
        }
    }

    pub fn create(relationship: StoredRelationship) -> Self {
        Self {
            operation: UpdateOperation::Create,
            relationship,
        }
    }

    pub fn delete(relationship: StoredRelationship) -> Self {
        Self {
            operation: UpdateOperation::Delete,
            relationship,
        }
    }
}

/// Filter for reading relationships.
#[derive(Debug, Clone, Default)]
pub struct RelationshipFilter {
    /// Required resource type.
    pub resource_type: String,
    /// Filter by resource ID.
    pub resource_id: Option<String>,
    /// Filter by relation.
    pub relation: Option<String>,
}

impl RelationshipFilter {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Self::default()
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    pub fn matches(&self, relationship: &StoredRelationship) -> bool {
        relationship.resource_type == self.resource_type
            && self
                .resource_id
                .as_ref()
                .map_or(true, |id| *id == relationship.resource_id)
            && self
                .relation
                .as_ref()
                .map_or(true, |relation| *relation == relationship.relation)
    }
}

/// Abstract revisioned storage for schemas and relationships.
///
/// Implementations must be thread-safe (Send + Sync) and support
/// async operations. Reads take a revision and see the state committed as
/// of that revision.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    /// Starts a read-write transaction.
    async fn begin_read_write(&self) -> StorageResult<Box<dyn ReadWriteTransaction>>;

    /// The latest committed revision.
    async fn head_revision(&self) -> StorageResult<Revision>;

    /// Fails with `StorageError::InvalidRevision` when `revision` is not readable.
    async fn check_revision(&self, revision: Revision) -> StorageResult<()>;

    async fn read_namespace(&self, name: &str, revision: Revision) -> StorageResult<ReadNamespace>;

    async fn list_namespaces(&self, revision: Revision) -> StorageResult<Vec<StoredNamespace>>;

    async fn read_caveat(&self, name: &str, revision: Revision) -> StorageResult<StoredCaveat>;

    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
        revision: Revision,
    ) -> StorageResult<Vec<StoredRelationship>>;

    /// Releases the store. Later operations fail with `StorageError::Closed`;
    /// closing twice is a no-op.
    async fn close(&self) -> StorageResult<()>;
}

/// A read-write transaction. Writes are staged until `commit`; reads
/// observe staged writes. Dropping an uncommitted transaction rolls it back.
#[async_trait]
pub trait ReadWriteTransaction: Send + Sync {
    async fn write_caveats(&mut self, caveats: Vec<StoredCaveat>) -> StorageResult<()>;

    async fn write_namespaces(&mut self, namespaces: Vec<StoredNamespace>) -> StorageResult<()>;

    /// Deletes namespaces together with their relationships.
    async fn delete_namespaces(&mut self, names: Vec<String>) -> StorageResult<()>;

    async fn write_relationships(&mut self, updates: Vec<RelationshipUpdate>) -> StorageResult<()>;

    async fn read_namespace(&self, name: &str) -> StorageResult<StoredNamespace>;

    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
    ) -> StorageResult<Vec<StoredRelationship>>;

    /// Applies every staged write atomically and returns the new revision.
    async fn commit(self: Box<Self>) -> StorageResult<Revision>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Validates a definition name and its JSON body.
pub fn validate_definition(kind: &str, name: &str, definition: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidInput {
            message: format!("{kind} name cannot be empty"),
        });
    }
    serde_json::from_str::<serde_json::Value>(definition)?;
    Ok(())
}

/// Validates the fields of a relationship row.
pub fn validate_relationship(relationship: &StoredRelationship) -> StorageResult<()> {
    let fields = [
        ("resource_type", &relationship.resource_type),
        ("resource_id", &relationship.resource_id),
        ("relation", &relationship.relation),
        ("subject_type", &relationship.subject_type),
        ("subject_id", &relationship.subject_id),
        ("subject_relation", &relationship.subject_relation),
    ];
    for (field, value) in fields {
        if value.is_empty() {
            return Err(StorageError::InvalidInput {
                message: format!("{field} cannot be empty in relationship {relationship}"),
            });
        }
    }

    match (&relationship.caveat_name, &relationship.caveat_context) {
        (None, Some(_)) => Err(StorageError::InvalidInput {
            message: format!("caveat context without caveat name in relationship {relationship}"),
        }),
        (_, Some(context)) if !context.is_object() => Err(StorageError::InvalidInput {
            message: format!("caveat context must be an object in relationship {relationship}"),
        }),
        _ => Ok(()),
    }
}
