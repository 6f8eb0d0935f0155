//! Adapters that bridge the storage layer to the domain layer.
//!
//! The domain layer (rsrel-domain) defines abstract ports for data access:
//! - `RelationshipReader`: Read relationships for checks and expansions
//! - `DefinitionReader`: Read namespace and caveat definitions
//!
//! The storage layer (rsrel-storage) implements `DataStore` and stores
//! definitions as JSON. This module encodes domain values into storage rows,
//! decodes them back, and implements the domain ports over a `DataStore`.

use std::sync::Arc;

use async_trait::async_trait;

use rsrel_domain::dispatch::{DefinitionReader, DispatchError, DispatchResult, RelationshipReader};
use rsrel_domain::model::{
    CaveatDefinition, ContextualizedCaveat, NamespaceDefinition, ObjectAndRelation, Relationship,
    Revision,
};
use rsrel_storage::{
    DataStore, RelationshipFilter, StorageError, StoredCaveat, StoredNamespace,
    StoredRelationship,
};

use crate::error::{DevError, DevResult};

// ============ Encoding ============

pub fn encode_namespace(definition: &NamespaceDefinition) -> DevResult<StoredNamespace> {
    let json = serde_json::to_string(definition).map_err(|e| DevError::Decode {
        kind: "namespace",
        name: definition.name.clone(),
        message: e.to_string(),
    })?;
    Ok(StoredNamespace {
        name: definition.name.clone(),
        definition: json,
    })
}

pub fn encode_caveat(definition: &CaveatDefinition) -> DevResult<StoredCaveat> {
    let json = serde_json::to_string(definition).map_err(|e| DevError::Decode {
        kind: "caveat",
        name: definition.name.clone(),
        message: e.to_string(),
    })?;
    Ok(StoredCaveat {
        name: definition.name.clone(),
        definition: json,
    })
}

pub fn decode_namespace(stored: &StoredNamespace) -> DevResult<NamespaceDefinition> {
    serde_json::from_str(&stored.definition).map_err(|e| DevError::Decode {
        kind: "namespace",
        name: stored.name.clone(),
        message: e.to_string(),
    })
}

pub fn decode_caveat(stored: &StoredCaveat) -> DevResult<CaveatDefinition> {
    serde_json::from_str(&stored.definition).map_err(|e| DevError::Decode {
        kind: "caveat",
        name: stored.name.clone(),
        message: e.to_string(),
    })
}

pub fn to_stored_relationship(relationship: &Relationship) -> StoredRelationship {
    let (caveat_name, caveat_context) = match &relationship.caveat {
        Some(caveat) => (
            Some(caveat.name.clone()),
            (!caveat.context.is_empty())
                .then(|| serde_json::Value::Object(caveat.context.clone())),
        ),
        None => (None, None),
    };

    StoredRelationship {
        resource_type: relationship.resource.namespace.clone(),
        resource_id: relationship.resource.object_id.clone(),
        relation: relationship.resource.relation.clone(),
        subject_type: relationship.subject.namespace.clone(),
        subject_id: relationship.subject.object_id.clone(),
        subject_relation: relationship.subject.relation.clone(),
        caveat_name,
        caveat_context,
    }
}

pub fn from_stored_relationship(stored: StoredRelationship) -> Relationship {
    let relationship = Relationship::new(
        ObjectAndRelation::new(stored.resource_type, stored.resource_id, stored.relation),
        ObjectAndRelation::new(stored.subject_type, stored.subject_id, stored.subject_relation),
    );
    match stored.caveat_name {
        Some(name) => {
            let caveat = match stored.caveat_context {
                Some(serde_json::Value::Object(context)) => {
                    ContextualizedCaveat::with_context(name, context)
                }
                _ => ContextualizedCaveat::new(name),
            };
            relationship.with_caveat(caveat)
        }
        None => relationship,
    }
}

fn storage_revision(revision: Revision) -> rsrel_storage::Revision {
    rsrel_storage::Revision(revision.0)
}

/// Maps storage failures seen during dispatch onto dispatch errors.
pub fn storage_to_dispatch(err: StorageError) -> DispatchError {
    match err {
        StorageError::NamespaceNotFound { name } => {
            DispatchError::UnknownNamespace { namespace: name }
        }
        StorageError::InvalidRevision { .. } => DispatchError::InvalidRevision {
            message: err.to_string(),
        },
        other => DispatchError::Storage {
            message: other.to_string(),
        },
    }
}

fn decode_to_dispatch(err: DevError) -> DispatchError {
    DispatchError::Storage {
        message: err.to_string(),
    }
}

// ============ Domain ports ============

/// Adapter that implements `RelationshipReader` using a `DataStore`.
pub struct DataStoreRelationshipReader<S: DataStore + ?Sized> {
    storage: Arc<S>,
}

impl<S: DataStore + ?Sized> DataStoreRelationshipReader<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: DataStore + ?Sized> RelationshipReader for DataStoreRelationshipReader<S> {
    async fn read_relationships(
        &self,
        resource: &ObjectAndRelation,
        revision: Revision,
    ) -> DispatchResult<Vec<Relationship>> {
        let filter = RelationshipFilter::new(resource.namespace.clone())
            .with_resource_id(resource.object_id.clone())
            .with_relation(resource.relation.clone());

        let rows = self
            .storage
            .read_relationships(&filter, storage_revision(revision))
            .await
            .map_err(storage_to_dispatch)?;

        Ok(rows.into_iter().map(from_stored_relationship).collect())
    }
}

/// Adapter that implements `DefinitionReader` using a `DataStore`.
pub struct DataStoreDefinitionReader<S: DataStore + ?Sized> {
    storage: Arc<S>,
}

impl<S: DataStore + ?Sized> DataStoreDefinitionReader<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: DataStore + ?Sized> DefinitionReader for DataStoreDefinitionReader<S> {
    async fn read_namespace(
        &self,
        name: &str,
        revision: Revision,
    ) -> DispatchResult<Arc<NamespaceDefinition>> {
        let read = self
            .storage
            .read_namespace(name, storage_revision(revision))
            .await
            .map_err(storage_to_dispatch)?;
        let definition = decode_namespace(&read.namespace).map_err(decode_to_dispatch)?;
        Ok(Arc::new(definition))
    }

    async fn read_caveat(
        &self,
        name: &str,
        revision: Revision,
    ) -> DispatchResult<Arc<CaveatDefinition>> {
        let stored = self
            .storage
            .read_caveat(name, storage_revision(revision))
            .await
            .map_err(|err| match err {
                StorageError::CaveatNotFound { name } => DispatchError::InvalidArgument {
                    message: format!("caveat `{name}` not found"),
                },
                other => storage_to_dispatch(other),
            })?;
        let definition = decode_caveat(&stored).map_err(decode_to_dispatch)?;
        Ok(Arc::new(definition))
    }
}
