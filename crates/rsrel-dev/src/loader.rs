//! Schema and relationship loading into a sandbox transaction.
//!
//! Schema definitions are validated one by one and errors are accumulated.
//! Relationships are checked the way a live write would check them before
//! the batch is written.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use rsrel_domain::cel::CompiledCaveat;
use rsrel_domain::dispatch::{DispatchError, DispatchResult};
use rsrel_domain::model::{
    CompiledSchema, DefinitionResolver, NamespaceTypeSystem, PredefinedDefinitions, Relationship,
    SchemaError, ValidatedNamespaceTypeSystem,
};
use rsrel_storage::{ReadWriteTransaction, RelationshipUpdate, StorageError};

use crate::adapters::{encode_caveat, encode_namespace, to_stored_relationship};
use crate::classify::{classify, Classification, ErrorReporter, EvaluationScope};
use crate::error::{DevError, DevResult, DeveloperError, ErrorKind, ErrorSource};

/// Definitions that passed validation and were written to the transaction.
#[derive(Debug, Default)]
pub struct LoadedDefinitions {
    type_systems: HashMap<String, ValidatedNamespaceTypeSystem>,
    caveats: HashMap<String, Arc<CompiledCaveat>>,
}

impl LoadedDefinitions {
    pub fn type_system(&self, namespace: &str) -> Option<&ValidatedNamespaceTypeSystem> {
        self.type_systems.get(namespace)
    }

    pub fn caveat(&self, name: &str) -> Option<&Arc<CompiledCaveat>> {
        self.caveats.get(name)
    }
}

/// Result of loading a batch: developer errors are data, storage failures are
/// errors.
pub type LoadResult<T> = DevResult<(T, Vec<DeveloperError>)>;

fn schema_issue(err: &SchemaError, fallback_context: &str) -> DeveloperError {
    let developer = DeveloperError::new(
        err.message.clone(),
        ErrorSource::Schema,
        ErrorKind::SchemaIssue,
    );
    match err.position {
        Some(position) => developer
            .with_position(Some(position))
            .with_context(err.context.clone().unwrap_or_else(|| fallback_context.to_string())),
        None => developer.with_context(fallback_context),
    }
}

/// Validates and writes every caveat and namespace of `schema`.
///
/// Each definition is validated independently so all problems are reported
/// together. A storage failure aborts immediately.
#[instrument(
    skip_all,
    fields(namespaces = schema.namespaces.len(), caveats = schema.caveats.len())
)]
pub async fn load_schema(
    tx: &mut dyn ReadWriteTransaction,
    schema: &CompiledSchema,
) -> LoadResult<LoadedDefinitions> {
    let mut errors = Vec::new();
    let mut loaded = LoadedDefinitions::default();
    let resolver: Arc<dyn DefinitionResolver> = Arc::new(PredefinedDefinitions::new(
        schema.namespaces.clone(),
        schema.caveats.clone(),
    ));

    for definition in &schema.caveats {
        match CompiledCaveat::compile(definition) {
            Ok(compiled) => {
                tx.write_caveats(vec![encode_caveat(definition)?]).await?;
                loaded
                    .caveats
                    .insert(definition.name.clone(), Arc::new(compiled));
            }
            Err(err) => {
                let developer = DeveloperError::new(
                    err.to_string(),
                    ErrorSource::Schema,
                    ErrorKind::SchemaIssue,
                );
                // CEL errors carry no location of their own; point at the body.
                let developer = match definition.expression_position.or(definition.position) {
                    Some(position) => developer
                        .with_position(Some(position))
                        .with_context(definition.expression.trim()),
                    None => developer.with_context(definition.name.clone()),
                };
                errors.push(developer);
            }
        }
    }

    for definition in &schema.namespaces {
        let validated =
            NamespaceTypeSystem::new(Arc::new(definition.clone()), Arc::clone(&resolver))
                .and_then(NamespaceTypeSystem::validate);
        match validated {
            Ok(type_system) => {
                tx.write_namespaces(vec![encode_namespace(definition)?]).await?;
                loaded
                    .type_systems
                    .insert(definition.name.clone(), type_system);
            }
            Err(err) => errors.push(schema_issue(&err, &definition.name)),
        }
    }

    debug!(errors = errors.len(), "schema loaded into transaction");
    Ok((loaded, errors))
}

/// Checks a relationship against what a live write would enforce: the types
/// it references exist in the transaction, the relation accepts writes and
/// allows the subject type, and the caveat context fits the caveat.
pub async fn validate_relationship_write(
    tx: &dyn ReadWriteTransaction,
    loaded: &LoadedDefinitions,
    relationship: &Relationship,
) -> DispatchResult<()> {
    let resource = &relationship.resource;
    let subject = &relationship.subject;

    let resource_types = namespace_in_transaction(tx, loaded, &resource.namespace).await?;
    if !resource_types.has_relation(&resource.relation) {
        return Err(DispatchError::UnknownRelation {
            namespace: resource.namespace.clone(),
            relation: resource.relation.clone(),
        });
    }

    let subject_types = namespace_in_transaction(tx, loaded, &subject.namespace).await?;
    if !subject.is_terminal() && !subject_types.has_relation(&subject.relation) {
        return Err(DispatchError::UnknownRelation {
            namespace: subject.namespace.clone(),
            relation: subject.relation.clone(),
        });
    }

    if !resource_types.is_directly_assignable(&resource.relation) {
        return Err(DispatchError::InvalidRelationReference {
            message: format!(
                "cannot write a relationship to permission `{}` under definition `{}`",
                resource.relation, resource.namespace
            ),
        });
    }

    let caveat_name = relationship.caveat.as_ref().map(|c| c.name.as_str());
    if !resource_types.allows_subject(
        &resource.relation,
        &subject.namespace,
        Some(subject.relation.as_str()),
        subject.is_wildcard(),
        caveat_name,
    ) {
        let mut subject_type = if subject.is_wildcard() {
            format!("{}:*", subject.namespace)
        } else if subject.is_terminal() {
            subject.namespace.clone()
        } else {
            format!("{}#{}", subject.namespace, subject.relation)
        };
        if let Some(caveat) = caveat_name {
            subject_type = format!("{subject_type} with {caveat}");
        }
        return Err(DispatchError::InvalidRelationReference {
            message: format!(
                "subjects of type `{subject_type}` are not allowed on relation `{}#{}`",
                resource.namespace, resource.relation
            ),
        });
    }

    if let Some(caveat) = &relationship.caveat {
        let compiled = loaded
            .caveat(&caveat.name)
            .ok_or_else(|| DispatchError::InvalidArgument {
                message: format!("caveat `{}` not found", caveat.name),
            })?;
        compiled
            .validate_context(&caveat.context)
            .map_err(|e| DispatchError::InvalidArgument {
                message: format!("invalid context for caveat `{}`: {e}", caveat.name),
            })?;
    }

    Ok(())
}

async fn namespace_in_transaction<'a>(
    tx: &dyn ReadWriteTransaction,
    loaded: &'a LoadedDefinitions,
    namespace: &str,
) -> DispatchResult<&'a ValidatedNamespaceTypeSystem> {
    match tx.read_namespace(namespace).await {
        Ok(_) => {}
        Err(StorageError::NamespaceNotFound { .. }) => {
            return Err(DispatchError::UnknownNamespace {
                namespace: namespace.to_string(),
            })
        }
        Err(err) => {
            return Err(DispatchError::Storage {
                message: err.to_string(),
            })
        }
    }
    loaded
        .type_system(namespace)
        .ok_or_else(|| DispatchError::UnknownNamespace {
            namespace: namespace.to_string(),
        })
}

/// Validates and writes test relationships.
///
/// Every relationship is checked so all problems are reported together. The
/// batch is written only when none failed.
#[instrument(skip_all, fields(relationships = relationships.len()))]
pub async fn load_relationships(
    tx: &mut dyn ReadWriteTransaction,
    loaded: &LoadedDefinitions,
    relationships: &[Relationship],
    reporter: &dyn ErrorReporter,
    scope: &EvaluationScope,
) -> LoadResult<usize> {
    let mut errors = Vec::new();
    let mut updates = Vec::with_capacity(relationships.len());

    for relationship in relationships {
        let text = relationship.to_string();
        if let Err(err) = relationship.validate() {
            errors.push(
                DeveloperError::new(
                    err.to_string(),
                    ErrorSource::Relationship,
                    ErrorKind::ParseError,
                )
                .with_context(text),
            );
            continue;
        }

        if let Err(err) = validate_relationship_write(&*tx, loaded, relationship).await {
            match classify(
                err,
                ErrorSource::Relationship,
                None,
                None,
                Some(&text),
                reporter,
                scope,
            ) {
                Classification::Developer(developer) => {
                    errors.push(developer);
                    continue;
                }
                Classification::Infrastructure(err) => return Err(err),
            }
        }

        updates.push(RelationshipUpdate::touch(to_stored_relationship(relationship)));
    }

    if !errors.is_empty() {
        debug!(errors = errors.len(), "skipping relationship batch");
        return Ok((0, errors));
    }

    let written = updates.len();
    tx.write_relationships(updates).await.map_err(DevError::from)?;
    Ok((written, errors))
}
