//! Ports used by the dispatcher and the dispatcher itself.

use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{
    CaveatDefinition, NamespaceDefinition, ObjectAndRelation, Relationship, Revision,
};

use super::types::{CheckRequest, CheckResult, ExpandRequest, ExpansionNode};
use super::DispatchResult;

/// Reads stored relationships.
#[async_trait]
pub trait RelationshipReader: Send + Sync {
    /// Reads every relationship for `resource` (namespace, object id and
    /// relation) as of `revision`, including caveats.
    async fn read_relationships(
        &self,
        resource: &ObjectAndRelation,
        revision: Revision,
    ) -> DispatchResult<Vec<Relationship>>;
}

/// Reads schema definitions.
#[async_trait]
pub trait DefinitionReader: Send + Sync {
    /// Returns `DispatchError::UnknownNamespace` when the namespace is missing.
    async fn read_namespace(
        &self,
        name: &str,
        revision: Revision,
    ) -> DispatchResult<Arc<NamespaceDefinition>>;

    async fn read_caveat(&self, name: &str, revision: Revision)
        -> DispatchResult<Arc<CaveatDefinition>>;
}

/// A bounded-depth traversal engine over relationships and rewrites.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Decides whether the subject has the resource relation.
    async fn check(&self, request: CheckRequest) -> DispatchResult<CheckResult>;

    /// Builds the expansion tree of the resource relation.
    async fn expand(&self, request: ExpandRequest) -> DispatchResult<ExpansionNode>;

    /// Releases the dispatcher; later requests fail with `DispatchError::Closed`.
    async fn close(&self) -> DispatchResult<()>;
}
