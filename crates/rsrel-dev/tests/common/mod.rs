//! Shared helpers for the sandbox integration tests.

// Used across different test files; each file is analyzed independently.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use rsrel_dev::{DevConfig, DevContext, DevContextError, DevRequest, EvaluationScope};
use rsrel_domain::model::ObjectAndRelation;
use rsrel_storage::{
    DataStore, MemoryDataStore, ReadNamespace, ReadWriteTransaction, RelationshipFilter, Revision,
    StorageResult, StoredCaveat, StoredNamespace, StoredRelationship,
};

pub const SCHEMA: &str = r#"
type user
type group
  relations
    define member: [user, group#member]
type document
  relations
    define owner: [user]
    define viewer: [user, user:*, group#member, user with on_network] or owner
    define banned: [user]
    define view: viewer but not banned
condition on_network(allowed: string, ip: string) {
  ip == allowed
}
"#;

pub fn onr(text: &str) -> ObjectAndRelation {
    ObjectAndRelation::parse(text).unwrap()
}

pub async fn sandbox(relationships: &str) -> anyhow::Result<DevContext> {
    let request = DevRequest::from_text(SCHEMA, relationships)
        .map_err(|errors| anyhow::anyhow!("bad relationships: {errors:?}"))?;
    Ok(DevContext::new(EvaluationScope::new(), &request, &DevConfig::default()).await?)
}

pub async fn build_over(
    store: &RetainingStore,
    request: &DevRequest,
) -> Result<DevContext, DevContextError> {
    DevContext::with_datastore(
        EvaluationScope::new(),
        request,
        &DevConfig::default(),
        Arc::new(store.clone()),
    )
    .await
}

/// A store that records `close` calls but stays readable, so tests can
/// inspect what a failed sandbox left behind.
#[derive(Clone, Default)]
pub struct RetainingStore {
    inner: MemoryDataStore,
    closes: Arc<AtomicUsize>,
}

impl RetainingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataStore for RetainingStore {
    async fn begin_read_write(&self) -> StorageResult<Box<dyn ReadWriteTransaction>> {
        self.inner.begin_read_write().await
    }

    async fn head_revision(&self) -> StorageResult<Revision> {
        self.inner.head_revision().await
    }

    async fn check_revision(&self, revision: Revision) -> StorageResult<()> {
        self.inner.check_revision(revision).await
    }

    async fn read_namespace(&self, name: &str, revision: Revision) -> StorageResult<ReadNamespace> {
        self.inner.read_namespace(name, revision).await
    }

    async fn list_namespaces(&self, revision: Revision) -> StorageResult<Vec<StoredNamespace>> {
        self.inner.list_namespaces(revision).await
    }

    async fn read_caveat(&self, name: &str, revision: Revision) -> StorageResult<StoredCaveat> {
        self.inner.read_caveat(name, revision).await
    }

    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
        revision: Revision,
    ) -> StorageResult<Vec<StoredRelationship>> {
        self.inner.read_relationships(filter, revision).await
    }

    async fn close(&self) -> StorageResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
