//! In-memory storage implementation.
//!
//! Every row carries the revision that created it and, once replaced or
//! deleted, the revision that deleted it. A read at revision `r` sees the rows
//! with `created <= r < deleted`, so snapshots stay stable while later
//! transactions commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    validate_definition, validate_relationship, DataStore, ReadNamespace, ReadWriteTransaction,
    RelationshipFilter, RelationshipKey, RelationshipUpdate, Revision, StoredCaveat,
    StoredNamespace, StoredRelationship, UpdateOperation,
};

/// A versioned row.
#[derive(Debug, Clone)]
struct Row<T> {
    value: T,
    created: u64,
    deleted: Option<u64>,
}

impl<T> Row<T> {
    fn new(value: T, created: u64) -> Self {
        Self {
            value,
            created,
            deleted: None,
        }
    }

    fn visible_at(&self, revision: u64) -> bool {
        self.created <= revision && self.deleted.map_or(true, |deleted| revision < deleted)
    }
}

fn visible<T>(rows: &[Row<T>], revision: u64) -> Option<&Row<T>> {
    rows.iter().rev().find(|row| row.visible_at(revision))
}

/// Marks the live row deleted at `revision` and appends `value` as the new live row.
fn replace<T>(rows: &mut Vec<Row<T>>, value: Option<T>, revision: u64) {
    if let Some(live) = rows.iter_mut().find(|row| row.deleted.is_none()) {
        live.deleted = Some(revision);
    }
    if let Some(value) = value {
        rows.push(Row::new(value, revision));
    }
}

#[derive(Debug, Default)]
struct Inner {
    namespaces: DashMap<String, Vec<Row<StoredNamespace>>>,
    caveats: DashMap<String, Vec<Row<StoredCaveat>>>,
    relationships: DashMap<RelationshipKey, Vec<Row<StoredRelationship>>>,
    head: AtomicU64,
    closed: AtomicBool,
    /// Serializes commits.
    commit_lock: Mutex<()>,
}

impl Inner {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    fn check_revision(&self, revision: Revision) -> StorageResult<()> {
        let head = self.head();
        if revision.0 > head {
            return Err(StorageError::InvalidRevision {
                revision: revision.0,
                head,
            });
        }
        Ok(())
    }

    fn namespace_at(&self, name: &str, revision: u64) -> Option<Row<StoredNamespace>> {
        self.namespaces
            .get(name)
            .and_then(|rows| visible(rows.value(), revision).cloned())
    }

    fn relationship_live_at(&self, key: &RelationshipKey, revision: u64) -> bool {
        self.relationships
            .get(key)
            .is_some_and(|rows| visible(rows.value(), revision).is_some())
    }

    fn relationships_at(
        &self,
        filter: &RelationshipFilter,
        revision: u64,
    ) -> BTreeMap<RelationshipKey, StoredRelationship> {
        self.relationships
            .iter()
            .filter_map(|entry| {
                visible(entry.value(), revision)
                    .filter(|row| filter.matches(&row.value))
                    .map(|row| (entry.key().clone(), row.value.clone()))
            })
            .collect()
    }
}

/// In-memory, MVCC implementation of [`DataStore`].
///
/// Cloning shares the underlying rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryDataStore {
    inner: Arc<Inner>,
}

impl MemoryDataStore {
    /// Creates a new, empty in-memory data store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory data store wrapped in Arc.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    #[instrument(skip(self))]
    async fn begin_read_write(&self) -> StorageResult<Box<dyn ReadWriteTransaction>> {
        self.inner.ensure_open()?;
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            base: self.inner.head(),
            caveats: BTreeMap::new(),
            namespaces: BTreeMap::new(),
            relationships: BTreeMap::new(),
            finished: false,
        }))
    }

    async fn head_revision(&self) -> StorageResult<Revision> {
        self.inner.ensure_open()?;
        Ok(Revision(self.inner.head()))
    }

    async fn check_revision(&self, revision: Revision) -> StorageResult<()> {
        self.inner.ensure_open()?;
        self.inner.check_revision(revision)
    }

    #[instrument(skip(self), fields(namespace = %name, revision = %revision))]
    async fn read_namespace(&self, name: &str, revision: Revision) -> StorageResult<ReadNamespace> {
        self.inner.ensure_open()?;
        self.inner.check_revision(revision)?;
        self.inner
            .namespace_at(name, revision.0)
            .map(|row| ReadNamespace {
                namespace: row.value,
                revision: Revision(row.created),
            })
            .ok_or_else(|| StorageError::NamespaceNotFound {
                name: name.to_string(),
            })
    }

    async fn list_namespaces(&self, revision: Revision) -> StorageResult<Vec<StoredNamespace>> {
        self.inner.ensure_open()?;
        self.inner.check_revision(revision)?;
        let mut namespaces: Vec<StoredNamespace> = self
            .inner
            .namespaces
            .iter()
            .filter_map(|entry| visible(entry.value(), revision.0).map(|row| row.value.clone()))
            .collect();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(namespaces)
    }

    #[instrument(skip(self), fields(caveat = %name, revision = %revision))]
    async fn read_caveat(&self, name: &str, revision: Revision) -> StorageResult<StoredCaveat> {
        self.inner.ensure_open()?;
        self.inner.check_revision(revision)?;
        self.inner
            .caveats
            .get(name)
            .and_then(|rows| visible(rows.value(), revision.0).map(|row| row.value.clone()))
            .ok_or_else(|| StorageError::CaveatNotFound {
                name: name.to_string(),
            })
    }

    #[instrument(
        skip(self, filter),
        fields(resource_type = %filter.resource_type, revision = %revision)
    )]
    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
        revision: Revision,
    ) -> StorageResult<Vec<StoredRelationship>> {
        self.inner.ensure_open()?;
        self.inner.check_revision(revision)?;
        Ok(self
            .inner
            .relationships_at(filter, revision.0)
            .into_values()
            .collect())
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.namespaces.clear();
            self.inner.caveats.clear();
            self.inner.relationships.clear();
            debug!("memory datastore closed");
        }
        Ok(())
    }
}

/// A staged relationship write.
#[derive(Debug, Clone)]
enum Staged {
    Write {
        relationship: StoredRelationship,
        create: bool,
    },
    Delete,
}

/// Read-write transaction over a [`MemoryDataStore`].
#[derive(Debug)]
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    /// Head revision when the transaction began; reads see this snapshot.
    base: u64,
    caveats: BTreeMap<String, StoredCaveat>,
    /// `None` stages a deletion.
    namespaces: BTreeMap<String, Option<StoredNamespace>>,
    relationships: BTreeMap<RelationshipKey, Staged>,
    finished: bool,
}

impl MemoryTransaction {
    fn relationship_exists(&self, key: &RelationshipKey) -> bool {
        match self.relationships.get(key) {
            Some(Staged::Write { .. }) => true,
            Some(Staged::Delete) => false,
            None => self.inner.relationship_live_at(key, self.base),
        }
    }

    fn staged_relationships(
        &self,
        filter: &RelationshipFilter,
    ) -> BTreeMap<RelationshipKey, StoredRelationship> {
        let mut rows = self.inner.relationships_at(filter, self.base);
        for (key, staged) in &self.relationships {
            match staged {
                Staged::Write { relationship, .. } if filter.matches(relationship) => {
                    rows.insert(key.clone(), relationship.clone());
                }
                Staged::Write { .. } => {}
                Staged::Delete => {
                    rows.remove(key);
                }
            }
        }
        rows
    }
}

#[async_trait]
impl ReadWriteTransaction for MemoryTransaction {
    async fn write_caveats(&mut self, caveats: Vec<StoredCaveat>) -> StorageResult<()> {
        self.inner.ensure_open()?;
        for caveat in &caveats {
            validate_definition("caveat", &caveat.name, &caveat.definition)?;
        }
        for caveat in caveats {
            self.caveats.insert(caveat.name.clone(), caveat);
        }
        Ok(())
    }

    async fn write_namespaces(&mut self, namespaces: Vec<StoredNamespace>) -> StorageResult<()> {
        self.inner.ensure_open()?;
        for namespace in &namespaces {
            validate_definition("namespace", &namespace.name, &namespace.definition)?;
        }
        for namespace in namespaces {
            self.namespaces
                .insert(namespace.name.clone(), Some(namespace));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_namespaces(&mut self, names: Vec<String>) -> StorageResult<()> {
        self.inner.ensure_open()?;
        for name in names {
            let exists = match self.namespaces.get(&name) {
                Some(staged) => staged.is_some(),
                None => self.inner.namespace_at(&name, self.base).is_some(),
            };
            if !exists {
                return Err(StorageError::NamespaceNotFound { name });
            }

            let owned = self.staged_relationships(&RelationshipFilter::new(&name));
            for key in owned.into_keys() {
                self.relationships.insert(key, Staged::Delete);
            }
            self.namespaces.insert(name, None);
        }
        Ok(())
    }

    async fn write_relationships(&mut self, updates: Vec<RelationshipUpdate>) -> StorageResult<()> {
        self.inner.ensure_open()?;
        for update in &updates {
            validate_relationship(&update.relationship)?;
        }

        for update in updates {
            let key = update.relationship.key();
            let staged = match update.operation {
                UpdateOperation::Touch => Staged::Write {
                    relationship: update.relationship,
                    create: false,
                },
                UpdateOperation::Create => {
                    if self.relationship_exists(&key) {
                        return Err(StorageError::DuplicateRelationship {
                            relationship: update.relationship.to_string(),
                        });
                    }
                    Staged::Write {
                        relationship: update.relationship,
                        create: true,
                    }
                }
                UpdateOperation::Delete => Staged::Delete,
            };
            self.relationships.insert(key, staged);
        }
        Ok(())
    }

    async fn read_namespace(&self, name: &str) -> StorageResult<StoredNamespace> {
        self.inner.ensure_open()?;
        let not_found = || StorageError::NamespaceNotFound {
            name: name.to_string(),
        };
        match self.namespaces.get(name) {
            Some(staged) => staged.clone().ok_or_else(not_found),
            None => self
                .inner
                .namespace_at(name, self.base)
                .map(|row| row.value)
                .ok_or_else(not_found),
        }
    }

    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
    ) -> StorageResult<Vec<StoredRelationship>> {
        self.inner.ensure_open()?;
        Ok(self.staged_relationships(filter).into_values().collect())
    }

    #[instrument(skip(self), fields(base = self.base))]
    async fn commit(self: Box<Self>) -> StorageResult<Revision> {
        let mut this = self;
        this.inner.ensure_open()?;
        let inner = Arc::clone(&this.inner);
        let _guard = inner
            .commit_lock
            .lock()
            .map_err(|_| StorageError::TransactionError {
                message: "commit lock poisoned".to_string(),
            })?;

        let head = inner.head();
        for (key, staged) in &this.relationships {
            if let Staged::Write {
                relationship,
                create: true,
            } = staged
            {
                if inner.relationship_live_at(key, head) {
                    return Err(StorageError::DuplicateRelationship {
                        relationship: relationship.to_string(),
                    });
                }
            }
        }

        let revision = head + 1;
        for (name, caveat) in std::mem::take(&mut this.caveats) {
            replace(&mut *inner.caveats.entry(name).or_default(), Some(caveat), revision);
        }
        for (name, namespace) in std::mem::take(&mut this.namespaces) {
            replace(&mut *inner.namespaces.entry(name).or_default(), namespace, revision);
        }
        for (key, staged) in std::mem::take(&mut this.relationships) {
            let value = match staged {
                Staged::Write { relationship, .. } => Some(relationship),
                Staged::Delete => None,
            };
            replace(&mut *inner.relationships.entry(key).or_default(), value, revision);
        }

        inner.head.store(revision, Ordering::Release);
        this.finished = true;
        debug!(revision, "transaction committed");
        Ok(Revision(revision))
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.finished = true;
        debug!(base = this.base, "transaction rolled back");
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(base = self.base, "uncommitted transaction dropped, rolling back");
        }
    }
}
