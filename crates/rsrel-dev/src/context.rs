//! The sandbox: an isolated store loaded with a schema and test relationships,
//! plus a depth-bounded dispatcher over it.
//!
//! # Construction
//!
//! ```text
//! compile ─► begin tx ─► caveats ─► namespaces ─► relationships ─► commit ─► validate request ─► dispatcher
//!               │            └──── developer errors: roll back ────┘
//!               └──────────── any failure: close the store ─────────────────────┘
//! ```
//!
//! A sandbox owns its store and dispatcher exclusively. [`DevContext::dispose`]
//! releases the dispatcher first and then the store.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use rsrel_domain::dispatch::{
    CheckRequest, CheckResult, DispatchError, DispatchResult, Dispatcher, ExpandRequest,
    ExpansionMode, ExpansionNode, LocalDispatcher,
};
use rsrel_domain::membership::{FoundSubjects, MembershipSet};
use rsrel_domain::model::{compile, CompileError, CompiledSchema, ObjectAndRelation, Revision};
use rsrel_storage::{DataStore, MemoryDataStore, ReadWriteTransaction};

use crate::adapters::{DataStoreDefinitionReader, DataStoreRelationshipReader};
use crate::classify::{ErrorReporter, EvaluationScope, TracingReporter};
use crate::config::DevConfig;
use crate::error::{DevContextError, DevError, DeveloperError, ErrorKind, ErrorSource, Status};
use crate::loader::{load_relationships, load_schema};
use crate::request::DevRequest;

/// A ready-to-query sandbox.
pub struct DevContext {
    scope: EvaluationScope,
    schema: CompiledSchema,
    revision: Revision,
    datastore: Option<Arc<dyn DataStore>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    reporter: Arc<dyn ErrorReporter>,
    membership: Mutex<MembershipSet>,
}

impl std::fmt::Debug for DevContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevContext")
            .field("scope", &self.scope.id())
            .field("revision", &self.revision)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl DevContext {
    /// Builds a sandbox over a fresh in-memory store.
    pub async fn new(
        scope: EvaluationScope,
        request: &DevRequest,
        config: &DevConfig,
    ) -> Result<Self, DevContextError> {
        Self::with_datastore(scope, request, config, MemoryDataStore::new_shared()).await
    }

    /// Builds a sandbox over `datastore`, which must be empty and is owned by
    /// the sandbox from now on. It is closed if construction fails.
    pub async fn with_datastore(
        scope: EvaluationScope,
        request: &DevRequest,
        config: &DevConfig,
        datastore: Arc<dyn DataStore>,
    ) -> Result<Self, DevContextError> {
        Self::build(scope, request, config, datastore, Arc::new(TracingReporter)).await
    }

    /// Builds a sandbox reporting internal errors through `reporter`.
    #[instrument(
        skip_all,
        fields(scope = %scope.id(), relationships = request.relationships.len())
    )]
    pub async fn build(
        scope: EvaluationScope,
        request: &DevRequest,
        config: &DevConfig,
        datastore: Arc<dyn DataStore>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self, DevContextError> {
        let cancel = scope.cancellation().clone();
        let populated = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DevContextError::Infrastructure(
                Status::canceled("sandbox construction canceled").into(),
            )),
            populated = populate(
                &scope,
                request,
                config,
                datastore.as_ref(),
                reporter.as_ref(),
            ) => populated,
        };

        let (schema, revision) = match populated {
            Ok(populated) => populated,
            Err(err) => {
                if let Err(close_err) = datastore.close().await {
                    warn!(error = %close_err, "failed to close datastore of failed sandbox");
                }
                return Err(err);
            }
        };

        let dispatcher: Arc<dyn Dispatcher> = Arc::new(LocalDispatcher::new(
            Arc::new(DataStoreRelationshipReader::new(Arc::clone(&datastore))),
            Arc::new(DataStoreDefinitionReader::new(Arc::clone(&datastore))),
            config.sandbox.dispatcher_config(),
        ));

        debug!(revision = %revision, "sandbox ready");
        Ok(Self {
            scope,
            schema,
            revision,
            datastore: Some(datastore),
            dispatcher: Some(dispatcher),
            reporter,
            membership: Mutex::new(MembershipSet::new()),
        })
    }

    pub fn scope(&self) -> &EvaluationScope {
        &self.scope
    }

    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }

    /// The revision the test data was committed at.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn datastore(&self) -> Option<&Arc<dyn DataStore>> {
        self.datastore.as_ref()
    }

    pub fn dispatcher(&self) -> Option<&Arc<dyn Dispatcher>> {
        self.dispatcher.as_ref()
    }

    pub fn reporter(&self) -> &dyn ErrorReporter {
        self.reporter.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.dispatcher.is_none() && self.datastore.is_none()
    }

    fn live_dispatcher(&self) -> DispatchResult<&Arc<dyn Dispatcher>> {
        self.dispatcher.as_ref().ok_or(DispatchError::Closed)
    }

    /// Checks `subject` against `resource` at the sandbox revision.
    pub async fn check(
        &self,
        resource: &ObjectAndRelation,
        subject: &ObjectAndRelation,
        context: Map<String, Value>,
    ) -> DispatchResult<CheckResult> {
        let request = CheckRequest::new(resource.clone(), subject.clone(), self.revision)
            .with_context(context)
            .with_cancellation(self.scope.cancellation().clone());
        self.live_dispatcher()?.check(request).await
    }

    /// Expands `resource` at the sandbox revision.
    pub async fn expand(
        &self,
        resource: &ObjectAndRelation,
        mode: ExpansionMode,
    ) -> DispatchResult<ExpansionNode> {
        let request = ExpandRequest::new(resource.clone(), self.revision, mode)
            .with_cancellation(self.scope.cancellation().clone());
        self.live_dispatcher()?.expand(request).await
    }

    /// Every subject with access to `resource`, with provenance.
    ///
    /// Results are cached for the lifetime of the sandbox.
    pub async fn found_subjects(
        &self,
        resource: &ObjectAndRelation,
    ) -> DispatchResult<FoundSubjects> {
        if let Some(found) = self.membership.lock().await.subjects_for(resource) {
            return Ok(found.clone());
        }

        let tree = self.expand(resource, ExpansionMode::Recursive).await?;
        let mut membership = self.membership.lock().await;
        if let Some(found) = membership.subjects_for(resource) {
            return Ok(found.clone());
        }
        Ok(membership.add_expansion(resource, &tree)?)
    }

    /// Releases the dispatcher and then the store. Failures are logged;
    /// calling this again, or on a partially built sandbox, is a no-op.
    #[instrument(skip(self), fields(scope = %self.scope.id()))]
    pub async fn dispose(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(err) = dispatcher.close().await {
                warn!(error = %err, "error when disposing of dispatcher in sandbox");
            }
        }

        if let Some(datastore) = self.datastore.take() {
            if let Err(err) = datastore.close().await {
                warn!(error = %err, "error when disposing of datastore in sandbox");
            }
        }
    }
}

/// Compiles the schema and loads everything into `datastore` in one
/// transaction, returning the compiled schema and the committed revision.
async fn populate(
    scope: &EvaluationScope,
    request: &DevRequest,
    config: &DevConfig,
    datastore: &dyn DataStore,
    reporter: &dyn ErrorReporter,
) -> Result<(CompiledSchema, Revision), DevContextError> {
    let schema = match compile(&request.schema) {
        Ok(schema) => schema,
        Err(CompileError::Syntax {
            message,
            position,
            context,
        }) => {
            let mut err = DeveloperError::new(message, ErrorSource::Schema, ErrorKind::ParseError)
                .with_position(position);
            if let Some(context) = context {
                err = err.with_context(context);
            }
            return Err(DevContextError::Developer(vec![err]));
        }
        Err(CompileError::Internal { message }) => {
            return Err(DevError::Compile { message }.into());
        }
    };

    let mut tx = datastore.begin_read_write().await.map_err(DevError::from)?;

    let (loaded, errors) = load_schema(tx.as_mut(), &schema).await?;
    if !errors.is_empty() {
        abandon(tx).await;
        return Err(DevContextError::Developer(errors));
    }

    let (_, errors) =
        load_relationships(tx.as_mut(), &loaded, &request.relationships, reporter, scope).await?;
    if !errors.is_empty() {
        abandon(tx).await;
        return Err(DevContextError::Developer(errors));
    }

    let revision = tx.commit().await.map_err(DevError::from)?;

    // Checked after loading so problems in the schema or relationships are
    // reported as developer errors first.
    request.validate(&config.limits)?;

    Ok((schema, Revision(revision.0)))
}

async fn abandon(tx: Box<dyn ReadWriteTransaction>) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "failed to roll back sandbox transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsrel_domain::dispatch::Permissionship;

    const SCHEMA: &str = r#"
type user
type document
  relations
    define owner: [user]
    define viewer: [user, user:*] or owner
    define banned: [user]
    define can_view: viewer but not banned
"#;

    fn onr(text: &str) -> ObjectAndRelation {
        ObjectAndRelation::parse(text).unwrap()
    }

    async fn sandbox(relationships: &str) -> DevContext {
        let request = DevRequest::from_text(SCHEMA, relationships).unwrap();
        DevContext::new(EvaluationScope::new(), &request, &DevConfig::default())
            .await
            .unwrap()
    }

    fn bare(datastore: Option<Arc<dyn DataStore>>) -> DevContext {
        DevContext {
            scope: EvaluationScope::new(),
            schema: CompiledSchema::default(),
            revision: Revision::zero(),
            datastore,
            dispatcher: None,
            reporter: Arc::new(TracingReporter),
            membership: Mutex::new(MembershipSet::new()),
        }
    }

    #[tokio::test]
    async fn test_sandbox_answers_checks() {
        let ctx =
            sandbox("document:readme#owner@user:alice\ndocument:readme#banned@user:alice").await;

        let owner = ctx
            .check(&onr("document:readme#viewer"), &onr("user:alice"), Map::new())
            .await
            .unwrap();
        assert_eq!(owner.permissionship, Permissionship::HasPermission);

        let banned = ctx
            .check(&onr("document:readme#can_view"), &onr("user:alice"), Map::new())
            .await
            .unwrap();
        assert_eq!(banned.permissionship, Permissionship::NoPermission);
        assert_eq!(ctx.revision(), Revision(1));
    }

    #[tokio::test]
    async fn test_found_subjects_are_cached() {
        let ctx =
            sandbox("document:readme#viewer@user:*\ndocument:readme#banned@user:mallory").await;
        let resource = onr("document:readme#can_view");

        let first = ctx.found_subjects(&resource).await.unwrap();
        let second = ctx.found_subjects(&resource).await.unwrap();
        let rendered: Vec<_> = first
            .list_found()
            .iter()
            .map(|f| f.to_canonical_string().unwrap())
            .collect();
        assert_eq!(rendered, vec!["user:* - {user:mallory}"]);
        assert_eq!(first.list_found(), second.list_found());
        assert_eq!(ctx.membership.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_releases_both_handles_once() {
        let store = MemoryDataStore::new_shared();
        let request = DevRequest::from_text(SCHEMA, "document:readme#owner@user:alice").unwrap();
        let mut ctx = DevContext::with_datastore(
            EvaluationScope::new(),
            &request,
            &DevConfig::default(),
            Arc::clone(&store) as Arc<dyn DataStore>,
        )
        .await
        .unwrap();

        ctx.dispose().await;
        assert!(ctx.is_disposed());
        assert!(store.is_closed());
        ctx.dispose().await;

        let err = ctx
            .check(&onr("document:readme#owner"), &onr("user:alice"), Map::new())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Closed);
    }

    #[tokio::test]
    async fn test_dispose_tolerates_missing_handles() {
        let mut empty = bare(None);
        empty.dispose().await;
        empty.dispose().await;
        assert!(empty.is_disposed());

        let store = MemoryDataStore::new_shared();
        let mut store_only = bare(Some(Arc::clone(&store) as Arc<dyn DataStore>));
        store_only.dispose().await;
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_failed_construction_closes_store() {
        let store = MemoryDataStore::new_shared();
        let request =
            DevRequest::new("type user\ntype document\n  relations\n    define viewer: [usr]");

        let err = DevContext::with_datastore(
            EvaluationScope::new(),
            &request,
            &DevConfig::default(),
            Arc::clone(&store) as Arc<dyn DataStore>,
        )
        .await
        .unwrap_err();

        assert!(err.developer_errors().is_some());
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_relationship_errors_are_classified() {
        let request = DevRequest::from_text(
            SCHEMA,
            "document:readme#can_view@user:alice\nfolder:docs#viewer@user:alice",
        )
        .unwrap();

        let err = DevContext::new(EvaluationScope::new(), &request, &DevConfig::default())
            .await
            .unwrap_err();

        let kinds: Vec<_> = err.developer_errors().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ErrorKind::UnknownRelation, ErrorKind::UnknownObjectType]);
    }

    #[tokio::test]
    async fn test_cancelled_scope_aborts_construction() {
        let scope = EvaluationScope::new();
        scope.cancel();
        let store = MemoryDataStore::new_shared();
        let request = DevRequest::from_text(SCHEMA, "document:readme#owner@user:alice").unwrap();

        let err = DevContext::with_datastore(
            scope,
            &request,
            &DevConfig::default(),
            Arc::clone(&store) as Arc<dyn DataStore>,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            DevContextError::Infrastructure(DevError::Status(Status {
                code: crate::error::StatusCode::Canceled,
                ..
            }))
        ));
        assert!(store.is_closed());
    }
}
