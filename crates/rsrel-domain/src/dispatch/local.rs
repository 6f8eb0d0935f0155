//! In-process dispatcher.
//!
//! Walks stored relationships and userset rewrites directly against the
//! reader ports, without any cross-node dispatch.
//!
//! - **Fan-out**: union and intersection branches run concurrently through
//!   `FuturesUnordered` and short-circuit on a deciding result.
//! - **Depth**: every rewrite step and every followed relationship counts
//!   towards `max_depth`; exceeding it is an error, never a silent "no".
//! - **Caveats**: compiled once per (name, revision) and cached for the
//!   dispatcher's lifetime.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::cel::{CaveatOutcome, CompiledCaveat};
use crate::model::{
    CaveatExpression, ContextualizedCaveat, ObjectAndRelation, RelationDefinition, Revision,
    Userset,
};

use super::config::DispatcherConfig;
use super::context::{Goal, TraversalContext};
use super::traits::{DefinitionReader, Dispatcher, RelationshipReader};
use super::types::{
    CheckRequest, CheckResult, DirectSubject, ExpandRequest, ExpansionMode, ExpansionNode,
    Permissionship, SetOperation,
};
use super::{DispatchError, DispatchResult};

/// Type alias for boxed future to handle async recursion.
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Dispatcher that resolves everything in the current process.
pub struct LocalDispatcher<R, D> {
    relationships: Arc<R>,
    definitions: Arc<D>,
    config: DispatcherConfig,
    caveats: DashMap<(String, Revision), Arc<CompiledCaveat>>,
    closed: AtomicBool,
}

impl<R, D> LocalDispatcher<R, D>
where
    R: RelationshipReader + 'static,
    D: DefinitionReader + 'static,
{
    pub fn new(relationships: Arc<R>, definitions: Arc<D>, config: DispatcherConfig) -> Self {
        Self {
            relationships,
            definitions,
            config,
            caveats: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs one top-level operation under the configured timeout and the
    /// request's cancellation token.
    async fn run<T>(
        &self,
        cancel: &CancellationToken,
        operation: impl Future<Output = DispatchResult<T>>,
    ) -> DispatchResult<T> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(DispatchError::Canceled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Canceled),
            result = timeout(self.config.timeout, operation) => match result {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Timeout {
                    duration_ms: self.config.timeout.as_millis() as u64,
                }),
            },
        }
    }

    async fn relation_definition(
        &self,
        resource: &ObjectAndRelation,
        revision: Revision,
    ) -> DispatchResult<RelationDefinition> {
        let namespace = self
            .definitions
            .read_namespace(&resource.namespace, revision)
            .await?;
        namespace
            .relation(&resource.relation)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownRelation {
                namespace: resource.namespace.clone(),
                relation: resource.relation.clone(),
            })
    }

    /// Returns true when the object type of `target` defines its relation.
    ///
    /// Arrows skip targets whose type lacks the computed relation.
    async fn target_has_relation(
        &self,
        target: &ObjectAndRelation,
        revision: Revision,
    ) -> DispatchResult<bool> {
        let namespace = self
            .definitions
            .read_namespace(&target.namespace, revision)
            .await?;
        Ok(namespace.relation(&target.relation).is_some())
    }

    async fn compiled_caveat(
        &self,
        name: &str,
        revision: Revision,
    ) -> DispatchResult<Arc<CompiledCaveat>> {
        let key = (name.to_string(), revision);
        if let Some(compiled) = self.caveats.get(&key) {
            return Ok(Arc::clone(&compiled));
        }

        let definition = self.definitions.read_caveat(name, revision).await?;
        let compiled = CompiledCaveat::compile(&definition).map_err(|e| {
            DispatchError::InvalidArgument {
                message: format!("caveat `{name}`: {e}"),
            }
        })?;
        let compiled = Arc::new(compiled);
        self.caveats.insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Decides a relationship caveat against the request context.
    async fn caveat_permissionship(
        &self,
        caveat: Option<&ContextualizedCaveat>,
        request_context: &Map<String, Value>,
        revision: Revision,
    ) -> DispatchResult<Permissionship> {
        let Some(caveat) = caveat else {
            return Ok(Permissionship::HasPermission);
        };

        let compiled = self.compiled_caveat(&caveat.name, revision).await?;
        let outcome = compiled
            .evaluate(&caveat.context, request_context)
            .map_err(|e| DispatchError::InvalidArgument {
                message: format!("caveat `{}`: {e}", caveat.name),
            })?;

        Ok(match outcome {
            CaveatOutcome::True => Permissionship::HasPermission,
            CaveatOutcome::False => Permissionship::NoPermission,
            CaveatOutcome::Conditional { missing } => {
                debug!(caveat = %caveat.name, ?missing, "caveat is missing context");
                Permissionship::ConditionalPermission
            }
        })
    }

    // ========== Check ==========

    fn resolve_check<'a>(
        &'a self,
        ctx: &'a TraversalContext,
        resource: ObjectAndRelation,
        depth: u32,
    ) -> BoxFuture<'a, DispatchResult<Permissionship>> {
        Box::pin(async move {
            ctx.enter(&resource, depth)?;

            if let Goal::Check { subject, .. } = &ctx.goal {
                if *subject == resource {
                    return Ok(Permissionship::HasPermission);
                }
            }

            let relation = self.relation_definition(&resource, ctx.revision).await?;
            self.resolve_userset(ctx, resource, relation.rewrite, depth)
                .await
        })
    }

    fn resolve_userset<'a>(
        &'a self,
        ctx: &'a TraversalContext,
        resource: ObjectAndRelation,
        userset: Userset,
        depth: u32,
    ) -> BoxFuture<'a, DispatchResult<Permissionship>> {
        Box::pin(async move {
            match userset {
                Userset::This => self.resolve_direct(ctx, resource, depth).await,

                Userset::ComputedUserset { relation } => {
                    self.resolve_check(ctx, resource.with_relation(relation), depth + 1)
                        .await
                }

                Userset::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    self.resolve_arrow(ctx, resource, &tupleset, &computed_userset, depth)
                        .await
                }

                Userset::Union { children } => {
                    let mut branches: FuturesUnordered<_> = children
                        .into_iter()
                        .map(|child| self.resolve_userset(ctx, resource.clone(), child, depth + 1))
                        .collect();

                    let mut result = Permissionship::NoPermission;
                    while let Some(branch) = branches.next().await {
                        result = result.or(branch?);
                        if result == Permissionship::HasPermission {
                            break;
                        }
                    }
                    Ok(result)
                }

                Userset::Intersection { children } => {
                    let mut branches: FuturesUnordered<_> = children
                        .into_iter()
                        .map(|child| self.resolve_userset(ctx, resource.clone(), child, depth + 1))
                        .collect();

                    let mut result = Permissionship::HasPermission;
                    while let Some(branch) = branches.next().await {
                        result = result.and(branch?);
                        if result == Permissionship::NoPermission {
                            break;
                        }
                    }
                    Ok(result)
                }

                Userset::Exclusion { base, subtract } => {
                    let (base, subtract) = futures::future::try_join(
                        self.resolve_userset(ctx, resource.clone(), *base, depth + 1),
                        self.resolve_userset(ctx, resource, *subtract, depth + 1),
                    )
                    .await?;
                    Ok(base.and_not(subtract))
                }
            }
        })
    }

    /// Resolves the relationships stored directly on `resource`.
    async fn resolve_direct(
        &self,
        ctx: &TraversalContext,
        resource: ObjectAndRelation,
        depth: u32,
    ) -> DispatchResult<Permissionship> {
        let Goal::Check { subject, context } = &ctx.goal else {
            return Err(DispatchError::InvalidArgument {
                message: "direct resolution requires a check goal".to_string(),
            });
        };

        let relationships = self
            .relationships
            .read_relationships(&resource, ctx.revision)
            .await?;

        let mut result = Permissionship::NoPermission;
        let mut nested = FuturesUnordered::new();

        for relationship in relationships {
            let gate = self
                .caveat_permissionship(relationship.caveat.as_ref(), context, ctx.revision)
                .await?;
            if gate == Permissionship::NoPermission {
                continue;
            }

            let found = &relationship.subject;
            let matches_wildcard = found.is_wildcard()
                && subject.is_terminal()
                && found.namespace == subject.namespace;

            if found == subject || matches_wildcard {
                result = result.or(gate);
            } else if !found.is_terminal() {
                let userset = found.clone();
                nested.push(async move {
                    let member = self.resolve_check(ctx, userset, depth + 1).await?;
                    Ok::<_, DispatchError>(member.and(gate))
                });
            }

            if result == Permissionship::HasPermission {
                return Ok(result);
            }
        }

        while let Some(member) = nested.next().await {
            result = result.or(member?);
            if result == Permissionship::HasPermission {
                break;
            }
        }
        Ok(result)
    }

    /// Resolves `computed_userset from tupleset`.
    async fn resolve_arrow(
        &self,
        ctx: &TraversalContext,
        resource: ObjectAndRelation,
        tupleset: &str,
        computed_userset: &str,
        depth: u32,
    ) -> DispatchResult<Permissionship> {
        let context = match &ctx.goal {
            Goal::Check { context, .. } => context,
            Goal::Expand { .. } => {
                return Err(DispatchError::InvalidArgument {
                    message: "arrow resolution requires a check goal".to_string(),
                })
            }
        };

        let relationships = self
            .relationships
            .read_relationships(&resource.with_relation(tupleset), ctx.revision)
            .await?;

        let mut targets = FuturesUnordered::new();
        for relationship in relationships {
            let target = relationship.subject.with_relation(computed_userset);
            if !self.target_has_relation(&target, ctx.revision).await? {
                continue;
            }
            let gate = self
                .caveat_permissionship(relationship.caveat.as_ref(), context, ctx.revision)
                .await?;
            if gate == Permissionship::NoPermission {
                continue;
            }
            targets.push(async move {
                let member = self.resolve_check(ctx, target, depth + 1).await?;
                Ok::<_, DispatchError>(member.and(gate))
            });
        }

        let mut result = Permissionship::NoPermission;
        while let Some(member) = targets.next().await {
            result = result.or(member?);
            if result == Permissionship::HasPermission {
                break;
            }
        }
        Ok(result)
    }

    // ========== Expand ==========

    fn expand_relation<'a>(
        &'a self,
        ctx: &'a TraversalContext,
        resource: ObjectAndRelation,
        depth: u32,
    ) -> BoxFuture<'a, DispatchResult<ExpansionNode>> {
        Box::pin(async move {
            ctx.enter(&resource, depth)?;
            let relation = self.relation_definition(&resource, ctx.revision).await?;
            self.expand_userset(ctx, resource, relation.rewrite, depth)
                .await
        })
    }

    fn expand_userset<'a>(
        &'a self,
        ctx: &'a TraversalContext,
        resource: ObjectAndRelation,
        userset: Userset,
        depth: u32,
    ) -> BoxFuture<'a, DispatchResult<ExpansionNode>> {
        Box::pin(async move {
            match userset {
                Userset::This => self.expand_direct(ctx, resource, depth).await,

                Userset::ComputedUserset { relation } => {
                    self.expand_relation(ctx, resource.with_relation(relation), depth + 1)
                        .await
                }

                Userset::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    let relationships = self
                        .relationships
                        .read_relationships(&resource.with_relation(&tupleset), ctx.revision)
                        .await?;

                    let mut children = Vec::new();
                    for relationship in relationships {
                        let target = relationship.subject.with_relation(&computed_userset);
                        if !self.target_has_relation(&target, ctx.revision).await? {
                            continue;
                        }
                        let caveat = relationship.caveat.map(CaveatExpression::caveat);
                        children.push(async move {
                            let node = self.expand_relation(ctx, target, depth + 1).await?;
                            Ok::<_, DispatchError>(node.with_caveat(caveat.as_ref()))
                        });
                    }

                    Ok(ExpansionNode::Intermediate {
                        expanded: resource,
                        operation: SetOperation::Union,
                        children: futures::future::try_join_all(children).await?,
                        caveat: None,
                    })
                }

                Userset::Union { children } => {
                    self.expand_children(ctx, resource, SetOperation::Union, children, depth)
                        .await
                }

                Userset::Intersection { children } => {
                    self.expand_children(ctx, resource, SetOperation::Intersection, children, depth)
                        .await
                }

                Userset::Exclusion { base, subtract } => {
                    self.expand_children(
                        ctx,
                        resource,
                        SetOperation::Exclusion,
                        vec![*base, *subtract],
                        depth,
                    )
                    .await
                }
            }
        })
    }

    async fn expand_children(
        &self,
        ctx: &TraversalContext,
        resource: ObjectAndRelation,
        operation: SetOperation,
        children: Vec<Userset>,
        depth: u32,
    ) -> DispatchResult<ExpansionNode> {
        let nodes = futures::future::try_join_all(
            children
                .into_iter()
                .map(|child| self.expand_userset(ctx, resource.clone(), child, depth + 1)),
        )
        .await?;

        Ok(ExpansionNode::Intermediate {
            expanded: resource,
            operation,
            children: nodes,
            caveat: None,
        })
    }

    /// Lists the subjects stored on `resource`, following userset subjects
    /// in recursive mode.
    async fn expand_direct(
        &self,
        ctx: &TraversalContext,
        resource: ObjectAndRelation,
        depth: u32,
    ) -> DispatchResult<ExpansionNode> {
        let relationships = self
            .relationships
            .read_relationships(&resource, ctx.revision)
            .await?;

        let subjects: Vec<DirectSubject> = relationships
            .into_iter()
            .map(|relationship| DirectSubject {
                subject: relationship.subject,
                caveat: relationship.caveat.map(CaveatExpression::caveat),
            })
            .collect();

        let recursive = matches!(
            ctx.goal,
            Goal::Expand {
                mode: ExpansionMode::Recursive
            }
        );
        let usersets: Vec<DirectSubject> = subjects
            .iter()
            .filter(|direct| !direct.subject.is_terminal())
            .cloned()
            .collect();

        let leaf = ExpansionNode::Leaf {
            expanded: resource.clone(),
            subjects,
            caveat: None,
        };
        if !recursive || usersets.is_empty() {
            return Ok(leaf);
        }

        let nested = futures::future::try_join_all(usersets.into_iter().map(|direct| async move {
            let node = self.expand_relation(ctx, direct.subject, depth + 1).await?;
            Ok::<_, DispatchError>(node.with_caveat(direct.caveat.as_ref()))
        }))
        .await?;

        let mut children = Vec::with_capacity(nested.len() + 1);
        children.push(leaf);
        children.extend(nested);

        Ok(ExpansionNode::Intermediate {
            expanded: resource,
            operation: SetOperation::Union,
            children,
            caveat: None,
        })
    }
}

#[async_trait]
impl<R, D> Dispatcher for LocalDispatcher<R, D>
where
    R: RelationshipReader + 'static,
    D: DefinitionReader + 'static,
{
    #[instrument(
        skip(self, request),
        fields(resource = %request.resource, subject = %request.subject)
    )]
    async fn check(&self, request: CheckRequest) -> DispatchResult<CheckResult> {
        if request.resource.is_wildcard() {
            return Err(DispatchError::InvalidArgument {
                message: format!("cannot check wildcard resource `{}`", request.resource),
            });
        }

        let ctx = TraversalContext {
            goal: Goal::Check {
                subject: request.subject,
                context: request.context,
            },
            revision: request.revision,
            cancel: request.cancel.clone(),
            max_depth: self.config.max_depth,
        };

        let permissionship = self
            .run(&request.cancel, self.resolve_check(&ctx, request.resource, 0))
            .await?;
        Ok(CheckResult { permissionship })
    }

    #[instrument(skip(self, request), fields(resource = %request.resource, mode = ?request.mode))]
    async fn expand(&self, request: ExpandRequest) -> DispatchResult<ExpansionNode> {
        let ctx = TraversalContext {
            goal: Goal::Expand { mode: request.mode },
            revision: request.revision,
            cancel: request.cancel.clone(),
            max_depth: self.config.max_depth,
        };

        self.run(&request.cancel, self.expand_relation(&ctx, request.resource, 0))
            .await
    }

    async fn close(&self) -> DispatchResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.caveats.clear();
            debug!("local dispatcher closed");
        }
        Ok(())
    }
}
