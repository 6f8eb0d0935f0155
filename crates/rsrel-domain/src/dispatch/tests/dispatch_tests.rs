//! Local dispatcher test suite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::mocks::{create_dispatcher, MockDefinitionReader};
use crate::dispatch::{
    CheckRequest, DispatchError, DispatchResult, Dispatcher, DispatcherConfig, ExpandRequest,
    ExpansionMode, ExpansionNode, LocalDispatcher, Permissionship, RelationshipReader,
    SetOperation,
};
use crate::model::{ObjectAndRelation, Relationship, Revision};

const SCHEMA: &str = r#"
type user
type group
  relations
    define member: [user, group#member]
type folder
  relations
    define viewer: [user, user:*]
type document
  relations
    define parent: [folder]
    define owner: [user]
    define editor: [user] or owner
    define viewer: [user, user:*, group#member, user with on_network] or editor or viewer from parent
    define reviewer: [user]
    define banned: [user]
    define can_review: reviewer and editor
    define can_view: viewer but not banned
condition on_network(allowed: string, ip: string) {
  ip == allowed
}
"#;

fn onr(value: &str) -> ObjectAndRelation {
    ObjectAndRelation::parse(value).unwrap()
}

fn check(resource: &str, subject: &str) -> CheckRequest {
    CheckRequest::new(onr(resource), onr(subject), Revision::zero())
}

// ========== Section 1: Direct Relationships ==========

#[tokio::test]
async fn test_check_has_permission_for_direct_relationship() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:readme#viewer@user:alice").await;

    let result = dispatcher
        .check(check("document:readme#viewer", "user:alice"))
        .await
        .unwrap();
    assert!(result.is_member());
}

#[tokio::test]
async fn test_check_no_permission_without_relationship() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:readme#viewer@user:alice").await;

    let result = dispatcher
        .check(check("document:readme#viewer", "user:bob"))
        .await
        .unwrap();
    assert_eq!(result.permissionship, Permissionship::NoPermission);
}

#[tokio::test]
async fn test_wildcard_grants_every_terminal_subject_of_its_type() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:public#viewer@user:*").await;

    let result = dispatcher
        .check(check("document:public#viewer", "user:anyone"))
        .await
        .unwrap();
    assert!(result.is_member());

    let result = dispatcher
        .check(check("document:public#viewer", "group:eng#member"))
        .await
        .unwrap();
    assert!(!result.is_member(), "wildcard must not match usersets");
}

#[tokio::test]
async fn test_userset_subject_is_followed() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:readme#viewer@group:eng#member").await;
    relationships.add("group:eng#member@group:backend#member").await;
    relationships.add("group:backend#member@user:carol").await;

    let result = dispatcher
        .check(check("document:readme#viewer", "user:carol"))
        .await
        .unwrap();
    assert!(result.is_member());
}

#[tokio::test]
async fn test_userset_subject_is_member_of_itself() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:readme#viewer@group:eng#member").await;

    let result = dispatcher
        .check(check("document:readme#viewer", "group:eng#member"))
        .await
        .unwrap();
    assert!(result.is_member());
}

// ========== Section 2: Rewrites ==========

#[tokio::test]
async fn test_computed_userset_follows_other_relation() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:readme#owner@user:alice").await;

    let result = dispatcher
        .check(check("document:readme#viewer", "user:alice"))
        .await
        .unwrap();
    assert!(result.is_member(), "owner implies editor implies viewer");
}

#[tokio::test]
async fn test_arrow_follows_parent() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:readme#parent@folder:docs").await;
    relationships.add("folder:docs#viewer@user:dave").await;

    let result = dispatcher
        .check(check("document:readme#viewer", "user:dave"))
        .await
        .unwrap();
    assert!(result.is_member());
}

#[tokio::test]
async fn test_intersection_requires_every_branch() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:readme#reviewer@user:alice").await;
    relationships.add("document:readme#reviewer@user:bob").await;
    relationships.add("document:readme#editor@user:bob").await;

    let alice = dispatcher
        .check(check("document:readme#can_review", "user:alice"))
        .await
        .unwrap();
    let bob = dispatcher
        .check(check("document:readme#can_review", "user:bob"))
        .await
        .unwrap();
    assert!(!alice.is_member());
    assert!(bob.is_member());
}

#[tokio::test]
async fn test_exclusion_removes_banned_subject() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:readme#viewer@user:*").await;
    relationships.add("document:readme#banned@user:mallory").await;

    let mallory = dispatcher
        .check(check("document:readme#can_view", "user:mallory"))
        .await
        .unwrap();
    let alice = dispatcher
        .check(check("document:readme#can_view", "user:alice"))
        .await
        .unwrap();
    assert!(!mallory.is_member());
    assert!(alice.is_member());
}

// ========== Section 3: Caveats ==========

#[tokio::test]
async fn test_caveat_decides_with_full_context() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships
        .add(r#"document:readme#viewer@user:alice[on_network:{"allowed":"10.0.0.1"}]"#)
        .await;

    let context = json!({"ip": "10.0.0.1"}).as_object().cloned().unwrap();
    let result = dispatcher
        .check(check("document:readme#viewer", "user:alice").with_context(context))
        .await
        .unwrap();
    assert_eq!(result.permissionship, Permissionship::HasPermission);

    let context = json!({"ip": "192.168.0.1"}).as_object().cloned().unwrap();
    let result = dispatcher
        .check(check("document:readme#viewer", "user:alice").with_context(context))
        .await
        .unwrap();
    assert_eq!(result.permissionship, Permissionship::NoPermission);
}

#[tokio::test]
async fn test_caveat_missing_context_is_conditional() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships
        .add(r#"document:readme#viewer@user:alice[on_network:{"allowed":"10.0.0.1"}]"#)
        .await;

    let result = dispatcher
        .check(check("document:readme#viewer", "user:alice"))
        .await
        .unwrap();
    assert_eq!(result.permissionship, Permissionship::ConditionalPermission);
}

#[tokio::test]
async fn test_unconditional_path_dominates_conditional_path() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships
        .add(r#"document:readme#viewer@user:alice[on_network:{"allowed":"10.0.0.1"}]"#)
        .await;
    relationships.add("document:readme#owner@user:alice").await;

    let result = dispatcher
        .check(check("document:readme#viewer", "user:alice"))
        .await
        .unwrap();
    assert_eq!(result.permissionship, Permissionship::HasPermission);
}

#[test]
fn test_permissionship_algebra() {
    use Permissionship::*;

    assert_eq!(NoPermission.or(ConditionalPermission), ConditionalPermission);
    assert_eq!(ConditionalPermission.or(HasPermission), HasPermission);
    assert_eq!(HasPermission.and(ConditionalPermission), ConditionalPermission);
    assert_eq!(ConditionalPermission.and(NoPermission), NoPermission);
    assert_eq!(HasPermission.and_not(NoPermission), HasPermission);
    assert_eq!(HasPermission.and_not(ConditionalPermission), ConditionalPermission);
    assert_eq!(ConditionalPermission.and_not(HasPermission), NoPermission);
    assert_eq!(NoPermission.and_not(NoPermission), NoPermission);
}

// ========== Section 4: Expansion ==========

#[tokio::test]
async fn test_shallow_expand_of_direct_relation_is_leaf() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("group:eng#member@user:alice").await;
    relationships.add("group:eng#member@group:ops#member").await;

    let node = dispatcher
        .expand(ExpandRequest::new(
            onr("group:eng#member"),
            Revision::zero(),
            ExpansionMode::Shallow,
        ))
        .await
        .unwrap();

    match node {
        ExpansionNode::Leaf {
            expanded, subjects, ..
        } => {
            assert_eq!(expanded, onr("group:eng#member"));
            assert_eq!(subjects.len(), 2);
        }
        other => panic!("expected leaf, got {other:?}"),
    }
}

#[tokio::test]
async fn test_recursive_expand_follows_usersets() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("group:eng#member@user:alice").await;
    relationships.add("group:eng#member@group:ops#member").await;
    relationships.add("group:ops#member@user:bob").await;

    let node = dispatcher
        .expand(ExpandRequest::new(
            onr("group:eng#member"),
            Revision::zero(),
            ExpansionMode::Recursive,
        ))
        .await
        .unwrap();

    let ExpansionNode::Intermediate {
        operation,
        children,
        ..
    } = node
    else {
        panic!("expected intermediate node");
    };
    assert_eq!(operation, SetOperation::Union);
    assert_eq!(children.len(), 2);
    assert_eq!(children[1].expanded(), &onr("group:ops#member"));
}

#[tokio::test]
async fn test_expand_exclusion_keeps_child_order() {
    let (_relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());

    let node = dispatcher
        .expand(ExpandRequest::new(
            onr("document:readme#can_view"),
            Revision::zero(),
            ExpansionMode::Shallow,
        ))
        .await
        .unwrap();

    let ExpansionNode::Intermediate {
        operation,
        children,
        ..
    } = node
    else {
        panic!("expected intermediate node");
    };
    assert_eq!(operation, SetOperation::Exclusion);
    assert_eq!(children[0].expanded(), &onr("document:readme#viewer"));
    assert_eq!(children[1].expanded(), &onr("document:readme#banned"));
}

#[tokio::test]
async fn test_expand_arrow_carries_relationship_caveat() {
    let schema = r#"
type user
type folder
  relations
    define viewer: [user]
type document
  relations
    define parent: [folder with on_network]
    define viewer: viewer from parent
condition on_network(allowed: string, ip: string) {
  ip == allowed
}
"#;
    let (relationships, dispatcher) = create_dispatcher(schema, DispatcherConfig::default());
    relationships
        .add(r#"document:readme#parent@folder:docs[on_network:{"allowed":"10.0.0.1"}]"#)
        .await;
    relationships.add("folder:docs#viewer@user:dave").await;

    let node = dispatcher
        .expand(ExpandRequest::new(
            onr("document:readme#viewer"),
            Revision::zero(),
            ExpansionMode::Shallow,
        ))
        .await
        .unwrap();

    let ExpansionNode::Intermediate { children, .. } = node else {
        panic!("expected intermediate node");
    };
    assert_eq!(children.len(), 1);
    let caveat = children[0].caveat().expect("arrow child should be caveated");
    assert_eq!(caveat.caveat_names(), vec!["on_network"]);
}

// ========== Section 5: Safety ==========

#[tokio::test]
async fn test_recursive_data_exceeds_max_depth() {
    let (relationships, dispatcher) =
        create_dispatcher(SCHEMA, DispatcherConfig::default().with_max_depth(10));
    relationships.add("group:a#member@group:b#member").await;
    relationships.add("group:b#member@group:a#member").await;

    let err = dispatcher
        .check(check("group:a#member", "user:x"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, DispatchError::MaxDepthExceeded { max_depth: 10, .. }),
        "got {err:?}"
    );

    let err = dispatcher
        .expand(ExpandRequest::new(
            onr("group:a#member"),
            Revision::zero(),
            ExpansionMode::Recursive,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::MaxDepthExceeded { .. }));
}

#[tokio::test]
async fn test_unknown_namespace_and_relation() {
    let (_relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());

    let err = dispatcher
        .check(check("widget:one#viewer", "user:alice"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DispatchError::UnknownNamespace {
            namespace: "widget".to_string()
        }
    );

    let err = dispatcher
        .check(check("document:readme#missing", "user:alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownRelation { .. }));
}

#[tokio::test]
async fn test_cancelled_request_is_canceled() {
    let (relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    relationships.add("document:readme#viewer@user:alice").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = dispatcher
        .check(check("document:readme#viewer", "user:alice").with_cancellation(cancel))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Canceled);
}

#[tokio::test]
async fn test_closed_dispatcher_rejects_requests() {
    let (_relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    dispatcher.close().await.unwrap();
    dispatcher.close().await.unwrap();

    let err = dispatcher
        .check(check("document:readme#viewer", "user:alice"))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Closed);
}

struct SlowRelationshipReader;

#[async_trait]
impl RelationshipReader for SlowRelationshipReader {
    async fn read_relationships(
        &self,
        _resource: &ObjectAndRelation,
        _revision: Revision,
    ) -> DispatchResult<Vec<Relationship>> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_slow_reads_time_out() {
    let dispatcher = LocalDispatcher::new(
        Arc::new(SlowRelationshipReader),
        Arc::new(MockDefinitionReader::from_schema(SCHEMA)),
        DispatcherConfig::default().with_timeout(Duration::from_millis(20)),
    );

    let err = dispatcher
        .check(check("document:readme#reviewer", "user:alice"))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Timeout { duration_ms: 20 });
}

#[tokio::test]
async fn test_wildcard_resource_is_invalid_argument() {
    let (_relationships, dispatcher) = create_dispatcher(SCHEMA, DispatcherConfig::default());
    let err = dispatcher
        .check(check("document:*#viewer", "user:alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument { .. }));
}
