//! Request and result types for dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::model::{and_optional, CaveatExpression, ObjectAndRelation, Revision};

/// Request for a permission check.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    /// The resource and relation to check, e.g. `document:readme#view`.
    pub resource: ObjectAndRelation,
    /// The subject, e.g. `user:alice` or `group:eng#member`.
    pub subject: ObjectAndRelation,
    pub revision: Revision,
    /// Caveat context supplied with the request.
    pub context: Map<String, Value>,
    pub cancel: CancellationToken,
}

impl CheckRequest {
    pub fn new(
        resource: ObjectAndRelation,
        subject: ObjectAndRelation,
        revision: Revision,
    ) -> Self {
        Self {
            resource,
            subject,
            revision,
            context: Map::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Three-valued check outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permissionship {
    NoPermission,
    HasPermission,
    /// Access depends on caveat context that was not supplied.
    ConditionalPermission,
}

impl Permissionship {
    /// Union: any `Has` wins, then any `Conditional`.
    pub fn or(self, other: Self) -> Self {
        use Permissionship::*;
        match (self, other) {
            (HasPermission, _) | (_, HasPermission) => HasPermission,
            (ConditionalPermission, _) | (_, ConditionalPermission) => ConditionalPermission,
            _ => NoPermission,
        }
    }

    /// Intersection: any `No` wins, then any `Conditional`.
    pub fn and(self, other: Self) -> Self {
        use Permissionship::*;
        match (self, other) {
            (NoPermission, _) | (_, NoPermission) => NoPermission,
            (ConditionalPermission, _) | (_, ConditionalPermission) => ConditionalPermission,
            _ => HasPermission,
        }
    }

    /// Exclusion of `subtract` from `self`.
    pub fn and_not(self, subtract: Self) -> Self {
        use Permissionship::*;
        match (self, subtract) {
            (NoPermission, _) | (_, HasPermission) => NoPermission,
            (HasPermission, NoPermission) => HasPermission,
            _ => ConditionalPermission,
        }
    }
}

/// Result of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub permissionship: Permissionship,
}

impl CheckResult {
    pub fn is_member(&self) -> bool {
        self.permissionship == Permissionship::HasPermission
    }
}

/// How far an expansion follows userset subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpansionMode {
    /// Userset subjects are listed but not expanded.
    #[default]
    Shallow,
    /// Userset subjects are expanded in turn.
    Recursive,
}

/// Request to expand a resource relation.
#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub resource: ObjectAndRelation,
    pub revision: Revision,
    pub mode: ExpansionMode,
    pub cancel: CancellationToken,
}

impl ExpandRequest {
    pub fn new(resource: ObjectAndRelation, revision: Revision, mode: ExpansionMode) -> Self {
        Self {
            resource,
            revision,
            mode,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Set operation of an intermediate expansion node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetOperation {
    Union,
    Intersection,
    /// The first child minus every later child.
    Exclusion,
}

/// A subject listed directly by a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectSubject {
    pub subject: ObjectAndRelation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<CaveatExpression>,
}

/// Node of an expansion tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionNode {
    Leaf {
        expanded: ObjectAndRelation,
        subjects: Vec<DirectSubject>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caveat: Option<CaveatExpression>,
    },
    Intermediate {
        expanded: ObjectAndRelation,
        operation: SetOperation,
        children: Vec<ExpansionNode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caveat: Option<CaveatExpression>,
    },
}

impl ExpansionNode {
    /// The resource relation this node expanded.
    pub fn expanded(&self) -> &ObjectAndRelation {
        match self {
            Self::Leaf { expanded, .. } | Self::Intermediate { expanded, .. } => expanded,
        }
    }

    pub fn caveat(&self) -> Option<&CaveatExpression> {
        match self {
            Self::Leaf { caveat, .. } | Self::Intermediate { caveat, .. } => caveat.as_ref(),
        }
    }

    /// ANDs `extra` into the node's caveat.
    pub fn with_caveat(mut self, extra: Option<&CaveatExpression>) -> Self {
        match &mut self {
            Self::Leaf { caveat, .. } | Self::Intermediate { caveat, .. } => {
                *caveat = and_optional(caveat.as_ref(), extra);
            }
        }
        self
    }
}
