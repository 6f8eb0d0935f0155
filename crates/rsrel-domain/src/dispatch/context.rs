//! Internal traversal state shared by one dispatch operation.

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::model::{ObjectAndRelation, Revision};

use super::types::ExpansionMode;
use super::{DispatchError, DispatchResult};

/// What is being resolved, shared by every branch of one request.
#[derive(Debug)]
pub(crate) enum Goal {
    Check {
        subject: ObjectAndRelation,
        context: Map<String, Value>,
    },
    Expand {
        mode: ExpansionMode,
    },
}

/// Per-request traversal state.
#[derive(Debug)]
pub(crate) struct TraversalContext {
    pub(crate) goal: Goal,
    pub(crate) revision: Revision,
    pub(crate) cancel: CancellationToken,
    pub(crate) max_depth: u32,
}

impl TraversalContext {
    /// Fails when the request was canceled or `depth` is past the limit.
    pub(crate) fn enter(&self, resource: &ObjectAndRelation, depth: u32) -> DispatchResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Canceled);
        }
        if depth >= self.max_depth {
            return Err(DispatchError::MaxDepthExceeded {
                max_depth: self.max_depth,
                resource: resource.to_string(),
            });
        }
        Ok(())
    }
}
