//! Dispatcher for permission checks and expansions.
//!
//! The dispatcher walks stored relationships and userset rewrites to decide
//! whether a subject holds a relation, or to build the expansion tree of a
//! relation.
//!
//! # Architecture Decisions
//!
//! - **Closed error set**: every failure is one `DispatchError` variant so
//!   callers can classify errors with a single exhaustive match.
//! - **Three-valued checks**: caveats missing context produce
//!   `ConditionalPermission` rather than an error.
//! - **Depth Limiting**: traversal deeper than `max_depth` fails with
//!   `MaxDepthExceeded`; recursive data is reported, never looped over.
//! - **Cancellation**: every request carries a `CancellationToken` that is
//!   checked at each traversal step and raced against the whole operation.

mod config;
mod context;
mod error;
mod local;
mod traits;
mod types;

#[cfg(test)]
mod tests;

pub use config::DispatcherConfig;
pub use error::{DispatchError, DispatchResult};
pub use local::LocalDispatcher;
pub use traits::{DefinitionReader, Dispatcher, RelationshipReader};
pub use types::{
    CheckRequest, CheckResult, DirectSubject, ExpandRequest, ExpansionMode, ExpansionNode,
    Permissionship, SetOperation,
};
