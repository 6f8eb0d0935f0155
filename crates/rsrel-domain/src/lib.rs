//! rsrel-domain: Core relationship domain logic
//!
//! This crate contains the core relationship logic including:
//! - Relationship model, schema compiler and type system
//! - Caveat compilation and evaluation
//! - Subject-set algebra for found subjects
//! - Local dispatcher for checks and expansions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                rsrel-domain                  │
//! ├─────────────────────────────────────────────┤
//! │  model/      - Relationships, schema, types │
//! │  cel/        - Caveat expressions           │
//! │  membership/ - Found-subject set algebra    │
//! │  dispatch/   - Check and expand engine      │
//! └─────────────────────────────────────────────┘
//! ```

pub mod cel;
pub mod dispatch;
pub mod error;
pub mod membership;
pub mod model;

// Re-export commonly used types at the crate root
pub use error::{DomainError, DomainResult};
