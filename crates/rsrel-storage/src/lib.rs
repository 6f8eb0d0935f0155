//! rsrel-storage: Storage abstraction layer
//!
//! This crate provides revisioned, transactional storage for sandbox data:
//! - DataStore and ReadWriteTransaction trait definitions
//! - In-memory MVCC implementation
//!
//! Definitions are stored as JSON strings; the crate does not interpret them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               rsrel-storage                  │
//! ├─────────────────────────────────────────────┤
//! │  traits.rs   - DataStore trait definition   │
//! │  memory.rs   - In-memory implementation     │
//! └─────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod traits;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryDataStore, MemoryTransaction};
pub use traits::{
    DataStore, ReadNamespace, ReadWriteTransaction, RelationshipFilter, RelationshipKey,
    RelationshipUpdate, Revision, StoredCaveat, StoredNamespace, StoredRelationship,
    UpdateOperation, ELLIPSIS,
};
