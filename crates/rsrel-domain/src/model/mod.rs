//! Relationship and schema model.
//!
//! This module contains:
//! - Core value types (ObjectAndRelation, Relationship, Revision)
//! - Caveat references and caveat expressions
//! - Compiled schema structures and the schema DSL compiler
//! - Per-namespace type systems used for schema and write validation

mod caveat;
mod parser;
mod schema;
mod type_system;
mod types;
#[cfg(test)]
mod types_proptest;

pub use caveat::{and_optional, or_optional, CaveatExpression, ContextualizedCaveat};
pub use parser::{compile, CompileError, CompileResult};
pub use schema::{
    CaveatDefinition, CaveatParameter, CompiledSchema, NamespaceDefinition, RelationDefinition,
    SourcePosition, TypeConstraint, Userset,
};
pub use type_system::{
    DefinitionResolver, NamespaceTypeSystem, PredefinedDefinitions, SchemaError,
    ValidatedNamespaceTypeSystem,
};
pub use types::*;
