//! Permission schema subsystem.
//!
//! The schema declares entity types, relation definitions with
//! cardinalities, per-action policies and computed relations. It owns the
//! snippet cache every rule expression is parsed through, so a schema
//! reload drops all cached parses with the replaced instance.
//!
//! # Design Principles
//!
//! - Rules are immutable and shared read-only across transactions
//! - Absent policy means `Allow`; denial is always explicit
//! - Rule expressions parse at schema build time, never at query time
//! - No hidden process-wide state: the parse cache lives on the instance

mod cache;
mod errors;
mod loader;
mod permissions;
mod types;

pub use cache::SnippetCache;
pub use errors::{SchemaError, SchemaResult};
pub use loader::{EntityDoc, PolicyDoc, RelationDoc, SchemaDocument, SchemaLoader};
pub use permissions::{ActionPolicy, PermissionRule, SnippetVar};
pub use types::{
    Action, Cardinality, EntityDef, Occurrence, RelationDef, RelationType, Schema, VALUE_TYPES,
};
