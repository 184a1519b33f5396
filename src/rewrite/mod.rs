//! Query rewrite subsystem.
//!
//! Transforms incoming queries so that every row they can return is one
//! the session's principal is authorized to act on. The engine splices
//! schema-defined permission rules under `EXISTS`, the partitioner splits
//! queries into unions when rules diverge by type, and the relation
//! rewriter expands computed relations before either runs.
//!
//! # Design Principles
//!
//! - Restriction-only: a rewritten query never returns a row the original
//!   would not have
//! - Rollback-safe: on `Unauthorized` the caller still holds the query
//!   exactly as it was submitted
//! - Every transformation step is recorded as a typed [`RewriteEvent`]

mod context;
mod engine;
mod errors;
mod events;
mod localchecks;
mod relations;

pub use context::RewriteContext;
pub use engine::{QueryRewriter, RuleApplication};
pub use errors::{RewriteError, RewriteResult};
pub use events::RewriteEvent;
pub use localchecks::{partition, Bucket, LocalCheck};
pub use relations::expand_computed_relations;
