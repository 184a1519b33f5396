//! rowgate - row-level security by query rewriting
//!
//! Rewrites queries of a declarative graph-relational language so that
//! every row they return is one the current principal is authorized to
//! see, by splicing schema-defined permission rules into the query tree
//! before execution.

pub mod ast;
pub mod parser;
pub mod rewrite;
pub mod schema;
pub mod session;
pub mod solver;

pub use rewrite::{QueryRewriter, RewriteError, RewriteEvent, RewriteResult, RuleApplication};
pub use schema::{Action, ActionPolicy, PermissionRule, Schema, SchemaLoader};
pub use session::{Params, SessionContext};
