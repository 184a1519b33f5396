//! Query AST for the graph-relational query language.
//!
//! Consumed by the type solver and mutated in place by the rewrite engine.
//! Trees are plain owned data; sharing happens at the schema level, never
//! here.

mod expr;
mod select;

pub use expr::{CmpOp, Expr, Optional, Term};
pub use select::{
    Select, Solution, SortDirection, SortSpec, SubQuery, Union, VariableOrigin,
};
