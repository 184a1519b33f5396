//! Rewrite error types.

use thiserror::Error;

use crate::solver::SolverError;

/// Result type for rewrite operations
pub type RewriteResult<T> = Result<T, RewriteError>;

/// Errors surfaced by the rewrite engine
///
/// Splice failures on individual candidate rules are internal: the engine
/// backtracks and tries the next rule, and only reports `Unauthorized` once
/// no candidate can be satisfied.
#[derive(Debug, Clone, Error)]
pub enum RewriteError {
    /// No candidate rule for a required action could be satisfied; the
    /// query must be aborted, never partially executed
    #[error("Unauthorized")]
    Unauthorized,

    /// Schema-authoring defect detected during rewriting (fatal, not a
    /// runtime condition to recover from)
    #[error("Bad schema definition for `{rtype}`: {detail}")]
    BadSchemaDefinition { rtype: String, detail: String },

    /// A supposedly safe splice changed the typed solutions of the
    /// original variables; indicates a defective permission rule
    #[error("Rewrite invariant violated: {0}")]
    InvariantViolation(String),

    /// Type resolution failed on the (possibly mutated) tree
    #[error(transparent)]
    Solver(#[from] SolverError),
}
