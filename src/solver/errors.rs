//! Solver error types.

use thiserror::Error;

/// Result type for solver operations
pub type SolverResult<T> = Result<T, SolverError>;

/// Errors raised while computing variable→type solutions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SolverError {
    /// Query references a relation type absent from the schema
    #[error("Unknown relation type `{0}`")]
    UnknownRelation(String),

    /// Query references an entity or value type absent from the schema
    #[error("Unknown type `{0}`")]
    UnknownType(String),

    /// No consistent type assignment exists for the statement
    #[error("No solution for query `{0}`")]
    NoSolution(String),
}
