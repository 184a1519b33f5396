//! Type Solver subsystem.
//!
//! Computes the ordered list of consistent variable→type assignments
//! (solutions) for a select statement. The rewrite engine invokes
//! [`compute_solutions`] after every splice: an emptied solution set means
//! the spliced rule cannot be satisfied and must be undone.
//!
//! # Invariants
//!
//! - Pure and re-entrant: same tree, same schema → same solutions
//! - Deterministic ordering: solutions sort lexicographically

mod errors;
mod solver;

pub use errors::{SolverError, SolverResult};
pub use solver::{annotate, compute_solutions};
