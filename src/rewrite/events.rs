//! Typed observability events emitted by the rewrite engine
//!
//! Every decision the engine takes while transforming a query is recorded
//! as a `RewriteEvent`. Callers receive the event trail alongside the
//! rewritten tree and can log, audit, or assert on it.

use std::fmt;

/// One decision taken during a rewrite pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteEvent {
    /// Rewriting was skipped entirely (service role session)
    Bypassed,

    /// A permission rule was spliced for a variable
    RuleApplied {
        variable: String,
        expression: String,
    },

    /// A candidate rule was tried and backtracked (unsatisfiable splice)
    RuleSkipped {
        variable: String,
        expression: String,
    },

    /// The rule condition was already present; nothing was added
    AlreadyGuarded { variable: String },

    /// No candidate rule could be satisfied for a variable
    AccessDenied {
        variable: String,
        entity_types: Vec<String>,
    },

    /// A union branch was dropped because a `deny` policy matched it
    BranchDenied { entity_types: Vec<String> },

    /// A branch was split into per-type-combination union branches
    UnionSplit { branches: usize },

    /// An aggregating branch was factored into a subquery union
    UnionFactored { branches: usize },

    /// Correlated new variables forced per-type variante branches
    AmbiguitySplit { variables: Vec<String> },

    /// An optional variable was guarded through a correlated subquery
    SubqueryExtracted { variable: String },

    /// A computed relation was expanded into its defining pattern
    RelationExpanded { rtype: String },
}

impl fmt::Display for RewriteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteEvent::Bypassed => write!(f, "rewrite bypassed (service role)"),
            RewriteEvent::RuleApplied { variable, expression } => {
                write!(f, "rule applied on {}: {}", variable, expression)
            }
            RewriteEvent::RuleSkipped { variable, expression } => {
                write!(f, "rule skipped on {}: {}", variable, expression)
            }
            RewriteEvent::AlreadyGuarded { variable } => {
                write!(f, "already guarded: {}", variable)
            }
            RewriteEvent::AccessDenied { variable, entity_types } => {
                write!(f, "access denied on {} ({})", variable, entity_types.join(", "))
            }
            RewriteEvent::BranchDenied { entity_types } => {
                write!(f, "branch denied ({})", entity_types.join(", "))
            }
            RewriteEvent::UnionSplit { branches } => {
                write!(f, "branch split into {} union branches", branches)
            }
            RewriteEvent::UnionFactored { branches } => {
                write!(f, "aggregating branch factored into {} subquery branches", branches)
            }
            RewriteEvent::AmbiguitySplit { variables } => {
                write!(f, "ambiguity split on {}", variables.join(", "))
            }
            RewriteEvent::SubqueryExtracted { variable } => {
                write!(f, "subquery extracted for optional {}", variable)
            }
            RewriteEvent::RelationExpanded { rtype } => {
                write!(f, "computed relation expanded: {}", rtype)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = RewriteEvent::RuleApplied {
            variable: "X".to_string(),
            expression: "X owned_by U".to_string(),
        };
        assert_eq!(event.to_string(), "rule applied on X: X owned_by U");
    }

    #[test]
    fn test_denied_display_lists_types() {
        let event = RewriteEvent::AccessDenied {
            variable: "X".to_string(),
            entity_types: vec!["BlogEntry".to_string(), "Comment".to_string()],
        };
        assert_eq!(event.to_string(), "access denied on X (BlogEntry, Comment)");
    }
}
