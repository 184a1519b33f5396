//! Permission rules and action policies.
//!
//! A [`PermissionRule`] wraps a parsed condition snippet written with the
//! symbolic placeholders `S`, `O`, `U`, `X`:
//!
//! - `X` — the entity the action targets (entity rules)
//! - `S` / `O` — subject and object of a relation (relation rules, also the
//!   main variables of computed-relation definitions)
//! - `U` — the user performing the action
//!
//! Rules are immutable once constructed and shared read-only across every
//! rewrite of every concurrent transaction.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use uuid::Uuid;

use crate::ast::{Expr, Term};

use super::cache::SnippetCache;
use super::errors::{SchemaError, SchemaResult};

/// Symbolic main variables a snippet may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SnippetVar {
    S,
    O,
    U,
    X,
}

impl SnippetVar {
    /// Maps a variable name to its symbolic role, if it has one.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "S" => Some(SnippetVar::S),
            "O" => Some(SnippetVar::O),
            "U" => Some(SnippetVar::U),
            "X" => Some(SnippetVar::X),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnippetVar::S => "S",
            SnippetVar::O => "O",
            SnippetVar::U => "U",
            SnippetVar::X => "X",
        }
    }
}

/// What a given action is allowed to do on an entity type.
#[derive(Debug, Clone, Default)]
pub enum ActionPolicy {
    /// No restriction; rows of this type never need rewriting.
    #[default]
    Allow,
    /// Never allowed; any query touching this type for the action fails.
    Deny,
    /// Allowed for rows matching at least one rule (rules are disjunctive).
    Guarded(Vec<Arc<PermissionRule>>),
}

/// An immutable permission rule: expression text, its parsed snippet, the
/// symbolic main variables it uses and a variable-adjacency graph for
/// reachability queries.
#[derive(Debug)]
pub struct PermissionRule {
    expression: String,
    snippet: Arc<Expr>,
    main_vars: BTreeSet<SnippetVar>,
    var_graph: BTreeMap<String, BTreeSet<String>>,
    eid: Option<Uuid>,
}

impl PermissionRule {
    /// Parses an expression into a rule, going through the schema's snippet
    /// cache.
    pub fn new(expression: impl Into<String>, cache: &mut SnippetCache) -> SchemaResult<Self> {
        let expression = expression.into();
        let snippet = cache
            .parse(&expression)
            .map_err(|source| SchemaError::InvalidExpression {
                expression: expression.clone(),
                source,
            })?;

        let mut vars = Vec::new();
        snippet.collect_variables(&mut vars);
        let main_vars = vars
            .iter()
            .filter_map(|name| SnippetVar::from_name(name))
            .collect();

        let mut var_graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        collect_edges(&snippet, &mut var_graph);

        Ok(Self {
            expression,
            snippet,
            main_vars,
            var_graph,
            eid: None,
        })
    }

    /// Attaches the schema entity id of the rule definition.
    pub fn with_eid(mut self, eid: Uuid) -> Self {
        self.eid = Some(eid);
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn snippet(&self) -> &Expr {
        &self.snippet
    }

    pub fn eid(&self) -> Option<Uuid> {
        self.eid
    }

    /// True if the snippet mentions the given symbolic variable.
    pub fn uses(&self, var: SnippetVar) -> bool {
        self.main_vars.contains(&var)
    }

    pub fn main_variables(&self) -> &BTreeSet<SnippetVar> {
        &self.main_vars
    }

    /// Variables reachable from `from` over the snippet's relation edges,
    /// `from` included.
    pub fn reachable_from(&self, from: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        seen.insert(from.to_string());
        queue.push_back(from.to_string());
        while let Some(current) = queue.pop_front() {
            if let Some(neighbours) = self.var_graph.get(&current) {
                for next in neighbours {
                    if seen.insert(next.clone()) {
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        seen
    }
}

fn collect_edges(expr: &Expr, graph: &mut BTreeMap<String, BTreeSet<String>>) {
    match expr {
        Expr::And(terms) | Expr::Or(terms) => {
            for term in terms {
                collect_edges(term, graph);
            }
        }
        Expr::Not(inner) | Expr::Exists(inner) => collect_edges(inner, graph),
        Expr::Relation {
            subject, object, ..
        } => {
            graph.entry(subject.clone()).or_default();
            if let Term::Variable(obj) = object {
                graph
                    .entry(subject.clone())
                    .or_default()
                    .insert(obj.clone());
                graph
                    .entry(obj.clone())
                    .or_default()
                    .insert(subject.clone());
            }
        }
        Expr::Comparison { .. }
        | Expr::TypeIs { .. }
        | Expr::IsNull { .. }
        | Expr::SubqueryIn { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(expression: &str) -> PermissionRule {
        let mut cache = SnippetCache::new();
        PermissionRule::new(expression, &mut cache).unwrap()
    }

    #[test]
    fn test_main_variables() {
        let r = rule("X in_state S, S name \"published\"");
        assert!(r.uses(SnippetVar::X));
        assert!(r.uses(SnippetVar::S));
        assert!(!r.uses(SnippetVar::U));
    }

    #[test]
    fn test_reachability() {
        let r = rule("X in_state S, S allowed_for G, G member U");
        let reachable = r.reachable_from("X");
        assert!(reachable.contains("G"));
        assert!(reachable.contains("U"));
    }

    #[test]
    fn test_unreachable_variable() {
        let r = rule("X owned_by U, A name \"island\"");
        assert!(!r.reachable_from("X").contains("A"));
    }

    #[test]
    fn test_invalid_expression_rejected() {
        let mut cache = SnippetCache::new();
        let err = PermissionRule::new("X owned_by", &mut cache).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidExpression { .. }));
    }
}
