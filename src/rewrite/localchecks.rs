//! Local-checks partitioner.
//!
//! Groups a select's solutions by which permission rules apply to which
//! variables, given each variable's concrete type in each solution. One
//! query becomes one bucket when every solution needs the same checks; it
//! becomes a union of specialized branches when rules diverge by type.
//!
//! Invariants:
//! - buckets partition the input solutions exactly (no overlap, no gaps
//!   besides policy-denied solutions)
//! - the bucket needing no checks at all sorts first, so already-permitted
//!   solutions stay in an unmodified leading branch
//! - a select whose every solution is denied is `Unauthorized` outright

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ast::{Select, Solution};
use crate::schema::{Action, ActionPolicy, PermissionRule, Schema};

use super::errors::{RewriteError, RewriteResult};
use super::events::RewriteEvent;

/// The rules one variable must satisfy within a bucket.
#[derive(Debug, Clone)]
pub struct LocalCheck {
    pub variable: String,
    pub rules: Vec<Arc<PermissionRule>>,
}

/// One group of solutions sharing an identical variable→rules combination.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Checks to splice, empty for solutions needing no rewrite.
    pub checks: Vec<LocalCheck>,
    pub solutions: Vec<Solution>,
}

impl Bucket {
    /// Distinct entity types the bucket's solutions assign to checked
    /// variables.
    pub fn checked_types(&self) -> Vec<String> {
        let mut types = Vec::new();
        for check in &self.checks {
            for solution in &self.solutions {
                if let Some(t) = solution.get(&check.variable) {
                    if !types.iter().any(|x| x == t) {
                        types.push(t.clone());
                    }
                }
            }
        }
        types
    }
}

/// Buckets the select's solutions by applicable rule combination for the
/// given action.
///
/// Only variables visible at the top conjunctive scope are checked: a
/// variable local to an `EXISTS` or `NOT` subscope never reaches the
/// caller, it only filters rows, and the guards spliced for visible
/// variables quantify such subscopes themselves. Checking them would also
/// re-guard variables an earlier rewrite introduced.
///
/// Solutions hitting a `Deny` policy are dropped (recorded as a
/// `BranchDenied` event); if every solution is denied the whole select is
/// unauthorized.
pub fn partition(
    select: &Select,
    schema: &Schema,
    action: Action,
    events: &mut Vec<RewriteEvent>,
) -> RewriteResult<Vec<Bucket>> {
    // Key: per-variable rule expressions, sorted by variable. The empty
    // key (no checks anywhere) sorts before every non-empty one.
    type Key = Vec<(String, Vec<String>)>;
    let mut buckets: BTreeMap<Key, Bucket> = BTreeMap::new();
    let mut denied_types: Vec<String> = Vec::new();
    let mut denied = 0usize;
    let visible = select.scope_variables();

    for solution in &select.solutions {
        let mut checks: Vec<LocalCheck> = Vec::new();
        let mut denied_here = false;
        for (variable, etype) in solution {
            if Schema::is_value_type(etype) || !visible.contains(variable) {
                continue;
            }
            match schema.policy(etype, action) {
                ActionPolicy::Allow => {}
                ActionPolicy::Deny => {
                    if !denied_types.iter().any(|t| t == etype) {
                        denied_types.push(etype.clone());
                    }
                    denied_here = true;
                    break;
                }
                ActionPolicy::Guarded(rules) => checks.push(LocalCheck {
                    variable: variable.clone(),
                    rules: rules.clone(),
                }),
            }
        }
        if denied_here {
            denied += 1;
            continue;
        }
        let key: Key = checks
            .iter()
            .map(|c| {
                (
                    c.variable.clone(),
                    c.rules.iter().map(|r| r.expression().to_string()).collect(),
                )
            })
            .collect();
        buckets
            .entry(key)
            .or_insert_with(|| Bucket {
                checks,
                solutions: Vec::new(),
            })
            .solutions
            .push(solution.clone());
    }

    if denied > 0 {
        events.push(RewriteEvent::BranchDenied {
            entity_types: denied_types,
        });
    }
    if buckets.is_empty() && !select.solutions.is_empty() {
        return Err(RewriteError::Unauthorized);
    }
    Ok(buckets.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;
    use crate::solver::compute_solutions;

    fn schema() -> Schema {
        let mut schema = Schema::new("blog");
        schema.add_entity("BlogEntry").unwrap();
        schema.add_entity("Note").unwrap();
        schema.add_entity("State").unwrap();
        schema
            .add_relation("in_state", "BlogEntry", "State", "?*")
            .unwrap();
        schema
            .add_relation("in_state", "Note", "State", "?*")
            .unwrap();
        schema.add_attribute("name", "State", "String").unwrap();
        schema
    }

    fn solved(text: &str, schema: &Schema) -> Select {
        let mut union = parse_query(text).unwrap();
        let mut select = union.branches.remove(0);
        compute_solutions(&mut select, schema).unwrap();
        select
    }

    #[test]
    fn test_unguarded_query_yields_single_empty_bucket() {
        let schema = schema();
        let select = solved("Any X WHERE X is BlogEntry", &schema);
        let mut events = Vec::new();
        let buckets = partition(&select, &schema, Action::Read, &mut events).unwrap();
        assert_eq!(buckets.len(), 1);
        assert!(buckets[0].checks.is_empty());
        assert_eq!(buckets[0].solutions.len(), 1);
    }

    #[test]
    fn test_diverging_rules_split_buckets() {
        let mut schema = schema();
        schema
            .guard(
                "BlogEntry",
                Action::Read,
                &["X in_state S, S name \"published\""],
            )
            .unwrap();
        let select = solved("Any X WHERE X in_state S", &schema);
        assert_eq!(select.solutions.len(), 2);
        let mut events = Vec::new();
        let buckets = partition(&select, &schema, Action::Read, &mut events).unwrap();
        // Note needs nothing, BlogEntry needs the rule; the unchecked
        // bucket comes first.
        assert_eq!(buckets.len(), 2);
        assert!(buckets[0].checks.is_empty());
        assert_eq!(buckets[1].checks.len(), 1);
        assert_eq!(buckets[1].checks[0].variable, "X");
        let total: usize = buckets.iter().map(|b| b.solutions.len()).sum();
        assert_eq!(total, select.solutions.len());
    }

    #[test]
    fn test_deny_policy_drops_solutions() {
        let mut schema = schema();
        schema
            .set_policy("Note", Action::Read, ActionPolicy::Deny)
            .unwrap();
        let select = solved("Any X WHERE X in_state S", &schema);
        let mut events = Vec::new();
        let buckets = partition(&select, &schema, Action::Read, &mut events).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].solutions.len(), 1);
        assert_eq!(buckets[0].solutions[0]["X"], "BlogEntry");
        assert!(matches!(
            events.as_slice(),
            [RewriteEvent::BranchDenied { .. }]
        ));
    }

    #[test]
    fn test_exists_local_variables_not_checked() {
        let mut schema = schema();
        schema
            .guard(
                "BlogEntry",
                Action::Read,
                &["X in_state S, S name \"published\""],
            )
            .unwrap();
        // X only filters rows from inside the EXISTS; the returned states
        // carry no BlogEntry data, so no check applies.
        let select = solved("Any S WHERE S is State, EXISTS(X in_state S)", &schema);
        let mut events = Vec::new();
        let buckets = partition(&select, &schema, Action::Read, &mut events).unwrap();
        assert_eq!(buckets.len(), 1);
        assert!(buckets[0].checks.is_empty());
        assert_eq!(buckets[0].solutions.len(), select.solutions.len());
    }

    #[test]
    fn test_all_denied_is_unauthorized() {
        let mut schema = schema();
        schema
            .set_policy("BlogEntry", Action::Delete, ActionPolicy::Deny)
            .unwrap();
        let select = solved("Any X WHERE X is BlogEntry", &schema);
        let mut events = Vec::new();
        let err = partition(&select, &schema, Action::Delete, &mut events).unwrap_err();
        assert!(matches!(err, RewriteError::Unauthorized));
    }
}
