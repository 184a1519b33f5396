//! Type solver: enumerates the consistent variable→type assignments of a
//! select statement.
//!
//! The solver is a pure, re-entrant pass over the (possibly just mutated)
//! tree; the rewrite engine re-invokes it after every splice to observe the
//! effect on the solution set. Typing rules:
//!
//! - `And`, `Not` and `Exists` constrain conjunctively (negation restricts
//!   types the same way the positive relation would)
//! - `Or` constrains a variable to the union of what its branches allow
//! - relation occurrences must match a (subject, object) definition of
//!   their relation type
//! - output ordering is deterministic: solutions sort lexicographically

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{Expr, Select, Solution, Term, Union};
use crate::schema::{Schema, VALUE_TYPES};

use super::errors::{SolverError, SolverResult};

/// Built-in relation types every entity supports.
const BUILTIN_RTYPES: &[&str] = &["eid", "identity"];

/// Recomputes `select.solutions` in place.
///
/// An empty result is not an error here; callers that require solutions
/// use [`annotate`].
pub fn compute_solutions(select: &mut Select, schema: &Schema) -> SolverResult<()> {
    // Nested queries first: subquery aliases and correlated subqueries take
    // their types from their own solutions.
    for subquery in &mut select.subqueries {
        for branch in &mut subquery.query.branches {
            compute_solutions(branch, schema)?;
        }
    }
    if let Some(restriction) = &mut select.restriction {
        solve_nested(restriction, schema)?;
    }

    let variables = select.variables();
    if variables.is_empty() {
        select.solutions = vec![BTreeMap::new()];
        return Ok(());
    }

    let mut domains: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let full_domain: BTreeSet<String> = schema
        .entity_types()
        .map(str::to_string)
        .chain(VALUE_TYPES.iter().map(|t| t.to_string()))
        .collect();
    for var in &variables {
        domains.insert(var.clone(), full_domain.clone());
    }
    for subquery in &select.subqueries {
        for (column, alias) in subquery.aliases.iter().enumerate() {
            let types = column_types(&subquery.query, column);
            if let Some(domain) = domains.get_mut(alias) {
                domain.retain(|t| types.contains(t));
            }
        }
    }

    // Unary propagation to a fixpoint; enumeration handles the rest.
    if let Some(restriction) = &select.restriction {
        loop {
            let before = domains.clone();
            constrain(restriction, &mut domains, schema)?;
            if domains == before {
                break;
            }
        }
    }

    let pairs = select
        .restriction
        .as_ref()
        .map(|r| conjunctive_pairs(r))
        .unwrap_or_default();

    let ordered: Vec<&String> = domains.keys().collect();
    let mut solutions = Vec::new();
    let mut assignment: Solution = BTreeMap::new();
    enumerate(
        &ordered,
        0,
        &domains,
        &pairs,
        select.restriction.as_ref(),
        schema,
        &mut assignment,
        &mut solutions,
    );
    solutions.sort();
    select.solutions = solutions;
    Ok(())
}

/// Recomputes solutions for every branch of a statement, failing if any
/// branch admits none.
pub fn annotate(union: &mut Union, schema: &Schema) -> SolverResult<()> {
    for branch in &mut union.branches {
        compute_solutions(branch, schema)?;
        if branch.solutions.is_empty() {
            return Err(SolverError::NoSolution(branch.to_string()));
        }
    }
    Ok(())
}

fn solve_nested(expr: &mut Expr, schema: &Schema) -> SolverResult<()> {
    match expr {
        Expr::And(terms) | Expr::Or(terms) => {
            for term in terms {
                solve_nested(term, schema)?;
            }
            Ok(())
        }
        Expr::Not(inner) | Expr::Exists(inner) => solve_nested(inner, schema),
        Expr::SubqueryIn { query, .. } => compute_solutions(query, schema),
        _ => Ok(()),
    }
}

/// Types the `column`-th selected term of a union can take.
fn column_types(union: &Union, column: usize) -> BTreeSet<String> {
    let mut types = BTreeSet::new();
    for branch in &union.branches {
        match branch.selection.get(column) {
            Some(Term::Variable(var)) => {
                for solution in &branch.solutions {
                    if let Some(t) = solution.get(var) {
                        types.insert(t.clone());
                    }
                }
            }
            Some(Term::Constant(value)) => {
                if let Some(t) = constant_type(value) {
                    types.insert(t.to_string());
                }
            }
            Some(Term::Function { .. }) | Some(Term::Param(_)) | None => {
                types.extend(VALUE_TYPES.iter().map(|t| t.to_string()));
            }
        }
    }
    types
}

fn constant_type(value: &serde_json::Value) -> Option<&'static str> {
    match value {
        serde_json::Value::String(_) => Some("String"),
        serde_json::Value::Bool(_) => Some("Bool"),
        serde_json::Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some("Int")
            } else {
                Some("Float")
            }
        }
        _ => None,
    }
}

fn constrain(
    expr: &Expr,
    domains: &mut BTreeMap<String, BTreeSet<String>>,
    schema: &Schema,
) -> SolverResult<()> {
    match expr {
        Expr::And(terms) => {
            for term in terms {
                constrain(term, domains, schema)?;
            }
            Ok(())
        }
        Expr::Not(inner) | Expr::Exists(inner) => constrain(inner, domains, schema),
        Expr::Or(terms) => {
            // A variable may satisfy any branch that mentions it: intersect
            // with the union of those branches' outcomes. Branches that do
            // not use the variable say nothing about it.
            let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for term in terms {
                let mut mentioned = Vec::new();
                term.collect_variables(&mut mentioned);
                let mut branch_domains = domains.clone();
                constrain(term, &mut branch_domains, schema)?;
                for var in mentioned {
                    if let Some(types) = branch_domains.get(&var) {
                        merged
                            .entry(var)
                            .or_default()
                            .extend(types.iter().cloned());
                    }
                }
            }
            for (var, allowed) in merged {
                if let Some(domain) = domains.get_mut(&var) {
                    domain.retain(|t| allowed.contains(t));
                }
            }
            Ok(())
        }
        Expr::Relation {
            subject,
            rtype,
            object,
            ..
        } => {
            if BUILTIN_RTYPES.contains(&rtype.as_str()) {
                if rtype == "identity" {
                    if let Term::Variable(obj) = object {
                        let subject_domain = domains.get(subject).cloned().unwrap_or_default();
                        let object_domain = domains.get(obj).cloned().unwrap_or_default();
                        if let Some(domain) = domains.get_mut(subject) {
                            domain.retain(|t| object_domain.contains(t));
                        }
                        if let Some(domain) = domains.get_mut(obj) {
                            domain.retain(|t| subject_domain.contains(t));
                        }
                    }
                } else if let Some(domain) = domains.get_mut(subject) {
                    // eid applies to entities only.
                    domain.retain(|t| !VALUE_TYPES.contains(&t.as_str()));
                }
                return Ok(());
            }
            let relation = schema
                .relation(rtype)
                .ok_or_else(|| SolverError::UnknownRelation(rtype.clone()))?;
            let subject_types: BTreeSet<&str> =
                relation.defs.iter().map(|d| d.subject.as_str()).collect();
            match object {
                Term::Variable(obj) => {
                    let object_types: BTreeSet<&str> =
                        relation.defs.iter().map(|d| d.object.as_str()).collect();
                    if let Some(domain) = domains.get_mut(subject) {
                        domain.retain(|t| subject_types.contains(t.as_str()));
                    }
                    if let Some(domain) = domains.get_mut(obj) {
                        domain.retain(|t| object_types.contains(t.as_str()));
                    }
                }
                Term::Constant(value) => {
                    let value_type = constant_type(value);
                    if let Some(domain) = domains.get_mut(subject) {
                        domain.retain(|t| {
                            relation.defs.iter().any(|d| {
                                d.subject == *t
                                    && value_type.map_or(true, |vt| d.object == vt)
                            })
                        });
                    }
                }
                Term::Param(_) | Term::Function { .. } => {
                    if let Some(domain) = domains.get_mut(subject) {
                        domain.retain(|t| subject_types.contains(t.as_str()));
                    }
                }
            }
            Ok(())
        }
        Expr::TypeIs { var, types } => {
            for t in types {
                if !schema.has_entity(t) && !Schema::is_value_type(t) {
                    return Err(SolverError::UnknownType(t.clone()));
                }
            }
            if let Some(domain) = domains.get_mut(var) {
                domain.retain(|t| types.contains(t));
            }
            Ok(())
        }
        Expr::SubqueryIn { var, query, .. } => {
            let types = column_types(&Union::single((**query).clone()), 0);
            if let Some(domain) = domains.get_mut(var) {
                domain.retain(|t| types.contains(t));
            }
            Ok(())
        }
        Expr::Comparison { .. } | Expr::IsNull { .. } => Ok(()),
    }
}

/// Relation pairs of the conjunctive scope (not under `Or`), used to prune
/// enumeration early.
fn conjunctive_pairs(expr: &Expr) -> Vec<(&str, &str, &str)> {
    fn visit<'a>(expr: &'a Expr, out: &mut Vec<(&'a str, &'a str, &'a str)>) {
        match expr {
            Expr::And(terms) => {
                for term in terms {
                    visit(term, out);
                }
            }
            Expr::Not(inner) | Expr::Exists(inner) => visit(inner, out),
            Expr::Relation {
                subject,
                rtype,
                object: Term::Variable(obj),
                ..
            } if !BUILTIN_RTYPES.contains(&rtype.as_str()) => {
                out.push((subject, rtype, obj));
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    visit(expr, &mut out);
    out
}

#[allow(clippy::too_many_arguments)]
fn enumerate(
    vars: &[&String],
    index: usize,
    domains: &BTreeMap<String, BTreeSet<String>>,
    pairs: &[(&str, &str, &str)],
    restriction: Option<&Expr>,
    schema: &Schema,
    assignment: &mut Solution,
    out: &mut Vec<Solution>,
) {
    if index == vars.len() {
        let ok = restriction.map_or(true, |r| satisfies(r, assignment, schema));
        if ok {
            out.push(assignment.clone());
        }
        return;
    }
    let var = vars[index];
    let Some(domain) = domains.get(var) else {
        return;
    };
    for t in domain {
        assignment.insert(var.clone(), t.clone());
        if pairs_consistent(pairs, assignment, schema) {
            enumerate(
                vars,
                index + 1,
                domains,
                pairs,
                restriction,
                schema,
                assignment,
                out,
            );
        }
    }
    assignment.remove(var);
}

fn pairs_consistent(
    pairs: &[(&str, &str, &str)],
    assignment: &Solution,
    schema: &Schema,
) -> bool {
    for (subject, rtype, object) in pairs {
        let (Some(st), Some(ot)) = (assignment.get(*subject), assignment.get(*object)) else {
            continue;
        };
        let Some(relation) = schema.relation(rtype) else {
            return false;
        };
        if !relation
            .defs
            .iter()
            .any(|d| d.subject == *st && d.object == *ot)
        {
            return false;
        }
    }
    true
}

fn satisfies(expr: &Expr, assignment: &Solution, schema: &Schema) -> bool {
    match expr {
        Expr::And(terms) => terms.iter().all(|t| satisfies(t, assignment, schema)),
        Expr::Or(terms) => terms.iter().any(|t| satisfies(t, assignment, schema)),
        Expr::Not(inner) | Expr::Exists(inner) => satisfies(inner, assignment, schema),
        Expr::Relation {
            subject,
            rtype,
            object,
            ..
        } => {
            if rtype == "identity" {
                if let Term::Variable(obj) = object {
                    return assignment.get(subject) == assignment.get(obj);
                }
                return true;
            }
            if BUILTIN_RTYPES.contains(&rtype.as_str()) {
                return assignment
                    .get(subject)
                    .map_or(true, |t| !VALUE_TYPES.contains(&t.as_str()));
            }
            let Some(st) = assignment.get(subject) else {
                return true;
            };
            let Some(relation) = schema.relation(rtype) else {
                return false;
            };
            match object {
                Term::Variable(obj) => {
                    let Some(ot) = assignment.get(obj) else {
                        return true;
                    };
                    relation
                        .defs
                        .iter()
                        .any(|d| d.subject == *st && d.object == *ot)
                }
                Term::Constant(value) => {
                    let value_type = constant_type(value);
                    relation.defs.iter().any(|d| {
                        d.subject == *st && value_type.map_or(true, |vt| d.object == vt)
                    })
                }
                Term::Param(_) | Term::Function { .. } => {
                    relation.defs.iter().any(|d| d.subject == *st)
                }
            }
        }
        Expr::TypeIs { var, types } => assignment
            .get(var)
            .map_or(true, |t| types.contains(t)),
        Expr::SubqueryIn { var, query } => {
            let types = column_types(&Union::single((**query).clone()), 0);
            assignment.get(var).map_or(true, |t| types.contains(t))
        }
        Expr::Comparison { .. } | Expr::IsNull { .. } => true,
    }
}
