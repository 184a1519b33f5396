//! Computed-relation expansion.
//!
//! A computed relation has no storage; it is defined by a rule expression
//! over `S` and `O`. Before any security rewriting, every occurrence of a
//! computed relation in a query is replaced by the EXISTS-wrapped body of
//! its defining rule, with `S`/`O` mapped to the occurrence's subject and
//! object and snippet locals renamed fresh. Pure macro expansion, no
//! access-control semantics.

use std::collections::BTreeMap;

use crate::ast::{Expr, Optional, Select, Term};
use crate::schema::{Action, Schema, SnippetVar};
use crate::solver::compute_solutions;

use super::errors::{RewriteError, RewriteResult};
use super::events::RewriteEvent;

/// Expansion passes before a rule chain is considered recursive.
const MAX_EXPANSION_DEPTH: usize = 8;

/// Replaces every computed-relation occurrence in the select (subqueries
/// included) by its defining rule's body, then recomputes solutions.
pub fn expand_computed_relations(
    select: &mut Select,
    schema: &Schema,
    events: &mut Vec<RewriteEvent>,
) -> RewriteResult<()> {
    let mut expanded_any = false;
    for _ in 0..MAX_EXPANSION_DEPTH {
        let mut expanded = Vec::new();
        expand_select(select, schema, &mut expanded)?;
        if expanded.is_empty() {
            if expanded_any {
                compute_solutions(select, schema).map_err(RewriteError::Solver)?;
            }
            return Ok(());
        }
        expanded_any = true;
        for rtype in expanded {
            events.push(RewriteEvent::RelationExpanded { rtype });
        }
    }
    Err(RewriteError::BadSchemaDefinition {
        rtype: first_computed(select, schema).unwrap_or_default(),
        detail: "computed relations expand recursively".to_string(),
    })
}

fn expand_select(
    select: &mut Select,
    schema: &Schema,
    expanded: &mut Vec<String>,
) -> RewriteResult<()> {
    let mut taken = select.all_variable_names();
    if let Some(restriction) = select.restriction.take() {
        select.restriction = expand_expr(restriction, schema, &mut taken, expanded)?;
    }
    for subquery in &mut select.subqueries {
        for branch in &mut subquery.query.branches {
            expand_select(branch, schema, expanded)?;
        }
    }
    Ok(())
}

fn expand_expr(
    expr: Expr,
    schema: &Schema,
    taken: &mut std::collections::BTreeSet<String>,
    expanded: &mut Vec<String>,
) -> RewriteResult<Option<Expr>> {
    match expr {
        Expr::And(terms) => {
            let mut out = Vec::with_capacity(terms.len());
            for term in terms {
                if let Some(e) = expand_expr(term, schema, taken, expanded)? {
                    out.push(e);
                }
            }
            Ok(if out.is_empty() {
                None
            } else {
                Some(Expr::and(out))
            })
        }
        Expr::Or(terms) => {
            let mut out = Vec::with_capacity(terms.len());
            for term in terms {
                if let Some(e) = expand_expr(term, schema, taken, expanded)? {
                    out.push(e);
                }
            }
            Ok(if out.is_empty() {
                None
            } else {
                Some(Expr::or(out))
            })
        }
        Expr::Not(inner) => Ok(expand_expr(*inner, schema, taken, expanded)?
            .map(|e| Expr::Not(Box::new(e)))),
        Expr::Exists(inner) => {
            Ok(expand_expr(*inner, schema, taken, expanded)?.map(Expr::exists))
        }
        Expr::Relation {
            ref subject,
            ref rtype,
            ref object,
            optional,
            ..
        } if schema.relation(rtype).is_some_and(|r| r.is_computed()) => {
            let relation = schema
                .relation(rtype)
                .ok_or_else(|| RewriteError::BadSchemaDefinition {
                    rtype: rtype.clone(),
                    detail: "computed relation vanished from schema".to_string(),
                })?;
            let rule = relation
                .rule
                .as_ref()
                .ok_or_else(|| RewriteError::BadSchemaDefinition {
                    rtype: rtype.clone(),
                    detail: "computed relation has no defining rule".to_string(),
                })?;
            if optional.is_optional() {
                return Err(RewriteError::BadSchemaDefinition {
                    rtype: rtype.clone(),
                    detail: "outer join over a computed relation is not supported".to_string(),
                });
            }
            let object_var = object.as_variable().ok_or_else(|| {
                RewriteError::BadSchemaDefinition {
                    rtype: rtype.clone(),
                    detail: "computed relation requires a variable object".to_string(),
                }
            })?;
            if rule.uses(SnippetVar::U) {
                return Err(RewriteError::BadSchemaDefinition {
                    rtype: rtype.clone(),
                    detail: "computed-relation rule may only use S and O".to_string(),
                });
            }
            let mut bindings = BTreeMap::new();
            bindings.insert("S".to_string(), subject.clone());
            bindings.insert("O".to_string(), object_var.to_string());
            let body = instantiate(rule.snippet(), rtype, &mut bindings, taken)?;
            expanded.push(rtype.clone());
            Ok(Some(Expr::exists(body)))
        }
        other => Ok(Some(other)),
    }
}

/// Clones a rule body with `S`/`O` substituted and every other variable
/// renamed to a fresh name.
fn instantiate(
    snippet: &Expr,
    rtype: &str,
    bindings: &mut BTreeMap<String, String>,
    taken: &mut std::collections::BTreeSet<String>,
) -> RewriteResult<Expr> {
    fn resolve(
        name: &str,
        bindings: &mut BTreeMap<String, String>,
        taken: &mut std::collections::BTreeSet<String>,
    ) -> String {
        if let Some(mapped) = bindings.get(name) {
            return mapped.clone();
        }
        let fresh = if taken.contains(name) {
            let mut n = 0;
            loop {
                let candidate = format!("{}{}", name, n);
                if !taken.contains(&candidate) {
                    break candidate;
                }
                n += 1;
            }
        } else {
            name.to_string()
        };
        taken.insert(fresh.clone());
        bindings.insert(name.to_string(), fresh.clone());
        fresh
    }

    fn map_term(
        term: &Term,
        bindings: &mut BTreeMap<String, String>,
        taken: &mut std::collections::BTreeSet<String>,
    ) -> Term {
        match term {
            Term::Variable(name) => Term::Variable(resolve(name, bindings, taken)),
            Term::Function { name, args } => Term::Function {
                name: name.clone(),
                args: args.iter().map(|a| map_term(a, bindings, taken)).collect(),
            },
            other => other.clone(),
        }
    }

    match snippet {
        Expr::And(terms) => {
            let mut out = Vec::with_capacity(terms.len());
            for term in terms {
                out.push(instantiate(term, rtype, bindings, taken)?);
            }
            Ok(Expr::and(out))
        }
        Expr::Or(terms) => {
            let mut out = Vec::with_capacity(terms.len());
            for term in terms {
                out.push(instantiate(term, rtype, bindings, taken)?);
            }
            Ok(Expr::or(out))
        }
        Expr::Not(inner) => Ok(Expr::Not(Box::new(instantiate(inner, rtype, bindings, taken)?))),
        Expr::Exists(inner) => Ok(Expr::exists(instantiate(inner, rtype, bindings, taken)?)),
        Expr::Relation {
            subject,
            rtype: rel_rtype,
            object,
            operator,
            optional,
        } => {
            if Action::from_permission_rtype(rel_rtype).is_some() {
                return Err(RewriteError::BadSchemaDefinition {
                    rtype: rtype.to_string(),
                    detail: "computed-relation rule may not check permissions".to_string(),
                });
            }
            Ok(Expr::Relation {
                subject: resolve(subject, bindings, taken),
                rtype: rel_rtype.clone(),
                object: map_term(object, bindings, taken),
                operator: *operator,
                optional: *optional,
            })
        }
        Expr::Comparison {
            left,
            operator,
            right,
        } => Ok(Expr::Comparison {
            left: map_term(left, bindings, taken),
            operator: *operator,
            right: map_term(right, bindings, taken),
        }),
        Expr::TypeIs { var, types } => Ok(Expr::TypeIs {
            var: resolve(var, bindings, taken),
            types: types.clone(),
        }),
        Expr::IsNull { var } => Ok(Expr::IsNull {
            var: resolve(var, bindings, taken),
        }),
        Expr::SubqueryIn { var, query } => Ok(Expr::SubqueryIn {
            var: resolve(var, bindings, taken),
            query: query.clone(),
        }),
    }
}

fn first_computed(select: &Select, schema: &Schema) -> Option<String> {
    fn visit(expr: &Expr, schema: &Schema) -> Option<String> {
        match expr {
            Expr::And(terms) | Expr::Or(terms) => {
                terms.iter().find_map(|t| visit(t, schema))
            }
            Expr::Not(inner) | Expr::Exists(inner) => visit(inner, schema),
            Expr::Relation { rtype, .. }
                if schema.relation(rtype).is_some_and(|r| r.is_computed()) =>
            {
                Some(rtype.clone())
            }
            _ => None,
        }
    }
    select.restriction.as_ref().and_then(|r| visit(r, schema))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;

    fn schema() -> Schema {
        let mut schema = Schema::new("blog");
        schema.add_entity("BlogEntry").unwrap();
        schema.add_entity("CWUser").unwrap();
        schema
            .add_relation("owned_by", "BlogEntry", "CWUser", "**")
            .unwrap();
        schema
            .add_computed_relation("readable_by", "BlogEntry", "CWUser", "S owned_by O")
            .unwrap();
        schema
    }

    fn branch(text: &str) -> Select {
        parse_query(text).unwrap().branches.remove(0)
    }

    #[test]
    fn test_expansion_replaces_relation_with_exists() {
        let schema = schema();
        let mut select = branch("Any X WHERE X readable_by Y");
        let mut events = Vec::new();
        expand_computed_relations(&mut select, &schema, &mut events).unwrap();
        assert_eq!(select.to_string(), "Any X WHERE EXISTS(X owned_by Y)");
        assert!(matches!(
            events.as_slice(),
            [RewriteEvent::RelationExpanded { rtype }] if rtype == "readable_by"
        ));
        assert_eq!(select.solutions.len(), 1);
    }

    #[test]
    fn test_snippet_locals_renamed_fresh() {
        let mut schema = schema();
        schema.add_entity("Group").unwrap();
        schema
            .add_relation("in_group", "CWUser", "Group", "**")
            .unwrap();
        schema
            .add_relation("allowed", "BlogEntry", "Group", "**")
            .unwrap();
        schema
            .add_computed_relation(
                "visible_to",
                "BlogEntry",
                "CWUser",
                "S allowed G, O in_group G",
            )
            .unwrap();
        // G is taken by the host query, so the expansion picks G0.
        let mut select = branch("Any X, G WHERE X visible_to G");
        let mut events = Vec::new();
        expand_computed_relations(&mut select, &schema, &mut events).unwrap();
        assert_eq!(
            select.to_string(),
            "Any X, G WHERE EXISTS(X allowed G0, G in_group G0)"
        );
    }

    #[test]
    fn test_recursive_definition_rejected() {
        let mut schema = Schema::new("s");
        schema.add_entity("Doc").unwrap();
        schema
            .add_computed_relation("linked", "Doc", "Doc", "S linked O")
            .unwrap();
        let mut select = branch("Any X WHERE X linked Y");
        let mut events = Vec::new();
        let err = expand_computed_relations(&mut select, &schema, &mut events).unwrap_err();
        assert!(matches!(
            err,
            RewriteError::BadSchemaDefinition { rtype, .. } if rtype == "linked"
        ));
    }

    #[test]
    fn test_plain_relations_untouched() {
        let schema = schema();
        let mut select = branch("Any X WHERE X owned_by Y");
        let before = select.to_string();
        let mut events = Vec::new();
        expand_computed_relations(&mut select, &schema, &mut events).unwrap();
        assert_eq!(select.to_string(), before);
        assert!(events.is_empty());
    }
}
