//! The query rewrite engine.
//!
//! Splices permission-rule conditions into a query tree so that every row
//! the query can return is one the session's principal is allowed to see.
//! Rewriting is restriction-only: it never widens a query, and on any
//! failure the original tree and solutions are restored intact.
//!
//! Design Principles:
//! - rules for one variable are disjunctive; one satisfiable rule suffices
//! - every splice is validated by re-running the type solver; a splice
//!   that empties the solutions is undone and the next rule is tried
//! - `Unauthorized` surfaces only when no candidate rule can be satisfied
//! - typed solutions of the original variables must survive a rewrite
//!   unchanged; divergence is a schema-authoring defect, not a runtime
//!   condition

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::ast::{Expr, Select, Solution, SubQuery, Term, Union, VariableOrigin};
use crate::schema::{Action, PermissionRule, Schema, SnippetVar};
use crate::session::{Params, SessionContext};
use crate::solver::{annotate, compute_solutions};

use super::context::RewriteContext;
use super::errors::{RewriteError, RewriteResult};
use super::events::RewriteEvent;
use super::localchecks::{partition, Bucket, LocalCheck};
use super::relations::expand_computed_relations;

/// One rewrite application: the substitution from snippet symbols to query
/// variables, plus the disjunctive rules to splice for it.
#[derive(Debug, Clone)]
pub struct RuleApplication {
    pub varmap: Vec<(String, SnippetVar)>,
    pub rules: Vec<Arc<PermissionRule>>,
}

impl RuleApplication {
    /// Entity-rule application: the rules' `X` maps to one query variable.
    pub fn entity(variable: impl Into<String>, rules: Vec<Arc<PermissionRule>>) -> Self {
        Self {
            varmap: vec![(variable.into(), SnippetVar::X)],
            rules,
        }
    }
}

/// A translated snippet: the condition body in the query's variable space
/// (None when the snippet reduced to pending obligations only) and the
/// `has_<action>_permission` obligations it recorded.
struct Translation {
    body: Option<Expr>,
    pending: Vec<(String, Action)>,
}

/// Outcome of resolving one pending permission obligation.
enum PendingOutcome {
    /// Every possible type of the variable allows the action.
    Clear,
    /// Condition to AND into the enclosing rule body.
    Guard(Expr),
    /// No type of the variable can satisfy the action; the enclosing rule
    /// is unusable.
    Refused,
}

/// Rewrites queries against one schema.
pub struct QueryRewriter<'a> {
    schema: &'a Schema,
}

impl<'a> QueryRewriter<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Enforces the given action on a whole statement: expands computed
    /// relations, buckets each branch's solutions by applicable rules and
    /// splices the rules in, splitting branches into unions where rules
    /// diverge by type.
    ///
    /// On error the statement is left exactly as it was passed in.
    pub fn enforce(
        &self,
        union: &mut Union,
        action: Action,
        session: &SessionContext,
        params: &mut Params,
    ) -> RewriteResult<Vec<RewriteEvent>> {
        if session.can_bypass_rewrite() {
            return Ok(vec![RewriteEvent::Bypassed]);
        }
        let saved = union.clone();
        let saved_params = params.clone();
        match self.enforce_inner(union, action, session, params) {
            Ok(events) => Ok(events),
            Err(err) => {
                *union = saved;
                *params = saved_params;
                Err(err)
            }
        }
    }

    fn enforce_inner(
        &self,
        union: &mut Union,
        action: Action,
        session: &SessionContext,
        params: &mut Params,
    ) -> RewriteResult<Vec<RewriteEvent>> {
        let mut events = Vec::new();
        for branch in &mut union.branches {
            expand_computed_relations(branch, self.schema, &mut events)?;
        }
        annotate(union, self.schema)?;

        let mut rewritten = Vec::new();
        for branch in std::mem::take(&mut union.branches) {
            let branch_types = branch_entity_types(&branch);
            match self.enforce_branch(branch, action, session, params, &mut rewritten, &mut events)
            {
                Ok(()) => {}
                // One refused branch only narrows the union; the statement
                // fails when nothing survives.
                Err(RewriteError::Unauthorized) => {
                    events.push(RewriteEvent::BranchDenied {
                        entity_types: branch_types,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        if rewritten.is_empty() {
            return Err(RewriteError::Unauthorized);
        }
        union.branches = rewritten;
        Ok(events)
    }

    fn enforce_branch(
        &self,
        mut branch: Select,
        action: Action,
        session: &SessionContext,
        params: &mut Params,
        out: &mut Vec<Select>,
        events: &mut Vec<RewriteEvent>,
    ) -> RewriteResult<()> {
        let pin_vars = pin_variables(&branch);
        let buckets = partition(&branch, self.schema, action, events)?;
        if buckets.len() == 1 {
            let bucket = &buckets[0];
            if !bucket_covers_all(bucket, &branch) {
                // A deny policy dropped part of the solutions; pin the
                // branch to what survived before splicing.
                if let Some(guard) = bucket_guard(bucket, &pin_vars) {
                    branch.add_restriction(guard);
                }
                compute_solutions(&mut branch, self.schema)?;
            }
            if bucket.checks.is_empty() {
                out.push(branch);
                return Ok(());
            }
            let applications = to_applications(&bucket.checks);
            let mut ctx = RewriteContext::new(&branch);
            self.rewrite_branch(&mut branch, &applications, &mut ctx, session, params)?;
            events.append(&mut ctx.events);
            out.push(branch);
            return Ok(());
        }

        if branch.needs_outer_factoring() {
            self.factor_aggregating_branch(branch, buckets, &pin_vars, session, params, out, events)
        } else {
            self.split_branch(branch, buckets, &pin_vars, session, params, out, events)
        }
    }

    /// Multi-bucket rewrite of a plain branch: one union branch per
    /// bucket, each pinned to its bucket's type combinations.
    #[allow(clippy::too_many_arguments)]
    fn split_branch(
        &self,
        branch: Select,
        buckets: Vec<Bucket>,
        pin_vars: &BTreeSet<String>,
        session: &SessionContext,
        params: &mut Params,
        out: &mut Vec<Select>,
        events: &mut Vec<RewriteEvent>,
    ) -> RewriteResult<()> {
        let mut produced = 0usize;
        for bucket in buckets {
            let mut piece = branch.clone();
            if let Some(guard) = bucket_guard(&bucket, pin_vars) {
                piece.add_restriction(guard);
            }
            compute_solutions(&mut piece, self.schema)?;
            if bucket.checks.is_empty() {
                out.push(piece);
                produced += 1;
                continue;
            }
            let applications = to_applications(&bucket.checks);
            let mut ctx = RewriteContext::new(&piece);
            match self.rewrite_branch(&mut piece, &applications, &mut ctx, session, params) {
                Ok(()) => {
                    events.append(&mut ctx.events);
                    out.push(piece);
                    produced += 1;
                }
                Err(RewriteError::Unauthorized) => {
                    events.push(RewriteEvent::BranchDenied {
                        entity_types: bucket.checked_types(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        if produced == 0 {
            return Err(RewriteError::Unauthorized);
        }
        events.push(RewriteEvent::UnionSplit { branches: produced });
        Ok(())
    }

    /// Multi-bucket rewrite of an aggregating branch: the per-bucket
    /// rewrites become branches of a union inside a subquery projecting
    /// the raw variables, and grouping, ordering and slicing reattach to
    /// a new outer select over the subquery's aliases.
    #[allow(clippy::too_many_arguments)]
    fn factor_aggregating_branch(
        &self,
        branch: Select,
        buckets: Vec<Bucket>,
        pin_vars: &BTreeSet<String>,
        session: &SessionContext,
        params: &mut Params,
        out: &mut Vec<Select>,
        events: &mut Vec<RewriteEvent>,
    ) -> RewriteResult<()> {
        let raw_vars = raw_variables(&branch);
        let mut template = Select::new();
        template.selection = raw_vars.iter().map(Term::var).collect();
        template.restriction = branch.restriction.clone();
        template.subqueries = branch.subqueries.clone();

        let mut inner_branches = Vec::new();
        for bucket in buckets {
            let mut piece = template.clone();
            if let Some(guard) = bucket_guard(&bucket, pin_vars) {
                piece.add_restriction(guard);
            }
            compute_solutions(&mut piece, self.schema)?;
            if bucket.checks.is_empty() {
                inner_branches.push(piece);
                continue;
            }
            let applications = to_applications(&bucket.checks);
            let mut ctx = RewriteContext::new(&piece);
            match self.rewrite_branch(&mut piece, &applications, &mut ctx, session, params) {
                Ok(()) => {
                    events.append(&mut ctx.events);
                    inner_branches.push(piece);
                }
                Err(RewriteError::Unauthorized) => {
                    events.push(RewriteEvent::BranchDenied {
                        entity_types: bucket.checked_types(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        if inner_branches.is_empty() {
            return Err(RewriteError::Unauthorized);
        }
        events.push(RewriteEvent::UnionFactored {
            branches: inner_branches.len(),
        });

        let mut outer = Select::new();
        outer.distinct = branch.distinct;
        outer.selection = branch.selection;
        outer.groupby = branch.groupby;
        outer.having = branch.having;
        outer.orderby = branch.orderby;
        outer.limit = branch.limit;
        outer.offset = branch.offset;
        outer.subqueries = vec![SubQuery {
            aliases: raw_vars,
            query: Union {
                branches: inner_branches,
            },
        }];
        compute_solutions(&mut outer, self.schema)?;
        out.push(outer);
        Ok(())
    }

    /// Splices the given rule applications into one select.
    ///
    /// The low-level entry point for callers that assemble their own
    /// varmaps (relation rules mapping `S`/`O`, write-action checks).
    /// `params` may gain a substitution for the current user's eid. On
    /// error the select is left untouched.
    pub fn rewrite(
        &self,
        select: &mut Select,
        applications: &[RuleApplication],
        session: &SessionContext,
        params: &mut Params,
    ) -> RewriteResult<Vec<RewriteEvent>> {
        compute_solutions(select, self.schema)?;
        let mut ctx = RewriteContext::new(select);
        self.rewrite_branch(select, applications, &mut ctx, session, params)?;
        Ok(ctx.events)
    }

    fn rewrite_branch(
        &self,
        select: &mut Select,
        applications: &[RuleApplication],
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
    ) -> RewriteResult<()> {
        let entry_vars = select.variables();
        let entry_restriction = select.restriction.clone();
        let entry_solutions = select.solutions.clone();
        // Applications targeting a subquery alias rewrite the subquery's
        // branches in place, so the rollback must cover those too.
        let entry_subqueries = select.subqueries.clone();
        let result =
            self.rewrite_branch_inner(select, applications, ctx, session, params, &entry_vars);
        if result.is_err() {
            select.restriction = entry_restriction;
            select.solutions = entry_solutions;
            select.subqueries = entry_subqueries;
        }
        result
    }

    fn rewrite_branch_inner(
        &self,
        select: &mut Select,
        applications: &[RuleApplication],
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
        entry_vars: &BTreeSet<String>,
    ) -> RewriteResult<()> {
        let entry_restriction = select.restriction.clone();
        let entry_solutions = select.solutions.clone();
        let mut insertions = Vec::new();
        for application in applications {
            self.apply_application(select, application, ctx, session, params, &mut insertions)?;
        }
        self.resolve_ambiguity(select, &entry_restriction, &mut insertions, ctx)?;
        validate_solutions(select, entry_vars, &entry_solutions)?;
        self.add_types_restriction(select);
        Ok(())
    }

    fn apply_application(
        &self,
        select: &mut Select,
        application: &RuleApplication,
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
        insertions: &mut Vec<Expr>,
    ) -> RewriteResult<()> {
        if application.varmap.is_empty() || application.rules.is_empty() {
            return Ok(());
        }
        if application.varmap.len() == 1 {
            let (qvar, sym) = &application.varmap[0];
            match select.variable_origin(qvar) {
                Some(VariableOrigin::SubqueryAlias { subquery, column }) => {
                    return self.rewrite_through_alias(
                        select,
                        subquery,
                        column,
                        *sym,
                        &application.rules,
                        ctx,
                        session,
                        params,
                    );
                }
                _ => {
                    if select.variable_is_optional(qvar) {
                        return self.guard_optional(
                            select,
                            qvar,
                            &application.rules,
                            ctx,
                            session,
                            params,
                            insertions,
                        );
                    }
                }
            }
        }
        self.splice_rules(select, application, ctx, session, params, insertions)
    }

    /// Core splice loop: try each rule in turn, keep the satisfiable ones
    /// OR-joined under one EXISTS, fail with `Unauthorized` when none
    /// survives.
    fn splice_rules(
        &self,
        select: &mut Select,
        application: &RuleApplication,
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
        insertions: &mut Vec<Expr>,
    ) -> RewriteResult<()> {
        let variable = application
            .varmap
            .iter()
            .map(|(v, _)| v.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut candidates = Vec::with_capacity(application.rules.len());
        for rule in &application.rules {
            let translation =
                self.translate_snippet(select, rule, &application.varmap, ctx, session, params);
            candidates.push((Arc::clone(rule), translation));
        }

        // A prior pass may already have spliced these rules; recognizing
        // the combined condition keeps rewriting idempotent. Rules with
        // pending permission obligations are checked again after the
        // obligations are resolved, when the bodies have their final shape.
        let no_pending = candidates
            .iter()
            .all(|(_, t)| t.as_ref().map_or(true, |t| t.pending.is_empty()));
        let all_bodies: Vec<Expr> = candidates
            .iter()
            .filter_map(|(_, t)| t.as_ref().and_then(|t| t.body.clone()))
            .collect();
        if no_pending && !all_bodies.is_empty() {
            let hypothesis = Expr::exists(Expr::or(all_bodies));
            if let Some(restriction) = &select.restriction {
                if restriction.conjuncts().iter().any(|c| c.alpha_eq(&hypothesis)) {
                    ctx.events.push(RewriteEvent::AlreadyGuarded { variable });
                    return Ok(());
                }
            }
        }

        let base_restriction = select.restriction.clone();
        let base_solutions = select.solutions.clone();
        let mut accepted: Vec<Expr> = Vec::new();
        let mut applied: Vec<RewriteEvent> = Vec::new();
        let mut good: Option<(Option<Expr>, Vec<Solution>)> = None;

        for (rule, translation) in candidates {
            let Some(translation) = translation else {
                ctx.events.push(RewriteEvent::RuleSkipped {
                    variable: variable.clone(),
                    expression: rule.expression().to_string(),
                });
                continue;
            };

            // Pending-only snippet: probe with a tautological pin per
            // mapped variable until obligations produce the real condition.
            let probe = translation.body.clone().unwrap_or_else(|| {
                Expr::and(
                    application
                        .varmap
                        .iter()
                        .map(|(v, _)| Expr::TypeIs {
                            var: v.clone(),
                            types: select.solution_types(v),
                        })
                        .collect(),
                )
            });
            let mut trial = accepted.clone();
            trial.push(probe);
            select.restriction = conj(&base_restriction, &[Expr::exists(Expr::or(trial))]);
            compute_solutions(select, self.schema)?;
            if select.solutions.is_empty() {
                restore(select, &good, &base_restriction, &base_solutions);
                ctx.events.push(RewriteEvent::RuleSkipped {
                    variable: variable.clone(),
                    expression: rule.expression().to_string(),
                });
                continue;
            }

            let mut body = translation.body.clone();
            let mut refused = false;
            for (pvar, paction) in &translation.pending {
                match self.resolve_pending(select, pvar, *paction, ctx, session, params)? {
                    PendingOutcome::Clear => {}
                    PendingOutcome::Guard(extra) => {
                        body = Some(match body {
                            Some(b) => Expr::and(vec![b, extra]),
                            None => extra,
                        });
                    }
                    PendingOutcome::Refused => {
                        refused = true;
                        break;
                    }
                }
            }
            if refused {
                restore(select, &good, &base_restriction, &base_solutions);
                ctx.events.push(RewriteEvent::RuleSkipped {
                    variable: variable.clone(),
                    expression: rule.expression().to_string(),
                });
                continue;
            }

            let Some(body) = body else {
                // The rule holds unconditionally: the whole application is
                // satisfied without splicing anything.
                select.restriction = base_restriction;
                select.solutions = base_solutions;
                ctx.events.push(RewriteEvent::RuleApplied {
                    variable,
                    expression: rule.expression().to_string(),
                });
                return Ok(());
            };

            let mut final_bodies = accepted.clone();
            final_bodies.push(body);
            select.restriction = conj(
                &base_restriction,
                &[Expr::exists(Expr::or(final_bodies.clone()))],
            );
            compute_solutions(select, self.schema)?;
            if select.solutions.is_empty() {
                restore(select, &good, &base_restriction, &base_solutions);
                ctx.events.push(RewriteEvent::RuleSkipped {
                    variable: variable.clone(),
                    expression: rule.expression().to_string(),
                });
                continue;
            }
            accepted = final_bodies;
            good = Some((select.restriction.clone(), select.solutions.clone()));
            applied.push(RewriteEvent::RuleApplied {
                variable: variable.clone(),
                expression: rule.expression().to_string(),
            });
        }

        if accepted.is_empty() {
            select.restriction = base_restriction;
            select.solutions = base_solutions;
            let entity_types = application
                .varmap
                .first()
                .map(|(v, _)| select.solution_types(v))
                .unwrap_or_default()
                .into_iter()
                .filter(|t| !Schema::is_value_type(t))
                .collect();
            ctx.events.push(RewriteEvent::AccessDenied {
                variable,
                entity_types,
            });
            return Err(RewriteError::Unauthorized);
        }
        // Pending obligations resolve into the bodies themselves, so the
        // final combined condition may match a conjunct spliced by an
        // earlier pass even though the raw translations did not.
        let hypothesis = Expr::exists(Expr::or(accepted.clone()));
        if let Some(base) = &base_restriction {
            if base.conjuncts().iter().any(|c| c.alpha_eq(&hypothesis)) {
                select.restriction = base_restriction;
                select.solutions = base_solutions;
                ctx.events.push(RewriteEvent::AlreadyGuarded { variable });
                return Ok(());
            }
        }
        ctx.events.append(&mut applied);
        if let Some((restriction, solutions)) = good {
            select.restriction = restriction;
            select.solutions = solutions;
        }
        insertions.push(hypothesis);
        Ok(())
    }

    /// Guards a variable attached through an outer-joined relation: a
    /// plain EXISTS would drop rows with no relation at all, so the rule
    /// goes into a correlated subquery OR-joined with an IS NULL test.
    #[allow(clippy::too_many_arguments)]
    fn guard_optional(
        &self,
        select: &mut Select,
        qvar: &str,
        rules: &[Arc<PermissionRule>],
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
        insertions: &mut Vec<Expr>,
    ) -> RewriteResult<()> {
        let types: Vec<String> = select
            .solution_types(qvar)
            .into_iter()
            .filter(|t| !Schema::is_value_type(t))
            .collect();
        let projected = ctx.fresh("W");
        let mut sub = Select::new().select_var(&projected);
        let varmap = vec![(projected.clone(), SnippetVar::X)];

        let mut bodies = Vec::new();
        let mut pending = Vec::new();
        for rule in rules {
            match self.translate_snippet(&sub, rule, &varmap, ctx, session, params) {
                Some(translation) => {
                    if let Some(body) = translation.body {
                        bodies.push(body);
                    }
                    pending.extend(translation.pending);
                }
                None => ctx.events.push(RewriteEvent::RuleSkipped {
                    variable: qvar.to_string(),
                    expression: rule.expression().to_string(),
                }),
            }
        }
        if bodies.is_empty() {
            ctx.events.push(RewriteEvent::AccessDenied {
                variable: qvar.to_string(),
                entity_types: types,
            });
            return Err(RewriteError::Unauthorized);
        }

        let mut conjuncts = Vec::new();
        if !types.is_empty() {
            conjuncts.push(Expr::TypeIs {
                var: projected.clone(),
                types,
            });
        }
        conjuncts.push(Expr::or(bodies));
        sub.restriction = Some(Expr::and(conjuncts));
        compute_solutions(&mut sub, self.schema)?;
        for (pvar, paction) in &pending {
            match self.resolve_pending(&sub, pvar, *paction, ctx, session, params)? {
                PendingOutcome::Clear => {}
                PendingOutcome::Guard(extra) => {
                    sub.add_restriction(extra);
                    compute_solutions(&mut sub, self.schema)?;
                }
                PendingOutcome::Refused => {
                    ctx.events.push(RewriteEvent::AccessDenied {
                        variable: qvar.to_string(),
                        entity_types: Vec::new(),
                    });
                    return Err(RewriteError::Unauthorized);
                }
            }
        }

        let candidate = Expr::or(vec![
            Expr::IsNull {
                var: qvar.to_string(),
            },
            Expr::SubqueryIn {
                var: qvar.to_string(),
                query: Box::new(sub),
            },
        ]);
        let saved_restriction = select.restriction.clone();
        let saved_solutions = select.solutions.clone();
        select.add_restriction(candidate.clone());
        compute_solutions(select, self.schema)?;
        if select.solutions.is_empty() {
            select.restriction = saved_restriction;
            select.solutions = saved_solutions;
            ctx.events.push(RewriteEvent::AccessDenied {
                variable: qvar.to_string(),
                entity_types: Vec::new(),
            });
            return Err(RewriteError::Unauthorized);
        }
        insertions.push(candidate);
        ctx.events.push(RewriteEvent::SubqueryExtracted {
            variable: qvar.to_string(),
        });
        Ok(())
    }

    /// A rule targeting a subquery alias is spliced inside the subquery's
    /// own branches, against the variable each branch projects into the
    /// aliased column. Branches no rule can satisfy are dropped.
    #[allow(clippy::too_many_arguments)]
    fn rewrite_through_alias(
        &self,
        select: &mut Select,
        subquery: usize,
        column: usize,
        sym: SnippetVar,
        rules: &[Arc<PermissionRule>],
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
    ) -> RewriteResult<()> {
        let alias = select.subqueries[subquery].aliases[column].clone();
        let branches = std::mem::take(&mut select.subqueries[subquery].query.branches);
        let mut kept = Vec::new();
        for mut branch in branches {
            let Some(column_var) = branch
                .selection
                .get(column)
                .and_then(Term::as_variable)
                .map(str::to_string)
            else {
                return Err(RewriteError::BadSchemaDefinition {
                    rtype: alias,
                    detail: "guarded subquery column is not a plain variable".to_string(),
                });
            };
            let applications = [RuleApplication {
                varmap: vec![(column_var, sym)],
                rules: rules.to_vec(),
            }];
            let mut branch_ctx = RewriteContext::new(&branch);
            match self.rewrite_branch(&mut branch, &applications, &mut branch_ctx, session, params)
            {
                Ok(()) => {
                    ctx.events.append(&mut branch_ctx.events);
                    kept.push(branch);
                }
                Err(RewriteError::Unauthorized) => {
                    ctx.events.append(&mut branch_ctx.events);
                }
                Err(err) => return Err(err),
            }
        }
        if kept.is_empty() {
            return Err(RewriteError::Unauthorized);
        }
        select.subqueries[subquery].query.branches = kept;
        compute_solutions(select, self.schema)?;
        Ok(())
    }

    /// Translates a rule snippet into the query's variable space.
    ///
    /// Returns `None` when the snippet cannot apply at all (it needs the
    /// current user and the session is anonymous, or it contains nothing
    /// usable).
    fn translate_snippet(
        &self,
        select: &Select,
        rule: &PermissionRule,
        varmap: &[(String, SnippetVar)],
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
    ) -> Option<Translation> {
        let reusable = reusable_edges(select, self.schema);
        let varmap_key = varmap
            .iter()
            .map(|(v, s)| format!("{}={}", s.as_str(), v))
            .collect::<Vec<_>>()
            .join(",");
        let mut state = TranslateState {
            rule_key: rule.expression().to_string(),
            varmap_key,
            bindings: varmap
                .iter()
                .map(|(v, s)| (s.as_str().to_string(), v.clone()))
                .collect(),
            pending: Vec::new(),
            user_relation: None,
            missing_user: false,
        };
        let body = walk_snippet(rule.snippet(), &reusable, &mut state, ctx, session, params);
        if state.missing_user {
            return None;
        }
        let body = match (body, state.user_relation) {
            (Some(b), Some(user_rel)) => Some(Expr::and(vec![b, user_rel])),
            (Some(b), None) => Some(b),
            (None, Some(user_rel)) => Some(user_rel),
            (None, None) => None,
        };
        if body.is_none() && state.pending.is_empty() {
            return None;
        }
        Some(Translation {
            body,
            pending: state.pending,
        })
    }

    /// Resolves a `has_<action>_permission` obligation for a variable
    /// whose possible types are now known, recursively translating each
    /// type's own rules.
    fn resolve_pending(
        &self,
        select: &Select,
        var: &str,
        action: Action,
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
    ) -> RewriteResult<PendingOutcome> {
        let rtype = format!("has_{}_permission", action.as_str());
        let types: Vec<String> = select
            .solution_types(var)
            .into_iter()
            .filter(|t| !Schema::is_value_type(t))
            .collect();
        if types.is_empty() {
            return Err(RewriteError::BadSchemaDefinition {
                rtype,
                detail: format!("variable {} has no resolvable entity type", var),
            });
        }

        let mut allow_types: Vec<String> = Vec::new();
        let mut branches: Vec<Expr> = Vec::new();
        let mut any_guarded = false;
        let mut any_denied = false;
        for etype in &types {
            match self.schema.policy(etype, action) {
                crate::schema::ActionPolicy::Allow => allow_types.push(etype.clone()),
                crate::schema::ActionPolicy::Deny => any_denied = true,
                crate::schema::ActionPolicy::Guarded(rules) => {
                    any_guarded = true;
                    if !ctx.begin_resolving(etype, action) {
                        return Err(RewriteError::BadSchemaDefinition {
                            rtype,
                            detail: format!("recursive permission rules on {}", etype),
                        });
                    }
                    let rules = rules.clone();
                    let outcome =
                        self.pending_bodies(select, var, &rules, ctx, session, params);
                    ctx.end_resolving(etype, action);
                    match outcome? {
                        PendingBodies::Unconditional => allow_types.push(etype.clone()),
                        PendingBodies::None => any_denied = true,
                        PendingBodies::Some(bodies) => branches.push(Expr::and(vec![
                            Expr::is_type(var, etype.clone()),
                            Expr::exists(Expr::or(bodies)),
                        ])),
                    }
                }
            }
        }

        if !any_guarded && !any_denied {
            return Ok(PendingOutcome::Clear);
        }
        let mut alternatives = Vec::new();
        if !allow_types.is_empty() {
            alternatives.push(Expr::TypeIs {
                var: var.to_string(),
                types: allow_types,
            });
        }
        alternatives.extend(branches);
        if alternatives.is_empty() {
            return Ok(PendingOutcome::Refused);
        }
        Ok(PendingOutcome::Guard(Expr::or(alternatives)))
    }

    fn pending_bodies(
        &self,
        select: &Select,
        var: &str,
        rules: &[Arc<PermissionRule>],
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
    ) -> RewriteResult<PendingBodies> {
        let varmap = vec![(var.to_string(), SnippetVar::X)];
        let mut bodies = Vec::new();
        for rule in rules {
            let Some(translation) =
                self.translate_snippet(select, rule, &varmap, ctx, session, params)
            else {
                continue;
            };
            let mut body = translation.body;
            let mut usable = true;
            for (nested_var, nested_action) in &translation.pending {
                match self.resolve_pending(select, nested_var, *nested_action, ctx, session, params)?
                {
                    PendingOutcome::Clear => {}
                    PendingOutcome::Guard(extra) => {
                        body = Some(match body {
                            Some(b) => Expr::and(vec![b, extra]),
                            None => extra,
                        });
                    }
                    PendingOutcome::Refused => {
                        usable = false;
                        break;
                    }
                }
            }
            if !usable {
                continue;
            }
            match body {
                Some(b) => bodies.push(b),
                // A rule with no condition left grants the type outright.
                None => return Ok(PendingBodies::Unconditional),
            }
        }
        if bodies.is_empty() {
            Ok(PendingBodies::None)
        } else {
            Ok(PendingBodies::Some(bodies))
        }
    }

    /// If splicing introduced variables whose type is not pinned down (the
    /// recomputed solutions outnumber the snapshot's coverage), split the
    /// affected EXISTS into one branch per distinct type combination,
    /// each pinned with explicit `is <Type>` restrictions.
    fn resolve_ambiguity(
        &self,
        select: &mut Select,
        entry_restriction: &Option<Expr>,
        insertions: &mut [Expr],
        ctx: &mut RewriteContext,
    ) -> RewriteResult<()> {
        let mut new_vars: BTreeSet<String> = BTreeSet::new();
        for insertion in insertions.iter() {
            let mut vars = Vec::new();
            insertion.collect_variables(&mut vars);
            new_vars.extend(vars.into_iter().filter(|v| ctx.allocated().contains(v)));
        }
        let varying: Vec<String> = new_vars
            .iter()
            .filter(|v| select.solution_types(v).len() > 1)
            .cloned()
            .collect();
        if varying.is_empty() {
            return Ok(());
        }

        let mut changed = false;
        for insertion in insertions.iter_mut() {
            let Expr::Exists(inner) = &*insertion else {
                continue;
            };
            let mut vars = Vec::new();
            insertion.collect_variables(&mut vars);
            let local: Vec<String> = new_vars
                .iter()
                .filter(|v| vars.contains(v))
                .cloned()
                .collect();
            if !local.iter().any(|v| varying.contains(v)) {
                continue;
            }
            // Distinct type combinations the solutions assign to this
            // insertion's new variables.
            let mut variantes: Vec<BTreeMap<String, String>> = Vec::new();
            for solution in &select.solutions {
                let variante: BTreeMap<String, String> = local
                    .iter()
                    .filter_map(|v| solution.get(v).map(|t| (v.clone(), t.clone())))
                    .collect();
                if !variante.is_empty() && !variantes.contains(&variante) {
                    variantes.push(variante);
                }
            }
            if variantes.len() < 2 {
                continue;
            }
            let inner = (**inner).clone();
            let branches: Vec<Expr> = variantes
                .iter()
                .map(|variante| {
                    let mut conjuncts = vec![inner.clone()];
                    for (v, t) in variante {
                        conjuncts.push(Expr::is_type(v.clone(), t.clone()));
                    }
                    Expr::exists(Expr::and(conjuncts))
                })
                .collect();
            *insertion = Expr::or(branches);
            changed = true;
        }
        if changed {
            select.restriction = conj(entry_restriction, insertions);
            compute_solutions(select, self.schema)?;
            ctx.events.push(RewriteEvent::AmbiguitySplit { variables: varying });
        }
        Ok(())
    }

    /// Pins every top-scope variable's possible types to exactly its
    /// solutions, replacing an existing top-level type restriction when
    /// one is present.
    fn add_types_restriction(&self, select: &mut Select) {
        let mut desired: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for var in select.scope_variables() {
            if select.variable_origin(&var) != Some(VariableOrigin::Local) {
                continue;
            }
            let types: Vec<String> = select
                .solution_types(&var)
                .into_iter()
                .filter(|t| !Schema::is_value_type(t))
                .collect();
            if !types.is_empty() {
                desired.insert(var, types);
            }
        }
        if desired.is_empty() {
            return;
        }
        if let Some(restriction) = &mut select.restriction {
            let conjuncts: &mut [Expr] = match restriction {
                Expr::And(terms) => terms,
                single => std::slice::from_mut(single),
            };
            for conjunct in conjuncts {
                if let Expr::TypeIs { var, types } = conjunct {
                    if let Some(wanted) = desired.remove(var.as_str()) {
                        *types = wanted;
                    }
                }
            }
        }
        // Variables already pinned by a relation to a single type need no
        // extra restriction; only genuinely ambiguous ones get one.
        for (var, types) in desired {
            if types.len() > 1 {
                select.add_restriction(Expr::TypeIs { var, types });
            }
        }
    }
}

enum PendingBodies {
    Unconditional,
    Some(Vec<Expr>),
    None,
}

struct TranslateState {
    rule_key: String,
    varmap_key: String,
    bindings: BTreeMap<String, String>,
    pending: Vec<(String, Action)>,
    user_relation: Option<Expr>,
    missing_user: bool,
}

impl TranslateState {
    fn resolve(
        &mut self,
        name: &str,
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
    ) -> String {
        if let Some(mapped) = self.bindings.get(name) {
            return mapped.clone();
        }
        if SnippetVar::from_name(name) == Some(SnippetVar::U) {
            return match ctx.bind_user(session, params) {
                Some((var, param)) => {
                    self.bindings.insert("U".to_string(), var.clone());
                    self.user_relation =
                        Some(Expr::relation(var.clone(), "eid", Term::param(param)));
                    var
                }
                None => {
                    self.missing_user = true;
                    "U".to_string()
                }
            };
        }
        let fresh = ctx.snippet_var(&self.rule_key, &self.varmap_key, name);
        self.bindings.insert(name.to_string(), fresh.clone());
        fresh
    }

    fn map_term(
        &mut self,
        term: &Term,
        ctx: &mut RewriteContext,
        session: &SessionContext,
        params: &mut Params,
    ) -> Term {
        match term {
            Term::Variable(name) => Term::Variable(self.resolve(name, ctx, session, params)),
            Term::Function { name, args } => Term::Function {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|a| self.map_term(a, ctx, session, params))
                    .collect(),
            },
            other => other.clone(),
        }
    }
}

fn walk_snippet(
    expr: &Expr,
    reusable: &[(String, String, String)],
    state: &mut TranslateState,
    ctx: &mut RewriteContext,
    session: &SessionContext,
    params: &mut Params,
) -> Option<Expr> {
    match expr {
        Expr::And(terms) => {
            let mapped: Vec<Expr> = terms
                .iter()
                .filter_map(|t| walk_snippet(t, reusable, state, ctx, session, params))
                .collect();
            if mapped.is_empty() {
                None
            } else {
                Some(Expr::and(mapped))
            }
        }
        Expr::Or(terms) => {
            let mapped: Vec<Expr> = terms
                .iter()
                .filter_map(|t| walk_snippet(t, reusable, state, ctx, session, params))
                .collect();
            if mapped.is_empty() {
                None
            } else {
                Some(Expr::or(mapped))
            }
        }
        Expr::Not(inner) => walk_snippet(inner, reusable, state, ctx, session, params)
            .map(|e| Expr::Not(Box::new(e))),
        Expr::Exists(inner) => {
            walk_snippet(inner, reusable, state, ctx, session, params).map(Expr::exists)
        }
        Expr::Relation {
            subject,
            rtype,
            object,
            operator,
            optional,
        } => {
            if let Some(action) = Action::from_permission_rtype(rtype) {
                // Resolved later, once the variable's types are known.
                if let Some(object_var) = object.as_variable() {
                    let mapped = state.resolve(object_var, ctx, session, params);
                    state.pending.push((mapped, action));
                }
                return None;
            }
            let mapped_subject = state.resolve(subject, ctx, session, params);
            // Reuse the host's relation node over a single-valued edge
            // instead of duplicating the join.
            if let Term::Variable(object_var) = object {
                if !state.bindings.contains_key(object_var)
                    && *operator == crate::ast::CmpOp::Eq
                    && !optional.is_optional()
                {
                    if let Some((_, _, existing)) = reusable
                        .iter()
                        .find(|(s, r, _)| *s == mapped_subject && r == rtype)
                    {
                        state
                            .bindings
                            .insert(object_var.clone(), existing.clone());
                        return None;
                    }
                }
            }
            Some(Expr::Relation {
                subject: mapped_subject,
                rtype: rtype.clone(),
                object: state.map_term(object, ctx, session, params),
                operator: *operator,
                optional: *optional,
            })
        }
        Expr::Comparison {
            left,
            operator,
            right,
        } => Some(Expr::Comparison {
            left: state.map_term(left, ctx, session, params),
            operator: *operator,
            right: state.map_term(right, ctx, session, params),
        }),
        Expr::TypeIs { var, types } => Some(Expr::TypeIs {
            var: state.resolve(var, ctx, session, params),
            types: types.clone(),
        }),
        Expr::IsNull { var } => Some(Expr::IsNull {
            var: state.resolve(var, ctx, session, params),
        }),
        Expr::SubqueryIn { var, query } => Some(Expr::SubqueryIn {
            var: state.resolve(var, ctx, session, params),
            query: query.clone(),
        }),
    }
}

/// Host relations a snippet may bind to instead of duplicating: in the
/// conjunctive scope, equality-joined, not outer-joined, and with a
/// single-valued object side.
fn reusable_edges(select: &Select, schema: &Schema) -> Vec<(String, String, String)> {
    let mut edges = Vec::new();
    for relation in select.scope_relations() {
        if let Expr::Relation {
            subject,
            rtype,
            object: Term::Variable(object),
            operator: crate::ast::CmpOp::Eq,
            optional: crate::ast::Optional::Neither,
        } = relation
        {
            if schema
                .relation(rtype)
                .is_some_and(|r| r.single_valued_object())
            {
                edges.push((subject.clone(), rtype.clone(), object.clone()));
            }
        }
    }
    edges
}

/// Distinct entity types a branch's solutions mention, for denial events.
fn branch_entity_types(select: &Select) -> Vec<String> {
    let mut types = Vec::new();
    for solution in &select.solutions {
        for t in solution.values() {
            if !Schema::is_value_type(t) && !types.iter().any(|x| x == t) {
                types.push(t.clone());
            }
        }
    }
    types
}

fn to_applications(checks: &[LocalCheck]) -> Vec<RuleApplication> {
    checks
        .iter()
        .map(|check| RuleApplication::entity(check.variable.clone(), check.rules.clone()))
        .collect()
}

/// Variables that can distinguish one bucket's solutions from another's:
/// those the original solutions assign more than one type. Restricted to
/// the top scope, where a pin may legally reference them.
fn pin_variables(select: &Select) -> BTreeSet<String> {
    select
        .scope_variables()
        .into_iter()
        .filter(|var| select.solution_types(var).len() > 1)
        .collect()
}

/// Type-combination pin restricting a branch to exactly one bucket's
/// solutions.
fn bucket_guard(bucket: &Bucket, pin_vars: &BTreeSet<String>) -> Option<Expr> {
    if pin_vars.is_empty() {
        return None;
    }
    let mut combos: Vec<Vec<(String, String)>> = Vec::new();
    for solution in &bucket.solutions {
        let combo: Vec<(String, String)> = pin_vars
            .iter()
            .filter_map(|v| solution.get(v).map(|t| (v.clone(), t.clone())))
            .collect();
        if !combo.is_empty() && !combos.contains(&combo) {
            combos.push(combo);
        }
    }
    if combos.is_empty() {
        return None;
    }
    let branches: Vec<Expr> = combos
        .into_iter()
        .map(|combo| {
            Expr::and(
                combo
                    .into_iter()
                    .map(|(v, t)| Expr::is_type(v, t))
                    .collect(),
            )
        })
        .collect();
    Some(Expr::or(branches))
}

fn bucket_covers_all(bucket: &Bucket, select: &Select) -> bool {
    bucket.solutions.len() == select.solutions.len()
}

/// Raw variables an aggregating select needs projected by its factored
/// subquery: everything its selection, grouping, ordering and having
/// reference, in first-use order.
fn raw_variables(select: &Select) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push_all = |vars: Vec<String>, out: &mut Vec<String>| {
        for var in vars {
            if !out.contains(&var) {
                out.push(var);
            }
        }
    };
    let mut vars = Vec::new();
    for term in &select.selection {
        term.collect_variables(&mut vars);
    }
    push_all(std::mem::take(&mut vars), &mut out);
    push_all(select.groupby.clone(), &mut out);
    for sort in &select.orderby {
        sort.term.collect_variables(&mut vars);
    }
    push_all(std::mem::take(&mut vars), &mut out);
    if let Some(having) = &select.having {
        having.collect_variables(&mut vars);
        push_all(std::mem::take(&mut vars), &mut out);
    }
    out
}

fn conj(base: &Option<Expr>, extras: &[Expr]) -> Option<Expr> {
    let mut terms = Vec::with_capacity(extras.len() + 1);
    if let Some(base) = base {
        terms.push(base.clone());
    }
    terms.extend(extras.iter().cloned());
    if terms.is_empty() {
        None
    } else {
        Some(Expr::and(terms))
    }
}

fn restore(
    select: &mut Select,
    good: &Option<(Option<Expr>, Vec<Solution>)>,
    base_restriction: &Option<Expr>,
    base_solutions: &[Solution],
) {
    match good {
        Some((restriction, solutions)) => {
            select.restriction = restriction.clone();
            select.solutions = solutions.clone();
        }
        None => {
            select.restriction = base_restriction.clone();
            select.solutions = base_solutions.to_vec();
        }
    }
}

/// Checks that the typed solutions of the original variables survived the
/// rewrite exactly: below means a supposedly safe splice dropped typings,
/// above means ambiguity resolution failed.
fn validate_solutions(
    select: &Select,
    entry_vars: &BTreeSet<String>,
    entry_solutions: &[Solution],
) -> RewriteResult<()> {
    let project = |solutions: &[Solution]| -> BTreeSet<Solution> {
        solutions
            .iter()
            .map(|solution| {
                solution
                    .iter()
                    .filter(|(var, _)| entry_vars.contains(*var))
                    .map(|(var, t)| (var.clone(), t.clone()))
                    .collect()
            })
            .collect()
    };
    let original = project(entry_solutions);
    let remaining = project(&select.solutions);
    if original != remaining {
        return Err(RewriteError::InvariantViolation(format!(
            "typed solutions diverged after rewrite ({} original combinations, {} remaining)",
            original.len(),
            remaining.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;
    use uuid::Uuid;

    fn blog_schema() -> Schema {
        let mut schema = Schema::new("blog");
        schema.add_entity("BlogEntry").unwrap();
        schema.add_entity("State").unwrap();
        schema.add_entity("CWUser").unwrap();
        schema
            .add_relation("in_state", "BlogEntry", "State", "?*")
            .unwrap();
        schema.add_attribute("name", "State", "String").unwrap();
        schema.add_attribute("title", "BlogEntry", "String").unwrap();
        schema
            .add_relation("owned_by", "BlogEntry", "CWUser", "**")
            .unwrap();
        schema
    }

    fn parsed(text: &str) -> Union {
        parse_query(text).unwrap()
    }

    #[test]
    fn test_published_scenario() {
        let mut schema = blog_schema();
        schema
            .guard(
                "BlogEntry",
                Action::Read,
                &["X in_state S, S name \"published\""],
            )
            .unwrap();
        let mut union = parsed("Any X WHERE X is BlogEntry");
        let mut params = Params::new();
        let rewriter = QueryRewriter::new(&schema);
        rewriter
            .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
            .unwrap();
        assert_eq!(
            union.to_string(),
            "Any X WHERE X is BlogEntry, EXISTS(X in_state S, S name \"published\")"
        );
    }

    #[test]
    fn test_owner_rule_binds_user_param() {
        let mut schema = blog_schema();
        schema
            .guard("BlogEntry", Action::Read, &["X owned_by U"])
            .unwrap();
        let mut union = parsed("Any X WHERE X is BlogEntry");
        let mut params = Params::new();
        let user = Uuid::new_v4();
        let rewriter = QueryRewriter::new(&schema);
        rewriter
            .enforce(
                &mut union,
                Action::Read,
                &SessionContext::authenticated(user),
                &mut params,
            )
            .unwrap();
        assert_eq!(
            union.to_string(),
            "Any X WHERE X is BlogEntry, EXISTS(X owned_by U, U eid %(u)s)"
        );
        assert_eq!(
            params.get("u"),
            Some(&serde_json::Value::String(user.to_string()))
        );
    }

    #[test]
    fn test_anonymous_cannot_satisfy_user_rule() {
        let mut schema = blog_schema();
        schema
            .guard("BlogEntry", Action::Read, &["X owned_by U"])
            .unwrap();
        let mut union = parsed("Any X WHERE X is BlogEntry");
        let before = union.to_string();
        let mut params = Params::new();
        let rewriter = QueryRewriter::new(&schema);
        let err = rewriter
            .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
            .unwrap_err();
        assert!(matches!(err, RewriteError::Unauthorized));
        // Rollback-safe: the query is untouched.
        assert_eq!(union.to_string(), before);
        assert!(params.is_empty());
    }

    #[test]
    fn test_service_role_bypasses() {
        let mut schema = blog_schema();
        schema
            .guard("BlogEntry", Action::Read, &["X owned_by U"])
            .unwrap();
        let mut union = parsed("Any X WHERE X is BlogEntry");
        let before = union.to_string();
        let mut params = Params::new();
        let rewriter = QueryRewriter::new(&schema);
        let events = rewriter
            .enforce(
                &mut union,
                Action::Read,
                &SessionContext::service_role(),
                &mut params,
            )
            .unwrap();
        assert_eq!(events, vec![RewriteEvent::Bypassed]);
        assert_eq!(union.to_string(), before);
    }

    #[test]
    fn test_disjunctive_rules_or_joined() {
        let mut schema = blog_schema();
        schema
            .guard(
                "BlogEntry",
                Action::Read,
                &["X in_state S, S name \"published\"", "X owned_by U"],
            )
            .unwrap();
        let mut union = parsed("Any X WHERE X is BlogEntry");
        let mut params = Params::new();
        let rewriter = QueryRewriter::new(&schema);
        rewriter
            .enforce(
                &mut union,
                Action::Read,
                &SessionContext::authenticated(Uuid::new_v4()),
                &mut params,
            )
            .unwrap();
        assert_eq!(
            union.to_string(),
            "Any X WHERE X is BlogEntry, EXISTS((X in_state S, S name \"published\") \
             OR (X owned_by U, U eid %(u)s))"
        );
    }

    #[test]
    fn test_unsatisfiable_rule_backtracked() {
        let mut schema = blog_schema();
        // The first rule references a relation State never has; splicing
        // it empties the solutions, so the second rule wins.
        schema
            .guard(
                "State",
                Action::Read,
                &["X in_state S", "X name \"published\""],
            )
            .unwrap();
        let mut union = parsed("Any X WHERE X is State");
        let mut params = Params::new();
        let rewriter = QueryRewriter::new(&schema);
        let events = rewriter
            .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
            .unwrap();
        assert_eq!(
            union.to_string(),
            "Any X WHERE X is State, EXISTS(X name \"published\")"
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, RewriteEvent::RuleSkipped { .. })));
    }

    #[test]
    fn test_relation_node_reused_on_single_valued_edge() {
        let mut schema = blog_schema();
        schema
            .guard(
                "BlogEntry",
                Action::Read,
                &["X in_state S, S name \"published\""],
            )
            .unwrap();
        // in_state has '?*' cardinality; the host already joins it, so the
        // snippet binds S to S2 instead of adding a second join.
        let mut union = parsed("Any X WHERE X in_state S2, S2 name N");
        let mut params = Params::new();
        let rewriter = QueryRewriter::new(&schema);
        rewriter
            .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
            .unwrap();
        assert_eq!(
            union.to_string(),
            "Any X WHERE X in_state S2, S2 name N, EXISTS(S2 name \"published\")"
        );
    }

    #[test]
    fn test_idempotent_on_second_pass() {
        let mut schema = blog_schema();
        schema
            .guard(
                "BlogEntry",
                Action::Read,
                &["X in_state S, S name \"published\""],
            )
            .unwrap();
        let mut union = parsed("Any X WHERE X is BlogEntry");
        let mut params = Params::new();
        let rewriter = QueryRewriter::new(&schema);
        rewriter
            .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
            .unwrap();
        let once = union.to_string();
        let events = rewriter
            .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
            .unwrap();
        assert_eq!(union.to_string(), once);
        assert!(events
            .iter()
            .any(|e| matches!(e, RewriteEvent::AlreadyGuarded { .. })));
    }

    #[test]
    fn test_tautology_rule_wraps_in_exists() {
        let mut schema = blog_schema();
        schema.guard("BlogEntry", Action::Read, &["X eid %(x)s"]).unwrap();
        let mut union = parsed("Any X WHERE X is BlogEntry");
        let mut params = Params::new();
        params.insert("x".to_string(), serde_json::json!(42));
        let rewriter = QueryRewriter::new(&schema);
        let events = rewriter
            .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
            .unwrap();
        assert_eq!(
            union.to_string(),
            "Any X WHERE X is BlogEntry, EXISTS(X eid %(x)s)"
        );
        assert!(!events
            .iter()
            .any(|e| matches!(e, RewriteEvent::AmbiguitySplit { .. })));
    }

    #[test]
    fn test_failed_application_restores_subqueries() {
        // An application targeting a subquery alias rewrites the subquery
        // branches in place; a later failing application must undo that.
        let mut schema = Schema::new("docs");
        schema.add_entity("Card").unwrap();
        schema.add_entity("Note").unwrap();
        schema.add_entity("Tag").unwrap();
        schema.add_entity("State").unwrap();
        schema.add_entity("CWUser").unwrap();
        schema.add_relation("owned_by", "Card", "CWUser", "**").unwrap();
        schema.add_relation("owned_by", "Note", "CWUser", "**").unwrap();
        schema.add_relation("in_state", "Tag", "State", "?*").unwrap();
        let owner = vec![Arc::new(
            PermissionRule::new("X owned_by U", schema.cache_mut()).unwrap(),
        )];
        let stateful = vec![Arc::new(
            PermissionRule::new("X in_state S", schema.cache_mut()).unwrap(),
        )];
        let mut union =
            parsed("Any A WITH A BEING ((Any X WHERE X is Card) UNION (Any X WHERE X is Note))");
        let mut select = union.branches.remove(0);
        let before = select.to_string();
        let applications = [
            RuleApplication::entity("A", owner),
            // Neither subquery branch can satisfy this one.
            RuleApplication::entity("A", stateful),
        ];
        let mut params = Params::new();
        let rewriter = QueryRewriter::new(&schema);
        let err = rewriter
            .rewrite(
                &mut select,
                &applications,
                &SessionContext::authenticated(Uuid::new_v4()),
                &mut params,
            )
            .unwrap_err();
        assert!(matches!(err, RewriteError::Unauthorized));
        assert_eq!(select.to_string(), before);
    }

    #[test]
    fn test_pending_only_rule_on_two_variable_mapping() {
        // A relation rule mapping both ends whose snippet is nothing but a
        // permission obligation: the trial pins each mapped variable to its
        // own types, and the obligation resolves through the object's rules.
        let mut schema = blog_schema();
        schema.add_entity("Tag").unwrap();
        schema.add_relation("tags", "Tag", "BlogEntry", "**").unwrap();
        schema
            .guard(
                "BlogEntry",
                Action::Read,
                &["X in_state S, S name \"published\""],
            )
            .unwrap();
        let through = vec![Arc::new(
            PermissionRule::new("U has_read_permission O", schema.cache_mut()).unwrap(),
        )];
        let mut union = parsed("Any T, X WHERE T tags X");
        let mut select = union.branches.remove(0);
        let applications = [RuleApplication {
            varmap: vec![
                ("T".to_string(), SnippetVar::S),
                ("X".to_string(), SnippetVar::O),
            ],
            rules: through,
        }];
        let mut params = Params::new();
        let rewriter = QueryRewriter::new(&schema);
        rewriter
            .rewrite(
                &mut select,
                &applications,
                &SessionContext::anonymous(),
                &mut params,
            )
            .unwrap();
        assert_eq!(
            select.to_string(),
            "Any T, X WHERE T tags X, \
             EXISTS(X is BlogEntry, EXISTS(X in_state S, S name \"published\"))"
        );
    }
}
