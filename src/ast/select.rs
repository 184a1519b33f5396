//! Select statements, unions and solutions.
//!
//! A [`Select`] owns its restriction tree plus the `solutions` computed by
//! the type solver: the ordered list of consistent variable→type
//! assignments. Rewriting mutates the tree in place and keeps `solutions`
//! in sync by re-running the solver.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::expr::{Expr, Optional, Term};

/// One consistent assignment of a concrete type to every statement variable.
pub type Solution = BTreeMap<String, String>;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One ORDERBY term.
#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub term: Term,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(term: Term) -> Self {
        Self {
            term,
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(term: Term) -> Self {
        Self {
            term,
            direction: SortDirection::Desc,
        }
    }
}

/// A `WITH <aliases> BEING (<union>)` clause: the aliases are visible as
/// variables of the enclosing select, one per selected column of the union.
#[derive(Debug, Clone, PartialEq)]
pub struct SubQuery {
    pub aliases: Vec<String>,
    pub query: Union,
}

/// Where a variable of a select is defined.
///
/// Returned from [`Select::variable_origin`] and matched explicitly; a
/// rewrite targeting an alias variable must recurse into the subquery's own
/// branches instead of splicing at the current level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableOrigin {
    /// Defined in this select's own scope.
    Local,
    /// Alias of column `column` of subquery `subquery`.
    SubqueryAlias { subquery: usize, column: usize },
}

/// A single select statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    pub distinct: bool,
    /// Projected terms, in order.
    pub selection: Vec<Term>,
    pub restriction: Option<Expr>,
    pub groupby: Vec<String>,
    pub having: Option<Expr>,
    pub orderby: Vec<SortSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub subqueries: Vec<SubQuery>,
    /// Ordered variable→type assignments, maintained by the type solver.
    pub solutions: Vec<Solution>,
}

impl Select {
    /// Creates an empty select.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a projected variable.
    pub fn select_var(mut self, name: impl Into<String>) -> Self {
        self.selection.push(Term::var(name));
        self
    }

    /// Adds a projected term.
    pub fn select_term(mut self, term: Term) -> Self {
        self.selection.push(term);
        self
    }

    /// Sets the restriction tree.
    pub fn with_restriction(mut self, expr: Expr) -> Self {
        self.restriction = Some(expr);
        self
    }

    /// Marks the select DISTINCT.
    pub fn with_distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Appends a GROUPBY variable.
    pub fn group_by(mut self, var: impl Into<String>) -> Self {
        self.groupby.push(var.into());
        self
    }

    /// Sets the limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// AND-joins an expression into the restriction.
    pub fn add_restriction(&mut self, expr: Expr) {
        self.restriction = Some(match self.restriction.take() {
            Some(existing) => Expr::and(vec![existing, expr]),
            None => expr,
        });
    }

    /// All variable names of this select's own scope: selection,
    /// restriction, grouping, sorting and subquery aliases. Variables
    /// internal to subqueries are not included.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = Vec::new();
        for term in &self.selection {
            term.collect_variables(&mut out);
        }
        if let Some(restriction) = &self.restriction {
            restriction.collect_variables(&mut out);
        }
        if let Some(having) = &self.having {
            having.collect_variables(&mut out);
        }
        for sort in &self.orderby {
            sort.term.collect_variables(&mut out);
        }
        out.extend(self.groupby.iter().cloned());
        for subquery in &self.subqueries {
            out.extend(subquery.aliases.iter().cloned());
        }
        out.into_iter().collect()
    }

    /// Every variable name used anywhere in the statement, subquery
    /// internals included. Fresh-variable allocation must avoid all of them.
    pub fn all_variable_names(&self) -> BTreeSet<String> {
        let mut names = self.variables();
        for subquery in &self.subqueries {
            for branch in &subquery.query.branches {
                names.extend(branch.all_variable_names());
            }
        }
        // SubqueryIn nodes carry their own nested selects.
        fn visit(expr: &Expr, names: &mut BTreeSet<String>) {
            match expr {
                Expr::And(terms) | Expr::Or(terms) => {
                    for term in terms {
                        visit(term, names);
                    }
                }
                Expr::Not(inner) | Expr::Exists(inner) => visit(inner, names),
                Expr::SubqueryIn { query, .. } => {
                    names.extend(query.all_variable_names());
                }
                _ => {}
            }
        }
        if let Some(restriction) = &self.restriction {
            visit(restriction, &mut names);
        }
        names
    }

    /// Resolves where a variable of this select is defined.
    ///
    /// Returns `None` for names not defined in this select at all.
    pub fn variable_origin(&self, name: &str) -> Option<VariableOrigin> {
        for (i, subquery) in self.subqueries.iter().enumerate() {
            if let Some(column) = subquery.aliases.iter().position(|a| a == name) {
                return Some(VariableOrigin::SubqueryAlias {
                    subquery: i,
                    column,
                });
            }
        }
        if self.variables().contains(name) {
            Some(VariableOrigin::Local)
        } else {
            None
        }
    }

    /// Relations of the top conjunctive scope: reachable from the
    /// restriction root through `And` only, never through `Or`, `Not` or
    /// `Exists`. These are the relations guaranteed to hold for every
    /// returned row with their variables visible at the top level, the
    /// only ones a rewrite may reuse instead of duplicating. A relation
    /// under `Exists` holds too, but its variables are local to that
    /// subscope and may not be referenced from outside it.
    pub fn scope_relations(&self) -> Vec<&Expr> {
        fn visit<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
            match expr {
                Expr::And(terms) => {
                    for term in terms {
                        visit(term, out);
                    }
                }
                Expr::Relation { .. } => out.push(expr),
                _ => {}
            }
        }
        let mut out = Vec::new();
        if let Some(restriction) = &self.restriction {
            visit(restriction, &mut out);
        }
        out
    }

    /// Variables visible at the select's top conjunctive scope: the
    /// selection, grouping and everything the restriction binds outside
    /// `Not` and `Exists` subscopes. `Or` does not open a scope.
    pub fn scope_variables(&self) -> BTreeSet<String> {
        fn visit(expr: &Expr, out: &mut BTreeSet<String>) {
            match expr {
                Expr::And(terms) | Expr::Or(terms) => {
                    for term in terms {
                        visit(term, out);
                    }
                }
                Expr::Not(_) | Expr::Exists(_) => {}
                Expr::Relation {
                    subject, object, ..
                } => {
                    out.insert(subject.clone());
                    let mut vars = Vec::new();
                    object.collect_variables(&mut vars);
                    out.extend(vars);
                }
                Expr::Comparison { left, right, .. } => {
                    let mut vars = Vec::new();
                    left.collect_variables(&mut vars);
                    right.collect_variables(&mut vars);
                    out.extend(vars);
                }
                Expr::TypeIs { var, .. } | Expr::IsNull { var } | Expr::SubqueryIn { var, .. } => {
                    out.insert(var.clone());
                }
            }
        }
        let mut out = BTreeSet::new();
        let mut vars = Vec::new();
        for term in &self.selection {
            term.collect_variables(&mut vars);
        }
        out.extend(std::mem::take(&mut vars));
        out.extend(self.groupby.iter().cloned());
        if let Some(restriction) = &self.restriction {
            visit(restriction, &mut out);
        }
        out
    }

    /// True if the variable is attached to the query through an outer-joined
    /// relation occurrence (it may legitimately be absent from a row).
    pub fn variable_is_optional(&self, name: &str) -> bool {
        fn visit(expr: &Expr, name: &str) -> bool {
            match expr {
                Expr::And(terms) | Expr::Or(terms) => terms.iter().any(|t| visit(t, name)),
                Expr::Not(inner) | Expr::Exists(inner) => visit(inner, name),
                Expr::Relation {
                    subject,
                    object,
                    optional,
                    ..
                } => match optional {
                    Optional::Subject => subject == name,
                    Optional::Object => object.as_variable() == Some(name),
                    Optional::Neither => false,
                },
                _ => false,
            }
        }
        self.restriction
            .as_ref()
            .is_some_and(|r| visit(r, name))
    }

    /// True if naive union branching would corrupt this select's result
    /// shape: aggregation, ordering, distinct or slicing present.
    pub fn needs_outer_factoring(&self) -> bool {
        self.distinct
            || !self.groupby.is_empty()
            || self.having.is_some()
            || !self.orderby.is_empty()
            || self.limit.is_some()
            || self.offset.is_some()
    }

    /// Distinct types the solutions assign to `var`, in order.
    pub fn solution_types(&self, var: &str) -> Vec<String> {
        let mut types = Vec::new();
        for solution in &self.solutions {
            if let Some(t) = solution.get(var) {
                if !types.iter().any(|x| x == t) {
                    types.push(t.clone());
                }
            }
        }
        types
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.distinct {
            f.write_str("DISTINCT ")?;
        }
        f.write_str("Any ")?;
        for (i, term) in self.selection.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", term)?;
        }
        if !self.groupby.is_empty() {
            write!(f, " GROUPBY {}", self.groupby.join(", "))?;
        }
        if !self.orderby.is_empty() {
            f.write_str(" ORDERBY ")?;
            for (i, sort) in self.orderby.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{} {}", sort.term, sort.direction.as_str())?;
            }
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {}", offset)?;
        }
        if let Some(restriction) = &self.restriction {
            write!(f, " WHERE {}", restriction)?;
        }
        if let Some(having) = &self.having {
            write!(f, " HAVING {}", having)?;
        }
        for subquery in &self.subqueries {
            write!(
                f,
                " WITH {} BEING ({})",
                subquery.aliases.join(", "),
                subquery.query
            )?;
        }
        Ok(())
    }
}

/// A full statement: one or more selects joined by UNION.
#[derive(Debug, Clone, PartialEq)]
pub struct Union {
    pub branches: Vec<Select>,
}

impl Union {
    /// Single-branch statement.
    pub fn single(select: Select) -> Self {
        Self {
            branches: vec![select],
        }
    }

    /// Total solution count across branches.
    pub fn solution_count(&self) -> usize {
        self.branches.iter().map(|b| b.solutions.len()).sum()
    }
}

impl fmt::Display for Union {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, branch) in self.branches.iter().enumerate() {
            if i > 0 {
                f.write_str(" UNION ")?;
            }
            if self.branches.len() > 1 {
                write!(f, "({})", branch)?;
            } else {
                write!(f, "{}", branch)?;
            }
        }
        Ok(())
    }
}
