//! Expression tree nodes for the query language.
//!
//! Restrictions are tagged-variant trees with exhaustive matching; every
//! transformation pass in this crate is a `match` over [`Expr`], so adding a
//! node kind is a compile-time event for all of them.

use std::fmt;

/// Comparison operators usable in relations and HAVING terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Returns the operator's query-text spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outer-join marker carried by a relation occurrence in a query.
///
/// `X rel Y?` keeps rows of X with no related Y; the marked side may be
/// absent without excluding the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Optional {
    /// Plain inner join.
    #[default]
    Neither,
    /// `X? rel Y` — subject side may be absent.
    Subject,
    /// `X rel Y?` — object side may be absent.
    Object,
}

impl Optional {
    /// True if either side is outer-joined.
    pub fn is_optional(&self) -> bool {
        !matches!(self, Optional::Neither)
    }
}

/// A term appearing in a selection, relation object or comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// Reference to a query variable.
    Variable(String),
    /// Literal constant.
    Constant(serde_json::Value),
    /// Bound-parameter placeholder, `%(name)s` in query text.
    Param(String),
    /// Function application, e.g. `COUNT(X)`.
    Function { name: String, args: Vec<Term> },
}

impl Term {
    /// Variable term from a name.
    pub fn var(name: impl Into<String>) -> Self {
        Term::Variable(name.into())
    }

    /// Constant term from any JSON value.
    pub fn constant(value: serde_json::Value) -> Self {
        Term::Constant(value)
    }

    /// String constant term.
    pub fn string(value: impl Into<String>) -> Self {
        Term::Constant(serde_json::Value::String(value.into()))
    }

    /// Bound-parameter term.
    pub fn param(name: impl Into<String>) -> Self {
        Term::Param(name.into())
    }

    /// Returns the variable name if this term is a variable.
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Term::Variable(name) => Some(name),
            _ => None,
        }
    }

    /// Collects variable names referenced by this term.
    pub fn collect_variables(&self, out: &mut Vec<String>) {
        match self {
            Term::Variable(name) => out.push(name.clone()),
            Term::Constant(_) | Term::Param(_) => {}
            Term::Function { args, .. } => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Variable(name) => f.write_str(name),
            Term::Constant(serde_json::Value::String(s)) => write!(f, "\"{}\"", s),
            Term::Constant(v) => write!(f, "{}", v),
            Term::Param(name) => write!(f, "%({})s", name),
            Term::Function { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A restriction-tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Conjunction; in query text, comma-separated terms.
    And(Vec<Expr>),
    /// Disjunction; `OR`-joined terms.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
    /// Existential subscope.
    Exists(Box<Expr>),
    /// `subject rtype object`, optionally with a comparison operator
    /// (`X age > 5`) and outer-join markers.
    Relation {
        subject: String,
        rtype: String,
        object: Term,
        operator: CmpOp,
        optional: Optional,
    },
    /// Operator comparison between arbitrary terms (HAVING clauses).
    Comparison {
        left: Term,
        operator: CmpOp,
        right: Term,
    },
    /// `X is T` / `X is IN(T1, T2)` type restriction.
    TypeIs { var: String, types: Vec<String> },
    /// `X is NULL` — the outer-joined side is absent.
    IsNull { var: String },
    /// Correlated membership of `var` in the single selected column of a
    /// subquery.
    SubqueryIn {
        var: String,
        query: Box<super::select::Select>,
    },
}

impl Expr {
    /// Plain relation node (equality operator, inner join).
    pub fn relation(subject: impl Into<String>, rtype: impl Into<String>, object: Term) -> Self {
        Expr::Relation {
            subject: subject.into(),
            rtype: rtype.into(),
            object,
            operator: CmpOp::Eq,
            optional: Optional::Neither,
        }
    }

    /// Single-type restriction node.
    pub fn is_type(var: impl Into<String>, etype: impl Into<String>) -> Self {
        Expr::TypeIs {
            var: var.into(),
            types: vec![etype.into()],
        }
    }

    /// Conjunction, flattening nested `And` nodes and dropping the wrapper
    /// for a single term.
    pub fn and(terms: Vec<Expr>) -> Self {
        let mut flat = Vec::with_capacity(terms.len());
        for term in terms {
            match term {
                Expr::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Expr::And(Vec::new()))
        } else {
            Expr::And(flat)
        }
    }

    /// Disjunction, flattening nested `Or` nodes and dropping the wrapper
    /// for a single term.
    pub fn or(terms: Vec<Expr>) -> Self {
        let mut flat = Vec::with_capacity(terms.len());
        for term in terms {
            match term {
                Expr::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Expr::Or(Vec::new()))
        } else {
            Expr::Or(flat)
        }
    }

    /// Existential wrapper.
    pub fn exists(inner: Expr) -> Self {
        Expr::Exists(Box::new(inner))
    }

    /// The top-level conjuncts of this expression (the expression itself if
    /// it is not an `And`).
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(terms) => terms.iter().collect(),
            other => vec![other],
        }
    }

    /// Collects every variable name mentioned in this subtree, subquery
    /// internals excluded (the correlated variable of a `SubqueryIn` counts,
    /// the subquery's own variables do not).
    pub fn collect_variables(&self, out: &mut Vec<String>) {
        match self {
            Expr::And(terms) | Expr::Or(terms) => {
                for term in terms {
                    term.collect_variables(out);
                }
            }
            Expr::Not(inner) | Expr::Exists(inner) => inner.collect_variables(out),
            Expr::Relation {
                subject, object, ..
            } => {
                out.push(subject.clone());
                object.collect_variables(out);
            }
            Expr::Comparison { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
            Expr::TypeIs { var, .. } | Expr::IsNull { var } | Expr::SubqueryIn { var, .. } => {
                out.push(var.clone());
            }
        }
    }

    /// Structural equality up to a consistent renaming of variables.
    ///
    /// Used to recognize an already-spliced permission condition so a second
    /// rewrite pass does not duplicate it, even though the second pass would
    /// allocate different fresh variable names.
    pub fn alpha_eq(&self, other: &Expr) -> bool {
        fn bind(
            map: &mut std::collections::HashMap<String, String>,
            rev: &mut std::collections::HashMap<String, String>,
            a: &str,
            b: &str,
        ) -> bool {
            match (map.get(a), rev.get(b)) {
                (Some(mapped), Some(back)) => mapped == b && back == a,
                (None, None) => {
                    map.insert(a.to_string(), b.to_string());
                    rev.insert(b.to_string(), a.to_string());
                    true
                }
                _ => false,
            }
        }

        fn term_eq(
            map: &mut std::collections::HashMap<String, String>,
            rev: &mut std::collections::HashMap<String, String>,
            a: &Term,
            b: &Term,
        ) -> bool {
            match (a, b) {
                (Term::Variable(x), Term::Variable(y)) => bind(map, rev, x, y),
                (Term::Constant(x), Term::Constant(y)) => x == y,
                (Term::Param(x), Term::Param(y)) => x == y,
                (
                    Term::Function { name: n1, args: a1 },
                    Term::Function { name: n2, args: a2 },
                ) => {
                    n1 == n2
                        && a1.len() == a2.len()
                        && a1.iter().zip(a2).all(|(x, y)| term_eq(map, rev, x, y))
                }
                _ => false,
            }
        }

        fn walk(
            map: &mut std::collections::HashMap<String, String>,
            rev: &mut std::collections::HashMap<String, String>,
            a: &Expr,
            b: &Expr,
        ) -> bool {
            match (a, b) {
                (Expr::And(x), Expr::And(y)) | (Expr::Or(x), Expr::Or(y)) => {
                    x.len() == y.len() && x.iter().zip(y).all(|(p, q)| walk(map, rev, p, q))
                }
                (Expr::Not(x), Expr::Not(y)) | (Expr::Exists(x), Expr::Exists(y)) => {
                    walk(map, rev, x, y)
                }
                (
                    Expr::Relation {
                        subject: s1,
                        rtype: r1,
                        object: o1,
                        operator: op1,
                        optional: f1,
                    },
                    Expr::Relation {
                        subject: s2,
                        rtype: r2,
                        object: o2,
                        operator: op2,
                        optional: f2,
                    },
                ) => {
                    r1 == r2
                        && op1 == op2
                        && f1 == f2
                        && bind(map, rev, s1, s2)
                        && term_eq(map, rev, o1, o2)
                }
                (
                    Expr::Comparison {
                        left: l1,
                        operator: op1,
                        right: r1,
                    },
                    Expr::Comparison {
                        left: l2,
                        operator: op2,
                        right: r2,
                    },
                ) => op1 == op2 && term_eq(map, rev, l1, l2) && term_eq(map, rev, r1, r2),
                (
                    Expr::TypeIs { var: v1, types: t1 },
                    Expr::TypeIs { var: v2, types: t2 },
                ) => t1 == t2 && bind(map, rev, v1, v2),
                (Expr::IsNull { var: v1 }, Expr::IsNull { var: v2 }) => bind(map, rev, v1, v2),
                (
                    Expr::SubqueryIn { var: v1, query: q1 },
                    Expr::SubqueryIn { var: v2, query: q2 },
                ) => {
                    // Subqueries compare structurally; their variables live in
                    // their own scope.
                    bind(map, rev, v1, v2) && q1 == q2
                }
                _ => false,
            }
        }

        let mut map = std::collections::HashMap::new();
        let mut rev = std::collections::HashMap::new();
        walk(&mut map, &mut rev, self, other)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::And(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", term)?;
                }
                Ok(())
            }
            Expr::Or(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" OR ")?;
                    }
                    // Nested conjunctions need grouping inside a disjunction.
                    if matches!(term, Expr::And(_) | Expr::Or(_)) {
                        write!(f, "({})", term)?;
                    } else {
                        write!(f, "{}", term)?;
                    }
                }
                Ok(())
            }
            Expr::Not(inner) => write!(f, "NOT ({})", inner),
            Expr::Exists(inner) => write!(f, "EXISTS({})", inner),
            Expr::Relation {
                subject,
                rtype,
                object,
                operator,
                optional,
            } => {
                let subject_mark = if *optional == Optional::Subject { "?" } else { "" };
                let object_mark = if *optional == Optional::Object { "?" } else { "" };
                if *operator == CmpOp::Eq {
                    write!(f, "{}{} {} {}{}", subject, subject_mark, rtype, object, object_mark)
                } else {
                    write!(
                        f,
                        "{}{} {} {} {}{}",
                        subject, subject_mark, rtype, operator, object, object_mark
                    )
                }
            }
            Expr::Comparison {
                left,
                operator,
                right,
            } => write!(f, "{} {} {}", left, operator, right),
            Expr::TypeIs { var, types } => {
                if types.len() == 1 {
                    write!(f, "{} is {}", var, types[0])
                } else {
                    write!(f, "{} is IN({})", var, types.join(", "))
                }
            }
            Expr::IsNull { var } => write!(f, "{} is NULL", var),
            Expr::SubqueryIn { var, query } => write!(f, "{} IN ({})", var, query),
        }
    }
}
