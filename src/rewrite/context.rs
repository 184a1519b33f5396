//! Per-invocation rewrite state.
//!
//! A [`RewriteContext`] is constructed fresh for every top-level rewrite of
//! one select statement and threaded explicitly through the engine. It owns
//! the fresh-variable namespace, the snippet-variable substitution record,
//! the current-user binding and the event trail. Nothing in here is shared
//! across queries or threads.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::Select;
use crate::schema::Action;
use crate::session::{Params, SessionContext};

use super::events::RewriteEvent;

/// Mutable state of one rewrite invocation.
#[derive(Debug)]
pub struct RewriteContext {
    /// Every variable name in use, query and allocations included.
    taken: BTreeSet<String>,
    /// Variables introduced by this rewrite, a subset of `taken`.
    allocated: BTreeSet<String>,
    /// (rule expression, varmap, snippet variable) → substituted query
    /// variable. Re-translating the same rule for the same varmap reuses
    /// the same names.
    rewritten: BTreeMap<(String, String, String), String>,
    /// (entity type, action) pairs currently being resolved through
    /// `has_<action>_permission`; re-entering one is a schema cycle.
    resolving: BTreeSet<(String, Action)>,
    /// Current-user variable and parameter, allocated at most once.
    user_binding: Option<(String, String)>,
    /// Decisions taken so far, in order.
    pub events: Vec<RewriteEvent>,
}

impl RewriteContext {
    /// Creates a context for rewriting the given select, reserving every
    /// variable name it already uses.
    pub fn new(select: &Select) -> Self {
        Self {
            taken: select.all_variable_names(),
            allocated: BTreeSet::new(),
            rewritten: BTreeMap::new(),
            resolving: BTreeSet::new(),
            user_binding: None,
            events: Vec::new(),
        }
    }

    /// Allocates a fresh variable name, keeping `preferred` when it is
    /// still free so rewritten queries stay readable.
    pub fn fresh(&mut self, preferred: &str) -> String {
        let name = if self.taken.contains(preferred) {
            let mut n = 0;
            loop {
                let candidate = format!("{}{}", preferred, n);
                if !self.taken.contains(&candidate) {
                    break candidate;
                }
                n += 1;
            }
        } else {
            preferred.to_string()
        };
        self.taken.insert(name.clone());
        self.allocated.insert(name.clone());
        name
    }

    /// Query variable substituted for a snippet-local variable, allocated
    /// on first use and reused for the same (rule, varmap) afterwards.
    pub fn snippet_var(&mut self, rule_key: &str, varmap_key: &str, name: &str) -> String {
        let key = (
            rule_key.to_string(),
            varmap_key.to_string(),
            name.to_string(),
        );
        if let Some(existing) = self.rewritten.get(&key) {
            return existing.clone();
        }
        let fresh = self.fresh(name);
        self.rewritten.insert(key, fresh.clone());
        fresh
    }

    /// The "current user" variable and parameter name, allocated once per
    /// rewrite. Allocation inserts the user's eid into `params`; later
    /// calls return the same binding. Returns `None` for anonymous
    /// sessions, which cannot satisfy a user-dependent rule.
    pub fn bind_user(
        &mut self,
        session: &SessionContext,
        params: &mut Params,
    ) -> Option<(String, String)> {
        if let Some(binding) = &self.user_binding {
            return Some(binding.clone());
        }
        let user_eid = session.user_eid?;
        let var = self.fresh("U");
        let mut param = "u".to_string();
        let mut n = 0;
        while params.contains_key(&param) {
            param = format!("u{}", n);
            n += 1;
        }
        params.insert(
            param.clone(),
            serde_json::Value::String(user_eid.to_string()),
        );
        self.user_binding = Some((var.clone(), param.clone()));
        Some((var, param))
    }

    /// Variables introduced by this rewrite so far.
    pub fn allocated(&self) -> &BTreeSet<String> {
        &self.allocated
    }

    /// Marks a (type, action) permission resolution as in progress.
    /// Returns false if it already was, which means the schema's
    /// permission rules are mutually recursive.
    pub fn begin_resolving(&mut self, etype: &str, action: Action) -> bool {
        self.resolving.insert((etype.to_string(), action))
    }

    pub fn end_resolving(&mut self, etype: &str, action: Action) {
        self.resolving.remove(&(etype.to_string(), action));
    }
}
