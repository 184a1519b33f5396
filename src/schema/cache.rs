//! Parsed-snippet cache.
//!
//! Rule expressions are parsed once per schema lifetime and shared as
//! `Arc<Expr>`. The cache is owned by its [`Schema`](super::Schema)
//! instance: rebuilding the schema discards the cache with it, so stale
//! parses cannot survive a schema reload.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::Expr;
use crate::parser::{parse_expression, ParseResult};

/// Cache of parsed rule snippets keyed by expression text.
#[derive(Debug, Default)]
pub struct SnippetCache {
    entries: HashMap<String, Arc<Expr>>,
}

impl SnippetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an expression, reusing a previous parse of the same text.
    pub fn parse(&mut self, expression: &str) -> ParseResult<Arc<Expr>> {
        if let Some(snippet) = self.entries.get(expression) {
            return Ok(Arc::clone(snippet));
        }
        let snippet = Arc::new(parse_expression(expression)?);
        self.entries
            .insert(expression.to_string(), Arc::clone(&snippet));
        Ok(snippet)
    }

    /// Number of cached parses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every cached parse.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
