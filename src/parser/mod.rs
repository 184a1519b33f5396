//! Parser for query statements and permission-rule snippets.
//!
//! The rewrite engine consumes parsed trees only; this module is the single
//! place query text is turned into an AST. Snippet parsing goes through the
//! schema's snippet cache so identical rule expressions are parsed once per
//! schema lifetime.

mod errors;
mod lexer;
mod parser;

pub use errors::{ParseError, ParseResult};
pub use parser::{parse_expression, parse_query};
