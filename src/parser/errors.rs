//! Parser error types.

use thiserror::Error;

/// Result type for parsing operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Errors raised while tokenizing or parsing query text
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Character sequence matched no token pattern
    #[error("Unexpected character at offset {position}")]
    UnexpectedCharacter { position: usize },

    /// Token stream ended before the statement was complete
    #[error("Unexpected end of input: expected {expected}")]
    UnexpectedEnd { expected: String },

    /// A token other than the expected one was found
    #[error("Expected {expected} at offset {position}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        position: usize,
    },

    /// Both sides of a relation carried an outer-join marker
    #[error("Relation `{rtype}` marks both sides optional at offset {position}")]
    DoubleOptional { rtype: String, position: usize },

    /// Trailing tokens after a complete statement
    #[error("Trailing input at offset {position}")]
    TrailingInput { position: usize },
}
