//! Schema error types.

use thiserror::Error;

use crate::parser::ParseError;

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while building or loading a schema
#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    /// Referenced entity type is not declared
    #[error("Unknown entity type `{0}`")]
    UnknownEntity(String),

    /// Referenced relation type is not declared
    #[error("Unknown relation type `{0}`")]
    UnknownRelation(String),

    /// Entity type declared twice
    #[error("Duplicate entity type `{0}`")]
    DuplicateEntity(String),

    /// Cardinality string is not two of `1`, `?`, `+`, `*`
    #[error("Invalid cardinality `{0}`")]
    InvalidCardinality(String),

    /// A permission or computed-relation expression failed to parse
    #[error("Invalid rule expression `{expression}`: {source}")]
    InvalidExpression {
        expression: String,
        #[source]
        source: ParseError,
    },

    /// Schema file could not be read or decoded
    #[error("Malformed schema `{path}`: {detail}")]
    MalformedSchema { path: String, detail: String },

    /// A schema with this name is already registered; schemas are immutable
    /// once loaded
    #[error("Schema `{0}` already registered")]
    SchemaImmutable(String),
}
