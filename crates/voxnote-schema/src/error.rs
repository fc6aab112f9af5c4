//! Schema and value error types.
//!
//! Value errors carry the field path of the offending node so callers can
//! point at the exact spot where model output disagreed with the schema.

use crate::value::Kind;

/// Errors raised while parsing or decoding a [`crate::Value`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    /// The raw text is not well-formed JSON.
    #[error("parse error at line {line}, column {column}: {reason}")]
    Parse {
        line: usize,
        column: usize,
        reason: String,
    },

    /// A node has a different kind than the schema declares.
    #[error("schema mismatch at `{path}`: expected {expected}, found {actual}")]
    SchemaMismatch {
        path: String,
        expected: Kind,
        actual: Kind,
    },

    /// A required object field is absent.
    #[error("missing required field `{path}`")]
    MissingField { path: String },

    /// The value matched the schema but could not be converted into the
    /// requested Rust type.
    #[error("cannot deserialize value: {reason}")]
    Deserialize { reason: String },
}

/// Errors raised while building or resolving a [`crate::Schema`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Two fields of one object share a name.
    #[error("duplicate field `{field}` in object schema `{object}`")]
    DuplicateField { object: String, field: String },

    /// A reference names a schema that is not registered.
    #[error("unknown schema reference `{name}` at `{path}`")]
    UnknownReference { name: String, path: String },

    /// A required field recurses deeper than the configured unroll depth.
    #[error("required field `{path}` recurses beyond depth {max_depth}")]
    UnboundedRecursion { path: String, max_depth: usize },

    /// A JSON Schema document could not be mapped onto a [`crate::Schema`].
    #[error("invalid json schema at `{path}`: {reason}")]
    InvalidJsonSchema { path: String, reason: String },
}

/// Convenience alias for value operations.
pub type ValueResult<T> = std::result::Result<T, ValueError>;

/// Convenience alias for schema operations.
pub type SchemaResult<T> = std::result::Result<T, SchemaError>;
