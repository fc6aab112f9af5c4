//! Schema and structured value model for voxnote.
//!
//! A [`Schema`] declares the shape a model is expected to produce; a
//! [`Value`] holds what it actually produced.  The two meet in
//! [`Schema::validate`] and [`Value::decode`], which turn raw model output
//! into typed application values.
//!
//! ## Modules
//!
//! - [`schema`] -- Declarative schemas, named schema sets, JSON Schema
//!   interchange.
//! - [`value`] -- The dynamic value type, parsing (full and partial), and
//!   typed decoding.
//! - [`error`] -- Error types for both.

pub mod error;
pub mod schema;
pub mod value;

pub use error::{SchemaError, ValueError};
pub use schema::{Field, ObjectSchema, Schema, SchemaSet};
pub use value::{Kind, Value};
