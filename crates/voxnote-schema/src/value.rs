//! Dynamic structured values.
//!
//! [`Value`] is the tagged representation of anything a model can produce:
//! tool-call arguments, structured responses, and partially-streamed JSON.
//! Objects keep their fields in insertion order so a value survives a
//! serialize/parse round trip unchanged.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ValueError, ValueResult};
use crate::schema::Schema;

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// The coarse shape of a value or schema node, used in mismatch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Null,
    Boolean,
    Number,
    Integer,
    String,
    Array,
    Object,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean => write!(f, "boolean"),
            Self::Number => write!(f, "number"),
            Self::Integer => write!(f, "integer"),
            Self::String => write!(f, "string"),
            Self::Array => write!(f, "array"),
            Self::Object => write!(f, "object"),
        }
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A dynamically typed structured value.
///
/// Numbers are stored as [`serde_json::Number`] so integers and floats keep
/// the precision they were parsed with.  Objects are an ordered list of
/// `(name, value)` pairs; names are unique within one object.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Create an empty object.
    pub fn object() -> Self {
        Self::Object(Vec::new())
    }

    /// Builder-style insert for object values.  Replaces an existing field of
    /// the same name in place; has no effect on non-objects.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a field on an object value.
    ///
    /// Returns the previous value of the field, if any.  Non-object values
    /// are left untouched and `None` is returned.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let Self::Object(fields) = self else {
            return None;
        };
        let key = key.into();
        let value = value.into();
        match fields.iter_mut().find(|(name, _)| *name == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                fields.push((key, value));
                None
            }
        }
    }

    /// Look up a field on an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(fields) => fields.iter().find(|(name, _)| name == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// The [`Kind`] of this value.  All numbers report [`Kind::Number`].
    pub fn kind(&self) -> Kind {
        match self {
            Self::Null => Kind::Null,
            Self::Bool(_) => Kind::Boolean,
            Self::Number(_) => Kind::Number,
            Self::String(_) => Kind::String,
            Self::Array(_) => Kind::Array,
            Self::Object(_) => Kind::Object,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns `true` for numbers without a fractional part.
    pub fn is_integer(&self) -> bool {
        match self {
            Self::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        }
    }

    // -- Parsing -------------------------------------------------------------

    /// Parse raw JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::Parse`] with the line and column of the first
    /// syntax error.
    pub fn parse(text: &str) -> ValueResult<Self> {
        serde_json::from_str::<serde_json::Value>(text)
            .map(Self::from)
            .map_err(parse_error)
    }

    /// Parse model output that may be wrapped in a Markdown code fence or
    /// surrounded by whitespace.
    pub fn parse_lenient(text: &str) -> ValueResult<Self> {
        Self::parse(strip_code_fence(text))
    }

    /// Parse a possibly truncated JSON document.
    ///
    /// Streaming backends deliver structured output a few characters at a
    /// time.  This closes any open strings, arrays and objects and drops a
    /// trailing member that has not produced a value yet, so every prefix of
    /// a valid document yields the largest value it already describes.  An
    /// empty prefix yields [`Value::Null`].
    pub fn parse_partial(text: &str) -> ValueResult<Self> {
        let text = strip_code_fence(text);
        if let Ok(value) = Self::parse(text) {
            return Ok(value);
        }
        let repaired = repair_truncated(text);
        if repaired.trim().is_empty() {
            return Ok(Self::Null);
        }
        tracing::trace!(%repaired, "parsing repaired partial json");
        Self::parse(&repaired)
    }

    // -- Conversion ------------------------------------------------------------

    /// Build a value from any serializable application type.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> ValueResult<Self> {
        serde_json::to_value(value)
            .map(Self::from)
            .map_err(|e| ValueError::Deserialize {
                reason: e.to_string(),
            })
    }

    /// Validate this value against `schema` and convert it into `T`.
    ///
    /// # Errors
    ///
    /// [`ValueError::SchemaMismatch`] or [`ValueError::MissingField`] when the
    /// value does not match the schema, [`ValueError::Deserialize`] when it
    /// matches but `T` disagrees with the schema.
    pub fn decode<T: DeserializeOwned>(&self, schema: &Schema) -> ValueResult<T> {
        schema.validate(self)?;
        self.deserialize_into()
    }

    /// Convert into `T` without consulting a schema.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> ValueResult<T> {
        serde_json::from_value(serde_json::Value::from(self)).map_err(|e| {
            ValueError::Deserialize {
                reason: e.to_string(),
            }
        })
    }

    /// Canonical compact JSON text.
    pub fn to_json(&self) -> String {
        self.to_string()
    }

    /// Indented JSON text, for logs and CLI output.
    pub fn to_json_pretty(&self) -> String {
        format!("{:#}", serde_json::Value::from(self))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self))
    }
}

fn parse_error(e: serde_json::Error) -> ValueError {
    let message = e.to_string();
    let reason = message
        .split(" at line ")
        .next()
        .unwrap_or(&message)
        .to_owned();
    ValueError::Parse {
        line: e.line(),
        column: e.column(),
        reason,
    }
}

/// Strip a surrounding Markdown code fence (```` ```json ... ``` ````).
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string (e.g. `json`) on the opening fence line.
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

// ---------------------------------------------------------------------------
// serde / serde_json interop
// ---------------------------------------------------------------------------

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from).collect()),
            Value::Object(fields) => Self::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        Self::from(&value)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in fields {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no JSON representation and become `null`.
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

// ---------------------------------------------------------------------------
// Partial JSON repair
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectState {
    /// Expecting a key or `}`.
    Key,
    /// Key read, expecting `:`.
    Colon,
    /// Expecting a value.
    Value,
    /// Value read, expecting `,` or `}`.
    Next,
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Object(ObjectState),
    Array { after_value: bool },
}

impl Frame {
    fn closer(self) -> char {
        match self {
            Self::Object(_) => '}',
            Self::Array { .. } => ']',
        }
    }
}

fn closers(stack: &[Frame]) -> String {
    stack.iter().rev().map(|f| f.closer()).collect()
}

fn complete_value(stack: &mut [Frame]) {
    match stack.last_mut() {
        Some(Frame::Object(state)) => *state = ObjectState::Next,
        Some(Frame::Array { after_value }) => *after_value = true,
        None => {}
    }
}

/// Turn a truncated JSON prefix into a complete document.
///
/// Tracks the last byte offset at which the prefix ended on a complete
/// value (or just inside a freshly opened container) together with the
/// container stack at that point.  An unterminated string *value* is kept and
/// closed; anything else after the last safe point is dropped.
fn repair_truncated(text: &str) -> String {
    let mut stack: Vec<Frame> = Vec::new();
    let mut safe_end = 0usize;
    let mut safe_closers = String::new();

    let mut in_string = false;
    let mut string_is_key = false;
    let mut escape_start: Option<usize> = None;
    let mut unicode_remaining = 0u8;

    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];

        if in_string {
            if unicode_remaining > 0 {
                unicode_remaining -= 1;
                if unicode_remaining == 0 {
                    escape_start = None;
                }
            } else if escape_start.is_some() {
                if c == b'u' {
                    unicode_remaining = 4;
                } else {
                    escape_start = None;
                }
            } else if c == b'\\' {
                escape_start = Some(i);
            } else if c == b'"' {
                in_string = false;
                if string_is_key {
                    if let Some(Frame::Object(state)) = stack.last_mut() {
                        *state = ObjectState::Colon;
                    }
                } else {
                    complete_value(&mut stack);
                    safe_end = i + 1;
                    safe_closers = closers(&stack);
                }
            }
            i += 1;
            continue;
        }

        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {}
            b'{' => {
                stack.push(Frame::Object(ObjectState::Key));
                safe_end = i + 1;
                safe_closers = closers(&stack);
            }
            b'[' => {
                stack.push(Frame::Array { after_value: false });
                safe_end = i + 1;
                safe_closers = closers(&stack);
            }
            b'}' | b']' => {
                stack.pop();
                complete_value(&mut stack);
                safe_end = i + 1;
                safe_closers = closers(&stack);
            }
            b'"' => {
                in_string = true;
                string_is_key = matches!(stack.last(), Some(Frame::Object(ObjectState::Key)));
            }
            b':' => {
                if let Some(Frame::Object(state)) = stack.last_mut() {
                    *state = ObjectState::Value;
                }
            }
            b',' => match stack.last_mut() {
                Some(Frame::Object(state)) => *state = ObjectState::Key,
                Some(Frame::Array { after_value }) => *after_value = false,
                None => {}
            },
            _ => {
                // Literal or number: consume the whole token.
                while i < bytes.len() && !b",}] \t\n\r:".contains(&bytes[i]) {
                    i += 1;
                }
                if i == bytes.len() {
                    // The token may still be growing (`tru`, `12.`); drop it.
                    break;
                }
                complete_value(&mut stack);
                safe_end = i;
                safe_closers = closers(&stack);
                continue;
            }
        }
        i += 1;
    }

    if in_string && !string_is_key {
        let cut = escape_start.unwrap_or(text.len());
        let mut repaired = text[..cut].to_owned();
        repaired.push('"');
        repaired.push_str(&closers(&stack));
        return repaired;
    }

    let mut repaired = text[..safe_end].to_owned();
    repaired.push_str(&safe_closers);
    repaired
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
