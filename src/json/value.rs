//! JSON value tree and the message that owns it.

use bigdecimal::BigDecimal;

use crate::json::parser::{self, JsonError};
use crate::json::serialize;

/// Kind of a [`JsonValue`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    Null,
    Bool,
    Int,
    Decimal,
    String,
    Array,
    Object,
}

/// A parsed JSON value.
///
/// Objects keep their members as an ordered list so duplicate names and
/// source order survive a parse/serialize cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonValue {
    Null,
    Bool(bool),
    Int(i32),
    Decimal(BigDecimal),
    String(String),
    Array(Vec<JsonValue>),
    Object(Vec<JsonPair>),
}

/// One `name: value` member of a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPair {
    pub name: String,
    pub value: JsonValue,
}

impl JsonPair {
    pub fn new(name: impl Into<String>, value: JsonValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl Default for JsonValue {
    fn default() -> Self {
        JsonValue::Null
    }
}

impl JsonValue {
    pub fn kind(&self) -> JsonKind {
        match self {
            JsonValue::Null => JsonKind::Null,
            JsonValue::Bool(_) => JsonKind::Bool,
            JsonValue::Int(_) => JsonKind::Int,
            JsonValue::Decimal(_) => JsonKind::Decimal,
            JsonValue::String(_) => JsonKind::String,
            JsonValue::Array(_) => JsonKind::Array,
            JsonValue::Object(_) => JsonKind::Object,
        }
    }

    /// First member with the given name, if this is an object.
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        match self {
            JsonValue::Object(pairs) => pairs.iter().find(|p| p.name == name).map(|p| &p.value),
            _ => None,
        }
    }

    /// Element at `index`, if this is an array.
    pub fn index(&self, index: usize) -> Option<&JsonValue> {
        match self {
            JsonValue::Array(items) => items.get(index),
            _ => None,
        }
    }

    /// Child at position `index`: an array element or the value of the
    /// n-th object member.
    pub fn child(&self, index: usize) -> Option<&JsonValue> {
        match self {
            JsonValue::Array(items) => items.get(index),
            JsonValue::Object(pairs) => pairs.get(index).map(|p| &p.value),
            _ => None,
        }
    }

    /// Walk a chain of child positions from this value.
    pub fn resolve(&self, positions: &[usize]) -> Option<&JsonValue> {
        positions
            .iter()
            .try_fold(self, |value, &position| value.child(position))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsonValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            JsonValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<BigDecimal> {
        match self {
            JsonValue::Int(n) => Some(BigDecimal::from(*n)),
            JsonValue::Decimal(d) => Some(d.clone()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsonValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[JsonValue]> {
        match self {
            JsonValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[JsonPair]> {
        match self {
            JsonValue::Object(pairs) => Some(pairs),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JsonValue::Null)
    }

    /// Number of direct children (0 for scalars).
    pub fn len(&self) -> usize {
        match self {
            JsonValue::Array(items) => items.len(),
            JsonValue::Object(pairs) => pairs.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for JsonValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&serialize::to_json_string(self, false))
    }
}

impl From<&str> for JsonValue {
    fn from(s: &str) -> Self {
        JsonValue::String(s.to_string())
    }
}

impl From<String> for JsonValue {
    fn from(s: String) -> Self {
        JsonValue::String(s)
    }
}

impl From<i32> for JsonValue {
    fn from(n: i32) -> Self {
        JsonValue::Int(n)
    }
}

impl From<bool> for JsonValue {
    fn from(b: bool) -> Self {
        JsonValue::Bool(b)
    }
}

/// A JSON document together with the outcome of parsing it.
///
/// Parsing never panics and never returns early to the caller: the first
/// error is kept on the message and can be inspected with [`error`].
///
/// [`error`]: JsonMessage::error
#[derive(Debug, Clone, Default)]
pub struct JsonMessage {
    value: JsonValue,
    whitespace: bool,
    last_error: Option<JsonError>,
}

impl JsonMessage {
    pub fn parse(text: &str) -> Self {
        Self::parse_bytes(text.as_bytes())
    }

    /// Parse raw bytes. Bytes that are not valid UTF-8 are read as
    /// single-byte (Latin-1) characters.
    pub fn parse_bytes(bytes: &[u8]) -> Self {
        Self::parse_bytes_with_depth(bytes, parser::MAX_NESTING_DEPTH)
    }

    /// Like [`parse_bytes`](JsonMessage::parse_bytes), refusing nesting
    /// deeper than `max_depth`.
    pub fn parse_bytes_with_depth(bytes: &[u8], max_depth: usize) -> Self {
        match parser::parse_with_depth(bytes, max_depth) {
            Ok(parsed) => Self {
                value: parsed.value,
                whitespace: parsed.whitespace,
                last_error: None,
            },
            Err(error) => {
                tracing::debug!(error = %error, "JSON parse failed");
                Self {
                    value: JsonValue::Null,
                    whitespace: false,
                    last_error: Some(error),
                }
            }
        }
    }

    pub fn from_value(value: JsonValue) -> Self {
        Self {
            value,
            whitespace: false,
            last_error: None,
        }
    }

    pub fn value(&self) -> &JsonValue {
        &self.value
    }

    pub fn into_value(self) -> JsonValue {
        self.value
    }

    pub fn error(&self) -> Option<&JsonError> {
        self.last_error.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.last_error.is_none()
    }

    /// Whether the source text was laid out with line breaks.
    pub fn whitespace(&self) -> bool {
        self.whitespace
    }

    pub fn set_whitespace(&mut self, whitespace: bool) {
        self.whitespace = whitespace;
    }

    /// Serialize, pretty-printed if the source was.
    pub fn to_json_string(&self) -> String {
        serialize::to_json_string(&self.value, self.whitespace)
    }
}
