//! The JSON-shaped value model
//!
//! Every expression in the engine evaluates to a [`Value`]: a tagged union of
//! the JSON types plus `Undefined` (the result of an absent attribute) and
//! `Error` (evaluation failures travel as data, never as panics). Numbers are
//! arbitrary-precision decimals so that policies doing equality on computed
//! numbers behave deterministically.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive};

use crate::location::SourceLocation;

// ============================================================================
// METADATA
// ============================================================================

/// Immutable metadata carried by every value.
///
/// The `secret` flag survives every operator: if either operand of an
/// arithmetic or comparison operation is secret, the result is secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueMetadata {
    /// The value must not be rendered in traces or error messages.
    pub secret: bool,
}

impl ValueMetadata {
    /// Metadata for a freshly constructed, non-secret value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge two metadata sets; `secret` is sticky.
    pub fn merged(a: ValueMetadata, b: ValueMetadata) -> Self {
        Self {
            secret: a.secret || b.secret,
        }
    }
}

// ============================================================================
// ERROR VALUES
// ============================================================================

/// An evaluation error, carried inside the value algebra as ordinary data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorValue {
    pub message: String,
    pub location: Option<SourceLocation>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            message: message.into(),
            location: Some(location),
        }
    }
}

// ============================================================================
// VALUE
// ============================================================================

/// The tagged union behind [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Result of an absent attribute or an empty attribute stream.
    Undefined,
    Null,
    Bool(bool),
    /// Arbitrary-precision decimal.
    Number(BigDecimal),
    Text(String),
    Array(Vec<Value>),
    /// Member order is irrelevant for equality; a sorted map keeps
    /// serialization deterministic.
    Object(BTreeMap<String, Value>),
    Error(ErrorValue),
}

/// A value flowing through the engine: a [`ValueKind`] plus metadata.
///
/// Equality and hashing are structural over the kind only; metadata never
/// influences comparison.
#[derive(Debug, Clone)]
pub struct Value {
    kind: ValueKind,
    meta: ValueMetadata,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl Value {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    pub fn undefined() -> Self {
        ValueKind::Undefined.into()
    }

    pub fn null() -> Self {
        ValueKind::Null.into()
    }

    pub fn boolean(b: bool) -> Self {
        ValueKind::Bool(b).into()
    }

    pub fn number(n: impl Into<BigDecimal>) -> Self {
        ValueKind::Number(n.into()).into()
    }

    pub fn text(s: impl Into<String>) -> Self {
        ValueKind::Text(s.into()).into()
    }

    pub fn array(items: Vec<Value>) -> Self {
        ValueKind::Array(items).into()
    }

    pub fn object(members: BTreeMap<String, Value>) -> Self {
        ValueKind::Object(members).into()
    }

    pub fn error(message: impl Into<String>) -> Self {
        ValueKind::Error(ErrorValue::new(message)).into()
    }

    pub fn error_at(message: impl Into<String>, location: SourceLocation) -> Self {
        ValueKind::Error(ErrorValue::at(message, location)).into()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn metadata(&self) -> ValueMetadata {
        self.meta
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.kind, ValueKind::Undefined)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ValueKind::Error(_))
    }

    pub fn is_secret(&self) -> bool {
        self.meta.secret
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match &self.kind {
            ValueKind::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&BigDecimal> {
        match &self.kind {
            ValueKind::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match &self.kind {
            ValueKind::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.kind {
            ValueKind::Object(members) => Some(members),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Error(e) => Some(&e.message),
            _ => None,
        }
    }

    /// A short name for the value's type, used in operator error messages.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Bool(_) => "boolean",
            ValueKind::Number(_) => "number",
            ValueKind::Text(_) => "text",
            ValueKind::Array(_) => "array",
            ValueKind::Object(_) => "object",
            ValueKind::Error(_) => "error",
        }
    }

    // ------------------------------------------------------------------
    // Metadata plumbing
    // ------------------------------------------------------------------

    /// Flag the value (and anything derived from it) as secret.
    pub fn mark_secret(mut self) -> Self {
        self.meta.secret = true;
        self
    }

    pub fn with_metadata(mut self, meta: ValueMetadata) -> Self {
        self.meta = meta;
        self
    }

    /// Merge another metadata set into this value's metadata.
    pub fn merge_metadata(mut self, other: ValueMetadata) -> Self {
        self.meta = ValueMetadata::merged(self.meta, other);
        self
    }

    /// Attach a source location to an error value that does not yet carry one.
    /// Non-error values pass through unchanged.
    pub fn with_location(mut self, location: &SourceLocation) -> Self {
        if let ValueKind::Error(e) = &mut self.kind {
            if e.location.is_none() {
                e.location = Some(location.clone());
            }
        }
        self
    }

    // ------------------------------------------------------------------
    // JSON conversion
    // ------------------------------------------------------------------

    /// Convert a JSON document into a value. Numbers are re-parsed as
    /// arbitrary-precision decimals from their textual form.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::null(),
            serde_json::Value::Bool(b) => Value::boolean(*b),
            serde_json::Value::Number(n) => match BigDecimal::from_str(&n.to_string()) {
                Ok(d) => Value::number(d),
                Err(_) => Value::error(format!("unrepresentable number: {n}")),
            },
            serde_json::Value::String(s) => Value::text(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(members) => Value::object(
                members
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back to JSON. `Undefined` and `Error` have no JSON image and
    /// yield `None`; a container holding either yields `None` as well.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match &self.kind {
            ValueKind::Undefined | ValueKind::Error(_) => None,
            ValueKind::Null => Some(serde_json::Value::Null),
            ValueKind::Bool(b) => Some(serde_json::Value::Bool(*b)),
            ValueKind::Number(n) => Some(number_to_json(n)),
            ValueKind::Text(s) => Some(serde_json::Value::String(s.clone())),
            ValueKind::Array(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            ValueKind::Object(members) => members
                .iter()
                .map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
        }
    }
}

impl From<ValueKind> for Value {
    fn from(kind: ValueKind) -> Self {
        Self {
            kind,
            meta: ValueMetadata::default(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::number(BigDecimal::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

/// Integers that fit an `i64` serialize as JSON integers; everything else
/// degrades to the closest double. The in-engine representation stays exact,
/// only the wire form narrows.
fn number_to_json(n: &BigDecimal) -> serde_json::Value {
    if n.is_integer() {
        if let Some(i) = n.to_i64() {
            return serde_json::Value::from(i);
        }
    }
    n.to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|| serde_json::Value::String(n.to_string()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.meta.secret {
            return write!(f, "<<secret>>");
        }
        match &self.kind {
            ValueKind::Undefined => write!(f, "undefined"),
            ValueKind::Null => write!(f, "null"),
            ValueKind::Bool(b) => write!(f, "{b}"),
            ValueKind::Number(n) => write!(f, "{}", n.normalized()),
            ValueKind::Text(s) => write!(f, "{s:?}"),
            ValueKind::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ValueKind::Object(members) => {
                write!(f, "{{")?;
                for (i, (k, v)) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k:?}:{v}")?;
                }
                write!(f, "}}")
            }
            ValueKind::Error(e) => write!(f, "error({:?})", e.message),
        }
    }
}
