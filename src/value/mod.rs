//! Typed dynamic JSON values shared across the algebra, planner, and
//! execution layers.
//!
//! The engine's data model is a tagged union over the JSON types plus two
//! extensions: `Missing` (a field that is absent from a document, distinct
//! from `null`) and `Binary` (opaque bytes surfaced by the datastore).
//! Values collate in the dialect's canonical order: MISSING < NULL < FALSE
//! < TRUE < NUMBER < STRING < ARRAY < OBJECT < BINARY.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::{Deserializer, Error as DeError};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

mod annotated;
mod pool;

pub use annotated::AnnotatedValue;
pub use pool::MapPool;

/// Type tag for a [`Value`], ordered by collation rank.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ValueType {
    /// Absent field. Collates below everything else.
    Missing,
    /// JSON null.
    Null,
    /// JSON boolean.
    Boolean,
    /// JSON number (IEEE 754 double).
    Number,
    /// JSON string.
    String,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
    /// Opaque binary payload.
    Binary,
}

impl ValueType {
    /// Canonical dialect name for the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Missing => "missing",
            ValueType::Null => "null",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::Binary => "binary",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dynamically typed JSON value.
///
/// Values are immutable from a consumer's perspective; operators build new
/// values rather than mutating shared ones. Object keys are kept sorted so
/// that encoding is canonical and structural equality is deterministic.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent field, distinct from `Null`.
    Missing,
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(f64),
    /// JSON string.
    String(String),
    /// JSON array.
    Array(Vec<Value>),
    /// JSON object with canonically ordered keys.
    Object(BTreeMap<String, Value>),
    /// Opaque binary payload.
    Binary(Vec<u8>),
}

impl Value {
    /// Boolean TRUE singleton-style constructor.
    pub const TRUE: Value = Value::Bool(true);
    /// Boolean FALSE singleton-style constructor.
    pub const FALSE: Value = Value::Bool(false);

    /// Returns the type tag of this value.
    pub fn type_of(&self) -> ValueType {
        match self {
            Value::Missing => ValueType::Missing,
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
            Value::Binary(_) => ValueType::Binary,
        }
    }

    /// Truth value under the dialect's rules: MISSING, NULL, `false`, `0`,
    /// the empty string, and empty collections are all falsy.
    pub fn truth(&self) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            Value::Binary(b) => !b.is_empty(),
        }
    }

    /// Three-valued equality. MISSING propagates strongest, then NULL;
    /// otherwise returns TRUE or FALSE per JSON equality.
    pub fn equals(&self, other: &Value) -> Value {
        if self.type_of() == ValueType::Missing || other.type_of() == ValueType::Missing {
            return Value::Missing;
        }
        if self.type_of() == ValueType::Null || other.type_of() == ValueType::Null {
            return Value::Null;
        }
        Value::Bool(self == other)
    }

    /// Total collation order used by ORDER BY and index span comparison.
    pub fn collate(&self, other: &Value) -> Ordering {
        let rank = self.type_of().cmp(&other.type_of());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let c = x.collate(y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let c = ka.cmp(kb);
                    if c != Ordering::Equal {
                        return c;
                    }
                    let c = va.collate(vb);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }

    /// Field access on objects. Returns `Missing` for absent fields and for
    /// non-object values.
    pub fn field(&self, name: &str) -> Value {
        match self {
            Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Missing),
            _ => Value::Missing,
        }
    }

    /// Element access on arrays. Returns `Missing` when out of range or for
    /// non-array values.
    pub fn index(&self, i: usize) -> Value {
        match self {
            Value::Array(items) => items.get(i).cloned().unwrap_or(Value::Missing),
            _ => Value::Missing,
        }
    }

    /// Returns the contained string, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained number, if any.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Builds an object value from key/value pairs.
    pub fn object<I, K>(pairs: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            // Missing has no JSON representation; it degrades to null on the wire.
            Value::Missing | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            // Integral numbers stay integers on the wire.
            Value::Number(n) if n.fract() == 0.0 && n.abs() <= i64::MAX as f64 => {
                serde_json::Value::Number((*n as i64).into())
            }
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(a) => serde_json::Value::Array(a.iter().map(Into::into).collect()),
            Value::Object(o) => serde_json::Value::Object(
                o.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            ),
            Value::Binary(b) => serde_json::Value::String(base64_encode(b)),
        }
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_json::Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer).map_err(D::Error::custom)?;
        Ok(Value::from(raw))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_is_not_null() {
        assert_ne!(Value::Missing, Value::Null);
        assert_eq!(Value::Missing.equals(&Value::Null), Value::Missing);
        assert_eq!(Value::Null.equals(&Value::Null), Value::Null);
    }

    #[test]
    fn equality_is_three_valued() {
        let one = Value::from(1.0);
        assert_eq!(one.equals(&Value::from(1.0)), Value::TRUE);
        assert_eq!(one.equals(&Value::from(2.0)), Value::FALSE);
        assert_eq!(one.equals(&Value::Missing), Value::Missing);
        assert_eq!(one.equals(&Value::Null), Value::Null);
    }

    #[test]
    fn collation_order_by_type() {
        let ordered = [
            Value::Missing,
            Value::Null,
            Value::FALSE,
            Value::TRUE,
            Value::from(-1.5),
            Value::from("a"),
            Value::Array(vec![]),
            Value::Object(BTreeMap::new()),
            Value::Binary(vec![0]),
        ];
        for w in ordered.windows(2) {
            assert_eq!(w[0].collate(&w[1]), Ordering::Less, "{:?} < {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn field_access_degrades_to_missing() {
        let doc = Value::object([("a", Value::from(1.0))]);
        assert_eq!(doc.field("a"), Value::from(1.0));
        assert_eq!(doc.field("b"), Value::Missing);
        assert_eq!(Value::Null.field("a"), Value::Missing);
    }

    #[test]
    fn json_round_trip() {
        let doc = Value::object([
            ("id", Value::from("k1")),
            ("n", Value::from(3.5)),
            ("tags", Value::Array(vec![Value::from("x"), Value::Null])),
        ]);
        let text = serde_json::to_string(&doc).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc, back);
    }
}
