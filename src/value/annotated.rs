//! Values carrying side-band attachments used by the execution pipeline.

use std::collections::HashMap;

use super::Value;

/// A [`Value`] extended with an attachment map and a producer bit.
///
/// Attachments carry metadata that must travel with an item without being
/// part of the document itself; the `meta` attachment holds the primary key
/// under `id`. The bit identifies which child of an intersect or union scan
/// produced the item.
#[derive(Clone, Debug)]
pub struct AnnotatedValue {
    value: Value,
    attachments: HashMap<String, Value>,
    bit: u8,
}

impl AnnotatedValue {
    /// Wraps a plain value with no attachments.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            attachments: HashMap::new(),
            bit: 0,
        }
    }

    /// Wraps a value and records its primary key under the `meta` attachment.
    pub fn with_meta_id(value: Value, id: impl Into<String>) -> Self {
        let mut av = Self::new(value);
        av.set_attachment("meta", Value::object([("id", Value::String(id.into()))]));
        av
    }

    /// The wrapped value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consumes the wrapper, returning the inner value.
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Replaces the wrapped value, keeping attachments.
    pub fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    /// Installs an attachment, replacing any prior value under the name.
    pub fn set_attachment(&mut self, name: impl Into<String>, value: Value) {
        self.attachments.insert(name.into(), value);
    }

    /// Looks up an attachment by name.
    pub fn attachment(&self, name: &str) -> Option<&Value> {
        self.attachments.get(name)
    }

    /// Primary key recorded under `meta.id`, when present and a string.
    pub fn meta_id(&self) -> Option<&str> {
        match self.attachments.get("meta")? {
            Value::Object(meta) => meta.get("id")?.as_str(),
            _ => None,
        }
    }

    /// Producer bit set by multi-child scans.
    pub fn bit(&self) -> u8 {
        self.bit
    }

    /// Tags the item with its producer's bit.
    pub fn set_bit(&mut self, bit: u8) {
        self.bit = bit;
    }
}

impl From<Value> for AnnotatedValue {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_id_reads_through_attachment() {
        let item = AnnotatedValue::with_meta_id(Value::Null, "k42");
        assert_eq!(item.meta_id(), Some("k42"));
        assert_eq!(AnnotatedValue::new(Value::Null).meta_id(), None);
    }

    #[test]
    fn bit_round_trips() {
        let mut item = AnnotatedValue::new(Value::Null);
        item.set_bit(7);
        assert_eq!(item.bit(), 7);
    }
}
