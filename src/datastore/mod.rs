//! Datastore collaborator traits.
//!
//! The engine never stores documents or builds indexes itself; it plans and
//! executes against these interfaces. Metadata carries monotonically
//! increasing version counters so cached plans can detect drift cheaply
//! ([`Index::metadata_version`], [`Keyspace::metadata_version`]) before
//! paying for full re-resolution.

use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use crate::errors::Result;
use crate::expression::Expr;
use crate::value::Value;

pub mod memory;

/// Span endpoint inclusion, low bit = low endpoint, high bit = high.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Inclusion {
    /// Both endpoints exclusive.
    #[default]
    Neither,
    /// Low endpoint inclusive.
    Low,
    /// High endpoint inclusive.
    High,
    /// Both endpoints inclusive.
    Both,
}

impl Inclusion {
    /// Whether the low endpoint is inclusive.
    pub fn includes_low(&self) -> bool {
        matches!(self, Inclusion::Low | Inclusion::Both)
    }

    /// Whether the high endpoint is inclusive.
    pub fn includes_high(&self) -> bool {
        matches!(self, Inclusion::High | Inclusion::Both)
    }
}

/// Evaluated scan range handed to an index. Empty bound vectors mean
/// unbounded on that side.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueSpan {
    /// Per-key low bounds.
    pub low: Vec<Value>,
    /// Per-key high bounds.
    pub high: Vec<Value>,
    /// Endpoint inclusion.
    pub inclusion: Inclusion,
}

impl ValueSpan {
    /// Unbounded span: every entry matches.
    pub fn full() -> Self {
        Self {
            low: Vec::new(),
            high: Vec::new(),
            inclusion: Inclusion::Neither,
        }
    }

    /// Whether a composite key value falls inside this span.
    pub fn contains(&self, key: &[Value]) -> bool {
        use std::cmp::Ordering;
        if !self.low.is_empty() {
            let ord = compare_composite(key, &self.low);
            if ord == Ordering::Less || (ord == Ordering::Equal && !self.inclusion.includes_low())
            {
                return false;
            }
        }
        if !self.high.is_empty() {
            let ord = compare_composite(key, &self.high);
            if ord == Ordering::Greater
                || (ord == Ordering::Equal && !self.inclusion.includes_high())
            {
                return false;
            }
        }
        true
    }
}

pub(crate) fn compare_composite(a: &[Value], b: &[Value]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let c = x.collate(y);
        if c != std::cmp::Ordering::Equal {
            return c;
        }
    }
    // A longer bound vector never decides containment on its own; treat the
    // shared prefix as the comparison.
    std::cmp::Ordering::Equal
}

/// One entry streamed from an index scan.
#[derive(Clone, Debug)]
pub struct IndexItem {
    /// Primary key of the matching document.
    pub primary_key: String,
    /// Index key values for the entry, used by covering scans.
    pub entry_values: Vec<Value>,
}

/// Receiver side of an index scan: a bounded channel plus a stop probe.
pub struct ScanSink<'a> {
    sender: SyncSender<IndexItem>,
    stopped: &'a dyn Fn() -> bool,
}

impl<'a> ScanSink<'a> {
    /// Builds a sink over a bounded channel.
    pub fn new(sender: SyncSender<IndexItem>, stopped: &'a dyn Fn() -> bool) -> Self {
        Self { sender, stopped }
    }

    /// Forwards one entry. Returns false when the scan should cease,
    /// either because the consumer hung up or the request stopped.
    pub fn send(&self, item: IndexItem) -> bool {
        if (self.stopped)() {
            return false;
        }
        self.sender.send(item).is_ok()
    }
}

/// Lifecycle state of an index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexState {
    /// Ready to serve scans.
    Online,
    /// Defined but unavailable.
    Offline,
    /// Still building.
    Building,
    /// Deferred build.
    Deferred,
}

/// A physical index over a keyspace.
pub trait Index: Send + Sync {
    /// Index name, unique within its keyspace.
    fn name(&self) -> &str;

    /// Whether this is a primary (whole-keyspace) index.
    fn is_primary(&self) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> IndexState;

    /// Key expressions, leading key first.
    fn keys(&self) -> Vec<Expr>;

    /// Partition key expressions, empty for unpartitioned indexes.
    fn partition_keys(&self) -> Vec<Expr> {
        Vec::new()
    }

    /// Partial-index condition, when any.
    fn condition(&self) -> Option<Expr> {
        None
    }

    /// Metadata version observed by plans; bumps on any index DDL.
    fn metadata_version(&self) -> u64;

    /// Streams matching entries into `sink` in index key order. `spans`
    /// restricts composite key ranges; `limit` caps emitted entries.
    fn scan(&self, spans: &[ValueSpan], limit: Option<u64>, sink: &ScanSink<'_>) -> Result<()>;
}

/// A named container of documents.
pub trait Keyspace: Send + Sync {
    /// Namespace holding the keyspace.
    fn namespace(&self) -> &str;

    /// Keyspace name.
    fn name(&self) -> &str;

    /// Metadata version; bumps on index DDL against this keyspace.
    fn metadata_version(&self) -> u64;

    /// Fetches documents by key; missing keys are silently skipped.
    fn fetch(&self, keys: &[String]) -> Result<Vec<(String, Value)>>;

    /// Inserts new documents; fails on an existing key.
    fn insert(&self, pairs: &[(String, Value)]) -> Result<u64>;

    /// Inserts or replaces documents.
    fn upsert(&self, pairs: &[(String, Value)]) -> Result<u64>;

    /// Replaces existing documents; missing keys are skipped.
    fn update(&self, pairs: &[(String, Value)]) -> Result<u64>;

    /// Deletes documents by key, returning how many existed.
    fn delete(&self, keys: &[String]) -> Result<u64>;

    /// All indexes on this keyspace.
    fn indexes(&self) -> Result<Vec<Arc<dyn Index>>>;

    /// Looks up one index by name.
    fn index_by_name(&self, name: &str) -> Result<Option<Arc<dyn Index>>> {
        Ok(self.indexes()?.into_iter().find(|ix| ix.name() == name))
    }
}

/// Top-level datastore handle.
pub trait Datastore: Send + Sync {
    /// Resolves a keyspace within a namespace.
    fn keyspace(&self, namespace: &str, name: &str) -> Result<Arc<dyn Keyspace>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inclusion_bits() {
        assert!(Inclusion::Both.includes_low());
        assert!(Inclusion::Both.includes_high());
        assert!(!Inclusion::Neither.includes_low());
        assert!(Inclusion::Low.includes_low());
        assert!(!Inclusion::Low.includes_high());
    }

    #[test]
    fn value_span_containment() {
        let span = ValueSpan {
            low: vec![Value::from(1.0)],
            high: vec![Value::from(5.0)],
            inclusion: Inclusion::Low,
        };
        assert!(span.contains(&[Value::from(1.0)]));
        assert!(span.contains(&[Value::from(3.0)]));
        assert!(!span.contains(&[Value::from(5.0)]));
        assert!(!span.contains(&[Value::from(0.0)]));
    }
}
