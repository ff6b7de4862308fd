//! In-memory datastore used by tests, examples, and single-node
//! deployments without a backing store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::{Error, Result};
use crate::expression::{Expr, SimpleContext};
use crate::value::Value;

use super::{
    Datastore, Index, IndexItem, IndexState, Keyspace, ScanSink, ValueSpan,
};

/// In-memory index over a [`MemKeyspace`].
pub struct MemIndex {
    name: String,
    primary: bool,
    state: RwLock<IndexState>,
    keys: Vec<Expr>,
    version: AtomicU64,
    docs: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MemIndex {
    /// Flips the index state, bumping its metadata version.
    pub fn set_state(&self, state: IndexState) {
        *self.state.write() = state;
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Bumps the metadata version without changing anything else, standing
    /// in for an index rebuild.
    pub fn touch(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn entries(&self) -> Vec<(Vec<Value>, String)> {
        let ctx = SimpleContext::default();
        let docs = self.docs.read();
        let mut out = Vec::new();
        for (key, doc) in docs.iter() {
            if self.primary {
                out.push((vec![Value::String(key.clone())], key.clone()));
                continue;
            }
            let mut entry = Vec::with_capacity(self.keys.len());
            let mut indexable = true;
            for key_expr in &self.keys {
                // Index keys are document-rooted expressions.
                match key_expr.evaluate(doc, &ctx) {
                    Ok(Value::Missing) => {
                        indexable = false;
                        break;
                    }
                    Ok(v) => entry.push(v),
                    Err(_) => {
                        indexable = false;
                        break;
                    }
                }
            }
            if indexable {
                out.push((entry, key.clone()));
            }
        }
        out.sort_by(|(a, ka), (b, kb)| {
            super::compare_composite(a, b).then_with(|| ka.cmp(kb))
        });
        out
    }
}

impl Index for MemIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_primary(&self) -> bool {
        self.primary
    }

    fn state(&self) -> IndexState {
        *self.state.read()
    }

    fn keys(&self) -> Vec<Expr> {
        self.keys.clone()
    }

    fn metadata_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn scan(&self, spans: &[ValueSpan], limit: Option<u64>, sink: &ScanSink<'_>) -> Result<()> {
        let mut sent = 0u64;
        for (entry, key) in self.entries() {
            let matched = spans.is_empty() || spans.iter().any(|s| s.contains(&entry));
            if !matched {
                continue;
            }
            if !sink.send(IndexItem {
                primary_key: key,
                entry_values: entry,
            }) {
                break;
            }
            sent += 1;
            if let Some(limit) = limit {
                if sent >= limit {
                    break;
                }
            }
        }
        Ok(())
    }
}

/// In-memory keyspace: a sorted map of documents plus its indexes.
pub struct MemKeyspace {
    namespace: String,
    name: String,
    docs: Arc<RwLock<BTreeMap<String, Value>>>,
    indexes: RwLock<Vec<Arc<MemIndex>>>,
    version: AtomicU64,
}

impl MemKeyspace {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            docs: Arc::new(RwLock::new(BTreeMap::new())),
            indexes: RwLock::new(Vec::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Defines a primary index. Index DDL bumps the keyspace version.
    pub fn create_primary_index(&self, name: &str) -> Arc<MemIndex> {
        self.create_index_inner(name, true, Vec::new())
    }

    /// Defines a secondary index over document-rooted key expressions.
    pub fn create_index(&self, name: &str, keys: Vec<Expr>) -> Arc<MemIndex> {
        self.create_index_inner(name, false, keys)
    }

    fn create_index_inner(&self, name: &str, primary: bool, keys: Vec<Expr>) -> Arc<MemIndex> {
        let index = Arc::new(MemIndex {
            name: name.to_owned(),
            primary,
            state: RwLock::new(IndexState::Online),
            keys,
            version: AtomicU64::new(0),
            docs: Arc::clone(&self.docs),
        });
        self.indexes.write().push(Arc::clone(&index));
        self.version.fetch_add(1, Ordering::SeqCst);
        index
    }

    /// Drops an index by name.
    pub fn drop_index(&self, name: &str) {
        self.indexes.write().retain(|ix| ix.name() != name);
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

impl Keyspace for MemKeyspace {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn metadata_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn fetch(&self, keys: &[String]) -> Result<Vec<(String, Value)>> {
        let docs = self.docs.read();
        Ok(keys
            .iter()
            .filter_map(|k| docs.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn insert(&self, pairs: &[(String, Value)]) -> Result<u64> {
        let mut docs = self.docs.write();
        for (k, _) in pairs {
            if docs.contains_key(k) {
                return Err(Error::Datastore {
                    reason: format!("duplicate key: {k}"),
                });
            }
        }
        for (k, v) in pairs {
            docs.insert(k.clone(), v.clone());
        }
        Ok(pairs.len() as u64)
    }

    fn upsert(&self, pairs: &[(String, Value)]) -> Result<u64> {
        let mut docs = self.docs.write();
        for (k, v) in pairs {
            docs.insert(k.clone(), v.clone());
        }
        Ok(pairs.len() as u64)
    }

    fn update(&self, pairs: &[(String, Value)]) -> Result<u64> {
        let mut docs = self.docs.write();
        let mut n = 0;
        for (k, v) in pairs {
            if let Some(slot) = docs.get_mut(k) {
                *slot = v.clone();
                n += 1;
            }
        }
        Ok(n)
    }

    fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut docs = self.docs.write();
        let mut n = 0;
        for k in keys {
            if docs.remove(k).is_some() {
                n += 1;
            }
        }
        Ok(n)
    }

    fn indexes(&self) -> Result<Vec<Arc<dyn Index>>> {
        Ok(self
            .indexes
            .read()
            .iter()
            .map(|ix| Arc::clone(ix) as Arc<dyn Index>)
            .collect())
    }
}

/// In-memory datastore: namespaces of keyspaces, created on demand.
#[derive(Default)]
pub struct MemDatastore {
    keyspaces: RwLock<BTreeMap<(String, String), Arc<MemKeyspace>>>,
}

impl MemDatastore {
    /// Empty datastore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the keyspace, creating it if absent.
    pub fn keyspace_or_create(&self, namespace: &str, name: &str) -> Arc<MemKeyspace> {
        let key = (namespace.to_owned(), name.to_owned());
        if let Some(ks) = self.keyspaces.read().get(&key) {
            return Arc::clone(ks);
        }
        let mut map = self.keyspaces.write();
        Arc::clone(
            map.entry(key)
                .or_insert_with(|| Arc::new(MemKeyspace::new(namespace, name))),
        )
    }
}

impl Datastore for MemDatastore {
    fn keyspace(&self, namespace: &str, name: &str) -> Result<Arc<dyn Keyspace>> {
        let key = (namespace.to_owned(), name.to_owned());
        self.keyspaces
            .read()
            .get(&key)
            .map(|ks| Arc::clone(ks) as Arc<dyn Keyspace>)
            .ok_or_else(|| Error::Datastore {
                reason: format!("no such keyspace: {namespace}:{name}"),
            })
    }
}
