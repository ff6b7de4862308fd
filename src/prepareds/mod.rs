//! Prepared-statement cache: named plan storage with LRU eviction,
//! metadata re-checking, transparent reprepare, and cluster distribution.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};
use uuid::Uuid;

use crate::algebra::{Parser, Statement};
use crate::config::FeatureControls;
use crate::datastore::Datastore;
use crate::errors::{Error, Result};
use crate::plan::Prepared;
use crate::planner::{build_prepared, PlanCache};
use crate::value::Value;

mod cache;
mod distribute;

pub use cache::{CacheEntry, Op, PreparedLru};
pub use distribute::{make_key, split_key, InProcessRemote, NoRemote, Remote};

/// Track the lookup in the entry's usage accounting and promote it.
pub const OPT_TRACK: u32 = 1 << 0;
/// Fall back to the named peer when the plan is not cached locally.
pub const OPT_REMOTE: u32 = 1 << 1;
/// Verify the plan against live metadata before returning it.
pub const OPT_VERIFY: u32 = 1 << 2;
/// Metadata check only: never run the expensive re-resolution or a
/// reprepare.
pub const OPT_METACHECK: u32 = 1 << 3;

/// The prepared-statement cache and its collaborators.
pub struct Prepareds {
    cache: PreparedLru,
    datastore: Arc<dyn Datastore>,
    parser: Arc<dyn Parser>,
    remote: Arc<dyn Remote>,
    namespace: String,
    index_api_version: u32,
    feature_controls: FeatureControls,
}

impl Prepareds {
    /// Builds the cache with its collaborators.
    pub fn new(
        limit: usize,
        datastore: Arc<dyn Datastore>,
        parser: Arc<dyn Parser>,
        remote: Arc<dyn Remote>,
        namespace: impl Into<String>,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> Self {
        Self {
            cache: PreparedLru::new(limit),
            datastore,
            parser,
            remote,
            namespace: namespace.into(),
            index_api_version,
            feature_controls,
        }
    }

    /// Cache capacity.
    pub fn limit(&self) -> usize {
        self.cache.limit()
    }

    /// Changes the capacity at runtime; shrinking evicts from the LRU end.
    pub fn set_limit(&self, limit: usize) {
        self.cache.set_limit(limit);
    }

    /// Number of cached plans.
    pub fn count(&self) -> usize {
        self.cache.size()
    }

    /// Cached plan names.
    pub fn names(&self) -> Vec<String> {
        self.cache.names()
    }

    /// Visits entries for the system keyspaces; the callback returns false
    /// to stop early.
    pub fn for_each(&self, f: impl FnMut(&str, &CacheEntry) -> bool) {
        self.cache.for_each(f);
    }

    /// Runs a callback against one entry without promoting it.
    pub fn entry_do(&self, name: &str, f: impl FnOnce(&CacheEntry)) {
        if let Some(entry) = self.cache.get(name) {
            f(&entry);
        }
    }

    /// Inserts a plan. An existing entry with the same text is replaced
    /// atomically and marked unpopulated; different text is a duplicate
    /// name. Successful inserts broadcast to peers.
    pub fn add_prepared(&self, prepared: Arc<Prepared>) -> Result<()> {
        let mut added = true;
        self.cache
            .add(Arc::clone(&prepared), false, false, |existing| {
                if existing.prepared().text != prepared.text {
                    added = false;
                    Op::Ignore
                } else {
                    Op::Amend
                }
            });
        if !added {
            return Err(Error::duplicate_name(&prepared.name));
        }
        distribute::distribute_prepared(&self.remote, &prepared.name, &prepared.encoded_plan);
        Ok(())
    }

    /// Removes a plan by name.
    pub fn delete_prepared(&self, name: &str) -> Result<()> {
        if self.cache.delete(name) {
            Ok(())
        } else {
            Err(Error::no_such_prepared(name))
        }
    }

    /// Resolves a prepared reference: a name string (optionally
    /// `host::name`), or a decoded plan object.
    pub fn get_prepared(&self, reference: &Value, options: u32) -> Result<Arc<Prepared>> {
        let track = options & OPT_TRACK != 0;
        let remote_ok = options & OPT_REMOTE != 0;
        let verify = options & (OPT_VERIFY | OPT_METACHECK) != 0;
        let metacheck = options & OPT_METACHECK != 0;

        match reference {
            Value::String(key) => {
                let (host, name) = split_key(key);
                let entry = if track {
                    self.cache.use_entry(name)
                } else {
                    self.cache.get(name)
                };
                let mut prepared = entry.as_ref().map(|e| e.prepared());

                if prepared.is_none()
                    && remote_ok
                    && !host.is_empty()
                    && host != self.remote.who_am_i()
                {
                    match self.remote.fetch_prepared(host, name) {
                        Ok(encoded) => {
                            // The fetched plan is returned without caching;
                            // the caller decides whether to keep it.
                            prepared = Some(self.decode_transient(name, &encoded)?);
                        }
                        Err(warn) => {
                            info!(%host, %name, %warn, "remote prepared fetch failed");
                        }
                    }
                } else if let (Some(current), Some(entry), true) =
                    (prepared.as_ref(), entry.as_ref(), verify)
                {
                    let good = self.check_entry(current, entry, metacheck);
                    if !good && !metacheck {
                        // Concurrent repreparing of the same entry is
                        // accepted; inserts are last-writer-wins rather than
                        // blocking the whole cache line.
                        let fresh = Arc::new(self.reprepare(current)?);
                        self.add_prepared(Arc::clone(&fresh))?;
                        prepared = Some(fresh);
                    }
                }

                prepared.ok_or_else(|| Error::no_such_prepared(name))
            }
            Value::Object(fields) => {
                // A decoded prepared bypasses the cache; an embedded name
                // is tried first.
                if let Some(Value::String(name)) = fields.get("name") {
                    let entry = if track {
                        self.cache.use_entry(name)
                    } else {
                        self.cache.get(name)
                    };
                    if let Some(entry) = entry {
                        return Ok(entry.prepared());
                    }
                }
                let raw = serde_json::to_vec(reference).map_err(|e| {
                    Error::UnrecognizedPrepared {
                        reason: e.to_string(),
                    }
                })?;
                self.unmarshal_prepared(&raw).map(Arc::new)
            }
            other => Err(Error::UnrecognizedPrepared {
                reason: format!("invalid prepared reference of type {}", other.type_of()),
            }),
        }
    }

    /// Populated fast path and slow path of the verification dance.
    fn check_entry(&self, prepared: &Arc<Prepared>, entry: &CacheEntry, metacheck: bool) -> bool {
        let ds = self.datastore.as_ref();
        if entry.populated() {
            // Checking and repopulating without the entry lock is fine: the
            // plan tree cannot change, so the worst case is two requests
            // refreshing the same counters.
            let mut good = prepared.metadata_check(ds, &entry.versions());
            if !good && !metacheck {
                good = prepared.verify(ds);
                if good {
                    if let Ok(versions) = prepared.current_versions(ds) {
                        entry.refresh_versions(versions);
                    }
                }
            }
            good
        } else {
            let _guard = entry.populate_lock().lock();
            // Somebody might have populated in the interim.
            if entry.populated() {
                return true;
            }
            let good = prepared.verify(ds);
            if good {
                if let Ok(versions) = prepared.current_versions(ds) {
                    entry.refresh_versions(versions);
                }
                entry.set_populated();
            }
            good
        }
    }

    /// Decodes an encoded plan, verifies it against metadata (repreparing
    /// when stale), inserts it, and optionally broadcasts it.
    pub fn decode_prepared(
        &self,
        declared_name: &str,
        encoded: &str,
        track: bool,
        distribute: bool,
    ) -> Result<Arc<Prepared>> {
        let raw = Prepared::decode_raw(encoded)?;
        let mut prepared = self.unmarshal_prepared(&raw)?;
        prepared.encoded_plan = encoded.to_owned();

        // The encoded plan must match the name it was submitted under.
        if !prepared.name.is_empty()
            && !declared_name.is_empty()
            && declared_name != prepared.name
        {
            return Err(Error::EncodingNameMismatch {
                name: declared_name.to_owned(),
            });
        }
        if prepared.name.is_empty() {
            return Ok(Arc::new(prepared));
        }

        // Nothing strangers give us is trusted: check the plan and
        // repopulate metadata counters, repreparing if it is no good.
        let good = prepared.verify(self.datastore.as_ref());
        if good {
            prepared.snapshot_versions(self.datastore.as_ref())?;
        } else {
            prepared = self.reprepare(&prepared)?;
        }

        let shared = Arc::new(prepared);
        let mut added = true;
        self.cache.add(Arc::clone(&shared), good, track, |existing| {
            // An existing entry must hold the same statement text; plan
            // conflicts resolve in favour of the new plan.
            if existing.prepared().text != shared.text {
                added = false;
                Op::Ignore
            } else {
                Op::Amend
            }
        });
        if !added {
            return Err(Error::PreparedEncodingMismatch {
                name: declared_name.to_owned(),
            });
        }
        if distribute {
            distribute::distribute_prepared(&self.remote, &shared.name, &shared.encoded_plan);
        }
        Ok(shared)
    }

    /// Decode for remote fallback: verified or reprepared, never cached.
    fn decode_transient(&self, declared_name: &str, encoded: &str) -> Result<Arc<Prepared>> {
        let raw = Prepared::decode_raw(encoded)?;
        let mut prepared = self.unmarshal_prepared(&raw)?;
        prepared.encoded_plan = encoded.to_owned();
        if !prepared.name.is_empty()
            && !declared_name.is_empty()
            && declared_name != prepared.name
        {
            return Err(Error::EncodingNameMismatch {
                name: declared_name.to_owned(),
            });
        }
        if !prepared.verify(self.datastore.as_ref()) {
            prepared = self.reprepare(&prepared)?;
        }
        Ok(Arc::new(prepared))
    }

    /// Unmarshals a prepared JSON document. When full unmarshalling fails
    /// but the statement text is recoverable, the plan is rebuilt from
    /// scratch.
    fn unmarshal_prepared(&self, raw: &[u8]) -> Result<Prepared> {
        match serde_json::from_slice::<Prepared>(raw) {
            Ok(prepared) => Ok(prepared),
            Err(err) => {
                if let Some(text) = Prepared::text_of_raw(raw) {
                    let mut stub = Prepared::new(
                        "",
                        text,
                        "",
                        crate::plan::Operator::Sequence { children: vec![] },
                        self.index_api_version,
                        self.feature_controls,
                    );
                    stub.namespace = self.namespace.clone();
                    if let Ok(rebuilt) = self.reprepare(&stub) {
                        return Ok(rebuilt);
                    }
                }
                Err(Error::UnrecognizedPrepared {
                    reason: format!("JSON unmarshalling error: {err}"),
                })
            }
        }
    }

    /// Re-parses and re-plans a stale prepared statement, preserving its
    /// identity (name, text, type, index API version, feature controls).
    fn reprepare(&self, prepared: &Prepared) -> Result<Prepared> {
        let stmt = self
            .parser
            .parse(&prepared.text)
            .map_err(|e| Error::Reprepare {
                reason: e.to_string(),
            })?;
        // This parsed before, so semantics need no second check.
        let mut inner = match stmt {
            Statement::Prepare { statement, .. } => *statement,
            other => other,
        };
        inner.formalize().map_err(|e| Error::Reprepare {
            reason: e.to_string(),
        })?;
        let namespace = if prepared.namespace.is_empty() {
            self.namespace.clone()
        } else {
            prepared.namespace.clone()
        };
        let mut rebuilt = build_prepared(
            &inner,
            &prepared.name,
            &prepared.text,
            self.datastore.as_ref(),
            &namespace,
            prepared.index_api_version,
            FeatureControls(prepared.feature_controls),
        )
        .map_err(|e| Error::Reprepare {
            reason: e.to_string(),
        })?;
        if !prepared.stmt_type.is_empty() {
            rebuilt.stmt_type = prepared.stmt_type.clone();
        }
        debug!(name = %prepared.name, "reprepared stale statement");
        Ok(rebuilt)
    }

    /// PREPARE entry point: reuses a still-valid cached plan unless FORCE
    /// was given, otherwise plans and inserts.
    pub fn prepare(
        &self,
        name: Option<&str>,
        force: bool,
        statement: &Statement,
        text: &str,
    ) -> Result<Arc<Prepared>> {
        let name = match name {
            Some(n) => n.to_owned(),
            None => self.get_name(text, self.index_api_version, self.feature_controls)?,
        };
        if !force {
            if let Some(existing) =
                self.get_plan(&name, text, self.index_api_version, self.feature_controls)?
            {
                return Ok(existing);
            }
        }
        let prepared = Arc::new(build_prepared(
            statement,
            &name,
            text,
            self.datastore.as_ref(),
            &self.namespace,
            self.index_api_version,
            self.feature_controls,
        )?);
        self.add_prepared(Arc::clone(&prepared))?;
        Ok(prepared)
    }

    /// Deterministic auto-prepare name: UUIDv5 over a realm derived from
    /// the index API version and feature controls, so the same text under
    /// different engine settings gets distinct cache entries.
    pub fn auto_prepare_name(
        text: &str,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> String {
        let realm = format!("{:x}_{:x}", index_api_version, feature_controls.0);
        let ns = Uuid::new_v5(&Uuid::NAMESPACE_URL, realm.as_bytes());
        Uuid::new_v5(&ns, text.as_bytes()).to_string()
    }

    /// Fetches an auto-prepared plan. Auto-prepared plans are never
    /// verified or reprepared, only metadata-checked: a stale plan means
    /// the caller should plan again, which refreshes the cache entry.
    pub fn get_auto_prepare_plan(
        &self,
        name: &str,
        text: &str,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> Option<Arc<Prepared>> {
        let reference = Value::String(name.to_owned());
        let prepared = match self.get_prepared(&reference, OPT_TRACK | OPT_METACHECK) {
            Ok(p) => p,
            Err(err) => {
                if err.code() != 4040 {
                    info!(%err, "auto prepare plan fetching failed");
                }
                return None;
            }
        };
        if prepared.text != text {
            info!(%name, "auto prepare found mismatching name and statement");
            return None;
        }
        if prepared.index_api_version != index_api_version
            || prepared.feature_controls != feature_controls.0
        {
            return None;
        }
        Some(prepared)
    }

    /// Caches a plan under its auto-prepare name. Statements that cannot
    /// be auto-prepared (EXPLAIN, EXECUTE, PREPARE, parameterised) are
    /// skipped.
    pub fn add_auto_prepare_plan(&self, stmt: &Statement, prepared: Arc<Prepared>) -> bool {
        match stmt.type_name() {
            "EXPLAIN" | "EXECUTE" | "PREPARE" => return false,
            _ => {}
        }
        // Anything depending on placeholders is not cached; prepared
        // statements exist for that.
        if stmt.params() > 0 {
            return false;
        }
        let mut added = true;
        self.cache
            .add(Arc::clone(&prepared), false, true, |existing| {
                added = existing.prepared().text == prepared.text;
                if !added {
                    info!(
                        name = %prepared.name,
                        "auto prepare found mismatching name and statement"
                    );
                    Op::Ignore
                } else {
                    Op::Amend
                }
            });
        added
    }

    /// Adds one request's timings to a plan's entry. The lookup does not
    /// promote: tracked fetches already moved the entry to the MRU end.
    pub fn record_prepared_metrics(
        &self,
        prepared: &Prepared,
        request_time: Duration,
        service_time: Duration,
    ) {
        if prepared.name.is_empty() {
            return;
        }
        if let Some(entry) = self.cache.get(&prepared.name) {
            entry.record_metrics(request_time.as_nanos() as u64, service_time.as_nanos() as u64);
        }
    }

    /// Primes the cache from peers at start-up: peers are tried in random
    /// order without replacement until one yields at least one import.
    pub fn remote_prime(&self) {
        let this_host = self.remote.who_am_i();
        if this_host.is_empty() {
            return;
        }
        let mut hosts = self.remote.node_names();
        let mut rng = rand::thread_rng();
        while !hosts.is_empty() {
            let host = hosts.swap_remove(rng.gen_range(0..hosts.len()));
            if host == this_host {
                continue;
            }
            let mut count = 0;
            let keys = match self.remote.fetch_keys(&host) {
                Ok(keys) => keys,
                Err(_) => continue,
            };
            for name in keys {
                let Ok(encoded) = self.remote.fetch_prepared(&host, &name) else {
                    continue;
                };
                if self.decode_prepared(&name, &encoded, false, false).is_ok() {
                    count += 1;
                }
            }
            // Found stuff; that is good enough.
            if count > 0 {
                break;
            }
        }
    }
}

impl PlanCache for Prepareds {
    fn get_text(&self, text: &str, prefix_len: usize) -> String {
        // A FORCE keyword in the prepare prefix must not make the statement
        // read as different text.
        let prefix_len = prefix_len.min(text.len());
        let prefix = &text[..prefix_len];
        match prefix.to_uppercase().find("FORCE") {
            Some(i) => {
                let mut out = String::with_capacity(text.len());
                out.push_str(&prefix[..i]);
                out.push_str(&prefix[(i + 6).min(prefix.len())..]);
                out.push_str(&text[prefix_len..]);
                out
            }
            None => text.to_owned(),
        }
    }

    fn get_name(
        &self,
        text: &str,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> Result<String> {
        // Realm-qualified deterministic names are behind a feature control;
        // the default is a random name per prepare.
        if feature_controls.has(FeatureControls::AUTO_PREPARE_REALM) {
            Ok(Self::auto_prepare_name(
                text,
                index_api_version,
                feature_controls,
            ))
        } else {
            Ok(Uuid::new_v4().to_string())
        }
    }

    fn get_plan(
        &self,
        name: &str,
        text: &str,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> Result<Option<Arc<Prepared>>> {
        let reference = Value::String(name.to_owned());
        let prepared = match self.get_prepared(&reference, OPT_VERIFY) {
            Ok(p) => p,
            Err(err) if err.code() == 4040 => return Ok(None),
            Err(err) => return Err(err),
        };
        if prepared.index_api_version != index_api_version
            || prepared.feature_controls != feature_controls.0
            || prepared.text != text
        {
            return Ok(None);
        }
        Ok(Some(prepared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Keyspace;
    use crate::algebra::{KeyspaceTerm, Projection, Select};
    use crate::datastore::memory::MemDatastore;
    use crate::expression::Expr;

    /// Toy parser for reprepare: parses `SELECT * FROM <keyspace>`.
    struct StubParser;

    impl Parser for StubParser {
        fn parse(&self, text: &str) -> Result<Statement> {
            let keyspace = text
                .rsplit(' ')
                .next()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::Semantics {
                    reason: "empty statement".into(),
                })?;
            Ok(Statement::Select(Select::simple(
                KeyspaceTerm::new("default", keyspace, None),
                None,
                Projection::star(),
            )))
        }
    }

    fn datastore() -> Arc<MemDatastore> {
        let store = Arc::new(MemDatastore::new());
        let ks = store.keyspace_or_create("default", "orders");
        ks.upsert(&[("k1".into(), Value::object([("n", Value::from(1.0))]))])
            .unwrap();
        ks.create_primary_index("#primary");
        let other = store.keyspace_or_create("default", "other");
        other
            .upsert(&[("k1".into(), Value::object([("n", Value::from(1.0))]))])
            .unwrap();
        other.create_primary_index("#primary");
        store
    }

    fn prepareds(store: Arc<MemDatastore>) -> Prepareds {
        Prepareds::new(
            16,
            store,
            Arc::new(StubParser),
            Arc::new(NoRemote),
            "default",
            4,
            FeatureControls::default(),
        )
    }

    fn build(store: &MemDatastore, name: &str, text: &str) -> Arc<Prepared> {
        let mut stmt = StubParser.parse(text).unwrap();
        stmt.formalize().unwrap();
        Arc::new(
            build_prepared(
                &stmt,
                name,
                text,
                store,
                "default",
                4,
                FeatureControls::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn add_get_delete_round_trip() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        let p = build(&store, "p1", "SELECT * FROM orders");
        cache.add_prepared(Arc::clone(&p)).unwrap();

        let got = cache
            .get_prepared(&Value::String("p1".into()), 0)
            .unwrap();
        assert_eq!(got.text, p.text);

        cache.delete_prepared("p1").unwrap();
        let err = cache
            .get_prepared(&Value::String("p1".into()), 0)
            .unwrap_err();
        assert_eq!(err.code(), 4040);
        assert_eq!(cache.delete_prepared("p1").unwrap_err().code(), 4040);
    }

    #[test]
    fn duplicate_name_with_different_text_is_rejected() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        cache
            .add_prepared(build(&store, "p1", "SELECT * FROM orders"))
            .unwrap();
        // Same text replaces.
        cache
            .add_prepared(build(&store, "p1", "SELECT * FROM orders"))
            .unwrap();
        // Different text is a duplicate.
        let err = cache
            .add_prepared(build(&store, "p1", "SELECT * FROM other"))
            .unwrap_err();
        assert_eq!(err.code(), 4060);
        assert!(err.to_string().contains("duplicate name: p1"));
    }

    #[test]
    fn decode_prepared_checks_the_declared_name() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        let p = build(&store, "y", "SELECT * FROM orders");
        let err = cache
            .decode_prepared("x", &p.encoded_plan, false, false)
            .unwrap_err();
        assert_eq!(err.code(), 4080);
    }

    #[test]
    fn decode_prepared_inserts_verified_plans() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        let p = build(&store, "p1", "SELECT * FROM orders");
        let decoded = cache
            .decode_prepared("p1", &p.encoded_plan, false, false)
            .unwrap();
        assert_eq!(decoded.name, "p1");
        assert_eq!(cache.count(), 1);
        let entry = cache.cache.get("p1").unwrap();
        assert!(entry.populated());
    }

    #[test]
    fn verify_reprepares_after_metadata_drift() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        let p = build(&store, "p1", "SELECT * FROM orders");
        cache.add_prepared(p).unwrap();

        // First verified fetch populates the entry.
        cache
            .get_prepared(&Value::String("p1".into()), OPT_VERIFY)
            .unwrap();
        assert!(cache.cache.get("p1").unwrap().populated());

        // Replace the primary index under a new name: the cached plan's
        // index no longer resolves, so verification fails outright.
        let ks = store.keyspace_or_create("default", "orders");
        ks.drop_index("#primary");
        ks.create_primary_index("#primary2");

        let got = cache
            .get_prepared(&Value::String("p1".into()), OPT_VERIFY)
            .unwrap();
        assert_eq!(got.text, "SELECT * FROM orders");
        // The reprepared plan uses the replacement index and landed back in
        // the cache, last writer wins.
        let json = serde_json::to_string(&got.operator).unwrap();
        assert!(json.contains("#primary2"));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn metadata_drift_with_surviving_index_refreshes_without_reprepare() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        let p = build(&store, "p1", "SELECT * FROM orders");
        cache.add_prepared(Arc::clone(&p)).unwrap();
        cache
            .get_prepared(&Value::String("p1".into()), OPT_VERIFY)
            .unwrap();

        // Bump versions without invalidating any reference: the cheap check
        // fails, the expensive one succeeds, and the same plan survives.
        let ks = store.keyspace_or_create("default", "orders");
        ks.create_index("ix_extra", vec![Expr::field(["x"])]);

        let got = cache
            .get_prepared(&Value::String("p1".into()), OPT_VERIFY)
            .unwrap();
        assert!(Arc::ptr_eq(&got, &p));
    }

    #[test]
    fn metacheck_never_reprepares() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        cache
            .add_prepared(build(&store, "p1", "SELECT * FROM orders"))
            .unwrap();
        cache
            .get_prepared(&Value::String("p1".into()), OPT_VERIFY)
            .unwrap();

        let ks = store.keyspace_or_create("default", "orders");
        ks.drop_index("#primary");

        // Metacheck sees the drift but must not replan (which would fail
        // now that the primary index is gone).
        let got = cache.get_prepared(&Value::String("p1".into()), OPT_TRACK | OPT_METACHECK);
        assert!(got.is_ok());
    }

    #[test]
    fn auto_prepare_name_is_deterministic_per_realm() {
        let fc = FeatureControls::default();
        let a = Prepareds::auto_prepare_name("SELECT 1", 4, fc);
        let b = Prepareds::auto_prepare_name("SELECT 1", 4, fc);
        assert_eq!(a, b);
        let c = Prepareds::auto_prepare_name("SELECT 1", 5, fc);
        assert_ne!(a, c);
        let d = Prepareds::auto_prepare_name("SELECT 1", 4, FeatureControls(1));
        assert_ne!(a, d);
    }

    #[test]
    fn auto_prepare_skips_non_cacheable_statements() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        let p = build(&store, "auto1", "SELECT * FROM orders");

        let explain = Statement::Explain(Box::new(StubParser.parse("SELECT * FROM orders").unwrap()));
        assert!(!cache.add_auto_prepare_plan(&explain, Arc::clone(&p)));

        let stmt = StubParser.parse("SELECT * FROM orders").unwrap();
        assert!(cache.add_auto_prepare_plan(&stmt, p));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn force_text_stripping() {
        let store = datastore();
        let cache = prepareds(store);
        let text = "PREPARE p1 FORCE AS SELECT 1";
        let stripped = cache.get_text(text, "PREPARE p1 FORCE AS ".len());
        assert_eq!(stripped, "PREPARE p1 AS SELECT 1");
        let unchanged = cache.get_text("PREPARE p1 AS SELECT 1", "PREPARE p1 AS ".len());
        assert_eq!(unchanged, "PREPARE p1 AS SELECT 1");
    }

    #[test]
    fn prepare_reuses_cached_plan_unless_forced() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        let mut stmt = StubParser.parse("SELECT * FROM orders").unwrap();
        stmt.formalize().unwrap();

        let first = cache
            .prepare(Some("p1"), false, &stmt, "SELECT * FROM orders")
            .unwrap();
        let second = cache
            .prepare(Some("p1"), false, &stmt, "SELECT * FROM orders")
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let err = cache
            .prepare(Some("p1"), false, &stmt, "SELECT * FROM elsewhere")
            .unwrap_err();
        assert_eq!(err.code(), 4060);
    }

    #[test]
    fn remote_prime_imports_from_a_peer() {
        let shared = InProcessRemote::shared_store();
        let store = datastore();
        let p = build(&store, "p1", "SELECT * FROM orders");

        // Seed node n2's store with the encoded plan.
        shared
            .lock()
            .entry("n2".to_owned())
            .or_default()
            .insert("p1".to_owned(), p.encoded_plan.clone());

        let cache = Prepareds::new(
            16,
            Arc::clone(&store) as Arc<dyn Datastore>,
            Arc::new(StubParser),
            Arc::new(InProcessRemote::new("n1", shared)),
            "default",
            4,
            FeatureControls::default(),
        );
        cache.remote_prime();
        assert_eq!(cache.count(), 1);
        assert!(cache
            .get_prepared(&Value::String("p1".into()), 0)
            .is_ok());
    }

    #[test]
    fn remote_fallback_resolves_host_prefixed_names() {
        let shared = InProcessRemote::shared_store();
        let store = datastore();
        let p = build(&store, "p9", "SELECT * FROM orders");
        shared
            .lock()
            .entry("n2".to_owned())
            .or_default()
            .insert("p9".to_owned(), p.encoded_plan.clone());

        let cache = Prepareds::new(
            16,
            Arc::clone(&store) as Arc<dyn Datastore>,
            Arc::new(StubParser),
            Arc::new(InProcessRemote::new("n1", shared)),
            "default",
            4,
            FeatureControls::default(),
        );
        let got = cache
            .get_prepared(&Value::String("n2::p9".into()), OPT_REMOTE)
            .unwrap();
        assert_eq!(got.name, "p9");
        // The remote fetch is not cached automatically.
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn object_reference_bypasses_the_cache() {
        let store = datastore();
        let cache = prepareds(Arc::clone(&store));
        let p = build(&store, "p1", "SELECT * FROM orders");
        let object: Value =
            serde_json::from_str::<serde_json::Value>(&serde_json::to_string(&*p).unwrap())
                .unwrap()
                .into();
        let got = cache.get_prepared(&object, 0).unwrap();
        assert_eq!(got.name, "p1");
        assert_eq!(cache.count(), 0);
    }
}
