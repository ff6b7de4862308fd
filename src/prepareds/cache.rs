//! Bounded LRU cache of prepared-statement entries.
//!
//! Lookup comes in two flavours: [`PreparedLru::get`] peeks without
//! touching recency, [`PreparedLru::use_entry`] promotes to most recently
//! used and tracks the entry. The capacity is runtime-mutable; shrinking
//! evicts from the LRU end.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::plan::{MetadataVersion, Prepared};

/// Outcome of the existing-entry callback passed to [`PreparedLru::add`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Op {
    /// Replace the entry's plan, clearing its populated flag.
    Amend,
    /// Leave the existing entry untouched.
    Ignore,
}

/// One cached prepared statement plus its usage accounting.
///
/// Timing counters are plain atomics updated with `fetch_add`/`fetch_min`/
/// `fetch_max`; min counters start at `u64::MAX` and max counters at zero
/// so the first recorded sample always installs.
pub struct CacheEntry {
    prepared: RwLock<Arc<Prepared>>,
    versions: Mutex<Vec<MetadataVersion>>,
    last_use: RwLock<Option<SystemTime>>,
    uses: AtomicU32,
    service_time: AtomicU64,
    request_time: AtomicU64,
    min_service_time: AtomicU64,
    min_request_time: AtomicU64,
    max_service_time: AtomicU64,
    max_request_time: AtomicU64,
    populated: AtomicBool,
    /// Serialises the false→true populated transition.
    populate_lock: Mutex<()>,
}

impl CacheEntry {
    fn new(prepared: Arc<Prepared>, populated: bool, track: bool) -> Self {
        let versions = prepared.versions.clone();
        Self {
            prepared: RwLock::new(prepared),
            versions: Mutex::new(versions),
            last_use: RwLock::new(track.then(SystemTime::now)),
            uses: AtomicU32::new(track as u32),
            service_time: AtomicU64::new(0),
            request_time: AtomicU64::new(0),
            min_service_time: AtomicU64::new(u64::MAX),
            min_request_time: AtomicU64::new(u64::MAX),
            max_service_time: AtomicU64::new(0),
            max_request_time: AtomicU64::new(0),
            populated: AtomicBool::new(populated),
            populate_lock: Mutex::new(()),
        }
    }

    /// Current plan held by the entry.
    pub fn prepared(&self) -> Arc<Prepared> {
        Arc::clone(&self.prepared.read())
    }

    /// Swaps in a new plan, clearing the populated flag so the next
    /// verified use re-checks metadata.
    pub(super) fn amend(&self, prepared: Arc<Prepared>) {
        *self.versions.lock() = prepared.versions.clone();
        *self.prepared.write() = prepared;
        self.populated.store(false, Ordering::Release);
    }

    /// Metadata versions recorded when the plan was last verified.
    pub fn versions(&self) -> Vec<MetadataVersion> {
        self.versions.lock().clone()
    }

    /// Refreshes the recorded versions after a successful verify. Benign
    /// races between concurrent refreshers are accepted.
    pub(super) fn refresh_versions(&self, versions: Vec<MetadataVersion>) {
        *self.versions.lock() = versions;
    }

    /// Whether the plan has been verified against current metadata since
    /// the last amend.
    pub fn populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub(super) fn set_populated(&self) {
        self.populated.store(true, Ordering::Release);
    }

    pub(super) fn populate_lock(&self) -> &Mutex<()> {
        &self.populate_lock
    }

    fn track(&self) {
        self.uses.fetch_add(1, Ordering::Relaxed);
        // Not exactly accurate under contention, but the MRU queue is
        // maintained under the cache lock; the timestamp may lag.
        *self.last_use.write() = Some(SystemTime::now());
    }

    /// Times the entry was fetched with tracking.
    pub fn uses(&self) -> u32 {
        self.uses.load(Ordering::Relaxed)
    }

    /// Last tracked use.
    pub fn last_use(&self) -> Option<SystemTime> {
        *self.last_use.read()
    }

    /// Adds one request's timings.
    pub fn record_metrics(&self, request_ns: u64, service_ns: u64) {
        self.service_time.fetch_add(service_ns, Ordering::Relaxed);
        self.min_service_time.fetch_min(service_ns, Ordering::Relaxed);
        self.max_service_time.fetch_max(service_ns, Ordering::Relaxed);
        self.request_time.fetch_add(request_ns, Ordering::Relaxed);
        self.min_request_time.fetch_min(request_ns, Ordering::Relaxed);
        self.max_request_time.fetch_max(request_ns, Ordering::Relaxed);
    }

    /// `(sum, min, max)` of recorded service times; min is `u64::MAX`
    /// until the first sample.
    pub fn service_times(&self) -> (u64, u64, u64) {
        (
            self.service_time.load(Ordering::Relaxed),
            self.min_service_time.load(Ordering::Relaxed),
            self.max_service_time.load(Ordering::Relaxed),
        )
    }

    /// `(sum, min, max)` of recorded request times.
    pub fn request_times(&self) -> (u64, u64, u64) {
        (
            self.request_time.load(Ordering::Relaxed),
            self.min_request_time.load(Ordering::Relaxed),
            self.max_request_time.load(Ordering::Relaxed),
        )
    }
}

/// Name-keyed LRU of [`CacheEntry`] values.
pub struct PreparedLru {
    inner: Mutex<LruCache<String, Arc<CacheEntry>>>,
}

fn capacity(limit: usize) -> NonZeroUsize {
    NonZeroUsize::new(limit.max(1)).unwrap()
}

impl PreparedLru {
    /// Cache bounded to `limit` entries.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity(limit))),
        }
    }

    /// Current capacity.
    pub fn limit(&self) -> usize {
        self.inner.lock().cap().get()
    }

    /// Changes the capacity; shrinking evicts least-recently-used entries.
    pub fn set_limit(&self, limit: usize) {
        self.inner.lock().resize(capacity(limit));
    }

    /// Number of cached entries.
    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    /// Cached names, most recently used first.
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Peek without promotion.
    pub fn get(&self, name: &str) -> Option<Arc<CacheEntry>> {
        self.inner.lock().peek(name).map(Arc::clone)
    }

    /// Fetch with promotion to most recently used, bumping the entry's use
    /// accounting.
    pub fn use_entry(&self, name: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.inner.lock().get(name).map(Arc::clone)?;
        entry.track();
        Some(entry)
    }

    /// Inserts or amends. The callback inspects an existing entry and
    /// decides between [`Op::Amend`] and [`Op::Ignore`]; returns whether
    /// the plan ended up in the cache.
    pub fn add(
        &self,
        prepared: Arc<Prepared>,
        populated: bool,
        track: bool,
        process: impl FnOnce(&CacheEntry) -> Op,
    ) -> bool {
        let name = prepared.name.clone();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(&name).map(Arc::clone) {
            match process(&existing) {
                Op::Amend => {
                    existing.amend(prepared);
                    if track {
                        existing.track();
                    }
                    true
                }
                Op::Ignore => false,
            }
        } else {
            let entry = Arc::new(CacheEntry::new(prepared, populated, track));
            inner.push(name, entry);
            true
        }
    }

    /// Removes an entry by name.
    pub fn delete(&self, name: &str) -> bool {
        self.inner.lock().pop(name).is_some()
    }

    /// Visits every entry, most recently used first, until the callback
    /// returns false. Entries are snapshotted so the callback runs without
    /// the cache lock.
    pub fn for_each(&self, mut f: impl FnMut(&str, &CacheEntry) -> bool) {
        let snapshot: Vec<(String, Arc<CacheEntry>)> = {
            let inner = self.inner.lock();
            inner
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };
        for (name, entry) in snapshot {
            if !f(&name, &entry) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureControls;
    use crate::plan::Operator;

    fn prepared(name: &str, text: &str) -> Arc<Prepared> {
        Arc::new(Prepared::new(
            name,
            text,
            "SELECT",
            Operator::Sequence {
                children: vec![Operator::DummyScan {}, Operator::Stream {}],
            },
            4,
            FeatureControls::default(),
        ))
    }

    fn always_amend(_: &CacheEntry) -> Op {
        Op::Amend
    }

    #[test]
    fn use_promotes_but_get_does_not() {
        let cache = PreparedLru::new(2);
        cache.add(prepared("p1", "SELECT 1"), false, false, always_amend);
        cache.add(prepared("p2", "SELECT 2"), false, false, always_amend);
        // Peeking p1 leaves it at the LRU end.
        cache.get("p1");
        cache.add(prepared("p3", "SELECT 3"), false, false, always_amend);
        assert!(cache.get("p1").is_none());
        assert!(cache.get("p2").is_some());

        // Promoting p2 protects it from the next eviction.
        cache.use_entry("p2");
        cache.add(prepared("p4", "SELECT 4"), false, false, always_amend);
        assert!(cache.get("p2").is_some());
        assert!(cache.get("p3").is_none());
    }

    #[test]
    fn shrinking_evicts_lru_entries() {
        let cache = PreparedLru::new(3);
        for (name, text) in [("a", "1"), ("b", "2"), ("c", "3")] {
            cache.add(prepared(name, text), false, false, always_amend);
        }
        cache.set_limit(1);
        assert_eq!(cache.size(), 1);
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn add_respects_ignore() {
        let cache = PreparedLru::new(4);
        cache.add(prepared("p", "old"), false, false, always_amend);
        let added = cache.add(prepared("p", "new"), false, false, |_| Op::Ignore);
        assert!(!added);
        assert_eq!(cache.get("p").unwrap().prepared().text, "old");
    }

    #[test]
    fn amend_clears_populated() {
        let cache = PreparedLru::new(4);
        cache.add(prepared("p", "t"), true, false, always_amend);
        let entry = cache.get("p").unwrap();
        assert!(entry.populated());
        cache.add(prepared("p", "t"), false, false, always_amend);
        assert!(!entry.populated());
    }

    #[test]
    fn tracking_counts_uses() {
        let cache = PreparedLru::new(4);
        cache.add(prepared("p", "t"), false, true, always_amend);
        let entry = cache.use_entry("p").unwrap();
        cache.use_entry("p");
        assert_eq!(entry.uses(), 3);
        assert!(entry.last_use().is_some());
    }

    #[test]
    fn metric_extremes_install_on_first_sample() {
        let cache = PreparedLru::new(4);
        cache.add(prepared("p", "t"), false, false, always_amend);
        let entry = cache.get("p").unwrap();
        let (_, min0, max0) = entry.service_times();
        assert_eq!((min0, max0), (u64::MAX, 0));
        entry.record_metrics(50, 100);
        entry.record_metrics(30, 200);
        let (sum, min, max) = entry.service_times();
        assert_eq!((sum, min, max), (300, 100, 200));
        let (rsum, rmin, rmax) = entry.request_times();
        assert_eq!((rsum, rmin, rmax), (80, 30, 50));
    }
}
