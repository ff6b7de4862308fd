//! Per-request execution context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use regex::Regex;

use crate::config;
use crate::datastore::Datastore;
use crate::errors::{Error, Result, Warning};
use crate::expression::{like_to_regex, EvalContext};
use crate::value::Value;

/// Execution phases tracked per request.
#[derive(Clone, Copy, Debug)]
pub enum Phase {
    /// Index scan time.
    Scan,
    /// Document fetch time.
    Fetch,
    /// Join and nest time.
    Join,
    /// Sort time.
    Sort,
    /// Everything else.
    Run,
}

#[derive(Default)]
struct PhaseTimes {
    scan_ns: AtomicU64,
    fetch_ns: AtomicU64,
    join_ns: AtomicU64,
    sort_ns: AtomicU64,
    run_ns: AtomicU64,
}

/// Snapshot of accumulated phase times.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseSnapshot {
    /// Nanoseconds spent scanning indexes.
    pub scan_ns: u64,
    /// Nanoseconds spent fetching documents.
    pub fetch_ns: u64,
    /// Nanoseconds spent joining.
    pub join_ns: u64,
    /// Nanoseconds spent sorting.
    pub sort_ns: u64,
    /// Nanoseconds spent elsewhere.
    pub run_ns: u64,
}

/// Shared state for one request's operator tree.
///
/// Cloneable handle: operators across threads share the same stop flag,
/// error slot, result sink, and caches.
#[derive(Clone)]
pub struct ExecContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    datastore: Arc<dyn Datastore>,
    now: SystemTime,
    started: Instant,
    timeout: Option<Duration>,
    pipeline_cap: usize,
    positional: Vec<Value>,
    named: HashMap<String, Value>,
    stop: AtomicBool,
    error: Mutex<Option<Error>>,
    warnings: Mutex<Vec<Warning>>,
    results: Mutex<Vec<Value>>,
    mutations: AtomicU64,
    regexes: Mutex<HashMap<String, Arc<Regex>>>,
    scratch: Mutex<HashMap<String, Value>>,
    phases: PhaseTimes,
}

impl ExecContext {
    /// Builds a context over a datastore with default knobs.
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self::with_options(datastore, None, config::pipeline_cap())
    }

    /// Builds a context with an explicit timeout and pipeline capacity.
    pub fn with_options(
        datastore: Arc<dyn Datastore>,
        timeout: Option<Duration>,
        pipeline_cap: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                datastore,
                now: SystemTime::now(),
                started: Instant::now(),
                timeout,
                pipeline_cap: pipeline_cap.max(1),
                positional: Vec::new(),
                named: HashMap::new(),
                stop: AtomicBool::new(false),
                error: Mutex::new(None),
                warnings: Mutex::new(Vec::new()),
                results: Mutex::new(Vec::new()),
                mutations: AtomicU64::new(0),
                regexes: Mutex::new(HashMap::new()),
                scratch: Mutex::new(HashMap::new()),
                phases: PhaseTimes::default(),
            }),
        }
    }

    /// Installs placeholder parameter values.
    pub fn with_params(mut self, positional: Vec<Value>, named: HashMap<String, Value>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("parameters must be set before the context is shared");
        inner.positional = positional;
        inner.named = named;
        self
    }

    /// Datastore handle operators read and write through.
    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.inner.datastore
    }

    /// Bound for inter-operator channels.
    pub fn pipeline_cap(&self) -> usize {
        self.inner.pipeline_cap
    }

    /// Whether the request has been stopped, failed, or timed out.
    pub fn stopped(&self) -> bool {
        if self.inner.stop.load(Ordering::Acquire) {
            return true;
        }
        if let Some(timeout) = self.inner.timeout {
            if self.inner.started.elapsed() >= timeout {
                self.expire(timeout);
                return true;
            }
        }
        false
    }

    /// Idempotent stop: all operators observe it at their next suspension
    /// point.
    pub fn send_stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
    }

    /// Records a timeout error and stops the request.
    pub fn expire(&self, timeout: Duration) {
        self.fail(Error::Timeout {
            ms: timeout.as_millis() as u64,
        });
    }

    /// Records a fatal error (first one wins) and stops the request.
    pub fn fail(&self, err: Error) {
        {
            let mut slot = self.inner.error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.send_stop();
    }

    /// First fatal error recorded, if any.
    pub fn error(&self) -> Option<Error> {
        self.inner.error.lock().clone()
    }

    /// Accumulates a non-fatal warning.
    pub fn warn(&self, warning: Warning) {
        self.inner.warnings.lock().push(warning);
    }

    /// Drains accumulated warnings.
    pub fn take_warnings(&self) -> Vec<Warning> {
        std::mem::take(&mut self.inner.warnings.lock())
    }

    /// Appends one result row.
    pub fn emit_result(&self, row: Value) {
        self.inner.results.lock().push(row);
    }

    /// Drains collected result rows.
    pub fn take_results(&self) -> Vec<Value> {
        std::mem::take(&mut self.inner.results.lock())
    }

    /// Adds to the mutation counter surfaced on DML results.
    pub fn add_mutations(&self, n: u64) {
        self.inner.mutations.fetch_add(n, Ordering::Relaxed);
    }

    /// Mutations performed so far.
    pub fn mutations(&self) -> u64 {
        self.inner.mutations.load(Ordering::Relaxed)
    }

    /// Accumulates elapsed time against a phase.
    pub fn record_phase(&self, phase: Phase, started: Instant) {
        let nanos = started.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        let counter = match phase {
            Phase::Scan => &self.inner.phases.scan_ns,
            Phase::Fetch => &self.inner.phases.fetch_ns,
            Phase::Join => &self.inner.phases.join_ns,
            Phase::Sort => &self.inner.phases.sort_ns,
            Phase::Run => &self.inner.phases.run_ns,
        };
        counter.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Snapshot of accumulated phase times.
    pub fn phase_snapshot(&self) -> PhaseSnapshot {
        PhaseSnapshot {
            scan_ns: self.inner.phases.scan_ns.load(Ordering::Relaxed),
            fetch_ns: self.inner.phases.fetch_ns.load(Ordering::Relaxed),
            join_ns: self.inner.phases.join_ns.load(Ordering::Relaxed),
            sort_ns: self.inner.phases.sort_ns.load(Ordering::Relaxed),
            run_ns: self.inner.phases.run_ns.load(Ordering::Relaxed),
        }
    }
}

impl EvalContext for ExecContext {
    fn now(&self) -> SystemTime {
        self.inner.now
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner
            .timeout
            .map(|t| t.saturating_sub(self.inner.started.elapsed()))
    }

    fn positional_param(&self, i: usize) -> Option<Value> {
        i.checked_sub(1)
            .and_then(|i| self.inner.positional.get(i))
            .cloned()
    }

    fn named_param(&self, name: &str) -> Option<Value> {
        self.inner.named.get(name).cloned()
    }

    fn like_regex(&self, pattern: &str) -> Result<Arc<Regex>> {
        let mut cache = self.inner.regexes.lock();
        if let Some(re) = cache.get(pattern) {
            return Ok(Arc::clone(re));
        }
        let re = Arc::new(like_to_regex(pattern)?);
        cache.insert(pattern.to_owned(), Arc::clone(&re));
        Ok(re)
    }

    fn store_value(&self, key: &str, value: Value) {
        self.inner.scratch.lock().insert(key.to_owned(), value);
    }

    fn retrieve_value(&self, key: &str) -> Option<Value> {
        self.inner.scratch.lock().get(key).cloned()
    }

    fn release_value(&self, key: &str) {
        self.inner.scratch.lock().remove(key);
    }
}
