//! Process-wide configuration knobs.
//!
//! Runtime-mutable settings use atomics so request paths never take a lock
//! to read them. Per-request defaults (pipeline capacity, parallelism) are
//! snapshotted into the execution context when a request starts.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Feature-control bitmask toggling engine behaviours.
///
/// Bits are wire-stable: they participate in auto-prepare name derivation,
/// so the same statement prepared under different controls yields different
/// cache entries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct FeatureControls(pub u64);

impl FeatureControls {
    /// Include the feature realm in auto-prepare names. When unset, names
    /// derive from statement text alone.
    pub const AUTO_PREPARE_REALM: u64 = 1 << 0;
    /// Let the semantic checker pass statements through without the full
    /// visitor walk.
    pub const SEMANTICS_PASSTHROUGH: u64 = 1 << 1;
    /// Disable the cost model even when statistics are available.
    pub const NO_COST_MODEL: u64 = 1 << 2;

    /// Whether the given bit is set.
    pub fn has(&self, bit: u64) -> bool {
        self.0 & bit != 0
    }
}

/// Default bound for inter-operator channels.
pub const DEFAULT_PIPELINE_CAP: usize = 512;

/// Default prepared-cache capacity.
pub const DEFAULT_PREPAREDS_LIMIT: usize = 16384;

static PIPELINE_CAP: AtomicU64 = AtomicU64::new(DEFAULT_PIPELINE_CAP as u64);
static MAX_PARALLELISM: AtomicU32 = AtomicU32::new(0);

/// Per-request default bound for item channels.
pub fn pipeline_cap() -> usize {
    PIPELINE_CAP.load(Ordering::Relaxed) as usize
}

/// Changes the per-request default channel bound.
pub fn set_pipeline_cap(cap: usize) {
    PIPELINE_CAP.store(cap.max(1) as u64, Ordering::Relaxed);
}

/// Upper bound for `Parallel` operator fan-out. Zero means the host CPU
/// count.
pub fn max_parallelism() -> usize {
    let configured = MAX_PARALLELISM.load(Ordering::Relaxed) as usize;
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Changes the parallelism cap; zero restores CPU-count defaulting.
pub fn set_max_parallelism(n: usize) {
    MAX_PARALLELISM.store(n as u32, Ordering::Relaxed);
}
