//! Bounded pools of scratch maps reused across operator runs.

use std::collections::HashMap;

use parking_lot::Mutex;

/// A pool of `HashMap<String, T>` scratch maps.
///
/// Maps handed back through [`MapPool::put`] are wiped before being
/// retained so no entries leak across requests; maps that have grown past
/// the pool's sizing are dropped instead of retained.
pub struct MapPool<T> {
    pool: Mutex<Vec<HashMap<String, T>>>,
    size: usize,
    retain: usize,
}

impl<T> MapPool<T> {
    /// Creates a pool whose maps are preallocated to `size` entries.
    pub fn new(size: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            size,
            retain: 16,
        }
    }

    /// Map sizing this pool was built for.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Takes a map from the pool, or allocates a fresh one.
    pub fn get(&self) -> HashMap<String, T> {
        if let Some(map) = self.pool.lock().pop() {
            return map;
        }
        HashMap::with_capacity(self.size)
    }

    /// Returns a map to the pool. Oversized maps are dropped; retained maps
    /// are cleared first.
    pub fn put(&self, mut map: HashMap<String, T>) {
        if map.len() > self.size {
            return;
        }
        map.clear();
        let mut pool = self.pool.lock();
        if pool.len() < self.retain {
            pool.push(map);
        }
    }

    /// Drops every retained map. Called on shutdown so leak detectors see a
    /// quiescent pool.
    pub fn drain(&self) {
        self.pool.lock().clear();
    }
}
