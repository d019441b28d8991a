use crate::key::RegionKey;
use crate::utils::lock;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicI64, Ordering};

pub type RegionHandle = Arc<Region>;

/// A profiled code region. Identity is immutable after interning; the
/// counters below belong to the shared (global) scope and are mutated while
/// the session's stop-the-world lock is held for reading, folded under the
/// write lock.
pub struct Region {
    pub id: u32,
    pub key: RegionKey,
    pub size_bytes: u64,
    pub inst_count: u32,
    /// Owning module id, 0 when unknown. Lookup only, never ownership.
    pub module_id: u32,

    slice_count: AtomicI64,
    cumulative_count: AtomicI64,
    prev_counts: Mutex<BTreeMap<u32, i64>>,
}

impl Region {
    pub fn new(id: u32, key: RegionKey, size_bytes: u64, inst_count: u32, module_id: u32) -> Self {
        Self {
            id,
            key,
            size_bytes,
            inst_count,
            module_id,
            slice_count: AtomicI64::new(0),
            cumulative_count: AtomicI64::new(0),
            prev_counts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Count one execution in the shared scope. `prev` is the id of the
    /// region previously executed on the recording thread, 0 for none.
    pub fn record_global(&self, prev: u32, track_prev: bool) {
        self.slice_count.fetch_add(1, Ordering::Relaxed);
        if track_prev {
            *lock(&self.prev_counts).entry(prev).or_insert(0) += 1;
        }
    }

    /// Move the live slice counter into the cumulative counter and return
    /// the moved amount.
    pub fn fold_global(&self) -> i64 {
        let n = self.slice_count.swap(0, Ordering::Relaxed);
        if n != 0 {
            self.cumulative_count.fetch_add(n, Ordering::Relaxed);
        }
        n
    }

    pub fn global_slice(&self) -> i64 {
        self.slice_count.load(Ordering::Relaxed)
    }

    pub fn global_cumulative(&self) -> i64 {
        self.cumulative_count.load(Ordering::Relaxed)
    }

    /// Executions seen so far in the shared scope, insensitive to fold
    /// timing. Used for marker counts.
    pub fn global_total(&self) -> i64 {
        self.global_cumulative() + self.global_slice()
    }

    /// Predecessor histogram in ascending predecessor-id order.
    pub fn global_prev_snapshot(&self) -> Vec<(u32, i64)> {
        lock(&self.prev_counts)
            .iter()
            .map(|(id, count)| (*id, *count))
            .collect()
    }
}
