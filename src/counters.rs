use crate::region::Region;
use std::collections::BTreeMap;

/// One region's counters within a single thread slot.
#[derive(Default, Clone)]
pub struct SliceCounts {
    /// Executions in the interval currently being accumulated.
    pub slice: i64,
    /// Executions folded at past interval boundaries.
    pub cumulative: i64,
    /// Transition counts keyed by previous region id (0 = none).
    pub prev: BTreeMap<u32, i64>,
}

/// Per-thread counter table, indexed by region id and grown on demand.
/// Exclusively owned by one thread slot, so no atomics are needed here.
#[derive(Default)]
pub struct ThreadCounters {
    counts: Vec<SliceCounts>,
    pub last_region: u32,
    /// Total instructions observed by this thread.
    pub icount: i64,
}

impl ThreadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, region: &Region, track_prev: bool) {
        let prev = self.last_region;
        let counts = self.slot_mut(region.id);
        counts.slice += 1;
        if track_prev {
            *counts.prev.entry(prev).or_insert(0) += 1;
        }
        self.last_region = region.id;
        self.icount += region.inst_count as i64;
    }

    fn slot_mut(&mut self, id: u32) -> &mut SliceCounts {
        let index = id as usize;
        if index >= self.counts.len() {
            self.counts.resize_with(index + 1, SliceCounts::default);
        }
        &mut self.counts[index]
    }

    pub fn get(&self, id: u32) -> Option<&SliceCounts> {
        self.counts.get(id as usize)
    }

    /// Executions seen so far for `id`, insensitive to fold timing.
    pub fn total(&self, id: u32) -> i64 {
        self.get(id).map_or(0, |c| c.cumulative + c.slice)
    }

    /// Drain the live interval: fold every region's slice counter into its
    /// cumulative counter and return the non-zero executions in ascending
    /// region-id order.
    pub fn take_slice_vector(&mut self) -> Vec<(u32, i64)> {
        let mut vector = vec![];
        for (index, counts) in self.counts.iter_mut().enumerate() {
            if counts.slice != 0 {
                vector.push((index as u32, counts.slice));
                counts.cumulative += counts.slice;
                counts.slice = 0;
            }
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use crate::counters::ThreadCounters;
    use crate::key::RegionKey;
    use crate::region::Region;

    fn region(id: u32, insts: u32) -> Region {
        let start = 0x1000 * id as u64;
        Region::new(id, RegionKey::range(start, start + 0x10), 0x14, insts, 0)
    }

    #[test]
    fn record_grows_table_and_counts_instructions() {
        let mut counters = ThreadCounters::new();
        let a = region(1, 10);
        let z = region(40, 3);
        counters.record(&a, false);
        counters.record(&z, false);
        counters.record(&a, false);
        assert_eq!(counters.icount, 23);
        assert_eq!(counters.total(1), 2);
        assert_eq!(counters.total(40), 1);
        assert_eq!(counters.total(2), 0);
        assert_eq!(counters.last_region, 1);
    }

    #[test]
    fn take_slice_vector_folds_and_clears() {
        let mut counters = ThreadCounters::new();
        let a = region(1, 10);
        let b = region(2, 5);
        counters.record(&a, false);
        counters.record(&b, false);
        counters.record(&a, false);
        assert_eq!(counters.take_slice_vector(), vec![(1, 2), (2, 1)]);
        assert_eq!(counters.take_slice_vector(), vec![]);
        assert_eq!(counters.total(1), 2);
        counters.record(&b, false);
        assert_eq!(counters.take_slice_vector(), vec![(2, 1)]);
        assert_eq!(counters.total(2), 2);
    }

    #[test]
    fn prev_region_sentinel_and_transitions() {
        let mut counters = ThreadCounters::new();
        let a = region(1, 10);
        let b = region(2, 5);
        counters.record(&a, true);
        counters.record(&b, true);
        counters.record(&b, true);
        counters.record(&a, true);
        let a_counts = counters.get(1).unwrap();
        assert_eq!(
            a_counts.prev.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
            vec![(0, 1), (2, 1)]
        );
        let b_counts = counters.get(2).unwrap();
        assert_eq!(
            b_counts.prev.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
            vec![(1, 1), (2, 1)]
        );
    }
}
