// Run recycler: one per class per memory bucket. Runs enter when a bucket
// detaches them (or at startup reclamation) with their free-unit score;
// frees only bump a pending counter. A recalculation pass rescans the
// parked runs against their bitmaps, keeps partially-empty runs available
// for reuse (fullest first, to keep runs dense) and harvests completely
// empty runs back into free chunks. Attached runs are never tracked here,
// so a harvested run can never be live in a bucket.

use crate::cache::PageCache;
use crate::heap::memblock::{run_free_space, MemoryBlock};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct Recycler {
    /// Units per run for this class.
    nallocs: u32,
    /// Parked runs keyed by (free units, address); lowest free first.
    runs: BTreeMap<(u32, u64), MemoryBlock>,
    /// Units freed since the last recalculation.
    pending_free: u64,
}

impl Recycler {
    pub fn new(nallocs: u32) -> Self {
        Self {
            nallocs,
            runs: BTreeMap::new(),
            pending_free: 0,
        }
    }

    #[inline]
    pub fn nallocs(&self) -> u32 {
        self.nallocs
    }

    /// Park a run with a known free-unit count.
    pub fn put(&mut self, m: MemoryBlock, free_space: u32) {
        debug_assert_eq!(m.block_off, 0);
        self.runs.insert((free_space, m.addr_key()), m);
    }

    /// Note freed units; the owning run may or may not be parked here.
    pub fn inc_unaccounted(&mut self, m: &MemoryBlock) {
        self.pending_free += m.size_idx as u64;
    }

    /// Pop the best reusable run: the fullest one that still has at least
    /// `units` free units.
    pub fn get(&mut self, units: u32) -> Option<MemoryBlock> {
        let key = self
            .runs
            .iter()
            .find(|((free, _), _)| *free >= units)
            .map(|(k, _)| *k)?;
        self.runs.remove(&key)
    }

    /// Rescore every parked run from its bitmap and extract the empty
    /// ones. Without `force` this is a no-op until roughly a run's worth
    /// of units has been freed.
    pub fn recalc(&mut self, cache: &PageCache, force: bool) -> Vec<MemoryBlock> {
        if !force && self.pending_free < self.nallocs as u64 {
            return Vec::new();
        }
        self.pending_free = 0;

        let mut empties = Vec::new();
        let parked: Vec<MemoryBlock> = std::mem::take(&mut self.runs).into_values().collect();
        for run in parked {
            let free = run_free_space(cache, &run);
            if free >= self.nallocs {
                empties.push(run);
            } else {
                self.runs.insert((free, run.addr_key()), run);
            }
        }
        empties
    }

    pub fn tracked(&self) -> usize {
        self.runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::alloc_class::RunDesc;

    fn run_at(chunk: u32, rdsc: RunDesc) -> MemoryBlock {
        MemoryBlock::run(0, chunk, 0, rdsc.size_idx, rdsc)
    }

    #[test]
    fn test_get_prefers_fullest_run() {
        let rdsc = RunDesc::compute(128, 0, 1);
        let mut r = Recycler::new(rdsc.nallocs);
        r.put(run_at(1, rdsc), 100);
        r.put(run_at(2, rdsc), 5);
        r.put(run_at(3, rdsc), 40);

        let got = r.get(3).unwrap();
        assert_eq!(got.chunk_id, 2);
        let got = r.get(50).unwrap();
        assert_eq!(got.chunk_id, 1);
        assert!(r.get(200).is_none());
        assert_eq!(r.tracked(), 1);
    }

    #[test]
    fn test_recalc_noop_below_threshold() {
        let rdsc = RunDesc::compute(128, 0, 1);
        let mut r = Recycler::new(rdsc.nallocs);
        let mut freed = run_at(7, rdsc);
        freed.size_idx = 1;
        r.inc_unaccounted(&freed);
        assert_eq!(r.pending_free, 1);
        // Below the threshold: the no-op path touches no cache state.
        assert!(r.tracked() == 0);
    }
}
