// Block containers behind buckets. The default (huge) bucket keeps FREE
// chunk extents in a best-fit ordered map with ties broken by lowest
// address; run buckets keep the free unit ranges of the active run in
// segregated lists, which gives an approximate best fit with LRU reuse.

use crate::heap::memblock::MemoryBlock;
use std::collections::{BTreeMap, VecDeque};

/// Unit counts with a dedicated segregated list; larger ranges share the
/// overflow list.
const SEGLIST_MAX: usize = 64;

#[derive(Debug)]
pub enum Container {
    BestFit(BTreeMap<(u32, u64), MemoryBlock>),
    SegLists {
        lists: Vec<VecDeque<MemoryBlock>>,
        overflow: VecDeque<MemoryBlock>,
    },
}

impl Container {
    pub fn new_bestfit() -> Self {
        Container::BestFit(BTreeMap::new())
    }

    pub fn new_seglists() -> Self {
        Container::SegLists {
            lists: (0..=SEGLIST_MAX).map(|_| VecDeque::new()).collect(),
            overflow: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, m: MemoryBlock) {
        match self {
            Container::BestFit(map) => {
                map.insert((m.size_idx, m.addr_key()), m);
            }
            Container::SegLists { lists, overflow } => {
                debug_assert!(m.size_idx >= 1);
                if (m.size_idx as usize) <= SEGLIST_MAX {
                    lists[m.size_idx as usize].push_back(m);
                } else {
                    overflow.push_back(m);
                }
            }
        }
    }

    /// Remove the block with this exact placement, if present.
    pub fn remove_exact(&mut self, m: &MemoryBlock) -> bool {
        match self {
            Container::BestFit(map) => map.remove(&(m.size_idx, m.addr_key())).is_some(),
            Container::SegLists { lists, overflow } => {
                let list = if (m.size_idx as usize) <= SEGLIST_MAX {
                    &mut lists[m.size_idx as usize]
                } else {
                    overflow
                };
                if let Some(pos) = list.iter().position(|b| b.addr_key() == m.addr_key()) {
                    list.remove(pos);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Extract a block of at least `size_idx` units/chunks.
    pub fn get_bestfit(&mut self, size_idx: u32) -> Option<MemoryBlock> {
        match self {
            Container::BestFit(map) => {
                let key = *map.range((size_idx, 0)..).next()?.0;
                map.remove(&key)
            }
            Container::SegLists { lists, overflow } => {
                let want = size_idx as usize;
                for n in want..=SEGLIST_MAX {
                    if let Some(m) = lists[n].pop_front() {
                        return Some(m);
                    }
                }
                overflow
                    .iter()
                    .position(|b| b.size_idx >= size_idx)
                    .and_then(|pos| overflow.remove(pos))
            }
        }
    }

    pub fn drain(&mut self) -> Vec<MemoryBlock> {
        match self {
            Container::BestFit(map) => {
                let out = map.values().copied().collect();
                map.clear();
                out
            }
            Container::SegLists { lists, overflow } => {
                let mut out = Vec::new();
                for l in lists.iter_mut() {
                    out.extend(l.drain(..));
                }
                out.extend(overflow.drain(..));
                out
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Container::BestFit(map) => map.is_empty(),
            Container::SegLists { lists, overflow } => {
                overflow.is_empty() && lists.iter().all(|l| l.is_empty())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bestfit_prefers_smallest_then_lowest_addr() {
        let mut c = Container::new_bestfit();
        c.insert(MemoryBlock::huge(0, 10, 4));
        c.insert(MemoryBlock::huge(0, 2, 2));
        c.insert(MemoryBlock::huge(0, 6, 2));

        let got = c.get_bestfit(2).unwrap();
        assert_eq!((got.chunk_id, got.size_idx), (2, 2));
        let got = c.get_bestfit(2).unwrap();
        assert_eq!((got.chunk_id, got.size_idx), (6, 2));
        let got = c.get_bestfit(1).unwrap();
        assert_eq!((got.chunk_id, got.size_idx), (10, 4));
        assert!(c.get_bestfit(1).is_none());
    }

    #[test]
    fn test_seglists_serves_larger_when_exact_missing() {
        let mut c = Container::new_seglists();
        let rdsc = crate::heap::alloc_class::RunDesc::compute(128, 0, 1);
        c.insert(MemoryBlock::run(0, 1, 0, 3, rdsc));
        c.insert(MemoryBlock::run(0, 1, 10, 8, rdsc));

        let got = c.get_bestfit(4).unwrap();
        assert_eq!(got.size_idx, 8);
        let got = c.get_bestfit(1).unwrap();
        assert_eq!(got.size_idx, 3);
        assert!(c.is_empty());
    }

    #[test]
    fn test_remove_exact() {
        let mut c = Container::new_bestfit();
        let m = MemoryBlock::huge(1, 5, 2);
        c.insert(m);
        assert!(c.remove_exact(&m));
        assert!(!c.remove_exact(&m));
    }
}
