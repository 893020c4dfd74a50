// # Transactions
//
// User-visible transaction state: the stage machine, the snapshot range
// tree and the reserved heap actions. Ranges are kept normalized (no
// overlapping or adjacent entries) by merging on insert; each newly
// covered interval is snapshotted into the undo log so an abort can
// restore the pre-transaction bytes. The longjmp-based control flow of
// the original interface maps to `Result` propagation: a failing
// operation aborts the transaction (unless `TX_NO_ABORT` is set) and
// returns the error.

use crate::cache::PageCache;
use crate::common::{BlobOff, FLAG_NO_FLUSH, FLAG_NO_SNAPSHOT};
use crate::error::{HeapError, Result};
use crate::memops::OperationContext;
use crate::palloc::PallocAction;
use crate::ulog::{UlogEntry, OP_BUF_CPY};
use crate::wal::WalTx;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    None,
    Work,
    OnCommit,
    OnAbort,
    Finally,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBehavior {
    Abort,
    Return,
}

/// A snapshotted extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeDef {
    pub size: u64,
    pub flags: u64,
}

/// Callback invoked on outermost stage transitions.
pub type TxCallback = Box<dyn FnMut(TxStage)>;

pub struct TxState {
    pub stage: TxStage,
    pub last_errno: i32,
    /// One entry per nesting level, outermost first.
    pub levels: Vec<FailureBehavior>,
    pub ranges: BTreeMap<BlobOff, RangeDef>,
    pub actions: Vec<PallocAction>,
    pub callback: Option<TxCallback>,
}

impl Default for TxState {
    fn default() -> Self {
        Self {
            stage: TxStage::None,
            last_errno: 0,
            levels: Vec::new(),
            ranges: BTreeMap::new(),
            actions: Vec::new(),
            callback: None,
        }
    }
}

impl TxState {
    #[inline]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn is_outermost(&self) -> bool {
        self.levels.len() == 1
    }

    /// The abort-on-failure flag inherited from the innermost level.
    pub fn abort_on_failure_flag(&self) -> u64 {
        match self.levels.last() {
            Some(FailureBehavior::Return) => crate::common::FLAG_TX_NO_ABORT,
            _ => 0,
        }
    }

    pub fn fire_callback(&mut self, stage: TxStage) {
        if self.is_outermost() || stage == TxStage::None {
            if let Some(cb) = self.callback.as_mut() {
                cb(stage);
            }
        }
    }
}

/// `NO_FLUSH` survives a merge only if both ranges carry it.
fn merge_flags(dest: &mut RangeDef, merged_flags: u64) {
    if dest.flags & FLAG_NO_FLUSH != 0 && merged_flags & FLAG_NO_FLUSH == 0 {
        dest.flags &= !FLAG_NO_FLUSH;
    }
}

/// Snapshot `[offset, offset + size)` into the undo log.
fn add_snapshot(
    undo: &mut OperationContext,
    cache: &PageCache,
    offset: BlobOff,
    size: u64,
    flags: u64,
) -> Result<()> {
    if flags & FLAG_NO_SNAPSHOT != 0 {
        return Ok(());
    }
    let data = cache.slice(offset, size).to_vec();
    undo.add_buffer(offset, &data, OP_BUF_CPY)
}

/// Add a range to the transaction, merging with existing entries and
/// snapshotting only the newly covered intervals.
///
/// The search walks existing ranges backwards from the end of the new
/// range; every iteration either creates the remaining snapshot, extends
/// an existing entry, or shrinks the work left to the uncovered prefix.
pub fn add_range_common(
    ranges: &mut BTreeMap<BlobOff, RangeDef>,
    undo: &mut OperationContext,
    cache: &PageCache,
    offset: BlobOff,
    size: u64,
    flags: u64,
) -> Result<()> {
    let mut r_off = offset;
    let mut r_size = size;
    let mut include_equal = true;
    // An adjacent entry found on the right in a previous iteration.
    let mut nprev: Option<BlobOff> = None;

    while r_size != 0 {
        let search = r_off + r_size;
        let found = if include_equal {
            ranges.range(..=search).next_back()
        } else {
            ranges.range(..search).next_back()
        }
        .map(|(k, v)| (*k, *v));
        include_equal = false;

        let rend = r_off + r_size;
        let fend = found.map(|(k, v)| k + v.size).unwrap_or(0);

        if found.is_none() || fend < r_off {
            // No overlap on the left side: snapshot the whole remainder.
            if let Some(prev_off) = nprev {
                // Extend the adjacent right-side entry over the range.
                let prev = ranges.remove(&prev_off).expect("adjacent entry");
                debug_assert_eq!(rend, prev_off);
                ranges.insert(
                    prev_off - r_size,
                    RangeDef {
                        size: prev.size + r_size,
                        flags: prev.flags,
                    },
                );
            } else {
                ranges.insert(r_off, RangeDef { size: r_size, flags });
            }
            add_snapshot(undo, cache, r_off, r_size, flags)?;
            break;
        }

        let (f_off, mut f_def) = found.unwrap();
        if fend <= rend {
            // The found range ends inside the new range: extend it over
            // the uncovered tail and snapshot just that part.
            let snap_off = fend;
            let snap_size = rend - fend;
            let intersection = fend - f_off.max(r_off);
            r_size -= intersection + snap_size;

            f_def.size += snap_size;
            merge_flags(&mut f_def, flags);

            if snap_size != 0 {
                add_snapshot(undo, cache, snap_off, snap_size, flags)?;
            }

            if let Some(prev_off) = nprev {
                let prev = ranges.remove(&prev_off).expect("adjacent entry");
                debug_assert_eq!(rend, prev_off);
                f_def.size += prev.size;
                merge_flags(&mut f_def, prev.flags);
            }
            ranges.insert(f_off, f_def);
            // The grown entry is now adjacent to whatever prefix is left.
            nprev = Some(f_off);
        } else if fend >= r_off {
            // The found range covers the tail of the new range; remember
            // it and keep searching for the uncovered prefix.
            let overlap = rend - f_off.max(r_off);
            r_size -= overlap;
            merge_flags(&mut f_def, flags);
            ranges.insert(f_off, f_def);
            nprev = Some(f_off);
        } else {
            unreachable!("range search invariant");
        }
    }
    Ok(())
}

/// Apply every undo entry: copy the pre-images back into cache memory and
/// log the restores so the abort itself is crash-consistent.
pub fn restore_undo(
    undo: &OperationContext,
    cache: &mut PageCache,
    wal: &mut WalTx,
) -> Result<()> {
    let mut rc = Ok(());
    undo.undo_foreach(|entry| {
        match entry {
            UlogEntry::Buf { offset, data, .. } => {
                cache.write_bytes(*offset, data);
                if let Err(e) = wal.snap(cache, *offset, data.len() as u64) {
                    rc = Err(e);
                    return false;
                }
            }
            UlogEntry::Val { .. } => {
                rc = Err(HeapError::Internal("value entry in undo log".into()));
                return false;
            }
        }
        true
    });
    rc
}

/// Flush every snapshotted range into the redo log (commit path).
pub fn flush_ranges(
    ranges: &BTreeMap<BlobOff, RangeDef>,
    cache: &mut PageCache,
    wal: &mut WalTx,
) -> Result<()> {
    for (off, def) in ranges {
        if def.flags & FLAG_NO_FLUSH == 0 {
            wal.snap(cache, *off, def.size)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memops::LogType;

    fn undo_ctx() -> OperationContext {
        let mut ctx = OperationContext::new(LogType::Undo, 4096, 4096);
        ctx.start();
        ctx
    }

    fn dummy_cache() -> PageCache {
        use crate::store::{MemStore, MetaStore, StoreRegion};
        use std::rc::Rc;
        let store: Rc<dyn MetaStore> = Rc::new(MemStore::new(4096 + (1 << 20)));
        let mut cache = PageCache::new(store, 1 << 20, 1, 1, 1, 4096).unwrap();
        cache
            .map_ranges(&[StoreRegion {
                addr: 4096,
                size: 1 << 20,
            }])
            .unwrap();
        cache
    }

    fn spans(ranges: &BTreeMap<BlobOff, RangeDef>) -> Vec<(u64, u64)> {
        ranges.iter().map(|(k, v)| (*k, v.size)).collect()
    }

    #[test]
    fn test_disjoint_ranges_stay_separate() {
        let cache = dummy_cache();
        let mut undo = undo_ctx();
        let mut ranges = BTreeMap::new();
        add_range_common(&mut ranges, &mut undo, &cache, 8192, 64, 0).unwrap();
        add_range_common(&mut ranges, &mut undo, &cache, 16384, 64, 0).unwrap();
        assert_eq!(spans(&ranges), vec![(8192, 64), (16384, 64)]);
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let cache = dummy_cache();
        let mut undo = undo_ctx();
        let mut ranges = BTreeMap::new();
        add_range_common(&mut ranges, &mut undo, &cache, 8192, 64, 0).unwrap();
        add_range_common(&mut ranges, &mut undo, &cache, 8256, 64, 0).unwrap();
        assert_eq!(spans(&ranges), vec![(8192, 128)]);

        // Adjacent on the left merges too.
        add_range_common(&mut ranges, &mut undo, &cache, 8128, 64, 0).unwrap();
        assert_eq!(spans(&ranges), vec![(8128, 192)]);
    }

    #[test]
    fn test_readding_covered_range_is_noop() {
        let cache = dummy_cache();
        let mut undo = undo_ctx();
        let mut ranges = BTreeMap::new();
        add_range_common(&mut ranges, &mut undo, &cache, 8192, 256, 0).unwrap();
        let logged = undo.total_logged();
        add_range_common(&mut ranges, &mut undo, &cache, 8200, 32, 0).unwrap();
        assert_eq!(spans(&ranges), vec![(8192, 256)]);
        // Fully covered: no new snapshot bytes.
        assert_eq!(undo.total_logged(), logged);
    }

    #[test]
    fn test_overlap_snapshots_only_uncovered() {
        let cache = dummy_cache();
        let mut undo = undo_ctx();
        let mut ranges = BTreeMap::new();
        add_range_common(&mut ranges, &mut undo, &cache, 8192, 128, 0).unwrap();
        // Overlaps on the left, extends 128 bytes beyond.
        add_range_common(&mut ranges, &mut undo, &cache, 8256, 192, 0).unwrap();
        assert_eq!(spans(&ranges), vec![(8192, 256)]);
    }

    #[test]
    fn test_bridge_merges_three_ranges() {
        let cache = dummy_cache();
        let mut undo = undo_ctx();
        let mut ranges = BTreeMap::new();
        add_range_common(&mut ranges, &mut undo, &cache, 8192, 64, 0).unwrap();
        add_range_common(&mut ranges, &mut undo, &cache, 8320, 64, 0).unwrap();
        // The middle piece is adjacent to both: everything coalesces.
        add_range_common(&mut ranges, &mut undo, &cache, 8256, 64, 0).unwrap();
        assert_eq!(spans(&ranges), vec![(8192, 192)]);
    }

    #[test]
    fn test_contained_range_absorbs_outer_add() {
        let cache = dummy_cache();
        let mut undo = undo_ctx();
        let mut ranges = BTreeMap::new();
        add_range_common(&mut ranges, &mut undo, &cache, 8300, 64, 0).unwrap();
        // A larger range containing the existing one collapses to a
        // single normalized entry.
        add_range_common(&mut ranges, &mut undo, &cache, 8192, 300, 0).unwrap();
        assert_eq!(spans(&ranges), vec![(8192, 300)]);
    }

    #[test]
    fn test_no_flush_flag_intersection() {
        let cache = dummy_cache();
        let mut undo = undo_ctx();
        let mut ranges = BTreeMap::new();
        add_range_common(&mut ranges, &mut undo, &cache, 8192, 64, FLAG_NO_FLUSH).unwrap();
        // Merging with a flushing range drops NO_FLUSH.
        add_range_common(&mut ranges, &mut undo, &cache, 8256, 64, 0).unwrap();
        let def = ranges.get(&8192).unwrap();
        assert_eq!(def.flags & FLAG_NO_FLUSH, 0);
    }
}
