// # Palloc — persistent allocator frontend
//
// Bridges the heap with the operation context: a reservation extracts a
// block and prepares its header without touching persistent allocation
// state; publishing flips the persistent markers (chunk headers or run
// bitmap bits) and the usage counters through the redo log in one atomic
// batch; cancel returns reserved blocks to the volatile state.

use crate::cache::PageCache;
use crate::common::{
    class_id_from_flags, ezone_id_from_flags, zone_id_of, zone_offset, BlobOff, CHUNKSIZE,
    DAV_MAX_ALLOC_SIZE, FLAG_ZERO, ZONE_META_SIZE,
};
use crate::error::{HeapError, Result};
use crate::heap::alloc_class::{AllocClass, ClassType, HeaderType, RunDesc, DEFAULT_ALLOC_CLASS_ID};
use crate::heap::layout::{chunk_header_off, sp_usage_glob_off, sp_usage_off, ChunkHeader, ChunkRunHeader, CHUNK_TYPE_RUN, CHUNK_TYPE_USED};
use crate::heap::memblock::{BlockKind, MemoryBlock};
use crate::heap::Heap;
use crate::memops::OperationContext;
use crate::ulog::OP_SET;
use crate::wal::WalTx;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Alloc,
    Free,
}

/// A prepared heap action, published or cancelled later.
#[derive(Debug, Clone, Copy)]
pub struct PallocAction {
    pub kind: ActionKind,
    pub m: MemoryBlock,
    /// Usable (post-header) offset handed to the caller.
    pub offset: BlobOff,
    pub usable_size: u64,
    pub chunk_flags: u16,
    pub mb_id: u32,
}

/// Constructor invoked on the usable bytes of a fresh reservation.
pub type Constructor<'a> = &'a mut dyn FnMut(&mut [u8]);

fn size_idx_for(class: &AllocClass, size: u64) -> Result<u32> {
    let need = size + class.header.size();
    match class.ctype {
        ClassType::Huge => Ok(need.div_ceil(CHUNKSIZE) as u32),
        ClassType::Run => {
            let rdsc = class.rdsc.expect("run class");
            let units = need.div_ceil(rdsc.unit_size) as u32;
            if units > rdsc.nallocs {
                return Err(HeapError::InvalidArgument(format!(
                    "request of {size} bytes does not fit class {}",
                    class.id
                )));
            }
            Ok(units)
        }
    }
}

fn try_reserve_on_mb(
    heap: &mut Heap,
    cache: &mut PageCache,
    wal: &mut WalTx,
    class: &AllocClass,
    size_idx: u32,
    mb_id: u32,
) -> Result<MemoryBlock> {
    let bucket_class = match class.ctype {
        ClassType::Huge => DEFAULT_ALLOC_CLASS_ID,
        ClassType::Run => class.id,
    };
    if !heap.has_class_bucket(mb_id, bucket_class) {
        heap.create_class_buckets(bucket_class);
    }
    let mut bucket = heap.bucket_acquire(mb_id, bucket_class);
    let mut m = MemoryBlock::huge(0, 0, size_idx);
    if class.ctype == ClassType::Run {
        m.kind = BlockKind::Run;
        m.rdsc = class.rdsc;
    }
    let rc = heap.get_bestfit_block(cache, wal, &mut bucket, mb_id, &mut m);
    heap.bucket_release(mb_id, bucket);
    rc.map(|_| m)
}

/// Reserve a block of at least `size` usable bytes.
pub fn reserve(
    heap: &mut Heap,
    cache: &mut PageCache,
    wal: &mut WalTx,
    size: u64,
    constructor: Option<Constructor<'_>>,
    extra: u64,
    flags: u64,
    log_ctor: bool,
) -> Result<PallocAction> {
    if size == 0 {
        return Err(HeapError::InvalidArgument("allocation with size 0".into()));
    }
    if size > DAV_MAX_ALLOC_SIZE {
        return Err(HeapError::OutOfSpace(format!(
            "requested size {size} too large"
        )));
    }

    let class_id = class_id_from_flags(flags);
    let zset_id = ezone_id_from_flags(flags);

    let class = if class_id != 0 {
        *heap
            .alloc_classes
            .by_id(class_id as u8)
            .ok_or_else(|| HeapError::InvalidArgument(format!("unknown class id {class_id}")))?
    } else {
        heap.best_class(size)
    };
    let size_idx = size_idx_for(&class, size)?;

    let m = if zset_id != 0 {
        // Explicit evictable bucket: make sure the zone is resident.
        if !heap.ismb_localrt(zset_id) || !heap.ismb_evictable(zset_id) {
            return Err(HeapError::InvalidArgument(format!(
                "zone {zset_id} is not an evictable memory bucket"
            )));
        }
        if !cache.off_is_loaded(zone_offset(zset_id)) {
            heap.zone_load(cache, zset_id)?;
        }
        match try_reserve_on_mb(heap, cache, wal, &class, size_idx, zset_id) {
            Ok(m) => m,
            Err(e) => {
                heap.log_alloc_failure(cache, wal, zset_id)?;
                return Err(e);
            }
        }
    } else {
        // Small allocations rotate through the active SOE buckets before
        // falling back to the default bucket.
        let mut got = None;
        if class.ctype == ClassType::Run {
            heap.soemb_active_iter_init();
            loop {
                let mbid = heap.soemb_active_get();
                if mbid == 0 {
                    break;
                }
                if let Ok(m) = try_reserve_on_mb(heap, cache, wal, &class, size_idx, mbid) {
                    got = Some(m);
                    break;
                }
            }
        }
        match got {
            Some(m) => m,
            None => try_reserve_on_mb(heap, cache, wal, &class, size_idx, 0)?,
        }
    };

    let act = PallocAction {
        kind: ActionKind::Alloc,
        m,
        offset: m.usable_off(),
        usable_size: m.usable_size(),
        chunk_flags: class.chunk_flags(),
        mb_id: heap.off2mbid(m.usable_off()),
    };

    act.m.write_header(cache, wal, extra, 0)?;

    if flags & FLAG_ZERO != 0 {
        cache.fill_bytes(act.offset, act.usable_size, 0);
    }
    if let Some(ctor) = constructor {
        ctor(cache.slice_mut(act.offset, act.usable_size));
    }
    if log_ctor {
        // Atomic allocations must carry the constructed content in the
        // redo log; transactional ones flush their ranges at commit.
        wal.snap(cache, act.offset, act.usable_size)?;
    }

    Ok(act)
}

/// Build a deferred-free action for the allocation at `off`.
pub fn defer_free(heap: &Heap, cache: &PageCache, off: BlobOff) -> Result<PallocAction> {
    let m = block_from_offset(heap, cache, off)?;
    Ok(PallocAction {
        kind: ActionKind::Free,
        m,
        offset: off,
        usable_size: m.usable_size(),
        chunk_flags: 0,
        mb_id: heap.off2mbid(off),
    })
}

/// Resolve an allocated block from its usable offset.
pub fn block_from_offset(heap: &Heap, cache: &PageCache, off: BlobOff) -> Result<MemoryBlock> {
    use crate::common::HEAP_HDR_SIZE;
    if off < HEAP_HDR_SIZE + ZONE_META_SIZE || off >= heap.heap_size {
        return Err(HeapError::InvalidArgument(format!(
            "offset {off} outside of heap"
        )));
    }
    let zid = zone_id_of(off);
    let in_zone = off - zone_offset(zid);
    if in_zone < ZONE_META_SIZE {
        return Err(HeapError::InvalidArgument(format!(
            "offset {off} points into zone metadata"
        )));
    }
    let mut cid = ((in_zone - ZONE_META_SIZE) / CHUNKSIZE) as u32;

    let mut hdr: ChunkHeader = cache.read_pod(chunk_header_off(zid, cid));
    if hdr.ctype == CHUNK_TYPE_RUN {
        // Walk back over the zero-sized cover markers to the run start.
        while hdr.size_idx == 0 {
            debug_assert!(cid > 0);
            cid -= 1;
            hdr = cache.read_pod(chunk_header_off(zid, cid));
        }
        let run_hdr: ChunkRunHeader =
            cache.read_pod(crate::heap::layout::chunk_data_off(zid, cid));
        let rdsc = match heap
            .alloc_classes
            .by_run(run_hdr.block_size, hdr.flags, hdr.size_idx)
        {
            Some(c) => c.rdsc.expect("run class"),
            None => RunDesc::compute(run_hdr.block_size, run_hdr.alignment, hdr.size_idx),
        };
        let header = HeaderType::from_chunk_flags(hdr.flags);
        let mut m = MemoryBlock::run(zid, cid, 0, 1, rdsc);
        m.header = header;
        let data = m.run_data_off();
        let delta = off - header.size() - data;
        if delta % rdsc.unit_size != 0 {
            return Err(HeapError::InvalidArgument(format!(
                "offset {off} is not an allocation boundary"
            )));
        }
        m.block_off = (delta / rdsc.unit_size) as u32;
        let (real_size, _, _) = m.read_header(cache);
        m.size_idx = (real_size.div_ceil(rdsc.unit_size) as u32).max(1);
        Ok(m)
    } else {
        if hdr.ctype != CHUNK_TYPE_USED {
            return Err(HeapError::NotFound(format!(
                "offset {off} is not allocated"
            )));
        }
        let mut m = MemoryBlock::huge(zid, cid, hdr.size_idx);
        m.header = HeaderType::from_chunk_flags(hdr.flags);
        Ok(m)
    }
}

/// Publish a batch of actions: stage the redo entries, apply them along
/// with the WAL records, then run the per-action bookkeeping.
pub fn publish(
    heap: &mut Heap,
    cache: &mut PageCache,
    wal: &mut WalTx,
    ctx: &mut OperationContext,
    actions: &[PallocAction],
) -> Result<()> {
    // Usage deltas are folded per zone so multiple actions against the
    // same zone publish one SET each.
    let mut zone_deltas: BTreeMap<u32, i64> = BTreeMap::new();
    let mut glob_delta: i64 = 0;

    for act in actions {
        let real = act.m.real_size() as i64;
        match act.kind {
            ActionKind::Alloc => {
                act.m.prep_hdr_alloc(ctx, act.chunk_flags);
                *zone_deltas.entry(act.m.zone_id).or_default() += real;
                glob_delta += real;
            }
            ActionKind::Free => {
                act.m.prep_hdr_free(ctx);
                *zone_deltas.entry(act.m.zone_id).or_default() -= real;
                glob_delta -= real;
            }
        }
    }

    for (zid, delta) in &zone_deltas {
        let cur = cache.read_u64(sp_usage_off(*zid));
        ctx.add_entry(
            sp_usage_off(*zid),
            cur.saturating_add_signed(*delta),
            OP_SET,
        );
    }
    if glob_delta != 0 {
        let cur = cache.read_u64(sp_usage_glob_off());
        ctx.add_entry(
            sp_usage_glob_off(),
            cur.saturating_add_signed(glob_delta),
            OP_SET,
        );
    }

    ctx.process(cache, wal)?;

    // Post-processing: volatile bookkeeping that depends on the now
    // persistent state.
    for act in actions {
        let real = act.m.real_size() as i64;
        match act.kind {
            ActionKind::Alloc => {
                if act.m.kind == BlockKind::Run {
                    let unit = act.m.rdsc.expect("run geometry").unit_size;
                    heap.tstats.run_allocated += act.m.size_idx as u64 * unit;
                }
                heap.incrmb_usage(cache, wal, act.m.zone_id, real)?;
            }
            ActionKind::Free => {
                if act.m.kind == BlockKind::Run {
                    let unit = act.m.rdsc.expect("run geometry").unit_size;
                    heap.tstats.run_allocated = heap
                        .tstats
                        .run_allocated
                        .saturating_sub(act.m.size_idx as u64 * unit);
                    heap.memblock_on_free(cache, &act.m);
                } else {
                    let mb_id = if heap.ismb_localrt(act.m.zone_id) {
                        act.m.zone_id
                    } else {
                        0
                    };
                    let mut b = heap.bucket_acquire(mb_id, DEFAULT_ALLOC_CLASS_ID);
                    let rc = heap.free_chunk_reuse(cache, wal, &mut b, act.m);
                    heap.bucket_release(mb_id, b);
                    rc?;
                }
                heap.incrmb_usage(cache, wal, act.m.zone_id, -real)?;
            }
        }
    }

    ctx.finish(false);
    Ok(())
}

/// Undo reservations: return the blocks to the volatile state.
pub fn cancel(
    heap: &mut Heap,
    cache: &mut PageCache,
    wal: &mut WalTx,
    actions: &[PallocAction],
) -> Result<()> {
    for act in actions {
        if act.kind != ActionKind::Alloc {
            continue;
        }
        match act.m.kind {
            BlockKind::Huge => {
                let mb_id = if heap.ismb_localrt(act.m.zone_id) {
                    act.m.zone_id
                } else {
                    0
                };
                let mut b = heap.bucket_acquire(mb_id, DEFAULT_ALLOC_CLASS_ID);
                let rc = heap.free_chunk_reuse(cache, wal, &mut b, act.m);
                heap.bucket_release(mb_id, b);
                rc?;
            }
            BlockKind::Run => {
                // The bitmap bits were never set; make sure the run's free
                // space is rediscovered.
                heap.memblock_on_free(cache, &act.m);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_idx_for_classes() {
        let classes = crate::heap::alloc_class::AllocClassCollection::new();
        let huge = *classes.huge();
        assert_eq!(size_idx_for(&huge, 1).unwrap(), 1);
        assert_eq!(size_idx_for(&huge, CHUNKSIZE).unwrap(), 2); // header spills
        assert_eq!(size_idx_for(&huge, 3 * CHUNKSIZE - 16).unwrap(), 3);

        let run = *classes.by_alloc_size(100);
        assert_eq!(size_idx_for(&run, 100).unwrap(), 1);
    }
}
