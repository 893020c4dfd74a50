// Memory blocks: the huge/run duality behind every allocation. A block is
// located by zone, chunk, unit offset and length; its operations know how
// to initialize chunks, flip persistent allocation state through an
// operation context and translate to usable byte ranges.

use crate::cache::PageCache;
use crate::common::{align_up, BlobOff, CHUNKSIZE};
use crate::error::Result;
use crate::heap::alloc_class::{AllocClassCollection, HeaderType, RunDesc};
use crate::heap::layout::{
    alloc_hdr_pack, alloc_hdr_unpack, chunk_data_off, chunk_header_off, AllocHdrCompact,
    AllocHdrLegacy, ChunkHeader, ChunkRunHeader, CHUNK_TYPE_FREE, CHUNK_TYPE_RUN, CHUNK_TYPE_USED,
    RUN_BASE_METADATA_SIZE,
};
use crate::memops::OperationContext;
use crate::ulog::{bits_to_val, OP_CLR_BITS, OP_SET, OP_SET_BITS};
use crate::wal::WalTx;
use bytemuck::Zeroable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Huge,
    Run,
}

/// A reserved or allocated extent. For huge blocks `size_idx` counts
/// chunks and `block_off` is zero; for run blocks `size_idx` counts units
/// and `block_off` is the first unit index.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBlock {
    pub zone_id: u32,
    pub chunk_id: u32,
    pub size_idx: u32,
    pub block_off: u32,
    pub kind: BlockKind,
    pub header: HeaderType,
    /// Run geometry, resolved from the class or the run header.
    pub rdsc: Option<RunDesc>,
}

impl MemoryBlock {
    pub fn huge(zone_id: u32, chunk_id: u32, size_idx: u32) -> Self {
        Self {
            zone_id,
            chunk_id,
            size_idx,
            block_off: 0,
            kind: BlockKind::Huge,
            header: HeaderType::Compact,
            rdsc: None,
        }
    }

    pub fn run(zone_id: u32, chunk_id: u32, block_off: u32, size_idx: u32, rdsc: RunDesc) -> Self {
        Self {
            zone_id,
            chunk_id,
            size_idx,
            block_off,
            kind: BlockKind::Run,
            header: HeaderType::Compact,
            rdsc: Some(rdsc),
        }
    }

    /// Stable ordering key: address order within the heap.
    #[inline]
    pub fn addr_key(&self) -> u64 {
        (self.zone_id as u64) << 40 | (self.chunk_id as u64) << 24 | self.block_off as u64
    }

    // ========================================================================
    // Geometry
    // ========================================================================

    /// Blob offset of the run's bitmap.
    pub fn run_bitmap_off(&self) -> BlobOff {
        debug_assert_eq!(self.kind, BlockKind::Run);
        chunk_data_off(self.zone_id, self.chunk_id) + RUN_BASE_METADATA_SIZE
    }

    /// Blob offset of the run's first unit.
    pub fn run_data_off(&self) -> BlobOff {
        let rdsc = self.rdsc.expect("run geometry");
        let raw = self.run_bitmap_off() + rdsc.bmap_words as u64 * 8;
        align_up(raw, rdsc.alignment.max(1))
    }

    /// Blob offset of the block itself (header included).
    pub fn block_off_abs(&self) -> BlobOff {
        match self.kind {
            BlockKind::Huge => chunk_data_off(self.zone_id, self.chunk_id),
            BlockKind::Run => {
                let rdsc = self.rdsc.expect("run geometry");
                self.run_data_off() + self.block_off as u64 * rdsc.unit_size
            }
        }
    }

    /// Total byte size of the block, header included.
    pub fn real_size(&self) -> u64 {
        match self.kind {
            BlockKind::Huge => self.size_idx as u64 * CHUNKSIZE,
            BlockKind::Run => self.size_idx as u64 * self.rdsc.expect("run geometry").unit_size,
        }
    }

    pub fn usable_off(&self) -> BlobOff {
        self.block_off_abs() + self.header.size()
    }

    pub fn usable_size(&self) -> u64 {
        self.real_size() - self.header.size()
    }

    // ========================================================================
    // Persistent state
    // ========================================================================

    /// Stage the persistent allocation markers for this block: the chunk
    /// header word for huge blocks, bitmap bits for run blocks.
    pub fn prep_hdr_alloc(&self, ctx: &mut OperationContext, chunk_flags: u16) {
        match self.kind {
            BlockKind::Huge => {
                let hdr = ChunkHeader::new(CHUNK_TYPE_USED, chunk_flags, self.size_idx);
                ctx.add_entry(
                    chunk_header_off(self.zone_id, self.chunk_id),
                    hdr.as_word(),
                    OP_SET,
                );
            }
            BlockKind::Run => self.run_bit_entries(ctx, OP_SET_BITS),
        }
    }

    /// Stage the markers for a free: huge blocks get a FREE header (and a
    /// matching footer for reverse coalescing), run blocks clear bits.
    pub fn prep_hdr_free(&self, ctx: &mut OperationContext) {
        match self.kind {
            BlockKind::Huge => {
                let hdr = ChunkHeader::new(CHUNK_TYPE_FREE, 0, self.size_idx);
                ctx.add_entry(
                    chunk_header_off(self.zone_id, self.chunk_id),
                    hdr.as_word(),
                    OP_SET,
                );
                if self.size_idx > 1 {
                    ctx.add_entry(
                        chunk_header_off(self.zone_id, self.chunk_id + self.size_idx - 1),
                        hdr.as_word(),
                        OP_SET,
                    );
                }
            }
            BlockKind::Run => self.run_bit_entries(ctx, OP_CLR_BITS),
        }
    }

    fn run_bit_entries(&self, ctx: &mut OperationContext, op: u64) {
        let bmap_off = self.run_bitmap_off();
        let mut bit = self.block_off;
        let end = self.block_off + self.size_idx;
        while bit < end {
            let word = bit / 64;
            let pos = bit % 64;
            let num = (end - bit).min(64 - pos) as u16;
            ctx.add_entry(bmap_off + word as u64 * 8, bits_to_val(pos, num), op);
            bit += num as u32;
        }
    }

    // ========================================================================
    // Allocation header
    // ========================================================================

    /// Write the allocation header in front of the usable area and log it.
    pub fn write_header(
        &self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        extra: u64,
        flags: u16,
    ) -> Result<()> {
        let off = self.block_off_abs();
        match self.header {
            HeaderType::Compact => {
                let hdr = AllocHdrCompact {
                    size: alloc_hdr_pack(self.real_size(), flags),
                    extra,
                };
                cache.write_pod(off, &hdr);
                wal.snap(cache, off, std::mem::size_of::<AllocHdrCompact>() as u64)?;
            }
            HeaderType::Legacy => {
                let mut hdr = AllocHdrLegacy::zeroed();
                hdr.size = alloc_hdr_pack(self.real_size(), flags);
                hdr.type_num = extra;
                cache.write_pod(off, &hdr);
                wal.snap(cache, off, std::mem::size_of::<AllocHdrLegacy>() as u64)?;
            }
            HeaderType::None => {}
        }
        Ok(())
    }

    /// Read back `(real_size, flags, extra)` from the allocation header.
    pub fn read_header(&self, cache: &PageCache) -> (u64, u16, u64) {
        let off = self.block_off_abs();
        match self.header {
            HeaderType::Compact => {
                let hdr: AllocHdrCompact = cache.read_pod(off);
                let (size, flags) = alloc_hdr_unpack(hdr.size);
                (size, flags, hdr.extra)
            }
            HeaderType::Legacy => {
                let hdr: AllocHdrLegacy = cache.read_pod(off);
                let (size, flags) = alloc_hdr_unpack(hdr.size);
                (size, flags, hdr.type_num)
            }
            HeaderType::None => (self.real_size(), 0, 0),
        }
    }
}

// ============================================================================
// Chunk initialization
// ============================================================================

/// Persist `[off, off + len)` exactly as it stands in cache memory.
fn persist(cache: &mut PageCache, wal: &mut WalTx, off: BlobOff, len: u64) -> Result<()> {
    wal.snap(cache, off, len)
}

/// Write a FREE chunk extent: header plus footer for reverse coalescing.
pub fn huge_init(
    cache: &mut PageCache,
    wal: &mut WalTx,
    zone_id: u32,
    chunk_id: u32,
    size_idx: u32,
) -> Result<MemoryBlock> {
    let hdr = ChunkHeader::new(CHUNK_TYPE_FREE, 0, size_idx);
    let off = chunk_header_off(zone_id, chunk_id);
    cache.write_pod(off, &hdr);
    persist(cache, wal, off, 8)?;
    if size_idx > 1 {
        let foot_off = chunk_header_off(zone_id, chunk_id + size_idx - 1);
        cache.write_pod(foot_off, &hdr);
        persist(cache, wal, foot_off, 8)?;
    }
    Ok(MemoryBlock::huge(zone_id, chunk_id, size_idx))
}

/// Turn a FREE chunk extent into a run: run header, bitmap with the tail
/// bits pre-set, and the RUN chunk header.
pub fn run_init(
    cache: &mut PageCache,
    wal: &mut WalTx,
    zone_id: u32,
    chunk_id: u32,
    rdsc: RunDesc,
    chunk_flags: u16,
) -> Result<MemoryBlock> {
    let data = chunk_data_off(zone_id, chunk_id);
    let run_hdr = ChunkRunHeader {
        block_size: rdsc.unit_size,
        alignment: rdsc.alignment,
    };
    cache.write_pod(data, &run_hdr);
    persist(cache, wal, data, RUN_BASE_METADATA_SIZE)?;

    // Zero the bitmap; bits past `nallocs` read as allocated forever.
    let bmap_off = data + RUN_BASE_METADATA_SIZE;
    for w in 0..rdsc.bmap_words {
        let first_bit = w * 64;
        let mut word: u64 = 0;
        if first_bit + 64 > rdsc.nallocs {
            let valid = rdsc.nallocs.saturating_sub(first_bit).min(64);
            word = if valid == 0 { u64::MAX } else { !((1u64 << valid) - 1) };
        }
        cache.write_bytes(bmap_off + w as u64 * 8, &word.to_le_bytes());
    }
    persist(cache, wal, bmap_off, rdsc.bmap_words as u64 * 8)?;

    let hdr = ChunkHeader::new(CHUNK_TYPE_RUN, chunk_flags, rdsc.size_idx);
    let hdr_off = chunk_header_off(zone_id, chunk_id);
    cache.write_pod(hdr_off, &hdr);
    persist(cache, wal, hdr_off, 8)?;

    // Covered chunks carry a zero-sized RUN marker so an offset landing in
    // the middle of a run can be walked back to the run start.
    for c in 1..rdsc.size_idx {
        let cover = ChunkHeader::new(CHUNK_TYPE_RUN, chunk_flags, 0);
        let off = chunk_header_off(zone_id, chunk_id + c);
        cache.write_pod(off, &cover);
        persist(cache, wal, off, 8)?;
    }

    Ok(MemoryBlock::run(zone_id, chunk_id, 0, rdsc.size_idx, rdsc))
}

/// Rebuild the runtime view of a block from its chunk header.
pub fn rebuild_state(
    cache: &PageCache,
    classes: &AllocClassCollection,
    m: &mut MemoryBlock,
) -> ChunkHeader {
    let hdr: ChunkHeader = cache.read_pod(chunk_header_off(m.zone_id, m.chunk_id));
    match hdr.ctype {
        CHUNK_TYPE_RUN => {
            m.kind = BlockKind::Run;
            m.header = HeaderType::from_chunk_flags(hdr.flags);
            let run_hdr: ChunkRunHeader =
                cache.read_pod(chunk_data_off(m.zone_id, m.chunk_id));
            m.rdsc = match classes.by_run(run_hdr.block_size, hdr.flags, hdr.size_idx) {
                Some(c) => c.rdsc,
                // Unknown class: derive geometry straight from the header.
                None => Some(RunDesc::compute(
                    run_hdr.block_size,
                    run_hdr.alignment,
                    hdr.size_idx,
                )),
            };
        }
        _ => {
            m.kind = BlockKind::Huge;
            m.header = HeaderType::from_chunk_flags(hdr.flags);
            m.rdsc = None;
        }
    }
    hdr
}

// ============================================================================
// Run bitmap queries
// ============================================================================

/// Count free units in a run.
pub fn run_free_space(cache: &PageCache, m: &MemoryBlock) -> u32 {
    let rdsc = m.rdsc.expect("run geometry");
    let bmap_off = m.run_bitmap_off();
    let mut free = 0u32;
    for w in 0..rdsc.bmap_words {
        let word = cache.read_u64(bmap_off + w as u64 * 8);
        free += word.count_zeros();
    }
    // Tail bits past nallocs are pre-set, so zeros only occur in range.
    free
}

/// Collect the free unit ranges of a run as allocatable blocks.
pub fn run_free_ranges(cache: &PageCache, m: &MemoryBlock) -> Vec<MemoryBlock> {
    let rdsc = m.rdsc.expect("run geometry");
    let bmap_off = m.run_bitmap_off();
    let mut out = Vec::new();
    let mut start: Option<u32> = None;
    for bit in 0..rdsc.nallocs {
        let word = cache.read_u64(bmap_off + (bit / 64) as u64 * 8);
        let set = word & (1u64 << (bit % 64)) != 0;
        match (set, start) {
            (false, None) => start = Some(bit),
            (true, Some(s)) => {
                let mut blk = *m;
                blk.block_off = s;
                blk.size_idx = bit - s;
                out.push(blk);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        let mut blk = *m;
        blk.block_off = s;
        blk.size_idx = rdsc.nallocs - s;
        out.push(blk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::alloc_class::ClassType;
    use crate::memops::{LogType, OperationContext};

    #[test]
    fn test_block_geometry() {
        let rdsc = RunDesc::compute(128, 0, 1);
        let m = MemoryBlock::run(0, 2, 5, 1, rdsc);
        let chunk = chunk_data_off(0, 2);
        assert_eq!(m.run_bitmap_off(), chunk + 16);
        let data = chunk + 16 + rdsc.bmap_words as u64 * 8;
        assert_eq!(m.run_data_off(), data);
        assert_eq!(m.block_off_abs(), data + 5 * 128);
        assert_eq!(m.usable_size(), 128 - 16);

        let h = MemoryBlock::huge(1, 3, 2);
        assert_eq!(h.block_off_abs(), chunk_data_off(1, 3));
        assert_eq!(h.real_size(), 2 * CHUNKSIZE);
    }

    #[test]
    fn test_prep_hdr_entries() {
        let mut ctx = OperationContext::new(LogType::Redo, 1024, 1024);
        ctx.start();

        let h = MemoryBlock::huge(0, 1, 3);
        h.prep_hdr_alloc(&mut ctx, 0x1);
        h.prep_hdr_free(&mut ctx);
        // USED header, FREE header and FREE footer: three SET entries.
        assert_eq!(ctx.entry_count(), 3);

        // A run block crossing a word boundary emits two bit entries.
        let rdsc = RunDesc::compute(128, 0, 1);
        let m = MemoryBlock::run(0, 2, 60, 10, rdsc);
        let mut ctx2 = OperationContext::new(LogType::Redo, 1024, 1024);
        ctx2.start();
        m.prep_hdr_alloc(&mut ctx2, 0);
        assert_eq!(ctx2.entry_count(), 2);
    }

    #[test]
    fn test_default_class_sanity() {
        let classes = AllocClassCollection::new();
        for c in classes.iter() {
            assert_eq!(c.ctype, ClassType::Run);
            let rdsc = c.rdsc.unwrap();
            assert!(rdsc.nallocs > 0);
            assert!(rdsc.bmap_words as u64 * 8 + RUN_BASE_METADATA_SIZE < CHUNKSIZE);
        }
    }
}
