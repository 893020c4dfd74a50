// # Page Cache
//
// Maps MD-blob offsets to in-memory pages. A page is a zone-sized buffer;
// dirty state is tracked per 4 KiB chunk in a bitmap. The cache owns the
// flush direction state machine:
//
// ```text
// CLEAN -> DIRTY (touch) -> FLUSHING (checkpoint start)
//                               -> CLEAN (once the commit id covers it)
//       -> WAIT_COMMIT (flush attempt against an uncommitted write)
//                               -> DIRTY (commit id advanced)
// ```
//
// Eviction only ever takes evictable pages from the cold LRU; non-evictable
// pages count against `max_ne_pages` and a small reserve of free pages is
// kept for non-evictable growth. All operations are single-threaded per
// pool; suspension points live behind the store.

mod page;

pub use page::{DirtyList, LruList, MdPageId, PageId, PageInfo, PageList};

use crate::common::{
    BlobOff, TxId, UMEM_CACHE_CHUNK_SZ_SHIFT, UMEM_CACHE_RSRVD_PAGES,
};
use crate::error::{HeapError, Result};
use crate::store::{MetaStore, StoreIod, StoreRegion, WaitQueue};
use std::rc::Rc;

/// Pages per bitmap word index shift (64 chunk bits per word).
const CHUNK_IDX_SHIFT: u32 = 6;

/// Largest supported page size (128 MiB).
const PAGE_SHIFT_MAX: u32 = 27;

/// Maximum number of sets of pages in flight during a checkpoint.
const MAX_INFLIGHT_SETS: usize = 4;
/// Maximum contiguous range a single checkpoint IOV may cover.
const MAX_IO_SIZE: u64 = 8 * 1024 * 1024;
/// Maximum number of pages in one checkpoint set.
const MAX_PAGES_PER_SET: usize = 10;

/// Notifications raised by the cache for the heap to consume after the
/// call returns (replaces the C callback pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    PageLoad(MdPageId),
    PageEvict(MdPageId),
}

/// Keeps a set of MD pages mapped, loaded and referenced.
#[derive(Debug)]
pub struct PinHandle {
    pages: Vec<MdPageId>,
}

/// Checkpoint outcome counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChkptStats {
    pub nr_pages: u64,
    pub nr_dchunks: u64,
    pub nr_iovs: u64,
}

/// Cache hit/miss/eviction counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
    pub flushes: u64,
}

struct ChkptSet {
    regions: Vec<StoreRegion>,
    /// (memory page, offset inside page, length), parallel to `regions`.
    iovs: Vec<(PageId, u64, u64)>,
    pages: Vec<PageId>,
    fh: crate::store::FlushHandle,
    max_tx: TxId,
    nr_dchunks: u32,
}

impl ChkptSet {
    fn new() -> Self {
        Self {
            regions: Vec::new(),
            iovs: Vec::new(),
            pages: Vec::new(),
            fh: 0,
            max_tx: 0,
            nr_dchunks: 0,
        }
    }
}

pub struct PageCache {
    store: Rc<dyn MetaStore>,
    base_off: u64,
    page_sz: u64,
    page_shift: u32,
    page_mask: u64,
    bmap_words: usize,
    md_pages: u32,
    mem_pages: u32,
    max_ne_pages: u32,
    /// 1: every MD page resident, eviction disabled. 2: paged.
    mode: u8,

    /// MD page id -> memory page, when mapped.
    map: Vec<Option<PageId>>,
    pages: Vec<PageInfo>,
    bufs: Vec<Box<[u8]>>,
    /// Evictability of each MD page, maintained by the heap.
    evictable_tags: Vec<bool>,

    free: PageList,
    lru_ne: PageList,
    lru_ev: PageList,
    pinned: PageList,
    dirty: PageList,
    wait_commit: PageList,
    flushing: PageList,

    free_cnt: u32,
    ne_cnt: u32,
    pinned_cnt: u32,

    commit_id: TxId,
    replay_done: bool,
    reserve_wq: WaitQueue,
    stats: CacheStats,
    events: Vec<CacheEvent>,
}

impl PageCache {
    /// Build the cache. `mem_pages == 0` selects phase-1 mode where every
    /// MD page is resident and eviction is disabled.
    pub fn new(
        store: Rc<dyn MetaStore>,
        page_sz: u64,
        md_pages: u32,
        mem_pages: u32,
        max_ne_pages: u32,
        base_off: u64,
    ) -> Result<Self> {
        if !page_sz.is_power_of_two() {
            return Err(HeapError::InvalidArgument(format!(
                "page size {page_sz} is not a power of two"
            )));
        }
        let page_shift = page_sz.trailing_zeros();
        if page_shift > PAGE_SHIFT_MAX {
            return Err(HeapError::InvalidArgument(format!(
                "page size {page_sz} above maximum"
            )));
        }
        if page_shift <= UMEM_CACHE_CHUNK_SZ_SHIFT + CHUNK_IDX_SHIFT {
            return Err(HeapError::InvalidArgument(format!(
                "page size {page_sz} below minimum"
            )));
        }
        if md_pages == 0 || (mem_pages != 0 && md_pages < mem_pages) {
            return Err(HeapError::InvalidArgument(
                "md pages must cover mem pages".into(),
            ));
        }

        let (mem_pages, max_ne_pages, mode) = if mem_pages == 0 {
            (md_pages, md_pages, 1u8)
        } else {
            (mem_pages, max_ne_pages, 2u8)
        };

        let bmap_words = 1usize << (page_shift - UMEM_CACHE_CHUNK_SZ_SHIFT - CHUNK_IDX_SHIFT);

        let mut cache = Self {
            store,
            base_off,
            page_sz,
            page_shift,
            page_mask: page_sz - 1,
            bmap_words,
            md_pages,
            mem_pages,
            max_ne_pages,
            mode,
            map: vec![None; md_pages as usize],
            pages: (0..mem_pages).map(|_| PageInfo::new(bmap_words)).collect(),
            bufs: (0..mem_pages)
                .map(|_| vec![0u8; page_sz as usize].into_boxed_slice())
                .collect(),
            evictable_tags: vec![false; md_pages as usize],
            free: PageList::new(),
            lru_ne: PageList::new(),
            lru_ev: PageList::new(),
            pinned: PageList::new(),
            dirty: PageList::new(),
            wait_commit: PageList::new(),
            flushing: PageList::new(),
            free_cnt: 0,
            ne_cnt: 0,
            pinned_cnt: 0,
            commit_id: 0,
            replay_done: false,
            reserve_wq: WaitQueue::new(),
            stats: CacheStats::default(),
            events: Vec::new(),
        };

        for id in 0..mem_pages {
            cache.free.push_tail(id);
            cache.pages[id as usize].lru = LruList::Free;
            cache.free_cnt += 1;
        }

        if cache.mode == 1 {
            // Map every MD page eagerly; nothing ever leaves the cache.
            for pg_id in 0..md_pages {
                let id = cache.pop_free_page().expect("mode 1 sizing");
                let pi = &mut cache.pages[id as usize];
                pi.pg_id = pg_id;
                pi.mapped = true;
                pi.loaded = true;
                pi.lru = LruList::LruNe;
                cache.map[pg_id as usize] = Some(id);
                cache.lru_ne.push_tail(id);
                cache.ne_cnt += 1;
            }
        }

        tracing::debug!(
            md_pages,
            mem_pages = cache.mem_pages,
            max_ne = cache.max_ne_pages,
            mode = cache.mode,
            "page cache allocated"
        );
        Ok(cache)
    }

    // ========================================================================
    // Mapping math
    // ========================================================================

    #[inline]
    fn off2id(&self, off: BlobOff) -> MdPageId {
        debug_assert!(off >= self.base_off);
        ((off - self.base_off) >> self.page_shift) as MdPageId
    }

    #[inline]
    fn off2pg_off(&self, off: BlobOff) -> u64 {
        (off - self.base_off) & self.page_mask
    }

    #[inline]
    fn id2off(&self, pg_id: MdPageId) -> BlobOff {
        ((pg_id as u64) << self.page_shift) + self.base_off
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_sz
    }

    #[inline]
    pub fn mem_page_count(&self) -> u32 {
        self.mem_pages
    }

    #[inline]
    pub fn free_pages(&self) -> u32 {
        self.free_cnt
    }

    #[inline]
    pub fn nonevictable_pages(&self) -> u32 {
        self.ne_cnt
    }

    #[inline]
    pub fn pinned_pages(&self) -> u32 {
        self.pinned_cnt
    }

    #[inline]
    pub fn commit_id(&self) -> TxId {
        self.commit_id
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.stats
    }

    pub fn take_events(&mut self) -> Vec<CacheEvent> {
        std::mem::take(&mut self.events)
    }

    /// Record the evictability of an MD page. Maintained by the heap as
    /// zones change role; consulted on every map/unpin decision.
    pub fn set_evictable_tag(&mut self, pg_id: MdPageId, evictable: bool) {
        self.evictable_tags[pg_id as usize] = evictable;
    }

    #[inline]
    fn is_id_evictable(&self, pg_id: MdPageId) -> bool {
        self.evictable_tags[pg_id as usize]
    }

    pub fn off_is_loaded(&self, off: BlobOff) -> bool {
        match self.map[self.off2id(off) as usize] {
            Some(id) => self.pages[id as usize].loaded,
            None => false,
        }
    }

    pub fn off_is_pinned(&self, off: BlobOff) -> bool {
        match self.map[self.off2id(off) as usize] {
            Some(id) => self.pages[id as usize].refcount > 0,
            None => false,
        }
    }

    // ========================================================================
    // Byte access
    // ========================================================================

    fn resolve(&self, off: BlobOff, len: u64) -> (PageId, usize) {
        let pg_id = self.off2id(off);
        let in_pg = self.off2pg_off(off);
        assert!(
            in_pg + len <= self.page_sz,
            "access crosses page boundary: off={off} len={len}"
        );
        let id = self.map[pg_id as usize].expect("access to unmapped page");
        debug_assert!(self.pages[id as usize].loaded, "access to unloaded page");
        (id, in_pg as usize)
    }

    pub fn slice(&self, off: BlobOff, len: u64) -> &[u8] {
        let (id, start) = self.resolve(off, len);
        &self.bufs[id as usize][start..start + len as usize]
    }

    pub fn slice_mut(&mut self, off: BlobOff, len: u64) -> &mut [u8] {
        let (id, start) = self.resolve(off, len);
        &mut self.bufs[id as usize][start..start + len as usize]
    }

    pub fn read_into(&self, off: BlobOff, out: &mut [u8]) {
        out.copy_from_slice(self.slice(off, out.len() as u64));
    }

    pub fn write_bytes(&mut self, off: BlobOff, src: &[u8]) {
        self.slice_mut(off, src.len() as u64).copy_from_slice(src);
    }

    pub fn fill_bytes(&mut self, off: BlobOff, len: u64, val: u8) {
        self.slice_mut(off, len).fill(val);
    }

    pub fn read_u64(&self, off: BlobOff) -> u64 {
        u64::from_le_bytes(self.slice(off, 8).try_into().unwrap())
    }

    pub fn read_u32(&self, off: BlobOff) -> u32 {
        u32::from_le_bytes(self.slice(off, 4).try_into().unwrap())
    }

    pub fn read_pod<T: bytemuck::AnyBitPattern>(&self, off: BlobOff) -> T {
        bytemuck::pod_read_unaligned(self.slice(off, std::mem::size_of::<T>() as u64))
    }

    pub fn write_pod<T: bytemuck::NoUninit>(&mut self, off: BlobOff, v: &T) {
        self.write_bytes(off, bytemuck::bytes_of(v));
    }

    // ========================================================================
    // List plumbing
    // ========================================================================

    fn pop_free_page(&mut self) -> Option<PageId> {
        let id = self.free.pop_head()?;
        debug_assert_eq!(self.pages[id as usize].lru, LruList::Free);
        self.pages[id as usize].lru = LruList::None;
        debug_assert!(self.free_cnt > 0);
        self.free_cnt -= 1;
        Some(id)
    }

    fn push_free_page(&mut self, id: PageId) {
        debug_assert_eq!(self.pages[id as usize].lru, LruList::None);
        self.pages[id as usize].lru = LruList::Free;
        self.free.push_tail(id);
        self.free_cnt += 1;
    }

    fn lru_remove(&mut self, id: PageId) {
        match self.pages[id as usize].lru {
            LruList::Free => self.free.remove(id),
            LruList::LruNe => self.lru_ne.remove(id),
            LruList::LruEv => self.lru_ev.remove(id),
            LruList::Pinned => self.pinned.remove(id),
            LruList::None => {}
        }
        self.pages[id as usize].lru = LruList::None;
    }

    fn add_to_lru(&mut self, id: PageId) {
        let pi = &mut self.pages[id as usize];
        debug_assert_eq!(pi.lru, LruList::None);
        debug_assert_eq!(pi.refcount, 0);
        if pi.evictable {
            pi.lru = LruList::LruEv;
            self.lru_ev.push_tail(id);
        } else {
            pi.lru = LruList::LruNe;
            self.lru_ne.push_tail(id);
        }
    }

    fn map_page(&mut self, id: PageId, pg_id: MdPageId) {
        let evictable = self.is_id_evictable(pg_id);
        let pi = &mut self.pages[id as usize];
        debug_assert!(!pi.mapped && !pi.loaded && pi.refcount == 0);
        pi.mapped = true;
        pi.pg_id = pg_id;
        pi.evictable = evictable;
        self.map[pg_id as usize] = Some(id);
        if !evictable {
            self.ne_cnt += 1;
        }
    }

    fn unmap_page(&mut self, id: PageId) {
        let pg_id = {
            let pi = &mut self.pages[id as usize];
            debug_assert!(pi.mapped && pi.refcount == 0 && !pi.io && !pi.copying);
            debug_assert_eq!(pi.dirty, DirtyList::None);
            pi.mapped = false;
            pi.loaded = false;
            pi.last_inflight = 0;
            pi.last_checkpoint = 0;
            pi.clear_bmap();
            pi.pg_id
        };
        self.map[pg_id as usize] = None;
        self.push_free_page(id);
        if !self.is_id_evictable(pg_id) {
            debug_assert!(self.ne_cnt > 0);
            self.ne_cnt -= 1;
        }
    }

    fn pin_page(&mut self, id: PageId) {
        let was = self.pages[id as usize].refcount;
        self.pages[id as usize].refcount = was + 1;
        if was == 0 {
            self.lru_remove(id);
            self.pages[id as usize].lru = LruList::Pinned;
            self.pinned.push_tail(id);
            if self.is_id_evictable(self.pages[id as usize].pg_id) {
                self.pinned_cnt += 1;
            }
        }
    }

    fn unpin_page(&mut self, id: PageId) {
        let pi = &mut self.pages[id as usize];
        debug_assert!(pi.refcount > 0);
        pi.refcount -= 1;
        if pi.refcount == 0 {
            self.lru_remove(id);
            self.add_to_lru(id);
            if self.is_id_evictable(self.pages[id as usize].pg_id) {
                debug_assert!(self.pinned_cnt > 0);
                self.pinned_cnt -= 1;
            }
        }
    }

    // ========================================================================
    // Touch (write visibility)
    // ========================================================================

    /// Mark `[addr, addr + size)` as written by `tx_id`: set the dirty
    /// chunk bits, advance the inflight id and queue the page on the dirty
    /// list. Fails with `CheckpointBusy` while a checkpoint copy is live.
    pub fn touch(&mut self, tx_id: TxId, addr: BlobOff, size: u64) -> Result<()> {
        debug_assert!(size > 0 && size <= self.page_sz);
        let end = addr + size - 1;
        let first = self.off2id(addr);
        let last = self.off2id(end);

        let first_mem = self.map[first as usize].expect("touch on unmapped page");
        if self.pages[first_mem as usize].copying {
            return Err(HeapError::CheckpointBusy(first));
        }

        if first != last {
            // Only the fully-resident mode accepts cross-page writes.
            assert_eq!(self.mode, 1, "cross-page touch in paged mode");
            let last_mem = self.map[last as usize].expect("touch on unmapped page");
            if self.pages[last_mem as usize].copying {
                return Err(HeapError::CheckpointBusy(last));
            }
            let split = (end - self.base_off) & !self.page_mask;
            self.touch_one(last_mem, tx_id, split + self.base_off, end);
            self.touch_one(first_mem, tx_id, addr, split + self.base_off - 1);
        } else {
            self.touch_one(first_mem, tx_id, addr, end);
        }
        Ok(())
    }

    fn touch_one(&mut self, id: PageId, tx_id: TxId, first_byte: BlobOff, last_byte: BlobOff) {
        let start_bit = (self.off2pg_off(first_byte)) >> UMEM_CACHE_CHUNK_SZ_SHIFT;
        let end_bit = (self.off2pg_off(last_byte)) >> UMEM_CACHE_CHUNK_SZ_SHIFT;
        let pi = &mut self.pages[id as usize];

        debug_assert!(tx_id >= pi.last_inflight, "stale write tx id");
        debug_assert!(
            pi.last_checkpoint == 0 || tx_id > pi.last_checkpoint,
            "write behind checkpoint"
        );

        for bit in start_bit..=end_bit {
            pi.bmap[(bit >> CHUNK_IDX_SHIFT) as usize] |= 1u64 << (bit & 63);
        }

        debug_assert!(pi.loaded);
        pi.last_inflight = tx_id;

        // Leave list membership alone while the page is being flushed.
        if pi.flushing {
            return;
        }
        debug_assert!(!pi.io);
        if pi.dirty == DirtyList::None {
            pi.dirty = DirtyList::Dirty;
            self.dirty.push_tail(id);
        }
    }

    // ========================================================================
    // Mapping / loading / pinning
    // ========================================================================

    fn ranges_to_pages(&self, ranges: &[StoreRegion]) -> Result<Vec<MdPageId>> {
        let mut pages = Vec::new();
        for (i, r) in ranges.iter().enumerate() {
            if i > 0 {
                let prev = &ranges[i - 1];
                if r.addr < prev.addr + prev.size {
                    return Err(HeapError::InvalidArgument(
                        "overlapping or unsorted cache ranges".into(),
                    ));
                }
            }
            debug_assert!(r.size > 0);
            let mut off = r.addr;
            let end = r.addr + r.size - 1;
            loop {
                let id = self.off2id(off);
                if pages.last() != Some(&id) {
                    pages.push(id);
                }
                let next = self.id2off(id) + self.page_sz;
                if next > end {
                    break;
                }
                off = next;
            }
        }
        Ok(pages)
    }

    fn need_reserve(&self, extra: u32) -> bool {
        let mut page_nr = 0;
        if self.replay_done {
            debug_assert!(self.ne_cnt <= self.max_ne_pages);
            page_nr = (self.max_ne_pages - self.ne_cnt).min(UMEM_CACHE_RSRVD_PAGES);
        }
        page_nr += extra;
        page_nr != 0 && self.free_cnt < page_nr
    }

    fn need_evict(&self) -> bool {
        self.free.is_empty() || self.need_reserve(1)
    }

    fn get_free_page(&mut self, pinned_here: u32, for_sys: bool) -> Result<PageId> {
        let mut retry = 0;
        while self.need_evict() {
            match self.evict_page(for_sys) {
                Ok(()) => {}
                Err(e) if matches!(e, HeapError::Retry(_)) => {}
                Err(e) if matches!(e, HeapError::Busy(_)) => {
                    if pinned_here == self.pinned_cnt {
                        return Err(HeapError::OutOfSpace(
                            "not enough evictable pages".into(),
                        ));
                    }
                }
                Err(e) => return Err(e),
            }
            retry += 1;
            if retry > 10_000 {
                return Err(HeapError::OutOfSpace("eviction made no progress".into()));
            }
        }
        Ok(self.pop_free_page().expect("free page after eviction"))
    }

    /// Map empty pages for the given ranges without loading their content.
    /// Re-checks evictability of pages that are already mapped.
    pub fn map_ranges(&mut self, ranges: &[StoreRegion]) -> Result<()> {
        let pages = self.ranges_to_pages(ranges)?;
        for pg_id in pages {
            if let Some(id) = self.map[pg_id as usize] {
                debug_assert!(self.pages[id as usize].mapped && self.pages[id as usize].loaded);
                let tag = self.is_id_evictable(pg_id);
                if tag != self.pages[id as usize].evictable {
                    self.pages[id as usize].evictable = tag;
                    if tag {
                        debug_assert!(self.ne_cnt > 0);
                        self.ne_cnt -= 1;
                    } else {
                        self.ne_cnt += 1;
                    }
                    if self.pages[id as usize].refcount == 0 {
                        self.lru_remove(id);
                        self.add_to_lru(id);
                    }
                }
                continue;
            }

            let id = if self.is_id_evictable(pg_id) {
                self.get_free_page(0, false)?
            } else {
                self.pop_free_page()
                    .ok_or_else(|| HeapError::Busy("no free pages".into()))?
            };
            self.bufs[id as usize].fill(0);
            self.map_page(id, pg_id);
            // Mapping an empty page: content is defined as zero, no load.
            self.pages[id as usize].loaded = true;
            self.add_to_lru(id);
        }
        Ok(())
    }

    fn load_page(&mut self, id: PageId) -> Result<()> {
        debug_assert!(self.pages[id as usize].mapped);
        if self.pages[id as usize].io {
            // Single task: an in-flight load here is a logic error.
            return Err(HeapError::Internal("page load raced".into()));
        }
        let pg_id = self.pages[id as usize].pg_id;
        let offset = self.id2off(pg_id);
        debug_assert!(offset < self.store.size());
        let len = self.page_sz.min(self.store.size() - offset);

        self.pages[id as usize].io = true;
        let store = Rc::clone(&self.store);
        let res = store.load(&mut self.bufs[id as usize][..len as usize], offset);
        self.pages[id as usize].io = false;
        res?;

        self.pages[id as usize].loaded = true;
        if self.pages[id as usize].refcount == 0 && self.pages[id as usize].lru == LruList::None {
            self.add_to_lru(id);
        }
        self.stats.loads += 1;
        self.events.push(CacheEvent::PageLoad(pg_id));
        Ok(())
    }

    fn pin_pages(&mut self, pages: &[MdPageId], for_sys: bool) -> Result<()> {
        let mut processed = 0;
        let mut pinned_here = 0;
        let mut rc = Ok(());

        for &pg_id in pages {
            let id = match self.map[pg_id as usize] {
                Some(id) => {
                    self.stats.hits += 1;
                    id
                }
                None => {
                    let id = match self.get_free_page(pinned_here, for_sys) {
                        Ok(id) => id,
                        Err(e) => {
                            rc = Err(e);
                            break;
                        }
                    };
                    self.stats.misses += 1;
                    self.bufs[id as usize].fill(0);
                    self.map_page(id, pg_id);
                    id
                }
            };
            self.pin_page(id);
            processed += 1;
            if self.is_id_evictable(pg_id) {
                pinned_here += 1;
            }
        }

        if rc.is_ok() {
            for &pg_id in pages {
                let id = self.map[pg_id as usize].expect("pinned page mapped");
                if !self.pages[id as usize].loaded {
                    if let Err(e) = self.load_page(id) {
                        rc = Err(e);
                        break;
                    }
                }
                self.pages[id as usize].sys = for_sys;
            }
        }

        if let Err(e) = rc {
            for &pg_id in &pages[..processed] {
                let id = self.map[pg_id as usize].expect("mapped");
                self.unpin_page(id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Ensure every page covered by `ranges` is mapped, loaded and
    /// referenced until the returned handle is passed to `unpin`.
    pub fn pin_ranges(&mut self, ranges: &[StoreRegion], for_sys: bool) -> Result<PinHandle> {
        let pages = self.ranges_to_pages(ranges)?;
        self.pin_pages(&pages, for_sys)?;
        Ok(PinHandle { pages })
    }

    pub fn unpin(&mut self, handle: PinHandle) {
        for pg_id in handle.pages {
            let id = self.map[pg_id as usize].expect("unpin of unmapped page");
            self.unpin_page(id);
        }
    }

    /// Load pages and immediately drop the references (prefetch).
    pub fn load_ranges(&mut self, ranges: &[StoreRegion], for_sys: bool) -> Result<()> {
        let handle = self.pin_ranges(ranges, for_sys)?;
        self.unpin(handle);
        Ok(())
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    fn evict_page(&mut self, for_sys: bool) -> Result<()> {
        if self.ne_cnt == self.mem_pages {
            return Err(HeapError::OutOfSpace("no evictable page".into()));
        }
        if self.lru_ev.is_empty() {
            return Err(HeapError::Busy("all evictable pages are pinned".into()));
        }

        // Prefer the MRU page when it was brought in by system access.
        let mut id = self.lru_ev.head().unwrap();
        if for_sys {
            let tail = self.lru_ev.tail().unwrap();
            if self.pages[tail as usize].sys {
                id = tail;
            }
        }
        debug_assert_eq!(self.pages[id as usize].refcount, 0);

        if self.pages[id as usize].io {
            debug_assert!(self.pages[id as usize].flushing);
            return Err(HeapError::Retry("page flush in progress".into()));
        }

        if self.pages[id as usize].dirty == DirtyList::WaitCommit {
            return Err(HeapError::Retry("page awaiting WAL commit".into()));
        }

        if self.pages[id as usize].is_dirty() {
            self.flush_page(id)?;
            let pi = &self.pages[id as usize];
            if pi.refcount > 0 || pi.is_dirty() || pi.io {
                return Err(HeapError::Retry("page changed while flushing".into()));
            }
            if !pi.evictable {
                return Err(HeapError::Retry("page became non-evictable".into()));
            }
        }

        let pg_id = self.pages[id as usize].pg_id;
        self.events.push(CacheEvent::PageEvict(pg_id));
        self.lru_remove(id);
        self.unmap_page(id);
        self.stats.evictions += 1;
        tracing::trace!(pg_id, "evicted page");
        Ok(())
    }

    /// Cooperative backpressure: evict until the reserve of free pages for
    /// non-evictable growth is satisfied.
    pub fn reserve(&mut self) -> Result<()> {
        if self.mode == 1 {
            return Ok(());
        }
        if !self.need_reserve(0) && self.reserve_wq.waiters() == 0 {
            return Ok(());
        }

        // FIFO order across reserving callers.
        if self.reserve_wq.enter() > 1 {
            self.reserve_wq.wait();
        }
        let mut rc = Ok(());
        let mut retry = 0;
        while self.need_reserve(0) {
            match self.evict_page(false) {
                Ok(()) | Err(HeapError::Retry(_)) | Err(HeapError::Busy(_)) => {}
                Err(e) => {
                    rc = Err(e);
                    break;
                }
            }
            retry += 1;
            if retry > 10_000 {
                rc = Err(HeapError::OutOfSpace("reserve made no progress".into()));
                break;
            }
        }
        self.reserve_wq.leave();
        if self.reserve_wq.waiters() > 0 {
            self.reserve_wq.wake(false);
        }
        rc
    }

    // ========================================================================
    // Checkpoint
    // ========================================================================

    fn page_to_set(&mut self, id: PageId, set: &mut ChkptSet) {
        let pg_id = self.pages[id as usize].pg_id;
        let mut offset = self.id2off(pg_id);
        let mut in_pg: u64 = 0;

        set.pages.push(id);
        if self.pages[id as usize].last_inflight > set.max_tx {
            set.max_tx = self.pages[id as usize].last_inflight;
        }

        let chunk = 1u64 << UMEM_CACHE_CHUNK_SZ_SHIFT;
        for w in 0..self.bmap_words {
            let mut bmap = self.pages[id as usize].bmap[w];
            while bmap != 0 {
                let first = bmap.trailing_zeros() as u64;
                let map_offset = first << UMEM_CACHE_CHUNK_SZ_SHIFT;
                let mut count: u64 = 0;
                let mut mask: u64 = 0;
                let mut bit = first;
                while bit < 64 {
                    let b = 1u64 << bit;
                    if bmap & b == 0 {
                        break;
                    }
                    mask |= b;
                    count += 1;
                    bit += 1;
                    if count * chunk == MAX_IO_SIZE {
                        break;
                    }
                }
                set.regions.push(StoreRegion {
                    addr: offset + map_offset,
                    size: count * chunk,
                });
                set.iovs.push((id, in_pg + map_offset, count * chunk));
                set.nr_dchunks += count as u32;
                bmap &= !mask;
            }
            offset += chunk << CHUNK_IDX_SHIFT;
            in_pg += chunk << CHUNK_IDX_SHIFT;
        }

        // A yielding flush must not observe new writes to this page.
        self.pages[id as usize].copying = true;
    }

    fn flush_completion(&mut self, id: PageId) {
        let pi = &mut self.pages[id as usize];
        debug_assert_eq!(pi.dirty, DirtyList::None);
        debug_assert!(pi.io && pi.flushing);
        pi.io = false;
        pi.flushing = false;
        self.flushing.remove(id);
        if self.pages[id as usize].is_dirty() {
            self.pages[id as usize].dirty = DirtyList::Dirty;
            self.dirty.push_tail(id);
        }
    }

    fn flush_list(
        &mut self,
        mut dirty_list: Vec<PageId>,
        wait_cb: &mut dyn FnMut(TxId) -> TxId,
        out_id: &mut TxId,
        stats: Option<&mut ChkptStats>,
        mut window_hook: Option<&mut dyn FnMut(&mut PageCache)>,
    ) -> Result<()> {
        let max_iod_per_set = self.bmap_words << CHUNK_IDX_SHIFT; // 2 * words*64/2
        let mut local_stats = ChkptStats::default();
        let mut waiting: Vec<ChkptSet> = Vec::new();
        let mut prep_failures = 0;
        let mut rc = Ok(());

        // Mark the whole batch first so nothing migrates underneath us.
        for &id in &dirty_list {
            let pi = &mut self.pages[id as usize];
            debug_assert!(!pi.io && !pi.flushing);
            pi.io = true;
            pi.flushing = true;
            pi.dirty = DirtyList::Local;
            self.flushing.push_tail(id);
            if self.pages[id as usize].last_inflight > *out_id {
                *out_id = self.pages[id as usize].last_inflight;
            }
        }

        loop {
            while waiting.len() < MAX_INFLIGHT_SETS && !dirty_list.is_empty() {
                let mut set = ChkptSet::new();
                while set.pages.len() < MAX_PAGES_PER_SET
                    && set.regions.len() <= max_iod_per_set
                    && !dirty_list.is_empty()
                {
                    let id = dirty_list.remove(0);
                    self.pages[id as usize].dirty = DirtyList::None;
                    self.page_to_set(id, &mut set);
                }

                if let Some(hook) = window_hook.as_deref_mut() {
                    // Test injection point: the copying window is open.
                    hook(&mut *self);
                }

                let iod = StoreIod {
                    regions: set.regions.clone(),
                };
                let store = Rc::clone(&self.store);
                let fh = match store.flush_prep(&iod) {
                    Ok(fh) => {
                        prep_failures = 0;
                        fh
                    }
                    Err(e) => {
                        // Put the pages back and stop building sets; the
                        // store may only be short on transfer buffers.
                        for &id in set.pages.iter().rev() {
                            self.pages[id as usize].copying = false;
                            self.pages[id as usize].dirty = DirtyList::Local;
                            dirty_list.insert(0, id);
                        }
                        prep_failures += 1;
                        if prep_failures > 100 {
                            rc = Err(e);
                        }
                        break;
                    }
                };

                for &id in &set.pages {
                    let pi = &mut self.pages[id as usize];
                    pi.last_checkpoint = pi.last_inflight;
                }

                let iovs: Vec<&[u8]> = set
                    .iovs
                    .iter()
                    .map(|&(id, off, len)| {
                        &self.bufs[id as usize][off as usize..(off + len) as usize]
                    })
                    .collect();
                store
                    .flush_copy(fh, &iovs)
                    .expect("checkpoint copy rejected prepared iod");
                drop(iovs);

                for &id in &set.pages {
                    self.pages[id as usize].copying = false;
                    self.pages[id as usize].clear_bmap();
                }

                let mut set = set;
                set.fh = fh;
                let pos = waiting
                    .iter()
                    .position(|other| set.max_tx < other.max_tx)
                    .unwrap_or(waiting.len());
                waiting.insert(pos, set);
            }

            let set = if waiting.is_empty() {
                None
            } else {
                Some(waiting.remove(0))
            };

            // Wait for in-flight transactions to commit (or just yield).
            let committed = wait_cb(set.as_ref().map(|s| s.max_tx).unwrap_or(0));
            self.commit(committed);

            let set = match set {
                Some(s) => s,
                None => {
                    if dirty_list.is_empty() || rc.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let mut set_rc = Ok(());
            if committed < set.max_tx {
                tracing::error!(committed, max_tx = set.max_tx, "WAL commit lagged checkpoint");
                set_rc = Err(HeapError::FlushFailed("WAL commit failed".into()));
            }

            let store = Rc::clone(&self.store);
            let post = store.flush_post(set.fh, set_rc);
            for &id in &set.pages {
                self.flush_completion(id);
            }

            local_stats.nr_pages += set.pages.len() as u64;
            local_stats.nr_dchunks += set.nr_dchunks as u64;
            local_stats.nr_iovs += set.regions.len() as u64;

            if let Err(e) = post {
                rc = Err(e);
                break;
            }

            if waiting.is_empty() && dirty_list.is_empty() {
                break;
            }
        }

        // Anything left goes back to the dirty list.
        for id in dirty_list {
            let pi = &mut self.pages[id as usize];
            pi.io = false;
            pi.flushing = false;
            self.flushing.remove(id);
            self.pages[id as usize].dirty = DirtyList::Dirty;
            self.dirty.push_tail(id);
        }

        if let Some(s) = stats {
            s.nr_pages += local_stats.nr_pages;
            s.nr_dchunks += local_stats.nr_dchunks;
            s.nr_iovs += local_stats.nr_iovs;
        }
        rc
    }

    /// Checkpoint every dirty page. `wait_cb` receives the highest tx id a
    /// completed set carries and returns the committed id; the checkpoint
    /// does not mark pages clean until the commit id covers them. Returns
    /// the highest tx id included in the checkpoint.
    pub fn checkpoint(
        &mut self,
        wait_cb: &mut dyn FnMut(TxId) -> TxId,
        stats: Option<&mut ChkptStats>,
    ) -> Result<TxId> {
        self.checkpoint_with_hook(wait_cb, stats, None)
    }

    pub(crate) fn checkpoint_with_hook(
        &mut self,
        wait_cb: &mut dyn FnMut(TxId) -> TxId,
        stats: Option<&mut ChkptStats>,
        hook: Option<&mut dyn FnMut(&mut PageCache)>,
    ) -> Result<TxId> {
        let mut chkpt_id = self.commit_id;
        if !self.dirty.is_empty() {
            let batch = self.dirty.drain();
            self.flush_list(batch, wait_cb, &mut chkpt_id, stats, hook)?;
            self.stats.flushes += 1;
        }

        // Pages being flushed by eviction with a lower checkpoint id are
        // part of this checkpoint too; with a single task they are already
        // complete by the time we get here.
        debug_assert!(self.flushing.is_empty());
        self.store.wal_checkpointed(chkpt_id);
        Ok(chkpt_id)
    }

    /// Flush a single dirty page (eviction path).
    fn flush_page(&mut self, id: PageId) -> Result<()> {
        debug_assert!(self.pages[id as usize].is_dirty());
        debug_assert_eq!(self.pages[id as usize].dirty, DirtyList::Dirty);

        // A write belonging to a transaction that has not committed yet
        // cannot be flushed; park the page on the wait-commit list until
        // `commit` covers it and requeues it as dirty.
        let wait_tx = self.pages[id as usize].last_inflight;
        if self.commit_id < wait_tx {
            let committed = self.store.wal_committed();
            if committed < wait_tx {
                self.dirty.remove(id);
                self.pages[id as usize].dirty = DirtyList::WaitCommit;
                self.wait_commit.push_tail(id);
                return Err(HeapError::Busy("page written by open transaction".into()));
            }
            self.commit(committed);
        }

        self.dirty.remove(id);
        self.pages[id as usize].dirty = DirtyList::None;

        // Bump the checkpoint id before any yield inside the flush.
        let pi = &mut self.pages[id as usize];
        pi.last_checkpoint = pi.last_inflight;

        let mut chkpt_id = 0;
        let store = Rc::clone(&self.store);
        let mut cb = move |_wait: TxId| store.wal_committed();
        let rc = self.flush_list(vec![id], &mut cb, &mut chkpt_id, None, None);
        self.stats.flushes += 1;
        rc
    }

    // ========================================================================
    // Commit / replay
    // ========================================================================

    /// Advance the committed tx id; monotonic. Parked pages whose writes
    /// are now covered return to the dirty list and become flushable.
    pub fn commit(&mut self, commit_id: TxId) {
        if commit_id < self.commit_id {
            debug_assert_eq!(commit_id, 0);
            return;
        }
        self.commit_id = commit_id;

        let woken: Vec<PageId> = self
            .wait_commit
            .iter()
            .filter(|&id| self.pages[id as usize].last_inflight <= commit_id)
            .collect();
        for id in woken {
            self.wait_commit.remove(id);
            self.pages[id as usize].dirty = DirtyList::Dirty;
            self.dirty.push_tail(id);
        }
    }

    /// After boot-time replay: every loaded page is re-tagged according to
    /// the heap's final evictability verdict and the free-page reserve is
    /// armed.
    pub fn post_replay(&mut self) {
        let mut ne = 0;
        for id in 0..self.mem_pages {
            if !self.pages[id as usize].loaded {
                continue;
            }
            let pg_id = self.pages[id as usize].pg_id;
            if !self.is_id_evictable(pg_id) {
                self.pages[id as usize].evictable = false;
                if self.pages[id as usize].refcount == 0 {
                    self.lru_remove(id);
                    self.pages[id as usize].lru = LruList::LruNe;
                    self.lru_ne.push_tail(id);
                }
                ne += 1;
            } else {
                self.pages[id as usize].evictable = true;
            }
        }
        self.ne_cnt = ne;
        self.replay_done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    const PG: u64 = 1 << 20; // 1 MiB pages keep tests light

    fn mk_cache(md: u32, mem: u32, max_ne: u32) -> (Rc<MemStore>, PageCache) {
        let store = Rc::new(MemStore::new(4096 + md as u64 * PG));
        let dy: Rc<dyn MetaStore> = store.clone();
        let cache = PageCache::new(dy, PG, md, mem, max_ne, 4096).unwrap();
        (store, cache)
    }

    #[test]
    fn test_new_rejects_bad_page_size() {
        let store: Rc<dyn MetaStore> = Rc::new(MemStore::new(1 << 20));
        assert!(PageCache::new(store.clone(), 12345, 4, 2, 2, 0).is_err());
        assert!(PageCache::new(store.clone(), 1 << 28, 4, 2, 2, 0).is_err());
        assert!(PageCache::new(store, 1 << 18, 4, 2, 2, 0).is_err());
    }

    #[test]
    fn test_phase1_maps_everything() {
        let (_s, cache) = mk_cache(4, 0, 0);
        assert_eq!(cache.mode, 1);
        assert_eq!(cache.free_pages(), 0);
        assert!(cache.off_is_loaded(4096));
        assert!(cache.off_is_loaded(4096 + 3 * PG));
    }

    #[test]
    fn test_map_and_rw() {
        let (_s, mut cache) = mk_cache(4, 2, 2);
        cache
            .map_ranges(&[StoreRegion { addr: 4096, size: PG }])
            .unwrap();
        cache.write_bytes(4096 + 100, b"hello");
        let mut out = [0u8; 5];
        cache.read_into(4096 + 100, &mut out);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_touch_sets_bits_and_dirty_list() {
        let (_s, mut cache) = mk_cache(4, 2, 2);
        cache
            .map_ranges(&[StoreRegion { addr: 4096, size: PG }])
            .unwrap();
        cache.touch(7, 4096 + 8192, 4096).unwrap();
        let id = cache.map[0].unwrap();
        assert_eq!(cache.pages[id as usize].bmap[0] & 0b1100, 0b1100);
        assert_eq!(cache.pages[id as usize].last_inflight, 7);
        assert_eq!(cache.pages[id as usize].dirty, DirtyList::Dirty);
        assert!(cache.pages[id as usize].is_dirty());
    }

    #[test]
    fn test_pin_loads_and_protects() {
        let (store, mut cache) = mk_cache(4, 2, 2);
        store.update(b"persisted", 4096 + 50).unwrap();
        let pin = cache
            .pin_ranges(&[StoreRegion { addr: 4096, size: 16 }], false)
            .unwrap();
        let mut out = [0u8; 9];
        cache.read_into(4096 + 50, &mut out);
        assert_eq!(&out, b"persisted");
        assert!(cache.off_is_pinned(4096));
        cache.unpin(pin);
        assert!(!cache.off_is_pinned(4096));
        assert!(cache.off_is_loaded(4096));
    }

    #[test]
    fn test_eviction_prefers_evictable_lru() {
        let (_s, mut cache) = mk_cache(8, 2, 1);
        cache.post_replay();
        cache.set_evictable_tag(2, true);
        cache.set_evictable_tag(3, true);
        // Load two evictable pages into a 2-page cache.
        cache
            .load_ranges(&[StoreRegion { addr: 4096 + 2 * PG, size: 8 }], false)
            .unwrap();
        cache
            .load_ranges(&[StoreRegion { addr: 4096 + 3 * PG, size: 8 }], false)
            .unwrap();
        // A third load evicts page 2 (LRU order).
        cache.set_evictable_tag(4, true);
        cache
            .load_ranges(&[StoreRegion { addr: 4096 + 4 * PG, size: 8 }], false)
            .unwrap();
        assert!(!cache.off_is_loaded(4096 + 2 * PG));
        assert!(cache.off_is_loaded(4096 + 3 * PG));
        let evicted: Vec<_> = cache
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, CacheEvent::PageEvict(_)))
            .collect();
        assert_eq!(evicted, vec![CacheEvent::PageEvict(2)]);
    }

    #[test]
    fn test_checkpoint_clears_dirty_state() {
        let (store, mut cache) = mk_cache(4, 2, 2);
        cache
            .map_ranges(&[StoreRegion { addr: 4096, size: PG }])
            .unwrap();
        cache.write_bytes(4096, b"dirty data");
        let id = store.wal_reserve().unwrap();
        cache.touch(id, 4096, 10).unwrap();
        store.wal_submit(id, &[], 0).unwrap();

        let committed = store.wal_committed();
        let mut stats = ChkptStats::default();
        let out = cache
            .checkpoint(&mut |_| committed, Some(&mut stats))
            .unwrap();
        assert_eq!(out, id);
        assert!(cache.dirty.is_empty());
        assert_eq!(stats.nr_pages, 1);
        assert_eq!(stats.nr_dchunks, 1);

        let mut buf = [0u8; 10];
        store.load(&mut buf, 4096).unwrap();
        assert_eq!(&buf, b"dirty data");
    }

    // S3: writes landing in the copying window bounce with CheckpointBusy
    // and the page stays dirty into a second checkpoint round.
    #[test]
    fn test_checkpoint_copying_window_rejects_writes() {
        let (store, mut cache) = mk_cache(8, 6, 6);
        let mut last = 0;
        for pg in 0..6u64 {
            cache
                .map_ranges(&[StoreRegion { addr: 4096 + pg * PG, size: PG }])
                .unwrap();
            let id = store.wal_reserve().unwrap();
            cache.touch(id, 4096 + pg * PG, 64).unwrap();
            store.wal_submit(id, &[], 0).unwrap();
            last = id;
        }

        let committed = store.wal_committed();
        let wid = store.wal_reserve().unwrap();
        let mut busy = 0;
        let mut hook = |cache: &mut PageCache| {
            for pg in 0..2u64 {
                match cache.touch(wid, 4096 + pg * PG, 16) {
                    Err(HeapError::CheckpointBusy(_)) => busy += 1,
                    Ok(()) => {}
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
        };
        cache
            .checkpoint_with_hook(&mut |_| committed, None, Some(&mut hook))
            .unwrap();
        assert!(busy >= 2, "writes during the copying window must bounce");
        assert!(last > 0);

        // The bounced writes retry and succeed now, dirtying the pages for
        // a second checkpoint round.
        cache.touch(wid, 4096, 16).unwrap();
        cache.touch(wid, 4096 + PG, 16).unwrap();
        store.wal_submit(wid, &[], 0).unwrap();
        assert_eq!(cache.dirty.len(), 2);
        let committed = store.wal_committed();
        cache.checkpoint(&mut |_| committed, None).unwrap();
        assert!(cache.dirty.is_empty());
    }

    #[test]
    fn test_reserve_keeps_free_pages() {
        let (_s, mut cache) = mk_cache(16, 6, 2);
        cache.post_replay();
        for pg in 4..10u32 {
            cache.set_evictable_tag(pg, true);
            cache
                .load_ranges(
                    &[StoreRegion { addr: 4096 + pg as u64 * PG, size: 8 }],
                    false,
                )
                .unwrap();
        }
        cache.reserve().unwrap();
        // max_ne(2) - ne(0) capped at RSRVD(4) = 2 free pages reserved.
        assert!(cache.free_pages() >= 2);
    }

    // A page written by a reserved-but-unsubmitted transaction parks on
    // the wait-commit list and returns to the dirty list once the commit
    // id covers the write.
    #[test]
    fn test_uncommitted_write_parks_until_commit() {
        let (store, mut cache) = mk_cache(4, 2, 2);
        cache.post_replay();
        cache.set_evictable_tag(1, true);
        cache
            .load_ranges(&[StoreRegion { addr: 4096 + PG, size: 8 }], false)
            .unwrap();

        let id = store.wal_reserve().unwrap();
        cache.touch(id, 4096 + PG, 16).unwrap();
        let mem = cache.map[1].unwrap();

        assert!(matches!(
            cache.flush_page(mem),
            Err(HeapError::Busy(_))
        ));
        assert_eq!(cache.pages[mem as usize].dirty, DirtyList::WaitCommit);
        assert_eq!(cache.wait_commit.len(), 1);
        assert!(cache.dirty.is_empty());

        // Eviction must not unmap a parked page.
        assert!(matches!(
            cache.evict_page(false),
            Err(HeapError::Retry(_))
        ));

        store.wal_submit(id, &[], 0).unwrap();
        cache.commit(store.wal_committed());
        assert!(cache.wait_commit.is_empty());
        assert_eq!(cache.pages[mem as usize].dirty, DirtyList::Dirty);

        // Now the flush goes through and the page comes out clean.
        cache.flush_page(mem).unwrap();
        assert!(!cache.pages[mem as usize].is_dirty());
    }

    #[test]
    fn test_commit_is_monotonic() {
        let (_s, mut cache) = mk_cache(4, 2, 2);
        cache.commit(5);
        cache.commit(9);
        assert_eq!(cache.commit_id(), 9);
        cache.commit(0);
        assert_eq!(cache.commit_id(), 9);
    }
}
