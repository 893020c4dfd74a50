// # Heap
//
// Zones, chunks, runs and the memory-bucket runtime. The heap owns the
// volatile allocation state (buckets, recyclers, usage queues) and the
// persistent zone metadata, which it mutates only through the current WAL
// transaction. Space is organized as fixed zones; a zone either routes to
// the shared default memory bucket, carries its own runtime (evictable and
// small-object-eviction buckets), or is unused.

pub mod alloc_class;
pub mod bucket;
pub mod container;
pub mod layout;
pub mod memblock;
pub mod mbrt;
pub mod recycler;

use crate::cache::PageCache;
use crate::common::{
    zone_offset, BlobOff, CHUNKSIZE, HEAP_HDR_SIZE, MAX_CHUNK, NEMB_EMPTY_RECYCLE_THRESHOLD,
    UMEM_CACHE_MIN_PAGES, ZONE_MAX_SIZE, ZONE_META_SIZE, ZONE_MIN_SIZE,
};
use crate::error::{HeapError, Result};
use crate::stats::HeapTransientStats;
use crate::store::{MetaStore, StoreRegion};
use crate::wal::WalTx;
use bytemuck::Zeroable;
use alloc_class::{AllocClass, AllocClassCollection, ClassType, DEFAULT_ALLOC_CLASS_ID};
use bucket::Bucket;
use layout::{
    chunk_header_off, zinfo_size, zone_header_off, ChunkHeader, HeapHeader, ZinfoElem, ZoneHeader,
    CHUNK_TYPE_FREE, CHUNK_TYPE_RUN, CHUNK_TYPE_USED, ZINFO_VERSION, ZONE_EVICTABLE_MB,
    ZONE_HEADER_MAGIC, ZONE_SOE_MB,
};
use memblock::{huge_init, rebuild_state, run_free_space, run_init, BlockKind, MemoryBlock};
use mbrt::{BandQueues, Mbrt, SoeRing, MB_U75, MB_UMAX_HINT, MB_USAGE_BY_HINT, SOEMB_ACTIVE_CNT};
use parking_lot::Mutex;
use std::mem::size_of;

const MAX_RUN_LOCKS: usize = MAX_CHUNK as usize;

/// Partitioning of the zone budget between heap, cache and the
/// non-evictable reserve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapZoneLimits {
    pub nzones_heap: u32,
    pub nzones_cache: u32,
    pub nzones_ne_max: u32,
    pub nzones_e_max: u32,
}

/// How many zones a blob of `size` bytes can hold.
pub fn heap_max_zone(size: u64) -> u32 {
    let mut n = 0;
    let mut left = size.saturating_sub(HEAP_HDR_SIZE);
    while left >= ZONE_MIN_SIZE {
        n += 1;
        left -= left.min(ZONE_MAX_SIZE);
    }
    n
}

pub fn heap_get_zone_limits(heap_size: u64, cache_size: u64, nemb_pct: u32) -> HeapZoneLimits {
    debug_assert!(nemb_pct <= 100);
    let mut zd = HeapZoneLimits::default();

    if heap_size >= HEAP_HDR_SIZE {
        zd.nzones_heap = heap_max_zone(heap_size);
    }
    zd.nzones_cache = (cache_size / ZONE_MAX_SIZE) as u32;

    if zd.nzones_heap == 0 || zd.nzones_cache == 0 {
        return zd;
    }
    if zd.nzones_heap <= zd.nzones_cache {
        zd.nzones_ne_max = zd.nzones_heap;
        return zd;
    }
    if zd.nzones_cache <= UMEM_CACHE_MIN_PAGES {
        zd.nzones_ne_max = zd.nzones_cache;
        return zd;
    }

    zd.nzones_ne_max = zd.nzones_cache * nemb_pct / 100;
    if zd.nzones_ne_max == 0 {
        zd.nzones_ne_max = UMEM_CACHE_MIN_PAGES;
    }
    zd.nzones_e_max = zd.nzones_heap - zd.nzones_ne_max;
    zd
}

/// Chunk count of a zone; the trailing zone may be short.
fn zone_calc_size_idx(zone_id: u32, max_zone: u32, heap_size: u64) -> u32 {
    debug_assert!(max_zone > 0);
    if zone_id < max_zone - 1 {
        return MAX_CHUNK;
    }
    let raw = heap_size - zone_id as u64 * ZONE_MAX_SIZE - HEAP_HDR_SIZE;
    debug_assert!(raw >= ZONE_META_SIZE);
    (((raw - ZONE_META_SIZE) / CHUNKSIZE) as u32).min(MAX_CHUNK)
}

/// Role of a zone in the memory-bucket runtime.
#[derive(Debug)]
pub enum MbState {
    Unused,
    /// Routed to the shared default bucket.
    Default,
    Local(Mbrt),
}

pub struct Heap {
    pub heap_size: u64,
    nzones: u32,
    nzones_e: u32,
    nzones_ne: u32,
    zones_exhausted: u32,
    zones_exhausted_e: u32,
    zones_exhausted_ne: u32,
    zones_nextne_gc: u32,
    zones_unused_first: u32,
    empty_nemb_cnt: u32,
    empty_nemb_gcth: u32,

    pub alloc_classes: AllocClassCollection,
    default_mb: Mbrt,
    mbs: Vec<MbState>,
    active_evictable_mb: Option<u32>,
    emb_qbs: BandQueues,
    soe: SoeRing,
    soemb_cnt: u32,
    mb_pressure: bool,
    mb_create_waiters: u32,

    /// Zinfo vector placement once bootstrapped.
    zinfo: Option<(BlobOff, u64)>,

    run_locks: Vec<Mutex<()>>,
    pub tstats: HeapTransientStats,
}

impl Heap {
    // ========================================================================
    // Format / boot
    // ========================================================================

    /// Format the blob: scrub the zone metadata heads and write a sealed
    /// heap header.
    pub fn format(store: &dyn MetaStore, cache_size: u64, nemb_pct: u32) -> Result<()> {
        let heap_size = store.size();
        if heap_size < HEAP_HDR_SIZE + ZONE_MIN_SIZE {
            return Err(HeapError::InvalidArgument(format!(
                "heap size {heap_size} below minimum"
            )));
        }

        let nzones = heap_max_zone(heap_size);
        let zeros = vec![0u8; ZONE_META_SIZE as usize];
        for zid in 0..nzones {
            store.update(&zeros, zone_offset(zid))?;
        }

        let hdr = HeapHeader::build(heap_size, cache_size, nemb_pct);
        store.update(bytemuck::bytes_of(&hdr), 0)?;
        tracing::info!(heap_size, cache_size, nemb_pct, "heap formatted");
        Ok(())
    }

    /// Read and verify the heap header.
    pub fn read_header(store: &dyn MetaStore, cache_size: u64) -> Result<HeapHeader> {
        let mut buf = vec![0u8; size_of::<HeapHeader>()];
        store.load(&mut buf, 0)?;
        let hdr: HeapHeader = bytemuck::pod_read_unaligned(&buf);
        hdr.verify(store.size(), cache_size)?;
        Ok(hdr)
    }

    /// Build the runtime state for an opened pool.
    pub fn boot(heap_size: u64, cache_size: u64, nemb_pct: u32) -> Result<Self> {
        let hzl = heap_get_zone_limits(heap_size, cache_size, nemb_pct);
        let alloc_classes = AllocClassCollection::new();
        let default_mb = Mbrt::new(0, &alloc_classes);

        let mut heap = Self {
            heap_size,
            nzones: hzl.nzones_heap,
            nzones_e: hzl.nzones_e_max,
            nzones_ne: hzl.nzones_ne_max,
            zones_exhausted: 0,
            zones_exhausted_e: 0,
            zones_exhausted_ne: 0,
            zones_nextne_gc: 0,
            zones_unused_first: 0,
            empty_nemb_cnt: 0,
            empty_nemb_gcth: *NEMB_EMPTY_RECYCLE_THRESHOLD,
            alloc_classes,
            default_mb,
            mbs: (0..hzl.nzones_heap).map(|_| MbState::Unused).collect(),
            active_evictable_mb: None,
            emb_qbs: BandQueues::new(),
            soe: SoeRing::new(),
            soemb_cnt: 0,
            mb_pressure: false,
            mb_create_waiters: 0,
            zinfo: None,
            run_locks: (0..MAX_RUN_LOCKS).map(|_| Mutex::new(())).collect(),
            tstats: HeapTransientStats::default(),
        };
        heap.setmb_nonevictable(None, 0);
        Ok(heap)
    }

    #[inline]
    pub fn nzones(&self) -> u32 {
        self.nzones
    }

    #[inline]
    pub fn max_nemb(&self) -> u32 {
        self.nzones_ne
    }

    pub fn run_lock(&self, chunk_id: u32) -> &Mutex<()> {
        &self.run_locks[chunk_id as usize % self.run_locks.len()]
    }

    /// Mirror the zone's evictability into the cache tag table.
    fn sync_tag(&self, cache: &mut PageCache, zid: u32) {
        cache.set_evictable_tag(zid, self.ismb_evictable(zid));
    }

    /// Seed every tag at boot time.
    pub fn sync_all_tags(&self, cache: &mut PageCache) {
        for zid in 0..self.nzones {
            self.sync_tag(cache, zid);
        }
    }

    // ========================================================================
    // MBRT plumbing
    // ========================================================================

    pub fn ismb_evictable(&self, zid: u32) -> bool {
        match &self.mbs[zid as usize] {
            MbState::Unused => true,
            MbState::Default => false,
            MbState::Local(m) => m.is_evictable,
        }
    }

    pub fn ismb_initialized(&self, zid: u32) -> bool {
        !matches!(self.mbs[zid as usize], MbState::Unused)
    }

    pub fn ismb_localrt(&self, zid: u32) -> bool {
        matches!(self.mbs[zid as usize], MbState::Local(_))
    }

    fn setmb_nonevictable(&mut self, mb: Option<Mbrt>, zid: u32) {
        match mb {
            Some(mut m) => {
                m.is_evictable = false;
                self.mbs[zid as usize] = MbState::Local(m);
            }
            None => self.mbs[zid as usize] = MbState::Default,
        }
    }

    fn setmb_evictable(&mut self, mut mb: Mbrt) {
        debug_assert!(mb.mb_id != 0 && mb.mb_id < self.nzones);
        mb.is_evictable = true;
        let zid = mb.mb_id;
        self.mbs[zid as usize] = MbState::Local(mb);
    }

    fn setmb_unused(&mut self, zid: u32) {
        debug_assert!(self.ismb_initialized(zid));
        self.mbs[zid as usize] = MbState::Unused;
    }

    fn mb(&self, zid: u32) -> &Mbrt {
        match &self.mbs[zid as usize] {
            MbState::Default => &self.default_mb,
            MbState::Local(m) => m,
            MbState::Unused => panic!("zone {zid} is marked unused"),
        }
    }

    fn mb_mut(&mut self, zid: u32) -> &mut Mbrt {
        match &mut self.mbs[zid as usize] {
            MbState::Default => &mut self.default_mb,
            MbState::Local(m) => m,
            MbState::Unused => panic!("zone {zid} is marked unused"),
        }
    }

    /// Take a bucket out of a memory bucket for the duration of an
    /// operation.
    pub fn bucket_acquire(&mut self, mb_id: u32, class_id: u8) -> Bucket {
        let mb = self.mb_mut(mb_id);
        let slot = if class_id == DEFAULT_ALLOC_CLASS_ID {
            &mut mb.default_bucket
        } else {
            &mut mb.buckets[class_id as usize]
        };
        slot.take().expect("bucket exists and is not taken")
    }

    /// Put a bucket back.
    pub fn bucket_release(&mut self, mb_id: u32, b: Bucket) {
        let class_id = b.class_id;
        let mb = self.mb_mut(mb_id);
        let slot = if class_id == DEFAULT_ALLOC_CLASS_ID {
            &mut mb.default_bucket
        } else {
            &mut mb.buckets[class_id as usize]
        };
        slot.put_back(b);
    }

    pub fn has_class_bucket(&self, mb_id: u32, class_id: u8) -> bool {
        if class_id == DEFAULT_ALLOC_CLASS_ID {
            return true;
        }
        match &self.mbs[mb_id as usize] {
            MbState::Unused => false,
            MbState::Default => self.default_mb.buckets[class_id as usize].is_present(),
            MbState::Local(m) => m.buckets[class_id as usize].is_present(),
        }
    }

    /// Propagate a freshly registered class to every live runtime.
    pub fn create_class_buckets(&mut self, class_id: u8) {
        self.default_mb.ensure_class_bucket(class_id);
        for state in self.mbs.iter_mut() {
            if let MbState::Local(m) = state {
                m.ensure_class_bucket(class_id);
            }
        }
    }

    pub fn best_class(&self, size: u64) -> AllocClass {
        *self.alloc_classes.by_alloc_size(size)
    }

    // ========================================================================
    // Zinfo vector
    // ========================================================================

    fn zinfo_elem_off(&self, zid: u32) -> BlobOff {
        let (off, _) = self.zinfo.expect("zinfo bootstrapped");
        off + size_of::<layout::ZinfoVecHdr>() as u64 + zid as u64
    }

    fn zinfo_set(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        zid: u32,
        allotted: bool,
        evictable: bool,
    ) -> Result<()> {
        if self.zinfo.is_none() {
            debug_assert_eq!(zid, 0);
            return Ok(());
        }
        let off = self.zinfo_elem_off(zid);
        let mut e = ZinfoElem::unpack(cache.slice(off, 1)[0]);
        e.allotted = allotted;
        e.evictable = evictable;
        cache.write_bytes(off, &[e.pack()]);
        wal.snap(cache, off, 1)
    }

    fn zinfo_get(&self, cache: &PageCache, zid: u32) -> (bool, bool) {
        match self.zinfo {
            Some(_) => {
                let e = ZinfoElem::unpack(cache.slice(self.zinfo_elem_off(zid), 1)[0]);
                (e.allotted, e.evictable)
            }
            None => {
                debug_assert_eq!(zid, 0);
                (false, false)
            }
        }
    }

    fn zinfo_set_usage(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        zid: u32,
        hint: u8,
    ) -> Result<()> {
        if self.zinfo.is_none() {
            return Ok(());
        }
        debug_assert!(hint < MB_UMAX_HINT);
        let off = self.zinfo_elem_off(zid);
        let mut e = ZinfoElem::unpack(cache.slice(off, 1)[0]);
        debug_assert!(e.allotted);
        e.usage_hint = hint;
        cache.write_bytes(off, &[e.pack()]);
        wal.snap(cache, off, 1)
    }

    fn zinfo_get_usage(&self, cache: &PageCache, zid: u32) -> u8 {
        let e = ZinfoElem::unpack(cache.slice(self.zinfo_elem_off(zid), 1)[0]);
        debug_assert!(e.allotted && e.evictable && e.usage_hint < MB_UMAX_HINT);
        e.usage_hint
    }

    /// First-boot zinfo initialization at the freshly allocated location.
    pub fn zinfo_init(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        vec_off: BlobOff,
        vec_size: u64,
    ) -> Result<()> {
        debug_assert!(vec_size >= zinfo_size(self.nzones));
        self.zinfo = Some((vec_off, vec_size));

        let hdr = layout::ZinfoVecHdr {
            version: ZINFO_VERSION,
            num_elems: self.nzones,
        };
        cache.write_pod(vec_off, &hdr);
        // Fresh elements: all zeros.
        let zeros = vec![0u8; self.nzones as usize];
        cache.write_bytes(vec_off + size_of::<layout::ZinfoVecHdr>() as u64, &zeros);
        wal.snap(cache, vec_off, zinfo_size(self.nzones))?;
        self.zinfo_set(cache, wal, 0, true, false)
    }

    /// Rebuild the MBRT from a persisted zinfo vector, or persist the
    /// fresh one when `init` is set.
    pub fn update_mbrt_zinfo(
        &mut self,
        cache: &mut PageCache,
        vec_off: BlobOff,
        vec_size: u64,
        init: bool,
    ) -> Result<()> {
        if !init {
            self.zinfo = Some((vec_off, vec_size));
            let hdr: layout::ZinfoVecHdr = cache.read_pod(vec_off);
            if hdr.version != ZINFO_VERSION || hdr.num_elems != self.nzones {
                return Err(HeapError::CorruptHeader(format!(
                    "zinfo vector mismatch: version {} zones {}",
                    hdr.version, hdr.num_elems
                )));
            }
            let (allotted, evictable) = self.zinfo_get(cache, 0);
            debug_assert!(allotted && !evictable);
        }

        let mut nemb_cnt = 1u32;
        let mut emb_cnt = 0u32;
        let mut last_allocated = 0u32;
        for zid in 1..self.nzones {
            let (allotted, evictable) = self.zinfo_get(cache, zid);
            if !allotted {
                if self.zones_unused_first == 0 {
                    self.zones_unused_first = zid;
                }
                continue;
            }
            if !evictable {
                self.setmb_nonevictable(None, zid);
                nemb_cnt += 1;
            } else {
                let mut mb = Mbrt::new(zid, &self.alloc_classes);
                if cache.off_is_loaded(zone_offset(zid)) {
                    let zh: ZoneHeader = cache.read_pod(zone_header_off(zid));
                    debug_assert!(zh.flags & ZONE_EVICTABLE_MB != 0);
                    mb.space_usage = zh.sp_usage;
                } else {
                    let hint = self.zinfo_get_usage(cache, zid);
                    mb.space_usage = MB_USAGE_BY_HINT[hint.min(3) as usize];
                }
                self.setmb_evictable(mb);
                let mb = match &mut self.mbs[zid as usize] {
                    MbState::Local(m) => m,
                    _ => unreachable!(),
                };
                self.emb_qbs.insert(mb);
                emb_cnt += 1;
            }
            self.sync_tag(cache, zid);
            last_allocated = zid;
        }
        self.zones_exhausted = last_allocated + 1;
        self.zones_exhausted_ne = nemb_cnt;
        self.zones_exhausted_e = emb_cnt;
        debug_assert!(self.nzones_e + self.nzones_ne >= self.zones_exhausted_e);
        Ok(())
    }

    // ========================================================================
    // Zone lifecycle
    // ========================================================================

    fn zone_range(&self, zid: u32) -> StoreRegion {
        let off = zone_offset(zid);
        StoreRegion {
            addr: off,
            size: ZONE_MAX_SIZE.min(self.heap_size - off),
        }
    }

    /// Bring a zone into the cache.
    pub fn zone_load(&self, cache: &mut PageCache, zid: u32) -> Result<()> {
        debug_assert!(zid < self.nzones);
        cache.load_ranges(&[self.zone_range(zid)], false)
    }

    /// Write a fresh zone header and its initial free extent.
    fn zone_init(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        zone_id: u32,
        flags: u32,
    ) -> Result<()> {
        let size_idx = zone_calc_size_idx(zone_id, self.nzones, self.heap_size);
        let mut zh = ZoneHeader::zeroed();
        zh.magic = ZONE_HEADER_MAGIC;
        zh.size_idx = size_idx;
        debug_assert!(flags == 0 || flags == ZONE_EVICTABLE_MB || flags == ZONE_SOE_MB);
        zh.flags = flags;

        let off = zone_header_off(zone_id);
        cache.write_pod(off, &zh);
        wal.snap(cache, off, size_of::<ZoneHeader>() as u64)?;

        huge_init(cache, wal, zone_id, 0, size_idx)?;
        Ok(())
    }

    fn zone_header(&self, cache: &PageCache, zid: u32) -> ZoneHeader {
        cache.read_pod(zone_header_off(zid))
    }

    /// Locate an adjacent FREE extent of a huge block.
    fn adjacent_free_block(
        &self,
        cache: &PageCache,
        m: &MemoryBlock,
        prev: bool,
    ) -> Option<MemoryBlock> {
        let zh = self.zone_header(cache, m.zone_id);
        if prev {
            if m.chunk_id == 0 {
                return None;
            }
            let prev_hdr: ChunkHeader =
                cache.read_pod(chunk_header_off(m.zone_id, m.chunk_id - 1));
            if prev_hdr.size_idx == 0 || prev_hdr.size_idx > m.chunk_id {
                return None;
            }
            let cid = m.chunk_id - prev_hdr.size_idx;
            let hdr: ChunkHeader = cache.read_pod(chunk_header_off(m.zone_id, cid));
            if hdr.ctype != CHUNK_TYPE_FREE {
                return None;
            }
            Some(MemoryBlock::huge(m.zone_id, cid, hdr.size_idx))
        } else {
            let hdr: ChunkHeader = cache.read_pod(chunk_header_off(m.zone_id, m.chunk_id));
            let cid = m.chunk_id + hdr.size_idx;
            if cid >= zh.size_idx {
                return None;
            }
            let next_hdr: ChunkHeader = cache.read_pod(chunk_header_off(m.zone_id, cid));
            if next_hdr.ctype != CHUNK_TYPE_FREE {
                return None;
            }
            Some(MemoryBlock::huge(m.zone_id, cid, next_hdr.size_idx))
        }
    }

    /// Coalesce a free huge block with free neighbors present in the
    /// bucket and insert the result.
    pub fn free_chunk_reuse(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
        m: MemoryBlock,
    ) -> Result<()> {
        let mut first = m;
        let mut total = m.size_idx;

        if let Some(prev) = self.adjacent_free_block(cache, &m, true) {
            if bucket.remove_block(&prev) {
                first = prev;
                total += prev.size_idx;
            }
        }
        if let Some(next) = self.adjacent_free_block(cache, &m, false) {
            if bucket.remove_block(&next) {
                total += next.size_idx;
            }
        }

        let merged = if total != m.size_idx {
            huge_init(cache, wal, first.zone_id, first.chunk_id, total)?
        } else {
            m
        };
        bucket.insert_block(merged);
        Ok(())
    }

    /// Rewrite a fully-empty run as a FREE chunk extent and reinsert it.
    fn run_into_free_chunk(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
        m: &MemoryBlock,
    ) -> Result<()> {
        let hdr: ChunkHeader = cache.read_pod(chunk_header_off(m.zone_id, m.chunk_id));
        debug_assert_eq!(hdr.ctype, CHUNK_TYPE_RUN);

        self.tstats.run_active = self
            .tstats
            .run_active
            .saturating_sub(hdr.size_idx as u64 * CHUNKSIZE);

        // Happens-before for the chunk-header rewrite.
        let lock = self.run_lock(m.chunk_id);
        let _guard = lock.lock();

        let free = huge_init(cache, wal, m.zone_id, m.chunk_id, hdr.size_idx)?;
        drop(_guard);
        self.free_chunk_reuse(cache, wal, bucket, free)
    }

    /// Examine a run found during reclamation. Returns true if the run is
    /// entirely free and should become a free chunk; otherwise tracks it
    /// in the recycler.
    fn reclaim_run(&mut self, cache: &PageCache, m: &MemoryBlock, startup: bool) -> bool {
        let rdsc = m.rdsc.expect("run geometry");
        let free = run_free_space(cache, m);

        let class = self.alloc_classes.by_run(
            rdsc.unit_size,
            cache
                .read_pod::<ChunkHeader>(chunk_header_off(m.zone_id, m.chunk_id))
                .flags,
            rdsc.size_idx,
        );
        let Some(class) = class else {
            return free == rdsc.nallocs;
        };
        let class_id = class.id;
        let nallocs = rdsc.nallocs;

        if free == nallocs {
            return true;
        }

        if startup {
            self.tstats.run_active += m.size_idx as u64 * CHUNKSIZE;
            self.tstats.run_allocated += (nallocs - free) as u64 * rdsc.unit_size;
        }
        let mb = self.mb_mut(m.zone_id);
        mb.recycler_mut(class_id, nallocs).put(*m, free);
        false
    }

    /// Build the volatile state of every unclaimed extent in a zone.
    fn reclaim_zone_garbage(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
        zone_id: u32,
    ) -> Result<()> {
        let zh = self.zone_header(cache, zone_id);
        let mut i = 0u32;
        while i < zh.size_idx {
            let hdr: ChunkHeader = cache.read_pod(chunk_header_off(zone_id, i));
            debug_assert!(hdr.size_idx != 0);

            let mut m = MemoryBlock::huge(zone_id, i, hdr.size_idx);
            rebuild_state(cache, &self.alloc_classes, &mut m);
            let step = hdr.size_idx;

            match hdr.ctype {
                CHUNK_TYPE_RUN => {
                    if self.reclaim_run(cache, &m, true) {
                        self.run_into_free_chunk(cache, wal, bucket, &m)?;
                    }
                }
                CHUNK_TYPE_FREE => {
                    self.free_chunk_reuse(cache, wal, bucket, m)?;
                }
                CHUNK_TYPE_USED => {}
                t => {
                    return Err(HeapError::Internal(format!(
                        "unknown chunk type {t} in zone {zone_id}"
                    )))
                }
            }
            i += step;
        }
        Ok(())
    }

    fn reclaim_next_ne(&mut self) -> Option<u32> {
        if self.zones_nextne_gc >= self.zones_exhausted {
            return None;
        }
        for zid in self.zones_nextne_gc..self.zones_exhausted {
            if matches!(self.mbs[zid as usize], MbState::Default) {
                self.zones_nextne_gc = zid + 1;
                return Some(zid);
            }
        }
        None
    }

    fn reclaim_setlast_ne(&mut self, zone_id: u32) {
        if zone_id >= self.zones_nextne_gc {
            self.zones_nextne_gc = zone_id + 1;
        }
    }

    fn next_unused_zone(&mut self, cache: &PageCache) -> Option<u32> {
        for zid in self.zones_unused_first..self.nzones {
            // Before the zinfo vector exists only zone 0 can be asked for,
            // and it reads as unused.
            let (allotted, _) = if self.zinfo.is_some() {
                self.zinfo_get(cache, zid)
            } else {
                (false, false)
            };
            if !allotted {
                return Some(zid);
            }
        }
        self.zones_unused_first = self.nzones;
        None
    }

    fn mark_zone_used_transient(
        &mut self,
        cache: &mut PageCache,
        mb: Option<Mbrt>,
        zone_id: u32,
        is_evictable: bool,
    ) {
        if is_evictable {
            let mb = mb.expect("evictable zones carry their runtime");
            self.setmb_evictable(mb);
            self.zones_exhausted_e += 1;
        } else {
            self.setmb_nonevictable(mb, zone_id);
            self.zones_exhausted_ne += 1;
        }
        self.sync_tag(cache, zone_id);

        self.zones_unused_first = zone_id + 1;
        if self.zones_exhausted < self.zones_unused_first {
            self.zones_exhausted = self.zones_unused_first;
        }
    }

    fn mark_zone_used_persist(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        zone_id: u32,
    ) -> Result<()> {
        if zone_id == 0 {
            return Ok(());
        }
        let evictable = self.ismb_evictable(zone_id);
        self.zinfo_set(cache, wal, zone_id, true, evictable)
    }

    fn mark_zone_unused_transient(&mut self, cache: &mut PageCache, zone_id: u32) {
        if self.ismb_evictable(zone_id) {
            self.zones_exhausted_e -= 1;
        } else {
            self.zones_exhausted_ne -= 1;
        }
        self.setmb_unused(zone_id);
        self.sync_tag(cache, zone_id);

        if self.zones_unused_first > zone_id {
            self.zones_unused_first = zone_id;
        }
        if self.zones_exhausted == zone_id + 1 {
            self.zones_exhausted = zone_id;
        }
    }

    /// Return a fully-free non-evictable zone to the unused pool.
    fn mark_zone_unused(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        zone_id: u32,
    ) -> Result<()> {
        debug_assert!(!self.ismb_evictable(zone_id));

        let had_local = self.ismb_localrt(zone_id);
        if had_local {
            self.soemb_cnt -= 1;
        }
        self.mark_zone_unused_transient(cache, zone_id);
        let rg = self.zone_range(zone_id);
        if let Err(e) = cache.map_ranges(&[rg]) {
            tracing::error!(zone_id, "failed to remap unused zone: {e}");
            self.mark_zone_used_transient(cache, None, zone_id, false);
            return Err(e);
        }
        self.zinfo_set_usage(cache, wal, zone_id, mbrt::MB_U0_HINT)?;
        self.zinfo_set(cache, wal, zone_id, false, false)?;
        tracing::debug!(zone_id, "zone returned to unused pool");
        Ok(())
    }

    /// Convert every fully-free default-routed zone back to unused.
    pub fn populate_nemb_unused(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
    ) -> Result<()> {
        let mut defb = self.bucket_acquire(0, DEFAULT_ALLOC_CLASS_ID);
        while let Some(m) = defb.alloc_block(MAX_CHUNK) {
            if self.mark_zone_unused(cache, wal, m.zone_id).is_ok() {
                self.empty_nemb_cnt = self.empty_nemb_cnt.saturating_sub(1);
            } else {
                defb.insert_block(m);
                break;
            }
        }
        self.bucket_release(0, defb);
        Ok(())
    }

    /// Refill the default bucket: reclaim the next never-collected
    /// non-evictable zone, or carve out a brand-new zone.
    fn populate_bucket(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
        mb_id: u32,
    ) -> Result<()> {
        if mb_id != 0 {
            let mb = self.mb_mut(mb_id);
            if !mb.garbage_reclaimed {
                mb.garbage_reclaimed = true;
                return self.reclaim_zone_garbage(cache, wal, bucket, mb_id);
            }
            return Err(HeapError::OutOfSpace(format!(
                "memory bucket {mb_id} exhausted"
            )));
        }

        if let Some(zid) = self.reclaim_next_ne() {
            self.reclaim_zone_garbage(cache, wal, bucket, zid)?;
            self.reclaim_setlast_ne(zid);
            return Ok(());
        }

        if self.zones_exhausted_ne >= self.nzones_ne {
            return Err(HeapError::OutOfSpace("non-evictable zones exhausted".into()));
        }
        let zone_id = self
            .next_unused_zone(cache)
            .ok_or_else(|| HeapError::OutOfSpace("no unused zones".into()))?;

        self.mark_zone_used_transient(cache, None, zone_id, false);

        let rg = self.zone_range(zone_id);
        if let Err(e) = cache.map_ranges(&[rg]) {
            tracing::error!(zone_id, "failed to map zone into cache: {e}");
            self.mark_zone_unused_transient(cache, zone_id);
            return Err(e);
        }
        cache.fill_bytes(rg.addr, rg.size, 0);

        self.zone_init(cache, wal, zone_id, 0)?;
        self.mark_zone_used_persist(cache, wal, zone_id)?;

        self.reclaim_zone_garbage(cache, wal, bucket, zone_id)?;
        self.reclaim_setlast_ne(zone_id);
        Ok(())
    }

    /// Recalculate one recycler and free its empty runs.
    fn recycle_unused(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        mb_id: u32,
        class_id: u8,
        defb: Option<&mut Bucket>,
        force: bool,
    ) -> Result<bool> {
        let empties = {
            let mb = self.mb_mut(mb_id);
            match mb.recyclers[class_id as usize].as_mut() {
                Some(r) => r.recalc(cache, force),
                None => return Ok(false),
            }
        };
        if empties.is_empty() {
            return Ok(false);
        }

        match defb {
            Some(b) => {
                for m in &empties {
                    self.run_into_free_chunk(cache, wal, b, m)?;
                }
            }
            None => {
                let mut b = self.bucket_acquire(mb_id, DEFAULT_ALLOC_CLASS_ID);
                let mut rc = Ok(());
                for m in &empties {
                    rc = self.run_into_free_chunk(cache, wal, &mut b, m);
                    if rc.is_err() {
                        break;
                    }
                }
                self.bucket_release(mb_id, b);
                rc?;
            }
        }
        Ok(true)
    }

    /// Force-recalculate every recycler of a memory bucket.
    fn reclaim_garbage(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        defb: &mut Bucket,
        mb_id: u32,
    ) -> Result<bool> {
        let mut any = false;
        for class_id in 0..alloc_class::MAX_ALLOCATION_CLASSES as u16 {
            if self
                .recycle_unused(cache, wal, mb_id, class_id as u8, Some(defb), true)?
            {
                any = true;
            }
        }
        Ok(any)
    }

    fn ensure_huge_bucket_filled(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
        mb_id: u32,
    ) -> Result<()> {
        if self.reclaim_garbage(cache, wal, bucket, mb_id)? {
            return Ok(());
        }
        self.populate_bucket(cache, wal, bucket, mb_id)
    }

    /// Put a detached run back into the global state: free chunk if empty,
    /// recycler otherwise.
    pub fn discard_run(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        m: &MemoryBlock,
    ) -> Result<()> {
        if self.reclaim_run(cache, m, false) {
            let mut b = self.bucket_acquire(m.zone_id, DEFAULT_ALLOC_CLASS_ID);
            let rc = self.run_into_free_chunk(cache, wal, &mut b, m);
            self.bucket_release(m.zone_id, b);
            rc?;
        }
        Ok(())
    }

    fn detach_and_try_discard_run(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
    ) -> Result<()> {
        if let Some((run, empty)) = bucket.detach_run(cache) {
            if empty {
                self.discard_run(cache, wal, &run)?;
            } else {
                // Not empty: park it for future reuse.
                let rdsc = run.rdsc.expect("run geometry");
                let free = run_free_space(cache, &run);
                let class_id = bucket.class_id;
                let mb = self.mb_mut(run.zone_id);
                mb.recycler_mut(class_id, rdsc.nallocs).put(run, free);
            }
        }
        Ok(())
    }

    /// Try to reattach a partially-empty run from the recycler.
    fn reuse_from_recycler(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
        mb_id: u32,
        units: u32,
        force: bool,
    ) -> Result<bool> {
        let class = *self
            .alloc_classes
            .by_id(bucket.class_id)
            .expect("bucket class");
        let nallocs = class.rdsc.expect("run class").nallocs;

        if !force {
            let got = {
                let mb = self.mb_mut(mb_id);
                mb.recycler_mut(class.id, nallocs).get(units)
            };
            if let Some(run) = got {
                bucket.attach_run(cache, run);
                return Ok(true);
            }
        }

        self.recycle_unused(cache, wal, mb_id, class.id, None, force)?;

        let got = {
            let mb = self.mb_mut(mb_id);
            mb.recycler_mut(class.id, nallocs).get(units)
        };
        if let Some(run) = got {
            bucket.attach_run(cache, run);
            return Ok(true);
        }
        Ok(false)
    }

    /// Create a new run from a free chunk extent and attach it.
    fn run_create(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
        m: MemoryBlock,
    ) -> Result<()> {
        let class = *self
            .alloc_classes
            .by_id(bucket.class_id)
            .expect("bucket class");
        let rdsc = class.rdsc.expect("run class");
        let run = run_init(
            cache,
            wal,
            m.zone_id,
            m.chunk_id,
            rdsc,
            class.chunk_flags(),
        )?;
        bucket.attach_run(cache, run);
        self.tstats.run_active += rdsc.size_idx as u64 * CHUNKSIZE;
        Ok(())
    }

    fn ensure_run_bucket_filled(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
        mb_id: u32,
        units: u32,
    ) -> Result<()> {
        let class_id = bucket.class_id;
        if self.mb(mb_id).is_laf(class_id) {
            return Err(HeapError::OutOfSpace(format!(
                "class {class_id} exhausted in bucket {mb_id}"
            )));
        }

        self.detach_and_try_discard_run(cache, wal, bucket)?;

        if self.reuse_from_recycler(cache, wal, bucket, mb_id, units, false)? {
            return Ok(());
        }

        // Cannot reuse an existing run; create a new one from free chunks.
        let class = *self.alloc_classes.by_id(class_id).expect("bucket class");
        let size_idx = class.rdsc.expect("run class").size_idx;
        let mut defb = self.bucket_acquire(mb_id, DEFAULT_ALLOC_CLASS_ID);
        let mut m = MemoryBlock::huge(0, 0, size_idx);
        let rc = self.get_bestfit_block(cache, wal, &mut defb, mb_id, &mut m);
        self.bucket_release(mb_id, defb);

        match rc {
            Ok(()) => {
                debug_assert_eq!(m.block_off, 0);
                self.run_create(cache, wal, bucket, m)
            }
            Err(_) => {
                if self.reuse_from_recycler(cache, wal, bucket, mb_id, units, true)? {
                    return Ok(());
                }
                self.mb_mut(mb_id).set_laf(class_id);
                Err(HeapError::OutOfSpace(format!(
                    "no backing space for class {class_id} in bucket {mb_id}"
                )))
            }
        }
    }

    /// Bookkeeping at every block free.
    pub fn memblock_on_free(&mut self, cache: &PageCache, m: &MemoryBlock) {
        if m.kind != BlockKind::Run {
            return;
        }
        let hdr: ChunkHeader = cache.read_pod(chunk_header_off(m.zone_id, m.chunk_id));
        debug_assert_eq!(hdr.ctype, CHUNK_TYPE_RUN);
        let rdsc = m.rdsc.expect("run geometry");

        let Some(class) = self
            .alloc_classes
            .by_run(rdsc.unit_size, hdr.flags, hdr.size_idx)
        else {
            return;
        };
        let class_id = class.id;
        let nallocs = class.rdsc.expect("run class").nallocs;
        let mb = self.mb_mut(m.zone_id);
        mb.recycler_mut(class_id, nallocs).inc_unaccounted(m);
        mb.clear_laf();
    }

    /// Split the unused tail of an extracted block back into the bucket.
    fn split_block(&self, bucket: &mut Bucket, m: &mut MemoryBlock, units: u32) {
        debug_assert!(units > 0 && units <= m.size_idx);
        if m.size_idx == units {
            return;
        }
        let mut rest = *m;
        rest.block_off = m.block_off + units;
        rest.size_idx = m.size_idx - units;
        if m.kind == BlockKind::Huge {
            rest.chunk_id = m.chunk_id + units;
            rest.block_off = 0;
        }
        bucket.insert_block(rest);
        m.size_idx = units;
    }

    /// Extract a block of `m.size_idx` units/chunks from the bucket,
    /// refilling it as needed.
    pub fn get_bestfit_block(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        bucket: &mut Bucket,
        mb_id: u32,
        m: &mut MemoryBlock,
    ) -> Result<()> {
        let class = *self
            .alloc_classes
            .by_id(bucket.class_id)
            .expect("bucket class");
        let units = m.size_idx;

        loop {
            match bucket.alloc_block(units) {
                Some(got) => {
                    *m = got;
                    break;
                }
                None => match class.ctype {
                    ClassType::Huge => {
                        self.ensure_huge_bucket_filled(cache, wal, bucket, mb_id)?
                    }
                    ClassType::Run => {
                        self.ensure_run_bucket_filled(cache, wal, bucket, mb_id, units)?
                    }
                },
            }
        }

        debug_assert!(m.size_idx >= units);
        if units != m.size_idx {
            if m.kind == BlockKind::Huge {
                // Rewrite both halves' headers before use.
                let rest_id = m.chunk_id + units;
                let rest_size = m.size_idx - units;
                let rest = huge_init(cache, wal, m.zone_id, rest_id, rest_size)?;
                let head = huge_init(cache, wal, m.zone_id, m.chunk_id, units)?;
                bucket.insert_block(rest);
                *m = head;
            } else {
                self.split_block(bucket, m, units);
            }
        }
        m.header = class.header;
        Ok(())
    }

    // ========================================================================
    // Evictable memory buckets
    // ========================================================================

    /// Create a new evictable memory bucket on an unused zone.
    fn create_evictable_mb(&mut self, cache: &mut PageCache, wal: &mut WalTx) -> Result<u32> {
        debug_assert!(self.active_evictable_mb.is_none());
        if self.zones_exhausted_e >= self.nzones_e {
            return Err(HeapError::OutOfSpace("evictable zones exhausted".into()));
        }

        // FIFO-serialize concurrent creators; a single task never queues.
        self.mb_create_waiters += 1;
        let result = self.create_evictable_mb_inner(cache, wal);
        self.mb_create_waiters -= 1;
        result
    }

    fn create_evictable_mb_inner(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
    ) -> Result<u32> {
        let zone_id = self
            .next_unused_zone(cache)
            .ok_or_else(|| HeapError::OutOfSpace("no unused zone for evictable mb".into()))?;

        let mb = Mbrt::new(zone_id, &self.alloc_classes);
        self.mark_zone_used_transient(cache, Some(mb), zone_id, true);

        let rg = self.zone_range(zone_id);
        let pin = (|| -> Result<crate::cache::PinHandle> {
            cache.map_ranges(&[rg])?;
            cache.fill_bytes(rg.addr, rg.size, 0);
            cache.pin_ranges(&[rg], false)
        })();
        let pin = match pin {
            Ok(p) => p,
            Err(e) => {
                self.mark_zone_unused_transient(cache, zone_id);
                return Err(e);
            }
        };

        tracing::debug!(zone_id, "creating evictable zone");
        let rc = (|| -> Result<()> {
            self.zone_init(cache, wal, zone_id, ZONE_EVICTABLE_MB)?;
            self.mb_reclaim_garbage(cache, wal, zone_id)?;
            self.mark_zone_used_persist(cache, wal, zone_id)
        })();
        cache.unpin(pin);
        match rc {
            Ok(()) => Ok(zone_id),
            Err(e) => {
                self.mark_zone_unused_transient(cache, zone_id);
                Err(e)
            }
        }
    }

    fn mb_reclaim_garbage(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        zid: u32,
    ) -> Result<()> {
        if zid != 0 && self.mb(zid).garbage_reclaimed {
            return Ok(());
        }
        let mut b = self.bucket_acquire(zid, DEFAULT_ALLOC_CLASS_ID);
        let rc = self.reclaim_zone_garbage(cache, wal, &mut b, zid);
        self.bucket_release(zid, b);
        rc?;
        if zid != 0 {
            self.mb_mut(zid).garbage_reclaimed = true;
        }
        Ok(())
    }

    /// Pick (or create) the evictable memory bucket to allocate from.
    pub fn get_evictable_mb(&mut self, cache: &mut PageCache, wal: &mut WalTx) -> Result<u32> {
        if let Some(active) = self.active_evictable_mb {
            if self.mb_pressure || self.mb(active).space_usage <= MB_U75 {
                return Ok(active);
            }
            self.active_evictable_mb = None;
            let usage = self.mb(active).space_usage;
            self.setmb_usage(cache, wal, active, usage)?;
        }
        self.mb_pressure = false;

        if let Some(id) = self.emb_qbs.pop(false) {
            self.mb_mut(id).qband = None;
            self.active_evictable_mb = Some(id);
            return Ok(id);
        }

        match self.create_evictable_mb(cache, wal) {
            Ok(id) => {
                self.active_evictable_mb = Some(id);
                return Ok(id);
            }
            Err(e) if !e.is_transient() => {
                // Fall back to nearly-full buckets under pressure.
            }
            Err(e) => return Err(e),
        }

        self.mb_pressure = true;
        match self.emb_qbs.pop(true) {
            Some(id) => {
                self.mb_mut(id).qband = None;
                self.active_evictable_mb = Some(id);
                Ok(id)
            }
            None => {
                tracing::warn!("failed to get an evictable memory bucket");
                Ok(0)
            }
        }
    }

    /// The active evictable bucket stopped serving: retire it to the U90
    /// band so another one is picked.
    pub fn log_alloc_failure(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        zone_id: u32,
    ) -> Result<()> {
        if self.active_evictable_mb == Some(zone_id) {
            self.active_evictable_mb = None;
            if let MbState::Local(mb) = &mut self.mbs[zone_id as usize] {
                debug_assert!(mb.qband.is_none());
                self.emb_qbs.insert_by_hint(mb, mbrt::MB_U90_HINT);
            }
            self.zinfo_set_usage(cache, wal, zone_id, mbrt::MB_U90_HINT)?;
        }
        Ok(())
    }

    /// Set the observed usage of a bucket (page-load refresh, boot).
    pub fn setmb_usage(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        zone_id: u32,
        usage: u64,
    ) -> Result<()> {
        debug_assert!(zone_id < self.nzones);
        if zone_id == 0 {
            self.default_mb.space_usage = usage;
            return Ok(());
        }
        if !self.ismb_evictable(zone_id) {
            let mb = match &mut self.mbs[zone_id as usize] {
                MbState::Local(m) => m,
                _ => return Ok(()),
            };
            mb.space_usage = usage;
            if mb.qband.is_none() {
                self.soe.qbs.insert(mb);
            }
            return Ok(());
        }

        {
            let mb = self.mb_mut(zone_id);
            mb.space_usage = usage;
        }
        if self.active_evictable_mb == Some(zone_id) {
            return Ok(());
        }
        let hint = {
            let mb = match &mut self.mbs[zone_id as usize] {
                MbState::Local(m) => m,
                _ => unreachable!(),
            };
            if mb.qband.is_some() {
                self.emb_qbs.update(mb)
            } else {
                self.emb_qbs.insert(mb);
                MB_UMAX_HINT
            }
        };
        if hint != MB_UMAX_HINT {
            self.zinfo_set_usage(cache, wal, zone_id, hint)?;
        }
        Ok(())
    }

    /// Usage statistics for a bucket: zone 0 aggregates every zone routed
    /// to the default runtime.
    pub fn getmb_usage(&self, zone_id: u32) -> Result<(u64, u64)> {
        if zone_id == 0 {
            return Ok((
                self.default_mb.space_usage,
                self.nzones_ne as u64 * ZONE_MAX_SIZE,
            ));
        }
        if zone_id >= self.nzones || !self.ismb_initialized(zone_id) || !self.ismb_evictable(zone_id)
        {
            return Err(HeapError::InvalidArgument(format!(
                "zone {zone_id} is not an evictable memory bucket"
            )));
        }
        Ok((self.mb(zone_id).space_usage, ZONE_MAX_SIZE))
    }

    /// Account an allocation or free against a bucket's usage.
    pub fn incrmb_usage(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
        zone_id: u32,
        delta: i64,
    ) -> Result<()> {
        let apply = |usage: &mut u64| {
            *usage = usage.saturating_add_signed(delta);
        };

        if !self.ismb_evictable(zone_id) {
            apply(&mut self.default_mb.space_usage);
        }
        if !self.ismb_localrt(zone_id) {
            return Ok(());
        }

        let evictable = self.ismb_evictable(zone_id);
        let active = self.active_evictable_mb;
        let (hint, relieved) = {
            let mb = match &mut self.mbs[zone_id as usize] {
                MbState::Local(m) => m,
                _ => unreachable!(),
            };
            apply(&mut mb.space_usage);
            if active == Some(zone_id) {
                (MB_UMAX_HINT, false)
            } else if evictable {
                let hint = self.emb_qbs.update(mb);
                (hint, hint <= mbrt::MB_U30_HINT && hint != MB_UMAX_HINT)
            } else {
                let _ = self.soe.qbs.update(mb);
                (MB_UMAX_HINT, false)
            }
        };
        if hint != MB_UMAX_HINT {
            self.zinfo_set_usage(cache, wal, zone_id, hint)?;
        }
        if relieved {
            self.mb_pressure = false;
        }
        Ok(())
    }

    /// Memory-bucket id of the zone owning an offset.
    pub fn off2mbid(&self, offset: BlobOff) -> u32 {
        let zid = crate::common::zone_id_of(offset);
        if self.ismb_localrt(zid) {
            zid
        } else {
            0
        }
    }

    // ========================================================================
    // Small-object-eviction ring
    // ========================================================================

    pub fn soemb_active_iter_init(&mut self) {
        self.soe.cur_idx = 0;
    }

    /// Next active SOE bucket for small allocations; 0 terminates.
    pub fn soemb_active_get(&mut self) -> u32 {
        if self.nzones_e == 0 {
            return 0;
        }
        if self.soe.cur_idx > self.soe.fur_idx {
            self.soe.fur_idx = self.soe.cur_idx;
        }
        let mut id = None;
        if self.soe.cur_idx < SOEMB_ACTIVE_CNT {
            id = self.soe.svec[self.soe.cur_idx];
            self.soe.cur_idx += 1;
        }
        id.unwrap_or(0)
    }

    fn create_soe_mb(&mut self, cache: &mut PageCache, wal: &mut WalTx) -> Result<u32> {
        if self.zones_exhausted_ne >= self.nzones_ne {
            return Err(HeapError::OutOfSpace("non-evictable zones exhausted".into()));
        }
        let zone_id = self
            .next_unused_zone(cache)
            .ok_or_else(|| HeapError::OutOfSpace("no unused zone for soe mb".into()))?;

        let mb = Mbrt::new(zone_id, &self.alloc_classes);
        self.mark_zone_used_transient(cache, Some(mb), zone_id, false);

        let rg = self.zone_range(zone_id);
        let rc = (|| -> Result<()> {
            cache.map_ranges(&[rg])?;
            cache.fill_bytes(rg.addr, rg.size, 0);
            self.zone_init(cache, wal, zone_id, ZONE_SOE_MB)?;
            self.mb_reclaim_garbage(cache, wal, zone_id)?;
            self.mark_zone_used_persist(cache, wal, zone_id)
        })();
        match rc {
            Ok(()) => {
                self.empty_nemb_cnt += 1;
                self.soemb_cnt += 1;
                tracing::debug!(zone_id, "created soe zone");
                Ok(zone_id)
            }
            Err(e) => {
                self.mark_zone_unused_transient(cache, zone_id);
                Err(e)
            }
        }
    }

    /// Refill the active SOE slots, retiring the oldest slot once the
    /// rotation has advanced past it.
    pub fn soemb_reserve(&mut self, cache: &mut PageCache, wal: &mut WalTx) -> Result<()> {
        if self.nzones_e == 0 {
            return Ok(());
        }

        if self.soe.fur_idx > 1 {
            if let Some(id) = self.soe.svec[0] {
                if let MbState::Local(mb) = &mut self.mbs[id as usize] {
                    if mb.qband.is_none() {
                        self.soe.qbs.insert(mb);
                    }
                }
            }
            for i in 1..SOEMB_ACTIVE_CNT {
                self.soe.svec[i - 1] = self.soe.svec[i];
            }
            self.soe.svec[SOEMB_ACTIVE_CNT - 1] = None;
            self.soe.fur_idx = 0;
        }

        for i in 0..SOEMB_ACTIVE_CNT {
            if self.soe.svec[i].is_some() {
                continue;
            }
            if let Some(id) = self.soe.qbs.pop(false) {
                self.mb_mut(id).qband = None;
                self.soe.svec[i] = Some(id);
                break;
            }
            match self.create_soe_mb(cache, wal) {
                Ok(id) => {
                    self.soe.svec[i] = Some(id);
                    break;
                }
                Err(_) => {
                    if let Some(id) = self.soe.qbs.pop(true) {
                        self.mb_mut(id).qband = None;
                        self.soe.svec[i] = Some(id);
                    }
                    break;
                }
            }
        }
        self.soe.cur_idx = 0;
        Ok(())
    }

    fn recycle_soembs(&mut self, cache: &mut PageCache, wal: &mut WalTx) -> Result<()> {
        for i in 0..SOEMB_ACTIVE_CNT {
            if let Some(id) = self.soe.svec[i] {
                if self.mb(id).space_usage == 0 {
                    if let MbState::Local(mb) = &mut self.mbs[id as usize] {
                        if mb.qband.is_none() {
                            self.soe.qbs.insert(mb);
                        }
                    }
                    self.soe.svec[i] = None;
                }
            }
        }

        while let Some(id) = self.soe.qbs.pop_empty() {
            self.mb_mut(id).qband = None;
            self.mb_reclaim_garbage(cache, wal, id)?;

            // Flush every active run back into free chunks where possible.
            for class_id in 0..alloc_class::MAX_ALLOCATION_CLASSES as u16 {
                if !self.has_class_bucket(id, class_id as u8) {
                    continue;
                }
                let mut b = self.bucket_acquire(id, class_id as u8);
                let rc = self.detach_and_try_discard_run(cache, wal, &mut b);
                self.bucket_release(id, b);
                rc?;
            }

            let mut defb = self.bucket_acquire(id, DEFAULT_ALLOC_CLASS_ID);
            let rc = self.reclaim_garbage(cache, wal, &mut defb, id);
            let whole = defb.alloc_block(MAX_CHUNK);
            match (rc, whole) {
                (Ok(_), Some(m)) => {
                    self.bucket_release(id, defb);
                    if self.mark_zone_unused(cache, wal, m.zone_id).is_ok() {
                        self.empty_nemb_cnt = self.empty_nemb_cnt.saturating_sub(1);
                        // The runtime is gone with the zone.
                        continue;
                    }
                    if let MbState::Local(mb) = &mut self.mbs[id as usize] {
                        if mb.qband.is_none() {
                            self.soe.qbs.insert_by_hint(mb, mbrt::MB_U0_HINT);
                        }
                    }
                }
                (rc, whole) => {
                    if let Some(m) = whole {
                        defb.insert_block(m);
                    }
                    self.bucket_release(id, defb);
                    rc?;
                    if let MbState::Local(mb) = &mut self.mbs[id as usize] {
                        if mb.qband.is_none() {
                            self.soe.qbs.insert_by_hint(mb, mbrt::MB_U0_HINT);
                        }
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Forced garbage collection: reclaim free blocks and return empty
    /// non-evictable zones to the unused pool.
    pub fn force_recycle(&mut self, cache: &mut PageCache, wal: &mut WalTx) -> Result<()> {
        let gcth = self.empty_nemb_gcth;
        let mut max_reclaim = gcth * 2;

        if self.empty_nemb_cnt < gcth {
            let mb = &self.default_mb;
            if mb.space_usage > mb.prev_usage
                || mb.prev_usage - mb.space_usage < ZONE_MAX_SIZE * gcth as u64
            {
                if mb.space_usage > mb.prev_usage {
                    self.default_mb.prev_usage = self.default_mb.space_usage;
                }
                return Ok(());
            }
        }

        self.recycle_soembs(cache, wal)?;

        let mut defb = self.bucket_acquire(0, DEFAULT_ALLOC_CLASS_ID);
        let rc = (|| -> Result<()> {
            while let Some(zid) = self.reclaim_next_ne() {
                self.reclaim_zone_garbage(cache, wal, &mut defb, zid)?;
                self.reclaim_setlast_ne(zid);
                max_reclaim -= 1;
                if max_reclaim == 0 {
                    break;
                }
            }
            self.reclaim_garbage(cache, wal, &mut defb, 0)?;
            Ok(())
        })();
        self.bucket_release(0, defb);
        rc?;

        self.populate_nemb_unused(cache, wal)?;
        self.default_mb.prev_usage = self.default_mb.space_usage;
        Ok(())
    }

    pub fn incr_empty_nemb_cnt(&mut self) -> u32 {
        self.empty_nemb_cnt += 1;
        self.empty_nemb_cnt
    }

    pub fn decr_empty_nemb_cnt(&mut self) -> u32 {
        self.empty_nemb_cnt = self.empty_nemb_cnt.saturating_sub(1);
        self.empty_nemb_cnt
    }

    // ========================================================================
    // Boot-time zone loading
    // ========================================================================

    /// Initialize zone 0 on first use; otherwise pick up its usage.
    pub fn ensure_zone0_initialized(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
    ) -> Result<()> {
        self.setmb_nonevictable(None, 0);
        self.sync_tag(cache, 0);

        // A fresh pool has nothing resident yet; map zone 0 as an empty
        // page so its (zeroed) header can be inspected.
        if !cache.off_is_loaded(zone_offset(0)) {
            cache.map_ranges(&[self.zone_range(0)])?;
        }

        let zh = self.zone_header(cache, 0);
        if zh.magic != ZONE_HEADER_MAGIC {
            debug_assert_eq!(zh.magic, 0, "zone 0 is neither initialized nor empty");
            let mut b = self.bucket_acquire(0, DEFAULT_ALLOC_CLASS_ID);
            let rc = self.populate_bucket(cache, wal, &mut b, 0);
            self.bucket_release(0, b);
            rc?;
        }
        let usage = self.zone_header(cache, 0).sp_usage;
        self.setmb_usage(cache, wal, 0, usage)
    }

    /// Load every allotted non-evictable zone and rebuild its runtime.
    pub fn load_nonevictable_zones(
        &mut self,
        cache: &mut PageCache,
        wal: &mut WalTx,
    ) -> Result<()> {
        for zid in 1..self.zones_exhausted {
            let (allotted, evictable) = self.zinfo_get(cache, zid);
            if !allotted || evictable {
                continue;
            }
            self.zone_load(cache, zid)?;
            let zh = self.zone_header(cache, zid);
            debug_assert_eq!(zh.flags & ZONE_EVICTABLE_MB, 0);
            if zh.flags & ZONE_SOE_MB != 0 {
                let mb = Mbrt::new(zid, &self.alloc_classes);
                self.setmb_nonevictable(Some(mb), zid);
                self.sync_tag(cache, zid);
                let mb = match &mut self.mbs[zid as usize] {
                    MbState::Local(m) => m,
                    _ => unreachable!(),
                };
                self.soe.qbs.insert(mb);
                self.soemb_cnt += 1;
            }
            if zh.sp_usage == 0 {
                self.incr_empty_nemb_cnt();
            }
            self.incrmb_usage(cache, wal, zid, zh.sp_usage as i64)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_max_zone() {
        assert_eq!(heap_max_zone(HEAP_HDR_SIZE), 0);
        assert_eq!(heap_max_zone(HEAP_HDR_SIZE + ZONE_MIN_SIZE), 1);
        assert_eq!(heap_max_zone(HEAP_HDR_SIZE + ZONE_MAX_SIZE), 1);
        assert_eq!(heap_max_zone(HEAP_HDR_SIZE + 3 * ZONE_MAX_SIZE), 3);
        // The leftover must be at least a minimal zone to count.
        assert_eq!(heap_max_zone(HEAP_HDR_SIZE + ZONE_MAX_SIZE + 100), 1);
    }

    #[test]
    fn test_zone_limits_partitioning() {
        // Cache covers the heap: everything non-evictable.
        let zd = heap_get_zone_limits(4096 + 4 * ZONE_MAX_SIZE, 8 * ZONE_MAX_SIZE, 80);
        assert_eq!(zd.nzones_ne_max, 4);
        assert_eq!(zd.nzones_e_max, 0);

        // Tiny cache: everything it can hold is non-evictable.
        let zd = heap_get_zone_limits(4096 + 64 * ZONE_MAX_SIZE, 8 * ZONE_MAX_SIZE, 80);
        assert_eq!(zd.nzones_ne_max, 8);

        // Large heap, split by percentage.
        let zd = heap_get_zone_limits(4096 + 100 * ZONE_MAX_SIZE, 40 * ZONE_MAX_SIZE, 80);
        assert_eq!(zd.nzones_cache, 40);
        assert_eq!(zd.nzones_ne_max, 32);
        assert_eq!(zd.nzones_e_max, 68);
    }

    #[test]
    fn test_zone_size_idx_trailing_zone() {
        let heap_size = HEAP_HDR_SIZE + ZONE_MAX_SIZE + ZONE_META_SIZE + 5 * CHUNKSIZE;
        let nz = heap_max_zone(heap_size);
        assert_eq!(nz, 2);
        assert_eq!(zone_calc_size_idx(0, nz, heap_size), MAX_CHUNK);
        assert_eq!(zone_calc_size_idx(1, nz, heap_size), 5);
    }
}
