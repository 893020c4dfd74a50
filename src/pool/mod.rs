// # Pool
//
// The object handle tying the subsystems together: create/open/close with
// header verification and WAL replay, the atomic operations (alloc, free,
// memcpy_persist), root object management, the transaction interface and
// the checkpoint driver. Every mutation runs under a WAL transaction:
// user transactions through the stage machine, everything else through a
// short-lived internal one.

use crate::cache::{CacheEvent, ChkptStats, PageCache, PinHandle};
use crate::common::{
    zone_offset, BlobOff, TxId, DAV_MAX_ALLOC_SIZE, FLAG_TX_NO_ABORT, FLAG_ZERO, HEAP_HDR_SIZE,
    NEMB_PCT, UMEM_CACHE_MIN_PAGES, VALID_ALLOC_FLAGS, VALID_XADD_FLAGS, ZONE_MAX_SIZE,
};
use crate::error::{HeapError, Result};
use crate::heap::alloc_class::HeaderType;
use crate::heap::layout::{root_ref_off, sp_usage_glob_off, zinfo_ref_off, zinfo_size, ZoneHeader};
use crate::heap::{heap_get_zone_limits, Heap};
use crate::memops::{LogType, OperationContext};
use crate::palloc::{self, PallocAction};
use crate::stats::{HeapStats, MbStats};
use crate::store::{MetaStore, StoreRegion};
use crate::tx::{
    add_range_common, flush_ranges, restore_undo, FailureBehavior, TxCallback, TxStage, TxState,
};
use crate::ulog::{LANE_REDO_EXTERNAL_SIZE, LANE_UNDO_SIZE, OP_SET, TX_RANGE_CACHE_SIZE};
use crate::wal::{self, WalTx};
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// Create-time parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Bytes of cache memory; ideally a multiple of the zone size.
    pub cache_size: u64,
    /// Override for the non-evictable percentage; `None` consults the
    /// environment and the built-in default.
    pub nemb_pct: Option<u32>,
}

/// Allocation class descriptor for registration.
#[derive(Debug, Clone, Copy)]
pub struct AllocClassDesc {
    pub unit_size: u64,
    pub alignment: u64,
    pub units_per_block: u32,
    pub header_type: HeaderType,
    /// 0 auto-assigns a free id.
    pub class_id: u16,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

pub struct Pool {
    store: Rc<dyn MetaStore>,
    cache: PageCache,
    heap: Heap,
    external: OperationContext,
    undo: OperationContext,
    utx: Option<WalTx>,
    lw_depth: u32,
    tx: TxState,
    booted: bool,
    /// Zones pinned for the duration of the current WAL transaction, so
    /// eviction cannot select a page the open transaction dirtied.
    tx_pins: Vec<PinHandle>,
    /// Bytes consumed by internal metadata (the zinfo vector), excluded
    /// from the user-visible allocation statistics.
    internal_allocated: u64,
}

macro_rules! cur_wal {
    ($self:ident) => {
        $self.utx.as_mut().expect("active WAL transaction")
    };
}

impl Pool {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn create(store: Rc<dyn MetaStore>, cfg: &PoolConfig) -> Result<Pool> {
        Self::validate_sizes(&*store, cfg.cache_size)?;
        let nemb_pct = match cfg.nemb_pct {
            Some(v) if (1..=100).contains(&v) => v,
            Some(v) => {
                return Err(HeapError::InvalidArgument(format!(
                    "nemb_pct {v} outside 1..=100"
                )))
            }
            None => *NEMB_PCT,
        };
        Heap::format(&*store, cfg.cache_size, nemb_pct)?;
        Self::open_internal(store, cfg.cache_size, true)
    }

    pub fn open(store: Rc<dyn MetaStore>, cache_size: u64) -> Result<Pool> {
        Self::validate_sizes(&*store, cache_size)?;
        Self::open_internal(store, cache_size, false)
    }

    fn validate_sizes(store: &dyn MetaStore, cache_size: u64) -> Result<()> {
        let hzl = heap_get_zone_limits(store.size(), cache_size, 100);
        if hzl.nzones_heap == 0 {
            return Err(HeapError::InvalidArgument("insufficient heap size".into()));
        }
        if hzl.nzones_cache <= UMEM_CACHE_MIN_PAGES && hzl.nzones_heap > hzl.nzones_cache {
            return Err(HeapError::InvalidArgument("insufficient cache size".into()));
        }
        if hzl.nzones_cache as u64 * ZONE_MAX_SIZE != cache_size {
            tracing::warn!(
                cache_size,
                "cache size is not zone aligned, the remainder is unused"
            );
        }
        Ok(())
    }

    fn open_internal(store: Rc<dyn MetaStore>, cache_size: u64, init: bool) -> Result<Pool> {
        let hdr = Heap::read_header(&*store, cache_size)?;
        let nemb_pct = if hdr.nemb_pct != 0 {
            hdr.nemb_pct as u32
        } else {
            *NEMB_PCT
        };
        let heap_size = store.size();
        let heap = Heap::boot(heap_size, cache_size, nemb_pct)?;
        let hzl = heap_get_zone_limits(heap_size, cache_size, nemb_pct);

        let mem_pages = hzl.nzones_cache.min(hzl.nzones_heap);
        let mut cache = PageCache::new(
            Rc::clone(&store),
            ZONE_MAX_SIZE,
            hzl.nzones_heap,
            mem_pages,
            heap.max_nemb(),
            HEAP_HDR_SIZE,
        )?;
        heap.sync_all_tags(&mut cache);

        let mut pool = Pool {
            store,
            cache,
            heap,
            external: OperationContext::new(
                LogType::Redo,
                LANE_REDO_EXTERNAL_SIZE,
                LANE_REDO_EXTERNAL_SIZE,
            ),
            undo: OperationContext::new(LogType::Undo, LANE_UNDO_SIZE, TX_RANGE_CACHE_SIZE),
            utx: None,
            lw_depth: 0,
            tx: TxState::default(),
            booted: false,
            tx_pins: Vec::new(),
            internal_allocated: 0,
        };

        if !init {
            pool.heap.zone_load(&mut pool.cache, 0)?;
            wal::replay(&pool.store, &mut pool.cache, heap_size)?;
        }

        pool.lw_tx(|p| {
            let utx = p.utx.as_mut().expect("lw tx");
            p.heap.ensure_zone0_initialized(&mut p.cache, utx)
        })?;

        let z0: ZoneHeader = pool.cache.read_pod(zone_offset(0));
        if z0.zone0_zinfo_off != 0 {
            debug_assert!(z0.zone0_zinfo_size != 0);
            pool.heap.update_mbrt_zinfo(
                &mut pool.cache,
                z0.zone0_zinfo_off,
                z0.zone0_zinfo_size,
                false,
            )?;
            pool.internal_allocated =
                palloc::block_from_offset(&pool.heap, &pool.cache, z0.zone0_zinfo_off)?
                    .real_size();
            pool.lw_tx(|p| {
                let utx = p.utx.as_mut().expect("lw tx");
                p.heap.load_nonevictable_zones(&mut p.cache, utx)
            })?;
        } else {
            debug_assert_eq!(z0.zone0_zinfo_size, 0);
            pool.lw_tx(|p| p.bootstrap_zinfo())?;
        }

        pool.cache.post_replay();
        pool.booted = true;
        pool.cache.take_events();
        tracing::info!(heap_size, cache_size, "pool is open");
        Ok(pool)
    }

    /// Allocate the zinfo vector from the heap and hook it into zone 0.
    fn bootstrap_zinfo(&mut self) -> Result<()> {
        let need = zinfo_size(self.heap.nzones());
        let act = {
            let utx = cur_wal!(self);
            palloc::reserve(
                &mut self.heap,
                &mut self.cache,
                utx,
                need,
                None,
                0,
                FLAG_ZERO,
                true,
            )?
        };

        self.external.start();
        let (off_ref, size_ref) = zinfo_ref_off();
        self.external.add_entry(off_ref, act.offset, OP_SET);
        self.external.add_entry(size_ref, act.usable_size, OP_SET);
        {
            let utx = cur_wal!(self);
            palloc::publish(
                &mut self.heap,
                &mut self.cache,
                utx,
                &mut self.external,
                &[act],
            )?;
        }

        self.internal_allocated = act.m.real_size();
        let utx = cur_wal!(self);
        self.heap
            .zinfo_init(&mut self.cache, utx, act.offset, act.usable_size)?;
        self.heap
            .update_mbrt_zinfo(&mut self.cache, act.offset, act.usable_size, true)
    }

    /// Close the pool. Volatile state is dropped; durability comes from
    /// the WAL, so no flushing is required here.
    pub fn close(self) {
        debug_assert_eq!(self.tx.stage, TxStage::None, "closing with an open tx");
        tracing::info!("pool closed");
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        ZONE_MAX_SIZE
    }

    #[inline]
    pub fn heap_size(&self) -> u64 {
        self.heap.heap_size
    }

    pub fn store(&self) -> &Rc<dyn MetaStore> {
        &self.store
    }

    // ========================================================================
    // Internal WAL transactions
    // ========================================================================

    fn lw_begin(&mut self) -> Result<()> {
        if self.utx.is_none() {
            let id = self.store.wal_reserve()?;
            self.utx = Some(WalTx::new(id));
        }
        self.lw_depth += 1;
        Ok(())
    }

    fn lw_end(&mut self) -> Result<()> {
        debug_assert!(self.lw_depth > 0);
        self.lw_depth -= 1;
        if self.lw_depth == 0 && self.tx.stage == TxStage::None {
            self.dispatch_events()?;
            self.submit_wal()?;
        }
        Ok(())
    }

    /// Keep the targeted evictable zone resident until the transaction
    /// submits.
    fn pin_ezone(&mut self, flags: u64) -> Result<()> {
        let zid = crate::common::ezone_id_from_flags(flags);
        if zid == 0 {
            return Ok(());
        }
        let off = zone_offset(zid);
        let size = ZONE_MAX_SIZE.min(self.heap.heap_size - off);
        let handle = self.cache.pin_ranges(&[StoreRegion { addr: off, size }], false)?;
        self.tx_pins.push(handle);
        Ok(())
    }

    fn submit_wal(&mut self) -> Result<()> {
        for pin in self.tx_pins.drain(..) {
            self.cache.unpin(pin);
        }
        let utx = self.utx.take().expect("active WAL transaction");
        if utx.act_count() > 0 {
            self.store
                .wal_submit(utx.id(), utx.actions(), utx.payload_len())
                .map_err(|e| HeapError::WalSubmit {
                    tx_id: utx.id(),
                    reason: e.to_string(),
                })?;
        }
        self.cache.commit(self.store.wal_committed());
        Ok(())
    }

    fn lw_tx<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.lw_begin()?;
        let r = f(self);
        // Mutations already applied to memory are submitted even on an
        // error path, keeping memory and WAL consistent.
        let end = self.lw_end();
        let v = r?;
        end?;
        Ok(v)
    }

    /// Feed deferred cache notifications into the heap: a loaded
    /// evictable zone refreshes its observed usage.
    fn dispatch_events(&mut self) -> Result<()> {
        let events = self.cache.take_events();
        if !self.booted || self.utx.is_none() {
            return Ok(());
        }
        for ev in events {
            if let CacheEvent::PageLoad(zid) = ev {
                if self.heap.ismb_localrt(zid) && self.heap.ismb_evictable(zid) {
                    let zh: ZoneHeader = self.cache.read_pod(zone_offset(zid));
                    let utx = cur_wal!(self);
                    self.heap
                        .setmb_usage(&mut self.cache, utx, zid, zh.sp_usage)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Atomic operations
    // ========================================================================

    fn check_no_tx(&self) -> Result<()> {
        if self.tx.stage != TxStage::None {
            return Err(HeapError::TxStage(
                "atomic operation inside a transaction".into(),
            ));
        }
        Ok(())
    }

    /// Allocate and publish a new object; the constructor (and `FLAG_ZERO`)
    /// runs before the object becomes reachable and its effect is logged.
    pub fn alloc(
        &mut self,
        size: u64,
        type_num: u64,
        flags: u64,
        constructor: Option<&mut dyn FnMut(&mut [u8])>,
    ) -> Result<BlobOff> {
        self.check_no_tx()?;
        if flags & !VALID_ALLOC_FLAGS != 0 {
            return Err(HeapError::InvalidArgument(format!(
                "unknown flags {:#x}",
                flags & !VALID_ALLOC_FLAGS
            )));
        }
        self.lw_tx(|p| {
            p.pin_ezone(flags)?;
            {
                let utx = cur_wal!(p);
                p.heap.soemb_reserve(&mut p.cache, utx)?;
            }
            let act = {
                let utx = cur_wal!(p);
                palloc::reserve(
                    &mut p.heap,
                    &mut p.cache,
                    utx,
                    size,
                    constructor,
                    type_num,
                    flags,
                    true,
                )?
            };
            p.external.start();
            let utx = cur_wal!(p);
            palloc::publish(&mut p.heap, &mut p.cache, utx, &mut p.external, &[act])?;
            Ok(act.offset)
        })
    }

    /// Free the object at `off`.
    pub fn free(&mut self, off: BlobOff) -> Result<()> {
        self.check_no_tx()?;
        self.lw_tx(|p| {
            let act = palloc::defer_free(&p.heap, &p.cache, off)?;
            p.external.start();
            let utx = cur_wal!(p);
            palloc::publish(&mut p.heap, &mut p.cache, utx, &mut p.external, &[act])
        })
    }

    /// Durable memcpy into the heap.
    pub fn memcpy_persist(&mut self, off: BlobOff, data: &[u8]) -> Result<()> {
        self.check_range(off, data.len() as u64)?;
        self.lw_tx(|p| {
            p.cache.write_bytes(off, data);
            let utx = cur_wal!(p);
            utx.snap(&mut p.cache, off, data.len() as u64)
        })
    }

    // ========================================================================
    // Root object
    // ========================================================================

    /// Return the root object offset, growing (or creating) the root when
    /// `size` exceeds the current root size.
    pub fn root(&mut self, size: u64) -> Result<BlobOff> {
        if size > DAV_MAX_ALLOC_SIZE {
            return Err(HeapError::OutOfSpace("requested root size too large".into()));
        }
        let (off_ref, size_ref) = root_ref_off();
        let cur_off = self.cache.read_u64(off_ref);
        let cur_size = self.cache.read_u64(size_ref);
        if size == 0 && cur_off == 0 {
            return Err(HeapError::InvalidArgument(
                "root size cannot be zero on first use".into(),
            ));
        }
        if size <= cur_size {
            return Ok(cur_off);
        }

        let old_content = if cur_off != 0 {
            Some(self.cache.slice(cur_off, cur_size).to_vec())
        } else {
            None
        };

        self.lw_tx(|p| {
            let mut ctor = |buf: &mut [u8]| {
                if let Some(old) = &old_content {
                    buf[..old.len()].copy_from_slice(old);
                }
            };
            let alloc = {
                let utx = cur_wal!(p);
                palloc::reserve(
                    &mut p.heap,
                    &mut p.cache,
                    utx,
                    size,
                    Some(&mut ctor),
                    0,
                    FLAG_ZERO,
                    true,
                )?
            };

            let mut actions = vec![alloc];
            if cur_off != 0 {
                actions.push(palloc::defer_free(&p.heap, &p.cache, cur_off)?);
            }

            p.external.start();
            p.external.add_entry(off_ref, alloc.offset, OP_SET);
            p.external.add_entry(size_ref, alloc.usable_size, OP_SET);
            let utx = cur_wal!(p);
            palloc::publish(&mut p.heap, &mut p.cache, utx, &mut p.external, &actions)?;
            Ok(alloc.offset)
        })
    }

    // ========================================================================
    // Reservation interface
    // ========================================================================

    fn check_in_work(&self) -> Result<()> {
        if self.tx.stage != TxStage::Work {
            return Err(HeapError::TxStage(format!(
                "operation requires an open transaction, stage is {:?}",
                self.tx.stage
            )));
        }
        Ok(())
    }

    /// Reserve an object without publishing it; the action is handed to
    /// `tx_publish` or `cancel`.
    pub fn reserve(&mut self, size: u64, type_num: u64, flags: u64) -> Result<PallocAction> {
        self.check_in_work()?;
        self.pin_ezone(flags)?;
        let utx = cur_wal!(self);
        palloc::reserve(
            &mut self.heap,
            &mut self.cache,
            utx,
            size,
            None,
            type_num,
            flags,
            false,
        )
    }

    /// Build a deferred-free action.
    pub fn defer_free(&mut self, off: BlobOff) -> Result<PallocAction> {
        self.check_in_work()?;
        palloc::defer_free(&self.heap, &self.cache, off)
    }

    /// Undo reservations.
    pub fn cancel(&mut self, actions: &[PallocAction]) -> Result<()> {
        self.check_in_work()?;
        let utx = cur_wal!(self);
        palloc::cancel(&mut self.heap, &mut self.cache, utx, actions)
    }

    /// Queue reserved actions for publication at commit.
    pub fn tx_publish(&mut self, actions: &[PallocAction]) -> Result<()> {
        self.check_in_work()?;
        for act in actions {
            self.tx.actions.push(*act);
            if act.kind == palloc::ActionKind::Alloc {
                self.tx.ranges.insert(
                    act.offset,
                    crate::tx::RangeDef {
                        size: act.usable_size,
                        flags: 0,
                    },
                );
            }
        }
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn tx_begin(&mut self) -> Result<()> {
        self.tx_begin_with(FailureBehavior::Abort, None)
    }

    pub fn tx_begin_with(
        &mut self,
        behavior: FailureBehavior,
        callback: Option<TxCallback>,
    ) -> Result<()> {
        if callback.is_some() && self.tx.callback.is_some() {
            return Err(HeapError::InvalidArgument(
                "transaction callback is already set".into(),
            ));
        }
        match self.tx.stage {
            TxStage::Work => {
                // Nested transaction inherits the failure behavior.
                let inherited = *self.tx.levels.last().expect("open level");
                self.tx.levels.push(inherited);
            }
            TxStage::None => {
                let id = self.store.wal_reserve()?;
                self.utx = Some(WalTx::new(id));
                self.undo.start();
                self.tx.levels.push(behavior);
                self.tx.ranges.clear();
                self.tx.actions.clear();
                self.tx.last_errno = 0;
                {
                    let utx = cur_wal!(self);
                    self.heap.soemb_reserve(&mut self.cache, utx)?;
                }
                self.dispatch_events()?;
            }
            stage => {
                return Err(HeapError::TxStage(format!(
                    "cannot begin a transaction in stage {stage:?}"
                )))
            }
        }
        if let Some(cb) = callback {
            self.tx.callback = Some(cb);
        }
        self.tx.stage = TxStage::Work;
        Ok(())
    }

    pub fn tx_stage(&self) -> TxStage {
        self.tx.stage
    }

    pub fn tx_errno(&self) -> i32 {
        self.tx.last_errno
    }

    /// Abort handling shared by the explicit abort and failing operations.
    fn tx_abort_internal(&mut self, errnum: i32) {
        debug_assert_eq!(self.tx.stage, TxStage::Work);
        let errnum = if errnum == 0 { 125 } else { errnum }; // ECANCELED
        self.tx.stage = TxStage::OnAbort;

        if self.tx.is_outermost() {
            {
                let utx = cur_wal!(self);
                if let Err(e) = restore_undo(&self.undo, &mut self.cache, utx) {
                    tracing::error!("undo restore failed: {e}");
                }
            }
            self.undo.finish(true);
            self.tx.ranges.clear();
            let actions = std::mem::take(&mut self.tx.actions);
            let utx = cur_wal!(self);
            if let Err(e) = palloc::cancel(&mut self.heap, &mut self.cache, utx, &actions) {
                tracing::error!("reservation cancel failed: {e}");
            }
        }

        self.tx.last_errno = errnum;
        self.tx.fire_callback(TxStage::OnAbort);
    }

    fn tx_fail(&mut self, e: HeapError, flags: u64) -> HeapError {
        if flags & FLAG_TX_NO_ABORT == 0 {
            self.tx_abort_internal(e.errno());
        } else {
            self.tx.last_errno = e.errno();
        }
        e
    }

    pub fn tx_abort(&mut self, errnum: i32) -> Result<()> {
        self.check_in_work()?;
        self.tx_abort_internal(errnum);
        Ok(())
    }

    pub fn tx_commit(&mut self) -> Result<()> {
        self.check_in_work()?;
        self.tx.fire_callback(TxStage::Work);

        if self.tx.is_outermost() {
            self.dispatch_events()?;
            {
                let utx = cur_wal!(self);
                flush_ranges(&self.tx.ranges, &mut self.cache, utx)?;
            }
            self.tx.ranges.clear();

            self.external.start();
            let actions = std::mem::take(&mut self.tx.actions);
            {
                let utx = cur_wal!(self);
                palloc::publish(
                    &mut self.heap,
                    &mut self.cache,
                    utx,
                    &mut self.external,
                    &actions,
                )?;
            }
            self.undo.finish(true);
        }

        self.tx.stage = TxStage::OnCommit;
        self.tx.fire_callback(TxStage::OnCommit);
        Ok(())
    }

    /// End the current (innermost) transaction. Must not be called in
    /// stage WORK; always transitions towards NONE.
    pub fn tx_end(&mut self) -> Result<()> {
        match self.tx.stage {
            TxStage::Work => {
                return Err(HeapError::TxStage(
                    "tx_end called without commit or abort".into(),
                ))
            }
            TxStage::None => {
                return Err(HeapError::TxStage("tx_end without tx_begin".into()))
            }
            TxStage::OnCommit | TxStage::OnAbort => {
                if self.tx.callback.is_some() {
                    self.tx.stage = TxStage::Finally;
                    self.tx.fire_callback(TxStage::Finally);
                }
            }
            TxStage::Finally => {}
        }

        self.tx.levels.pop();
        let errnum = self.tx.last_errno;

        if self.tx.levels.is_empty() {
            self.tx.stage = TxStage::None;
            self.tx.ranges.clear();
            self.tx.actions.clear();
            self.submit_wal()?;

            // The cleanup callback runs exactly once at the NONE stage.
            self.tx.fire_callback(TxStage::None);
            self.tx.callback = None;

            if errnum != 0 {
                return Err(HeapError::TxAborted(format!("errno {errnum}")));
            }
        } else {
            // Resume the enclosing transaction; an inner abort waterfalls.
            self.tx.stage = TxStage::Work;
            if errnum != 0 {
                self.tx_abort_internal(errnum);
            }
        }
        Ok(())
    }

    /// Run `f` inside a transaction: commit on `Ok`, abort on `Err`.
    pub fn tx_run<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.tx_begin()?;
        let mut result = f(self);

        if result.is_ok() && self.tx.stage == TxStage::Work {
            if let Err(e) = self.tx_commit() {
                result = Err(e);
            }
        }
        if self.tx.stage == TxStage::Work {
            let errnum = result.as_ref().err().map(|e| e.errno()).unwrap_or(125);
            self.tx_abort_internal(errnum);
        }

        let end = self.tx_end();
        match result {
            Err(e) => Err(e),
            Ok(v) => {
                end?;
                Ok(v)
            }
        }
    }

    /// Transactionally allocate a new object.
    pub fn tx_alloc(&mut self, size: u64, type_num: u64, flags: u64) -> Result<BlobOff> {
        self.check_in_work()?;
        let flags = flags | self.tx.abort_on_failure_flag();
        if size == 0 {
            let e = HeapError::InvalidArgument("allocation with size 0".into());
            return Err(self.tx_fail(e, flags));
        }
        if flags & !VALID_ALLOC_FLAGS != 0 {
            let e = HeapError::InvalidArgument(format!(
                "unknown flags {:#x}",
                flags & !VALID_ALLOC_FLAGS
            ));
            return Err(self.tx_fail(e, flags));
        }

        if let Err(e) = self.pin_ezone(flags) {
            return Err(self.tx_fail(e, flags));
        }
        let reserved = {
            let utx = cur_wal!(self);
            palloc::reserve(
                &mut self.heap,
                &mut self.cache,
                utx,
                size,
                None,
                type_num,
                flags,
                false,
            )
        };
        match reserved {
            Ok(act) => {
                self.tx.actions.push(act);
                self.tx.ranges.insert(
                    act.offset,
                    crate::tx::RangeDef {
                        size: act.usable_size,
                        flags,
                    },
                );
                Ok(act.offset)
            }
            Err(e) => Err(self.tx_fail(e, flags)),
        }
    }

    /// Transactionally free an object. Freeing an object allocated within
    /// the same transaction just cancels the reservation.
    pub fn tx_free(&mut self, off: BlobOff) -> Result<()> {
        self.check_in_work()?;
        let flags = self.tx.abort_on_failure_flag();
        if off == 0 {
            return Ok(());
        }
        if let Err(e) = self.check_range(off, 1) {
            return Err(self.tx_fail(e, flags));
        }

        if self.tx.ranges.contains_key(&off) {
            if let Some(pos) = self
                .tx
                .actions
                .iter()
                .position(|a| a.kind == palloc::ActionKind::Alloc && a.offset == off)
            {
                let act = self.tx.actions.remove(pos);
                self.tx.ranges.remove(&off);
                let utx = cur_wal!(self);
                palloc::cancel(&mut self.heap, &mut self.cache, utx, &[act])?;
                return Ok(());
            }
        }

        match palloc::defer_free(&self.heap, &self.cache, off) {
            Ok(act) => {
                self.tx.actions.push(act);
                Ok(())
            }
            Err(e) => Err(self.tx_fail(e, flags)),
        }
    }

    pub fn tx_add_range(&mut self, off: BlobOff, size: u64) -> Result<()> {
        let flags = self.tx.abort_on_failure_flag();
        self.tx_xadd_range(off, size, flags)
    }

    pub fn tx_xadd_range(&mut self, off: BlobOff, size: u64, flags: u64) -> Result<()> {
        self.check_in_work()?;
        let flags = flags | self.tx.abort_on_failure_flag();
        if flags & !VALID_XADD_FLAGS != 0 {
            let e = HeapError::InvalidArgument(format!(
                "unknown flags {:#x}",
                flags & !VALID_XADD_FLAGS
            ));
            return Err(self.tx_fail(e, flags));
        }
        if size > DAV_MAX_ALLOC_SIZE {
            let e = HeapError::InvalidArgument("snapshot size too large".into());
            return Err(self.tx_fail(e, flags));
        }
        if let Err(e) = self.check_range(off, size) {
            return Err(self.tx_fail(e, flags));
        }

        let rc = add_range_common(
            &mut self.tx.ranges,
            &mut self.undo,
            &self.cache,
            off,
            size,
            flags,
        );
        match rc {
            Ok(()) => Ok(()),
            Err(e) => Err(self.tx_fail(e, flags)),
        }
    }

    // ========================================================================
    // Data access
    // ========================================================================

    fn check_range(&self, off: BlobOff, size: u64) -> Result<()> {
        if off < HEAP_HDR_SIZE || off + size > self.heap.heap_size {
            return Err(HeapError::InvalidArgument(format!(
                "range [{off}, +{size}) outside of heap"
            )));
        }
        Ok(())
    }

    pub fn read(&self, off: BlobOff, out: &mut [u8]) -> Result<()> {
        self.check_range(off, out.len() as u64)?;
        self.cache.read_into(off, out);
        Ok(())
    }

    /// Read, bringing the owning zone back into the cache if it was
    /// evicted.
    pub fn read_faulting(&mut self, off: BlobOff, out: &mut [u8]) -> Result<()> {
        self.check_range(off, out.len() as u64)?;
        if !self.cache.off_is_loaded(off) {
            let zid = crate::common::zone_id_of(off);
            self.heap.zone_load(&mut self.cache, zid)?;
        }
        self.cache.read_into(off, out);
        Ok(())
    }

    pub fn with_slice<R>(&self, off: BlobOff, len: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.check_range(off, len)?;
        Ok(f(self.cache.slice(off, len)))
    }

    /// Mutable access to heap bytes. The write is transient until the
    /// covering range is flushed at commit (or logged explicitly).
    pub fn with_slice_mut<R>(
        &mut self,
        off: BlobOff,
        len: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.check_range(off, len)?;
        Ok(f(self.cache.slice_mut(off, len)))
    }

    /// Pin the zones covering `ranges` into the cache.
    pub fn pin(&mut self, ranges: &[(BlobOff, u64)]) -> Result<PinHandle> {
        let regions: Vec<StoreRegion> = ranges
            .iter()
            .map(|&(addr, size)| StoreRegion { addr, size })
            .collect();
        self.cache.pin_ranges(&regions, false)
    }

    pub fn unpin(&mut self, handle: PinHandle) {
        self.cache.unpin(handle)
    }

    // ========================================================================
    // Maintenance and statistics
    // ========================================================================

    /// Checkpoint dirty cache pages into the blob.
    pub fn checkpoint(&mut self) -> Result<(TxId, ChkptStats)> {
        self.check_no_tx()?;
        let store = Rc::clone(&self.store);
        let mut cb = move |_wait: TxId| store.wal_committed();
        let mut stats = ChkptStats::default();
        let id = self.cache.checkpoint(&mut cb, Some(&mut stats))?;
        tracing::debug!(
            id,
            pages = stats.nr_pages,
            dchunks = stats.nr_dchunks,
            "checkpoint complete"
        );
        Ok((id, stats))
    }

    /// Register an allocation class.
    pub fn class_register(&mut self, desc: &AllocClassDesc) -> Result<(u8, u32)> {
        let (id, nallocs) = self.heap.alloc_classes.register(
            desc.class_id,
            desc.unit_size,
            desc.alignment,
            desc.units_per_block,
            desc.header_type,
        )?;
        self.heap.create_class_buckets(id);
        Ok((id, nallocs))
    }

    pub fn heap_stats(&self) -> HeapStats {
        HeapStats {
            curr_allocated: self
                .cache
                .read_u64(sp_usage_glob_off())
                .saturating_sub(self.internal_allocated),
            run_allocated: self.heap.tstats.run_allocated,
            run_active: self.heap.tstats.run_active,
        }
    }

    /// Usage statistics for a memory bucket; approximate for evictable
    /// buckets that are not resident.
    pub fn mb_stats(&self, mb_id: u32) -> Result<MbStats> {
        let (allocated, maxsz) = self.heap.getmb_usage(mb_id)?;
        Ok(MbStats { allocated, maxsz })
    }

    /// Allot an evictable memory bucket for new-object placement.
    /// Returns 0 when only non-evictable space is available.
    pub fn allot_mb_evictable(&mut self) -> Result<u32> {
        self.check_no_tx()?;
        self.lw_tx(|p| {
            let utx = cur_wal!(p);
            p.heap.get_evictable_mb(&mut p.cache, utx)
        })
    }

    /// Force garbage collection of free blocks and empty non-evictable
    /// memory buckets.
    pub fn force_gc(&mut self) -> Result<()> {
        self.check_no_tx()?;
        self.lw_tx(|p| {
            let utx = cur_wal!(p);
            p.heap.force_recycle(&mut p.cache, utx)
        })
    }

    /// Cooperative backpressure: evict until the free-page reserve for
    /// non-evictable growth is satisfied.
    pub fn cache_reserve(&mut self) -> Result<()> {
        self.cache.reserve()
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.cache_stats()
    }

    pub fn cache_free_pages(&self) -> u32 {
        self.cache.free_pages()
    }

    pub fn cache_nonevictable_pages(&self) -> u32 {
        self.cache.nonevictable_pages()
    }

    /// Whether the page owning `off` is resident in the cache.
    pub fn is_resident(&self, off: BlobOff) -> bool {
        self.cache.off_is_loaded(off)
    }

    /// Trace per-bucket usage, for fragmentation diagnostics.
    pub fn log_fraginfo(&self) {
        let stats = self.heap_stats();
        tracing::debug!(
            curr_allocated = stats.curr_allocated,
            run_allocated = stats.run_allocated,
            run_active = stats.run_active,
            "heap usage"
        );
        for zid in 0..self.heap.nzones() {
            if let Ok((allocated, maxsz)) = self.heap.getmb_usage(zid) {
                if allocated != 0 {
                    tracing::debug!(zid, allocated, maxsz, "memory bucket usage");
                }
            }
        }
    }
}
