// # Backing Store Interface
//
// The heap core never touches durable media directly. Everything below the
// page cache goes through the `MetaStore` trait: synchronous reads of the
// meta blob, WAL reservation/submission/replay, and the three-phase
// checkpoint write. The engine that embeds a pool supplies the
// implementation; `MemStore` in this module is the reference implementation
// used by the test suites.
//
// All trait methods take `&self`; implementations use interior mutability.
// The pool itself is single-threaded, so a store only needs to serialize
// against its own background machinery (if any).

mod memstore;

pub use memstore::MemStore;

use crate::common::{BlobOff, TxId};
use crate::error::Result;
use crate::wal::WalAction;
use std::cmp::Ordering;

/// A contiguous region of the meta blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRegion {
    pub addr: BlobOff,
    pub size: u64,
}

/// I/O descriptor for a checkpoint set: the blob regions one flush covers.
#[derive(Debug, Clone, Default)]
pub struct StoreIod {
    pub regions: Vec<StoreRegion>,
}

/// Token for an in-flight three-phase flush.
pub type FlushHandle = u64;

/// Backing store operations required by the core.
pub trait MetaStore {
    /// Total size of the meta blob in bytes.
    fn size(&self) -> u64;

    /// Synchronous read of `dst.len()` bytes at `off` into a cache buffer.
    fn load(&self, dst: &mut [u8], off: BlobOff) -> Result<()>;

    /// Direct write to the blob, bypassing WAL and cache. Only used while
    /// formatting a new pool (header, zone-header scrub).
    fn update(&self, src: &[u8], off: BlobOff) -> Result<()>;

    /// Allocate the next monotonically increasing transaction id.
    fn wal_reserve(&self) -> Result<TxId>;

    /// Durably append the actions of one transaction, in order. On return
    /// the transaction is committed.
    fn wal_submit(&self, tx_id: TxId, actions: &[WalAction], payload_len: u64) -> Result<()>;

    /// Invoke `cb` in commit order for every transaction that has not been
    /// checkpointed away yet.
    fn wal_replay(&self, cb: &mut dyn FnMut(TxId, &WalAction) -> Result<()>) -> Result<()>;

    /// Highest transaction id known durable.
    fn wal_committed(&self) -> TxId;

    /// Total order on transaction ids.
    fn wal_id_cmp(&self, a: TxId, b: TxId) -> Ordering {
        a.cmp(&b)
    }

    /// Hint that every transaction up to `id` has been checkpointed into
    /// the blob; the store may reclaim WAL space. Default: ignore.
    fn wal_checkpointed(&self, _id: TxId) {}

    /// Phase 1 of a checkpoint write: reserve transfer buffers for `iod`.
    fn flush_prep(&self, iod: &StoreIod) -> Result<FlushHandle>;

    /// Phase 2: copy the memory ranges (one per region of the prepared
    /// iod, in order) into the transfer buffers.
    fn flush_copy(&self, fh: FlushHandle, iovs: &[&[u8]]) -> Result<()>;

    /// Phase 3: wait for the device write. `rc` carries an error from the
    /// caller's commit-wait; the store must release resources either way.
    fn flush_post(&self, fh: FlushHandle, rc: Result<()>) -> Result<()>;
}

/// Cooperative FIFO wait queue.
///
/// The pool is single-threaded, so a waiter can only exist while another
/// logical operation is mid-flight across a store suspension point. The
/// counter keeps the FIFO bookkeeping honest; an embedder with a real
/// scheduler replaces the wait/wake bodies with queue operations.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: u32,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn waiters(&self) -> u32 {
        self.waiters
    }

    #[inline]
    pub fn enter(&mut self) -> u32 {
        self.waiters += 1;
        self.waiters
    }

    #[inline]
    pub fn leave(&mut self) {
        debug_assert!(self.waiters > 0);
        self.waiters -= 1;
    }

    /// Yield until woken. With a single task this must never be reached
    /// with another waiter ahead of us.
    pub fn wait(&self) {
        debug_assert!(self.waiters <= 1, "cooperative wait with no scheduler");
    }

    pub fn wake(&self, _all: bool) {}
}
