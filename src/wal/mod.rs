// # WAL Transactions
//
// Every mutation of the meta blob is expressed as a redo action and queued
// on the transaction that performed it. `dav_tx_commit`-style submission
// hands the whole batch to the backing store, which owns durability. On
// open, `replay` re-applies every not-yet-checkpointed transaction to the
// page cache, pinning target zones on demand.
//
// Actions address the blob by offset and are strictly idempotent, so a
// replay that overlaps already-checkpointed state is harmless.

use crate::cache::{PageCache, PinHandle};
use crate::common::{zone_id_of, zone_offset, BlobOff, TxId, ZONE_MAX_SIZE};
use crate::error::{HeapError, Result};
use crate::store::{MetaStore, StoreRegion};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// Hard cap on the inline payload of a single copy action.
pub const ACT_PAYLOAD_MAX_LEN: u64 = 1 << 20;

/// A single redo action. The set mirrors the operations the heap and the
/// transaction layer need to express atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalAction {
    /// Copy `data` to `addr`. Payload travels inline with the record.
    Copy { addr: BlobOff, data: Bytes },
    /// Copy by reference: the store reads the payload from the shared
    /// buffer at submit time instead of an inline copy.
    CopyPtr { addr: BlobOff, data: Bytes },
    /// Store a 1/2/4/8-byte little-endian value at `addr`.
    Assign { addr: BlobOff, size: u8, val: u64 },
    /// memset `size` bytes at `addr` with `val`.
    Set { addr: BlobOff, size: u32, val: u8 },
    /// Set `num` bits starting at bit `pos` of the u64 at `addr`.
    SetBits { addr: BlobOff, pos: u32, num: u16 },
    /// Clear `num` bits starting at bit `pos` of the u64 at `addr`.
    ClrBits { addr: BlobOff, pos: u32, num: u16 },
}

impl WalAction {
    /// Blob range written by this action.
    pub fn target(&self) -> (BlobOff, u64) {
        match self {
            WalAction::Copy { addr, data } => (*addr, data.len() as u64),
            WalAction::CopyPtr { addr, data } => (*addr, data.len() as u64),
            WalAction::Assign { addr, size, .. } => (*addr, *size as u64),
            WalAction::Set { addr, size, .. } => (*addr, *size as u64),
            WalAction::SetBits { addr, .. } | WalAction::ClrBits { addr, .. } => (*addr, 8),
        }
    }

    /// Bytes of payload this action contributes to the WAL record.
    pub fn payload_len(&self) -> u64 {
        match self {
            WalAction::Copy { data, .. } | WalAction::CopyPtr { data, .. } => data.len() as u64,
            _ => 0,
        }
    }
}

/// Redo list of one in-flight transaction.
#[derive(Debug)]
pub struct WalTx {
    id: TxId,
    actions: Vec<WalAction>,
    payload_len: u64,
}

impl WalTx {
    pub fn new(id: TxId) -> Self {
        Self {
            id,
            actions: Vec::new(),
            payload_len: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> TxId {
        self.id
    }

    #[inline]
    pub fn act_count(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    #[inline]
    pub fn actions(&self) -> &[WalAction] {
        &self.actions
    }

    fn push(&mut self, act: WalAction) {
        self.payload_len += act.payload_len();
        self.actions.push(act);
    }

    /// Record the current contents of `[off, off + size)` as a copy
    /// action. Oversized ranges are split at the payload cap.
    pub fn snap(&mut self, cache: &mut PageCache, off: BlobOff, size: u64) -> Result<()> {
        if size == 0 {
            return Err(HeapError::InvalidArgument("zero-sized snap".into()));
        }

        let mut off = off;
        let mut left = size;
        while left > 0 {
            let n = left.min(ACT_PAYLOAD_MAX_LEN);
            cache.touch(self.id, off, n)?;
            let data = Bytes::copy_from_slice(cache.slice(off, n));
            self.push(WalAction::Copy { addr: off, data });
            off += n;
            left -= n;
        }
        Ok(())
    }

    /// Record caller-provided bytes for `[off, off + len)`. With `cptr`
    /// the payload is shared rather than copied into the record.
    pub fn snap_src(
        &mut self,
        cache: &mut PageCache,
        off: BlobOff,
        src: &Bytes,
        cptr: bool,
    ) -> Result<()> {
        let size = src.len() as u64;
        if size == 0 || size > ACT_PAYLOAD_MAX_LEN {
            return Err(HeapError::InvalidArgument(format!(
                "copy payload length {size} out of range"
            )));
        }
        cache.touch(self.id, off, size)?;
        let act = if cptr {
            WalAction::CopyPtr {
                addr: off,
                data: src.clone(),
            }
        } else {
            WalAction::Copy {
                addr: off,
                data: Bytes::copy_from_slice(src),
            }
        };
        self.push(act);
        Ok(())
    }

    /// Record an 8-byte assignment.
    pub fn assign(&mut self, cache: &mut PageCache, off: BlobOff, val: u64) -> Result<()> {
        cache.touch(self.id, off, 8)?;
        self.push(WalAction::Assign {
            addr: off,
            size: 8,
            val,
        });
        Ok(())
    }

    /// Record a memset.
    pub fn set(&mut self, cache: &mut PageCache, off: BlobOff, size: u64, val: u8) -> Result<()> {
        if size == 0 || size > ACT_PAYLOAD_MAX_LEN {
            return Err(HeapError::InvalidArgument(format!(
                "set length {size} out of range"
            )));
        }
        cache.touch(self.id, off, size)?;
        self.push(WalAction::Set {
            addr: off,
            size: size as u32,
            val,
        });
        Ok(())
    }

    /// Record a bit-set inside the u64 at `off`.
    pub fn set_bits(
        &mut self,
        cache: &mut PageCache,
        off: BlobOff,
        pos: u32,
        num: u16,
    ) -> Result<()> {
        debug_assert!(pos < 64 && num >= 1 && pos + num as u32 <= 64);
        cache.touch(self.id, off, 8)?;
        self.push(WalAction::SetBits {
            addr: off,
            pos,
            num,
        });
        Ok(())
    }

    /// Record a bit-clear inside the u64 at `off`.
    pub fn clr_bits(
        &mut self,
        cache: &mut PageCache,
        off: BlobOff,
        pos: u32,
        num: u16,
    ) -> Result<()> {
        debug_assert!(pos < 64 && num >= 1 && pos + num as u32 <= 64);
        cache.touch(self.id, off, 8)?;
        self.push(WalAction::ClrBits {
            addr: off,
            pos,
            num,
        });
        Ok(())
    }
}

/// Mask for a bit-op action.
#[inline]
pub fn bit_mask(pos: u32, num: u16) -> u64 {
    if num as u32 >= 64 {
        u64::MAX
    } else {
        ((1u64 << num) - 1) << pos
    }
}

/// Apply one action directly to cache memory. Shared by replay and by the
/// commit path (memory is updated before the WAL record is submitted).
pub fn apply_action(cache: &mut PageCache, act: &WalAction) -> Result<()> {
    match act {
        WalAction::Copy { addr, data } | WalAction::CopyPtr { addr, data } => {
            cache.write_bytes(*addr, data);
        }
        WalAction::Assign { addr, size, val } => {
            let bytes = val.to_le_bytes();
            cache.write_bytes(*addr, &bytes[..*size as usize]);
        }
        WalAction::Set { addr, size, val } => {
            cache.fill_bytes(*addr, *size as u64, *val);
        }
        WalAction::SetBits { addr, pos, num } => {
            let v = cache.read_u64(*addr) | bit_mask(*pos, *num);
            cache.write_bytes(*addr, &v.to_le_bytes());
        }
        WalAction::ClrBits { addr, pos, num } => {
            let v = cache.read_u64(*addr) & !bit_mask(*pos, *num);
            cache.write_bytes(*addr, &v.to_le_bytes());
        }
    }
    Ok(())
}

/// Replay driver state: pin handles held for the transaction currently
/// being applied, released at every tx-id boundary.
struct ReplayPins {
    last_txid: TxId,
    pins: Vec<PinHandle>,
}

impl ReplayPins {
    fn tx_boundary(&mut self, cache: &mut PageCache, tx_id: TxId) {
        if tx_id == self.last_txid {
            return;
        }
        if self.last_txid != 0 {
            cache.commit(self.last_txid);
        }
        for pin in self.pins.drain(..) {
            cache.unpin(pin);
        }
        self.last_txid = tx_id;
    }
}

/// Ensure the zone owning `off` is resident and pinned for replay.
fn replay_pin_target(
    cache: &mut PageCache,
    pins: &mut ReplayPins,
    heap_size: u64,
    off: BlobOff,
) -> Result<()> {
    if cache.off_is_pinned(off) {
        return Ok(());
    }
    let zid = zone_id_of(off);
    let zoff = zone_offset(zid);
    let size = ZONE_MAX_SIZE.min(heap_size - zoff);
    let pin = cache.pin_ranges(&[StoreRegion { addr: zoff, size }], false)?;
    pins.pins.push(pin);
    Ok(())
}

/// Replay every pending WAL transaction into the cache.
///
/// Pages are pinned per target zone, dirtied through `touch` so the dirty
/// bitmaps match what the crashed process would have had, and committed at
/// every transaction boundary.
pub fn replay(store: &Rc<dyn MetaStore>, cache: &mut PageCache, heap_size: u64) -> Result<()> {
    let mut pins = ReplayPins {
        last_txid: 0,
        pins: Vec::new(),
    };
    let mut applied: u64 = 0;

    let mut cb = |tx_id: TxId, act: &WalAction| -> Result<()> {
        pins.tx_boundary(cache, tx_id);
        let (off, size) = act.target();
        replay_pin_target(cache, &mut pins, heap_size, off)?;
        apply_action(cache, act)?;
        cache.touch(tx_id, off, size)?;
        applied += 1;
        Ok(())
    };

    store.wal_replay(&mut cb)?;
    pins.tx_boundary(cache, TxId::MAX);
    tracing::debug!(actions = applied, "WAL replay complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_mask() {
        assert_eq!(bit_mask(0, 1), 0x1);
        assert_eq!(bit_mask(3, 2), 0b11000);
        assert_eq!(bit_mask(0, 64), u64::MAX);
        assert_eq!(bit_mask(63, 1), 1u64 << 63);
    }

    #[test]
    fn test_action_target() {
        let a = WalAction::Assign {
            addr: 100,
            size: 8,
            val: 7,
        };
        assert_eq!(a.target(), (100, 8));
        let s = WalAction::Set {
            addr: 64,
            size: 32,
            val: 0,
        };
        assert_eq!(s.target(), (64, 32));
        assert_eq!(s.payload_len(), 0);
        let c = WalAction::Copy {
            addr: 0,
            data: Bytes::from_static(b"abcd"),
        };
        assert_eq!(c.payload_len(), 4);
    }
}
