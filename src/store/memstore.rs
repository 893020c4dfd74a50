// # Reference In-Memory Store
//
// `MemStore` backs a pool with a plain byte vector and keeps the WAL as a
// list of framed records. Frames are bincode-encoded and guarded by a
// CRC32C so the replay path exercises the same decode/verify shape a real
// log device would. Flushes are synchronous: `flush_prep` validates the
// descriptor, `flush_copy` moves bytes into the blob, `flush_post` retires
// the handle.
//
// Test hooks: `set_flush_hook` runs a callback inside `flush_copy`, which
// is how the checkpoint-interleaving scenarios observe the copying window.

use super::{FlushHandle, MetaStore, StoreIod, StoreRegion};
use crate::common::{BlobOff, TxId};
use crate::error::{HeapError, Result};
use crate::wal::WalAction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize)]
struct WalFrame {
    tx_id: TxId,
    actions: Vec<WalAction>,
}

struct PendingFlush {
    regions: Vec<StoreRegion>,
}

struct Inner {
    blob: Vec<u8>,
    /// Encoded frames not yet dropped by a checkpoint, in commit order.
    wal: Vec<(TxId, Vec<u8>)>,
    next_tx: TxId,
    committed: TxId,
    flushes: HashMap<FlushHandle, PendingFlush>,
    next_fh: FlushHandle,
    flush_hook: Option<Box<dyn FnMut() + Send>>,
    submits: u64,
}

/// In-memory meta blob plus WAL, for tests and examples.
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new(size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                blob: vec![0u8; size as usize],
                wal: Vec::new(),
                next_tx: 1,
                committed: 0,
                flushes: HashMap::new(),
                next_fh: 1,
                flush_hook: None,
                submits: 0,
            }),
        }
    }

    /// Install a callback invoked from inside `flush_copy`.
    pub fn set_flush_hook(&self, hook: Option<Box<dyn FnMut() + Send>>) {
        self.inner.lock().flush_hook = hook;
    }

    /// Number of WAL submissions so far.
    pub fn submit_count(&self) -> u64 {
        self.inner.lock().submits
    }

    /// Frames currently retained in the WAL.
    pub fn wal_len(&self) -> usize {
        self.inner.lock().wal.len()
    }

    /// Raw snapshot of the blob contents (tests compare post-checkpoint
    /// state against expectations).
    pub fn blob_snapshot(&self) -> Vec<u8> {
        self.inner.lock().blob.clone()
    }

    /// Corrupt a single byte of the blob (crash/corruption scenarios).
    pub fn corrupt_byte(&self, off: BlobOff, xor: u8) {
        let mut inner = self.inner.lock();
        let off = off as usize;
        inner.blob[off] ^= xor;
    }

    fn encode_frame(frame: &WalFrame) -> Result<Vec<u8>> {
        let body = bincode::serde::encode_to_vec(frame, bincode::config::standard())
            .map_err(|e| HeapError::Serialization(e.to_string()))?;
        let crc = crc32fast::hash(&body);
        let mut out = Vec::with_capacity(body.len() + 4);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode_frame(bytes: &[u8]) -> Result<WalFrame> {
        if bytes.len() < 4 {
            return Err(HeapError::WalReplay("short WAL frame".into()));
        }
        let stored = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let body = &bytes[4..];
        if crc32fast::hash(body) != stored {
            return Err(HeapError::WalReplay("WAL frame checksum mismatch".into()));
        }
        let (frame, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map_err(|e| HeapError::WalReplay(e.to_string()))?;
        Ok(frame)
    }
}

impl MetaStore for MemStore {
    fn size(&self) -> u64 {
        self.inner.lock().blob.len() as u64
    }

    fn load(&self, dst: &mut [u8], off: BlobOff) -> Result<()> {
        let inner = self.inner.lock();
        let off = off as usize;
        let end = off + dst.len();
        if end > inner.blob.len() {
            return Err(HeapError::InvalidArgument(format!(
                "load beyond blob end: {end} > {}",
                inner.blob.len()
            )));
        }
        dst.copy_from_slice(&inner.blob[off..end]);
        Ok(())
    }

    fn update(&self, src: &[u8], off: BlobOff) -> Result<()> {
        let mut inner = self.inner.lock();
        let off = off as usize;
        let end = off + src.len();
        if end > inner.blob.len() {
            return Err(HeapError::InvalidArgument(format!(
                "update beyond blob end: {end} > {}",
                inner.blob.len()
            )));
        }
        inner.blob[off..end].copy_from_slice(src);
        Ok(())
    }

    fn wal_reserve(&self) -> Result<TxId> {
        let mut inner = self.inner.lock();
        let id = inner.next_tx;
        inner.next_tx += 1;
        Ok(id)
    }

    fn wal_submit(&self, tx_id: TxId, actions: &[WalAction], _payload_len: u64) -> Result<()> {
        let frame = WalFrame {
            tx_id,
            actions: actions.to_vec(),
        };
        let encoded = Self::encode_frame(&frame)?;

        let mut inner = self.inner.lock();
        if let Some((last, _)) = inner.wal.last() {
            debug_assert!(*last < tx_id, "out-of-order WAL submit");
        }
        inner.wal.push((tx_id, encoded));
        if tx_id > inner.committed {
            inner.committed = tx_id;
        }
        inner.submits += 1;
        Ok(())
    }

    fn wal_replay(&self, cb: &mut dyn FnMut(TxId, &WalAction) -> Result<()>) -> Result<()> {
        // Decode up-front so the callback can re-enter the store for loads.
        let frames: Vec<Vec<u8>> = {
            let inner = self.inner.lock();
            inner.wal.iter().map(|(_, bytes)| bytes.clone()).collect()
        };
        for bytes in &frames {
            let frame = Self::decode_frame(bytes)?;
            for act in &frame.actions {
                cb(frame.tx_id, act)?;
            }
        }
        Ok(())
    }

    fn wal_committed(&self) -> TxId {
        self.inner.lock().committed
    }

    fn wal_checkpointed(&self, id: TxId) {
        let mut inner = self.inner.lock();
        inner.wal.retain(|(tx, _)| *tx > id);
    }

    fn flush_prep(&self, iod: &StoreIod) -> Result<FlushHandle> {
        let mut inner = self.inner.lock();
        let blob_len = inner.blob.len() as u64;
        for r in &iod.regions {
            if r.addr + r.size > blob_len {
                return Err(HeapError::InvalidArgument(format!(
                    "flush region beyond blob end: {}+{}",
                    r.addr, r.size
                )));
            }
        }
        let fh = inner.next_fh;
        inner.next_fh += 1;
        inner.flushes.insert(
            fh,
            PendingFlush {
                regions: iod.regions.clone(),
            },
        );
        Ok(fh)
    }

    fn flush_copy(&self, fh: FlushHandle, iovs: &[&[u8]]) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(mut hook) = inner.flush_hook.take() {
            drop(inner);
            hook();
            inner = self.inner.lock();
            inner.flush_hook = Some(hook);
        }

        let regions = inner
            .flushes
            .get(&fh)
            .ok_or_else(|| HeapError::FlushFailed(format!("unknown flush handle {fh}")))?
            .regions
            .clone();
        if regions.len() != iovs.len() {
            return Err(HeapError::FlushFailed(format!(
                "iov count {} does not match prepared regions {}",
                iovs.len(),
                regions.len()
            )));
        }
        for (r, iov) in regions.iter().zip(iovs.iter()) {
            if r.size as usize != iov.len() {
                return Err(HeapError::FlushFailed("iov length mismatch".into()));
            }
            let off = r.addr as usize;
            inner.blob[off..off + iov.len()].copy_from_slice(iov);
        }
        Ok(())
    }

    fn flush_post(&self, fh: FlushHandle, rc: Result<()>) -> Result<()> {
        self.inner.lock().flushes.remove(&fh);
        rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_load_update_roundtrip() {
        let store = MemStore::new(8192);
        store.update(b"hello", 100).unwrap();
        let mut buf = [0u8; 5];
        store.load(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_wal_ids_monotonic() {
        let store = MemStore::new(4096);
        let a = store.wal_reserve().unwrap();
        let b = store.wal_reserve().unwrap();
        assert!(b > a);
        assert_eq!(store.wal_committed(), 0);
    }

    #[test]
    fn test_submit_replay_truncate() {
        let store = MemStore::new(4096);
        let id = store.wal_reserve().unwrap();
        let acts = vec![WalAction::Assign {
            addr: 64,
            size: 8,
            val: 42,
        }];
        store.wal_submit(id, &acts, 0).unwrap();
        assert_eq!(store.wal_committed(), id);

        let mut seen = Vec::new();
        store
            .wal_replay(&mut |tx, act| {
                seen.push((tx, act.target()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(id, (64, 8))]);

        store.wal_checkpointed(id);
        assert_eq!(store.wal_len(), 0);
    }

    #[test]
    fn test_flush_writes_blob() {
        let store = MemStore::new(4096);
        let iod = StoreIod {
            regions: vec![StoreRegion {
                addr: 128,
                size: 4,
            }],
        };
        let fh = store.flush_prep(&iod).unwrap();
        store.flush_copy(fh, &[b"abcd"]).unwrap();
        store.flush_post(fh, Ok(())).unwrap();
        let mut buf = [0u8; 4];
        store.load(&mut buf, 128).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_frame_crc_detects_corruption() {
        let frame = WalFrame {
            tx_id: 3,
            actions: vec![WalAction::Copy {
                addr: 0,
                data: Bytes::from_static(b"xyzw"),
            }],
        };
        let mut enc = MemStore::encode_frame(&frame).unwrap();
        assert!(MemStore::decode_frame(&enc).is_ok());
        enc[7] ^= 0xff;
        assert!(MemStore::decode_frame(&enc).is_err());
    }
}
