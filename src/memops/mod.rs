// # Memops — aggregated memory operations
//
// An operation context collects every modification a heap operation needs
// to make atomically. Redo contexts stage value entries in a DRAM shadow
// log (merging adjacent bit operations over a small search window) and, on
// process, convert them into WAL actions and apply them to cache memory.
// Undo contexts write checksummed pre-image buffer entries into the
// preallocated undo log, extending it on demand; the entries are replayed
// by a transaction abort and invalidated wholesale by a generation bump.

use crate::cache::PageCache;
use crate::common::{BlobOff, CACHELINE_SIZE};
use crate::error::{HeapError, Result};
use crate::ulog::{
    self, read_entry, write_buf_entry, write_val_entry, Ulog, UlogEntry, ENTRY_BUF_HDR,
    ENTRY_VAL_SIZE, OP_BUF_CPY, OP_SET,
};
use crate::wal::{bit_mask, WalTx};
use std::collections::VecDeque;

/// How many recent value entries to consider for merging.
const OP_MERGE_SEARCH: usize = 64;

/// Growth quantum of the DRAM shadow log.
const ULOG_BASE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Redo,
    Undo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    Idle,
    InProgress,
    Cleanup,
}

pub struct OperationContext {
    log_type: LogType,
    /// Chained pre-image log; only undo contexts carry one. Redo staging
    /// lives entirely in the DRAM shadow below, the WAL owns durability.
    ulog: Option<Ulog>,
    ext_capacity: usize,

    /// DRAM shadow of redo entries under construction.
    shadow: Vec<u8>,
    shadow_off: usize,
    /// Offsets of recent value entries, newest last.
    merge_window: VecDeque<usize>,

    /// Undo writer position across the ulog chain.
    curr_seg: usize,
    curr_off: usize,
    total_logged: usize,

    state: OpState,
}

impl OperationContext {
    pub fn new(log_type: LogType, base_capacity: usize, ext_capacity: usize) -> Self {
        let (ulog, shadow) = match log_type {
            LogType::Undo => (Some(Ulog::new(base_capacity, 0)), Vec::new()),
            LogType::Redo => (None, vec![0u8; base_capacity.max(CACHELINE_SIZE)]),
        };
        Self {
            log_type,
            ulog,
            ext_capacity,
            shadow,
            shadow_off: 0,
            merge_window: VecDeque::new(),
            curr_seg: 0,
            curr_off: 0,
            total_logged: 0,
            state: OpState::Idle,
        }
    }

    pub fn log_type(&self) -> LogType {
        self.log_type
    }

    pub fn undo_gen(&self) -> u64 {
        self.undo_log().gen_num
    }

    fn undo_log(&self) -> &Ulog {
        self.ulog.as_ref().expect("undo context carries the log")
    }

    fn undo_log_mut(&mut self) -> &mut Ulog {
        self.ulog.as_mut().expect("undo context carries the log")
    }

    /// Initialize runtime state and start a new operation.
    pub fn start(&mut self) {
        debug_assert_eq!(self.state, OpState::Idle);
        self.shadow_off = 0;
        ulog::clobber_entry(&mut self.shadow, 0);
        self.merge_window.clear();
        self.curr_seg = 0;
        self.curr_off = 0;
        self.total_logged = 0;
        self.state = OpState::InProgress;
    }

    pub fn cancel(&mut self) {
        debug_assert_eq!(self.state, OpState::InProgress);
        self.state = OpState::Idle;
    }

    #[inline]
    pub fn in_progress(&self) -> bool {
        self.state == OpState::InProgress
    }

    // ========================================================================
    // Redo entries
    // ========================================================================

    fn try_merge(&mut self, dest: BlobOff, value: u64, op: u64) -> bool {
        for &at in self.merge_window.iter().rev() {
            let raw = u64::from_le_bytes(self.shadow[at..at + 8].try_into().unwrap());
            if raw & ulog::OFFSET_MASK != dest {
                continue;
            }
            if raw & ulog::OP_MASK != op {
                return false;
            }
            let old = u64::from_le_bytes(self.shadow[at + 8..at + 16].try_into().unwrap());
            let merged = match op {
                OP_SET => value,
                _ if ulog::is_bit_op(op) => {
                    let (p1, n1) = (ulog::val_to_pos(old), ulog::val_to_bits(old) as u32);
                    let (p2, n2) = (ulog::val_to_pos(value), ulog::val_to_bits(value) as u32);
                    if p2 > p1 + n1 || p1 > p2 + n2 {
                        return false; // a gap, no merge
                    }
                    let pos = p1.min(p2);
                    let num = (p1 + n1).max(p2 + n2) - pos;
                    ulog::bits_to_val(pos, num as u16)
                }
                _ => unreachable!("merge of non-value op"),
            };
            self.shadow[at + 8..at + 16].copy_from_slice(&merged.to_le_bytes());
            return true;
        }
        false
    }

    /// Stage a value operation (`OP_SET`, `OP_SET_BITS`, `OP_CLR_BITS`)
    /// against the u64 at `dest`.
    pub fn add_entry(&mut self, dest: BlobOff, value: u64, op: u64) {
        debug_assert_eq!(self.log_type, LogType::Redo);
        debug_assert!(self.in_progress());

        // Keep a spare cacheline so entry creation can zero the next header.
        if self.shadow_off + CACHELINE_SIZE >= self.shadow.len() {
            self.shadow.resize(self.shadow.len() + ULOG_BASE_SIZE, 0);
        }

        if self.try_merge(dest, value, op) {
            return;
        }

        write_val_entry(&mut self.shadow, self.shadow_off, dest, value, op);
        if self.merge_window.len() == OP_MERGE_SEARCH {
            self.merge_window.pop_front();
        }
        self.merge_window.push_back(self.shadow_off);
        self.shadow_off += ENTRY_VAL_SIZE;
    }

    /// Number of staged redo entries.
    pub fn entry_count(&self) -> usize {
        self.shadow_off / ENTRY_VAL_SIZE
    }

    /// Make sure the staged log can take `n` more value entries. The DRAM
    /// shadow grows dynamically, so this can only fail for undo logs.
    pub fn reserve_entries(&mut self, n: usize) -> Result<()> {
        let need = self.shadow_off + n * ENTRY_VAL_SIZE + CACHELINE_SIZE;
        if need > self.shadow.len() {
            self.shadow.resize(need.next_multiple_of(ULOG_BASE_SIZE), 0);
        }
        Ok(())
    }

    // ========================================================================
    // Undo snapshots
    // ========================================================================

    /// Append a pre-image buffer entry for `[dest, dest + src.len())`,
    /// splitting across log segments as capacity demands.
    pub fn add_buffer(&mut self, dest: BlobOff, src: &[u8], op: u64) -> Result<()> {
        debug_assert_eq!(self.log_type, LogType::Undo);
        debug_assert!(self.in_progress());
        debug_assert_eq!(op, OP_BUF_CPY);

        let gen = self.undo_log().gen_num;
        let mut dest = dest;
        let mut src = src;

        while !src.is_empty() {
            let seg_capacity = {
                // Extend the chain when the writer ran off its end.
                while self.undo_log().chain_len() <= self.curr_seg {
                    let ext_capacity = self.ext_capacity;
                    let need = self.undo_log().capacity_total() + ext_capacity;
                    self.undo_log_mut().reserve(need, ext_capacity);
                }
                self.seg(self.curr_seg).capacity()
            };

            // Segments are consumed exactly: entries split so the tail of
            // a segment is never left as a gap the reader would stop at.
            let avail = seg_capacity - self.curr_off;
            if avail == 0 {
                self.curr_seg += 1;
                self.curr_off = 0;
                continue;
            }
            debug_assert!(avail >= ENTRY_BUF_HDR + 8 && avail % CACHELINE_SIZE == 0);

            let data_len = src.len().min(avail - ENTRY_BUF_HDR);
            let at = self.curr_off;
            let seg_idx = self.curr_seg;
            let seg = self.seg_mut(seg_idx);
            let esize = write_buf_entry(&mut seg.data, at, gen, dest, &src[..data_len], op);
            // Invalidate whatever stale bytes follow, so iteration
            // terminates right after this entry.
            if at + esize + 8 <= seg.capacity() {
                ulog::clobber_entry(&mut seg.data, at + esize);
            }
            self.curr_off += esize;
            self.total_logged += esize;

            dest += data_len as u64;
            src = &src[data_len..];
        }
        Ok(())
    }

    fn seg(&self, idx: usize) -> &Ulog {
        let mut cur = self.undo_log();
        for _ in 0..idx {
            cur = cur.next.as_deref().expect("undo segment exists");
        }
        cur
    }

    fn nth_mut(u: &mut Ulog, idx: usize) -> &mut Ulog {
        if idx == 0 {
            u
        } else {
            Self::nth_mut(u.next.as_deref_mut().expect("undo segment exists"), idx - 1)
        }
    }

    fn seg_mut(&mut self, idx: usize) -> &mut Ulog {
        Self::nth_mut(
            self.ulog.as_mut().expect("undo context carries the log"),
            idx,
        )
    }

    /// Walk the undo entries in log order.
    pub fn undo_foreach<F>(&self, cb: F)
    where
        F: FnMut(&UlogEntry<'_>) -> bool,
    {
        if let Some(ulog) = &self.ulog {
            ulog.foreach_entry(cb);
        }
    }

    pub fn total_logged(&self) -> usize {
        self.total_logged
    }

    // ========================================================================
    // Processing
    // ========================================================================

    fn apply_entry(cache: &mut PageCache, wal: &mut WalTx, entry: &UlogEntry<'_>) -> Result<()> {
        match *entry {
            UlogEntry::Val { offset, op, value } => match op {
                OP_SET => {
                    wal.assign(cache, offset, value)?;
                    cache.write_bytes(offset, &value.to_le_bytes());
                }
                ulog::OP_SET_BITS => {
                    let pos = ulog::val_to_pos(value);
                    let num = ulog::val_to_bits(value);
                    wal.set_bits(cache, offset, pos, num)?;
                    let v = cache.read_u64(offset) | bit_mask(pos, num);
                    cache.write_bytes(offset, &v.to_le_bytes());
                }
                ulog::OP_CLR_BITS => {
                    let pos = ulog::val_to_pos(value);
                    let num = ulog::val_to_bits(value);
                    wal.clr_bits(cache, offset, pos, num)?;
                    let v = cache.read_u64(offset) & !bit_mask(pos, num);
                    cache.write_bytes(offset, &v.to_le_bytes());
                }
                _ => {
                    return Err(HeapError::Internal(format!(
                        "unexpected redo op {op:#x}"
                    )))
                }
            },
            UlogEntry::Buf { .. } => {
                return Err(HeapError::Internal("buffer entry in redo log".into()))
            }
        }
        Ok(())
    }

    /// Publish the staged redo entries: append a WAL action per entry and
    /// apply each to cache memory, in log order.
    pub fn process(&mut self, cache: &mut PageCache, wal: &mut WalTx) -> Result<()> {
        debug_assert_eq!(self.log_type, LogType::Redo);

        if self.shadow_off != 0 {
            let mut at = 0;
            while at < self.shadow_off {
                let (entry, esize) =
                    read_entry(&self.shadow, at, 0).expect("staged entry is valid");
                Self::apply_entry(cache, wal, &entry)?;
                at += esize;
            }
            self.state = OpState::Cleanup;
        }
        Ok(())
    }

    /// Finalize: invalidate the processed undo log and release its
    /// extensions. Redo staging is reset at the next `start`.
    pub fn finish(&mut self, inc_first_gen: bool) {
        debug_assert_ne!(self.state, OpState::Idle);

        if self.log_type == LogType::Undo && self.total_logged != 0 {
            self.state = OpState::Cleanup;
        }
        if self.state == OpState::Cleanup {
            if let Some(ulog) = self.ulog.as_mut() {
                ulog.clobber_data(inc_first_gen, true);
            }
        }
        self.state = OpState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ulog::{bits_to_val, OP_CLR_BITS, OP_SET_BITS};

    fn redo_ctx() -> OperationContext {
        let mut ctx = OperationContext::new(
            LogType::Redo,
            ulog::LANE_REDO_EXTERNAL_SIZE,
            ulog::LANE_REDO_EXTERNAL_SIZE,
        );
        ctx.start();
        ctx
    }

    fn entries(ctx: &OperationContext) -> Vec<(u64, u64, u64)> {
        let mut out = Vec::new();
        let mut at = 0;
        while at < ctx.shadow_off {
            let (e, sz) = read_entry(&ctx.shadow, at, 0).unwrap();
            if let UlogEntry::Val { offset, op, value } = e {
                out.push((offset, op, value));
            }
            at += sz;
        }
        out
    }

    #[test]
    fn test_set_overwrites_on_merge() {
        let mut ctx = redo_ctx();
        ctx.add_entry(0x100, 1, OP_SET);
        ctx.add_entry(0x100, 2, OP_SET);
        assert_eq!(entries(&ctx), vec![(0x100, OP_SET, 2)]);
    }

    #[test]
    fn test_adjacent_bit_ops_merge() {
        let mut ctx = redo_ctx();
        ctx.add_entry(0x200, bits_to_val(0, 4), OP_SET_BITS);
        ctx.add_entry(0x200, bits_to_val(4, 4), OP_SET_BITS);
        assert_eq!(entries(&ctx), vec![(0x200, OP_SET_BITS, bits_to_val(0, 8))]);
    }

    #[test]
    fn test_gap_and_mixed_ops_do_not_merge() {
        let mut ctx = redo_ctx();
        ctx.add_entry(0x300, bits_to_val(0, 2), OP_SET_BITS);
        ctx.add_entry(0x300, bits_to_val(10, 2), OP_SET_BITS);
        ctx.add_entry(0x300, bits_to_val(12, 2), OP_CLR_BITS);
        assert_eq!(ctx.entry_count(), 3);
    }

    #[test]
    fn test_merge_window_is_bounded() {
        let mut ctx = redo_ctx();
        ctx.add_entry(0x8, 1, OP_SET);
        for i in 0..OP_MERGE_SEARCH as u64 {
            ctx.add_entry(0x1000 + i * 8, i, OP_SET);
        }
        // The first entry fell out of the window: no merge.
        ctx.add_entry(0x8, 2, OP_SET);
        assert_eq!(ctx.entry_count(), OP_MERGE_SEARCH + 2);
    }

    #[test]
    fn test_undo_buffer_split_and_invalidate() {
        let mut ctx = OperationContext::new(LogType::Undo, 256, 256);
        ctx.start();
        let payload: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        ctx.add_buffer(0x5000, &payload, OP_BUF_CPY).unwrap();

        let mut restored = Vec::new();
        let mut next_off = 0x5000u64;
        ctx.undo_foreach(|e| {
            if let UlogEntry::Buf { offset, data, .. } = e {
                assert_eq!(*offset, next_off);
                next_off += data.len() as u64;
                restored.extend_from_slice(data);
            }
            true
        });
        assert_eq!(restored, payload);

        ctx.finish(true);
        ctx.start();
        let mut any = false;
        ctx.undo_foreach(|_| {
            any = true;
            true
        });
        assert!(!any, "generation bump must invalidate undo entries");
    }
}
