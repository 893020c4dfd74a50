// Transaction conformance: snapshot rollback, range normalization,
// nesting, failure behavior and stage callbacks.

use rusty_heap::{FailureBehavior, MemStore, Pool, PoolConfig, TxStage};
use std::cell::RefCell;
use std::rc::Rc;

const ZONE: u64 = 16 * 1024 * 1024;

fn make_pool(zones: u64) -> (Rc<MemStore>, Pool) {
    let store = Rc::new(MemStore::new(4096 + zones * ZONE));
    let pool = Pool::create(
        store.clone(),
        &PoolConfig {
            cache_size: zones * ZONE,
            nemb_pct: Some(100),
        },
    )
    .expect("pool create");
    (store, pool)
}

// S2: direct writes inside a snapshotted range revert on abort.
#[test]
fn test_snapshot_rollback() {
    let (_store, mut pool) = make_pool(2);
    let off = 0x10000;
    pool.memcpy_persist(off, b"AAAA").unwrap();

    pool.tx_begin().unwrap();
    pool.tx_add_range(off, 4).unwrap();
    pool.with_slice_mut(off, 4, |b| b.fill(b'B')).unwrap();
    let mut probe = [0u8; 4];
    pool.read(off, &mut probe).unwrap();
    assert_eq!(&probe, b"BBBB");

    pool.tx_abort(0).unwrap();
    assert!(pool.tx_end().is_err(), "aborted tx reports the error at end");

    pool.read(off, &mut probe).unwrap();
    assert_eq!(&probe, b"AAAA", "abort must restore the pre-image");
}

#[test]
fn test_commit_keeps_writes() {
    let (_store, mut pool) = make_pool(2);
    let off = 0x10000;
    pool.memcpy_persist(off, b"AAAA").unwrap();

    pool.tx_run(|p| {
        p.tx_add_range(off, 4)?;
        p.with_slice_mut(off, 4, |b| b.copy_from_slice(b"CCCC"))?;
        Ok(())
    })
    .unwrap();

    let mut probe = [0u8; 4];
    pool.read(off, &mut probe).unwrap();
    assert_eq!(&probe, b"CCCC");
}

#[test]
fn test_partial_overlap_rollback() {
    let (_store, mut pool) = make_pool(2);
    let off = 0x20000;
    pool.memcpy_persist(off, &[b'x'; 256]).unwrap();

    pool.tx_begin().unwrap();
    // Two overlapping adds; the overlap must be snapshotted exactly once
    // and the whole interval must restore.
    pool.tx_add_range(off, 128).unwrap();
    pool.tx_add_range(off + 64, 192).unwrap();
    pool.with_slice_mut(off, 256, |b| b.fill(b'y')).unwrap();
    pool.tx_abort(0).unwrap();
    let _ = pool.tx_end();

    let mut probe = [0u8; 256];
    pool.read(off, &mut probe).unwrap();
    assert_eq!(probe, [b'x'; 256]);
}

#[test]
fn test_tx_alloc_visible_after_commit() {
    let (_store, mut pool) = make_pool(2);

    let mut allocated = 0;
    pool.tx_run(|p| {
        allocated = p.tx_alloc(512, 3, rusty_heap::flags::FLAG_ZERO)?;
        p.with_slice_mut(allocated, 8, |b| b.copy_from_slice(b"txalloc!"))?;
        Ok(())
    })
    .unwrap();

    let mut probe = [0u8; 8];
    pool.read(allocated, &mut probe).unwrap();
    assert_eq!(&probe, b"txalloc!");
    assert!(pool.heap_stats().curr_allocated >= 512);
}

#[test]
fn test_tx_alloc_rolls_back_on_abort() {
    let (_store, mut pool) = make_pool(2);

    pool.tx_begin().unwrap();
    let off = pool.tx_alloc(256, 0, 0).unwrap();
    assert_ne!(off, 0);
    pool.tx_abort(0).unwrap();
    let _ = pool.tx_end();

    assert_eq!(pool.heap_stats().curr_allocated, 0);
}

#[test]
fn test_tx_free_of_same_tx_alloc_cancels() {
    let (_store, mut pool) = make_pool(2);

    pool.tx_run(|p| {
        let off = p.tx_alloc(256, 0, 0)?;
        p.tx_free(off)?;
        Ok(())
    })
    .unwrap();
    assert_eq!(pool.heap_stats().curr_allocated, 0);
}

#[test]
fn test_tx_free_of_committed_object() {
    let (_store, mut pool) = make_pool(2);
    let off = pool.alloc(1024, 0, 0, None).unwrap();

    pool.tx_run(|p| p.tx_free(off)).unwrap();
    assert_eq!(pool.heap_stats().curr_allocated, 0);
}

#[test]
fn test_nested_commit() {
    let (_store, mut pool) = make_pool(2);
    let off = 0x30000;
    pool.memcpy_persist(off, b"0000").unwrap();

    pool.tx_begin().unwrap();
    pool.tx_add_range(off, 4).unwrap();
    pool.with_slice_mut(off, 2, |b| b.copy_from_slice(b"11")).unwrap();

    // Nested level.
    pool.tx_begin().unwrap();
    pool.with_slice_mut(off + 2, 2, |b| b.copy_from_slice(b"22"))
        .unwrap();
    pool.tx_commit().unwrap();
    pool.tx_end().unwrap();

    pool.tx_commit().unwrap();
    pool.tx_end().unwrap();

    let mut probe = [0u8; 4];
    pool.read(off, &mut probe).unwrap();
    assert_eq!(&probe, b"1122");
}

#[test]
fn test_nested_abort_waterfalls() {
    let (_store, mut pool) = make_pool(2);
    let off = 0x30000;
    pool.memcpy_persist(off, b"seed").unwrap();

    pool.tx_begin().unwrap();
    pool.tx_add_range(off, 4).unwrap();
    pool.with_slice_mut(off, 4, |b| b.fill(b'z')).unwrap();

    pool.tx_begin().unwrap();
    pool.tx_abort(7).unwrap();
    // Inner end waterfalls the abort into the outer level.
    let _ = pool.tx_end();
    assert_eq!(pool.tx_stage(), TxStage::OnAbort);
    assert!(pool.tx_end().is_err());

    let mut probe = [0u8; 4];
    pool.read(off, &mut probe).unwrap();
    assert_eq!(&probe, b"seed");
    assert_eq!(pool.tx_stage(), TxStage::None);
}

#[test]
fn test_no_abort_failure_behavior() {
    let (_store, mut pool) = make_pool(2);

    pool.tx_begin_with(FailureBehavior::Return, None).unwrap();
    // An invalid allocation reports the error but stays in WORK.
    assert!(pool.tx_alloc(0, 0, 0).is_err());
    assert_eq!(pool.tx_stage(), TxStage::Work);
    assert_ne!(pool.tx_errno(), 0);

    pool.tx_commit().unwrap();
    pool.tx_end().expect_err("errno carries through to end");
    assert_eq!(pool.tx_stage(), TxStage::None);
}

#[test]
fn test_abort_on_failure_default() {
    let (_store, mut pool) = make_pool(2);

    pool.tx_begin().unwrap();
    assert!(pool.tx_alloc(0, 0, 0).is_err());
    assert_eq!(pool.tx_stage(), TxStage::OnAbort);
    let _ = pool.tx_end();
    assert_eq!(pool.tx_stage(), TxStage::None);
}

#[test]
fn test_stage_callbacks_fire_once_per_transition() {
    let (_store, mut pool) = make_pool(2);
    let seen: Rc<RefCell<Vec<TxStage>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();

    pool.tx_begin_with(
        FailureBehavior::Abort,
        Some(Box::new(move |stage| sink.borrow_mut().push(stage))),
    )
    .unwrap();

    // A nested level must not fire outermost callbacks.
    pool.tx_begin().unwrap();
    pool.tx_commit().unwrap();
    pool.tx_end().unwrap();

    pool.tx_commit().unwrap();
    pool.tx_end().unwrap();

    assert_eq!(
        seen.borrow().as_slice(),
        &[
            TxStage::Work,
            TxStage::OnCommit,
            TxStage::Finally,
            TxStage::None
        ]
    );
}

#[test]
fn test_add_range_validation() {
    let (_store, mut pool) = make_pool(2);
    pool.tx_begin_with(FailureBehavior::Return, None).unwrap();
    // Outside of the heap.
    assert!(pool.tx_add_range(10, 4).is_err());
    assert!(pool
        .tx_xadd_range(0x10000, 8, 1 << 30)
        .is_err());
    pool.tx_commit().unwrap();
    let _ = pool.tx_end();
}

#[test]
fn test_reserve_publish_cancel() {
    let (_store, mut pool) = make_pool(2);

    // Published reservation becomes durable at commit.
    let mut kept = 0;
    pool.tx_run(|p| {
        let act = p.reserve(300, 9, 0)?;
        kept = act.offset;
        p.tx_publish(&[act])?;
        Ok(())
    })
    .unwrap();
    assert!(pool.heap_stats().curr_allocated >= 300);

    // Cancelled reservation leaves no trace.
    let before = pool.heap_stats().curr_allocated;
    pool.tx_run(|p| {
        let act = p.reserve(300, 9, 0)?;
        p.cancel(&[act])?;
        Ok(())
    })
    .unwrap();
    assert_eq!(pool.heap_stats().curr_allocated, before);

    pool.tx_run(|p| {
        let act = p.defer_free(kept)?;
        p.tx_publish(&[act])?;
        Ok(())
    })
    .unwrap();
    assert_eq!(pool.heap_stats().curr_allocated, 0);
}

#[test]
fn test_atomic_ops_rejected_inside_tx() {
    let (_store, mut pool) = make_pool(2);
    pool.tx_begin().unwrap();
    assert!(pool.alloc(64, 0, 0, None).is_err());
    assert!(pool.free(0x10000).is_err());
    assert!(pool.checkpoint().is_err());
    pool.tx_commit().unwrap();
    pool.tx_end().unwrap();
}
