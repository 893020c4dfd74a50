// Evictable memory bucket pressure: filling evictable zones well past the
// cache capacity must evict only evictable zones, keep the non-evictable
// reserve intact and keep every allocation readable.

use rusty_heap::flags::ezone_id_flag;
use rusty_heap::{MemStore, Pool, PoolConfig};
use std::collections::HashSet;
use std::rc::Rc;

const ZONE: u64 = 16 * 1024 * 1024;
const CHUNK: u64 = 256 * 1024;

fn make_paged_pool(heap_zones: u64, cache_zones: u64, nemb_pct: u32) -> (Rc<MemStore>, Pool) {
    let store = Rc::new(MemStore::new(4096 + heap_zones * ZONE));
    let pool = Pool::create(
        store.clone(),
        &PoolConfig {
            cache_size: cache_zones * ZONE,
            nemb_pct: Some(nemb_pct),
        },
    )
    .expect("pool create");
    (store, pool)
}

// S5 (scaled): evictable usage at roughly twice the cache size.
#[test]
fn test_evictable_pressure_evicts_only_evictable() {
    let (_store, mut pool) = make_paged_pool(40, 17, 20);

    let mut buckets = HashSet::new();
    let mut sample: Vec<(u64, u8)> = Vec::new();

    for round in 0..400 {
        let mb = pool.allot_mb_evictable().expect("allot");
        if mb == 0 {
            break;
        }
        buckets.insert(mb);
        if buckets.len() >= 30 {
            break;
        }

        // Push the active bucket past the 75% band so the next round
        // rotates to a fresh zone.
        for i in 0..50u64 {
            let off = match pool.alloc(CHUNK - 16, 0, ezone_id_flag(mb), None) {
                Ok(off) => off,
                Err(_) => break,
            };
            let tag = (round % 251) as u8;
            if i == 0 {
                pool.memcpy_persist(off, &[tag; 64]).unwrap();
                sample.push((off, tag));
            }
        }
    }

    assert!(
        buckets.len() >= 25,
        "expected to cycle through many evictable buckets, got {}",
        buckets.len()
    );

    let stats = pool.cache_stats();
    assert!(
        stats.evictions > 0,
        "filling 2x the cache must evict evictable zones"
    );

    // Zone 0 (non-evictable) never left the cache.
    assert!(pool.is_resident(4096));

    // The free-page reserve for non-evictable growth holds.
    let max_ne = 3; // 17 cache zones * 20%
    let reserve = (max_ne - pool.cache_nonevictable_pages().min(max_ne)).min(4);
    assert!(
        pool.cache_free_pages() >= reserve,
        "free {} below reserve {}",
        pool.cache_free_pages(),
        reserve
    );

    // Every sampled allocation reads back, reloading zones on demand.
    for (off, tag) in &sample {
        let mut buf = [0u8; 64];
        pool.read_faulting(*off, &mut buf).expect("faulting read");
        assert_eq!(buf, [*tag; 64], "content at {off:#x}");
    }
}

#[test]
fn test_mb_stats_for_evictable_bucket() {
    let (_store, mut pool) = make_paged_pool(24, 17, 50);

    let mb = pool.allot_mb_evictable().expect("allot");
    assert_ne!(mb, 0);
    let off = pool
        .alloc(CHUNK - 16, 0, ezone_id_flag(mb), None)
        .expect("evictable alloc");
    let stats = pool.mb_stats(mb).expect("mb stats");
    assert!(stats.allocated >= CHUNK);
    assert_eq!(stats.maxsz, ZONE);
    pool.free(off).expect("free");
}

#[test]
fn test_force_gc_returns_empty_zones() {
    let (_store, mut pool) = make_paged_pool(24, 17, 50);

    // Drive allocations through several non-evictable zones, then free
    // everything and force a GC.
    let mut offs = Vec::new();
    for _ in 0..200 {
        offs.push(pool.alloc(CHUNK - 16, 0, 0, None).expect("alloc"));
    }
    for off in offs.drain(..) {
        pool.free(off).expect("free");
    }
    assert_eq!(pool.heap_stats().curr_allocated, 0);

    pool.force_gc().expect("force gc");
    // The heap still serves after the GC pass.
    let off = pool.alloc(1024, 0, 0, None).expect("post-gc alloc");
    pool.free(off).expect("post-gc free");
}
