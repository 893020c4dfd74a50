// Pool lifecycle, atomic allocation and statistics conformance.

use rusty_heap::heap::alloc_class::HeaderType;
use rusty_heap::{AllocClassDesc, HeapError, MemStore, MetaStore, Pool, PoolConfig};
use std::rc::Rc;

const ZONE: u64 = 16 * 1024 * 1024;

fn make_pool(heap_zones: u64, cache_zones: u64, nemb_pct: u32) -> (Rc<MemStore>, Pool) {
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

// S1: a fully resident pool serves allocations and returns to zero
// allocated bytes after the frees.
#[test]
fn test_sanity_alloc_free() {
    let (_store, mut pool) = make_pool(4, 4, 100);

    let o1 = pool.alloc(128, 0, 0, None).expect("alloc 128");
    let o2 = pool.alloc(1024, 0, 0, None).expect("alloc 1k");
    assert_ne!(o1, 0);
    assert_ne!(o2, 0);
    assert_ne!(o1, o2);
    assert!(pool.heap_stats().curr_allocated > 0);

    pool.free(o1).expect("free o1");
    pool.free(o2).expect("free o2");
    assert_eq!(pool.heap_stats().curr_allocated, 0);
}

#[test]
fn test_alloc_validation() {
    let (_store, mut pool) = make_pool(2, 2, 100);
    assert!(pool.alloc(0, 0, 0, None).is_err());
    assert!(pool.alloc(16, 0, 1 << 12, None).is_err()); // unknown flag
}

#[test]
fn test_alloc_zero_and_constructor() {
    let (_store, mut pool) = make_pool(2, 2, 100);

    let off = pool
        .alloc(64, 7, rusty_heap::flags::FLAG_ZERO, None)
        .unwrap();
    let mut buf = [0xffu8; 64];
    pool.read(off, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 64]);

    let mut ctor = |b: &mut [u8]| b[..4].copy_from_slice(b"init");
    let off2 = pool.alloc(32, 0, 0, Some(&mut ctor)).unwrap();
    let mut buf2 = [0u8; 4];
    pool.read(off2, &mut buf2).unwrap();
    assert_eq!(&buf2, b"init");
}

#[test]
fn test_memcpy_persist_roundtrip() {
    let (_store, mut pool) = make_pool(2, 2, 100);
    let off = pool.alloc(128, 0, 0, None).unwrap();
    pool.memcpy_persist(off, b"durable payload").unwrap();
    let mut buf = [0u8; 15];
    pool.read(off, &mut buf).unwrap();
    assert_eq!(&buf, b"durable payload");
}

#[test]
fn test_root_bootstrap_and_regrow() {
    let (store, mut pool) = make_pool(4, 4, 100);

    assert!(pool.root(0).is_err(), "zero size on first use");

    let r1 = pool.root(256).expect("root create");
    assert_ne!(r1, 0);
    pool.memcpy_persist(r1, b"root-data").unwrap();

    // Same size returns the same root.
    assert_eq!(pool.root(256).unwrap(), r1);
    assert_eq!(pool.root(64).unwrap(), r1);

    // Growing relocates but preserves content.
    let r2 = pool.root(8192).expect("root grow");
    assert_ne!(r2, r1);
    let mut buf = [0u8; 9];
    pool.read(r2, &mut buf).unwrap();
    assert_eq!(&buf, b"root-data");

    // The root reference survives reopen.
    pool.close();
    let pool2 = Pool::open(store, 4 * ZONE).expect("reopen");
    let mut buf2 = [0u8; 9];
    pool2.read(r2, &mut buf2).unwrap();
    assert_eq!(&buf2, b"root-data");
}

// S6: any single-bit corruption of the header page fails the open.
#[test]
fn test_header_corruption_detected() {
    let (store, pool) = make_pool(2, 2, 100);
    pool.close();

    for victim in [0u64, 17, 100, 1000, 4095] {
        store.corrupt_byte(victim, 0x10);
        let err = Pool::open(store.clone(), 2 * ZONE).expect_err("corrupt open");
        assert!(
            matches!(err, HeapError::CorruptHeader(_)),
            "offset {victim}: {err}"
        );
        store.corrupt_byte(victim, 0x10); // restore
    }
    // Pristine header opens fine again.
    Pool::open(store, 2 * ZONE).expect("clean reopen");
}

#[test]
fn test_open_rejects_size_mismatch() {
    let (store, pool) = make_pool(4, 4, 100);
    pool.close();
    assert!(Pool::open(store, 2 * ZONE).is_err());
}

#[test]
fn test_class_register_and_alloc() {
    let (_store, mut pool) = make_pool(4, 4, 100);

    let (id, nallocs) = pool
        .class_register(&AllocClassDesc {
            unit_size: 96,
            alignment: 0,
            units_per_block: 500,
            header_type: HeaderType::Compact,
            class_id: 0,
        })
        .expect("register");
    assert!(nallocs >= 500);

    let off = pool
        .alloc(80, 0, rusty_heap::flags::class_id_flag(id as u16), None)
        .expect("class alloc");
    pool.free(off).expect("class free");
    assert_eq!(pool.heap_stats().curr_allocated, 0);

    // Duplicate id is rejected.
    assert!(pool
        .class_register(&AllocClassDesc {
            unit_size: 96,
            alignment: 0,
            units_per_block: 10,
            header_type: HeaderType::Compact,
            class_id: id as u16,
        })
        .is_err());
}

#[test]
fn test_huge_alloc_roundtrip() {
    let (_store, mut pool) = make_pool(4, 4, 100);

    // Three chunks worth of data.
    let big = pool.alloc(700 * 1024, 0, 0, None).expect("huge alloc");
    pool.memcpy_persist(big, &[0xabu8; 1024]).unwrap();
    let stats = pool.heap_stats();
    assert!(stats.curr_allocated >= 700 * 1024);

    pool.free(big).expect("huge free");
    assert_eq!(pool.heap_stats().curr_allocated, 0);

    // The freed extent is reusable.
    let again = pool.alloc(700 * 1024, 0, 0, None).expect("realloc");
    assert_eq!(again, big, "coalesced extent is reused at the same place");
}

#[test]
fn test_mb_stats_default_bucket() {
    let (_store, mut pool) = make_pool(4, 4, 100);
    let off = pool.alloc(4096, 0, 0, None).unwrap();
    let stats = pool.mb_stats(0).expect("default mb stats");
    assert!(stats.allocated > 0);
    assert_eq!(stats.maxsz, 4 * ZONE);
    assert!(pool.mb_stats(999).is_err());
    pool.free(off).unwrap();
}

// Randomized alloc/free accounting: the persistent counter matches the
// sum of live allocation sizes (headers included) at every step.
#[test]
fn test_random_alloc_free_accounting() {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    let (_store, mut pool) = make_pool(8, 8, 100);
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut live: Vec<u64> = Vec::new();

    for _ in 0..300 {
        if live.is_empty() || rng.random_bool(0.6) {
            let size = rng.random_range(1..=8192u64);
            let off = pool.alloc(size, 0, 0, None).expect("alloc");
            live.push(off);
        } else {
            let idx = rng.random_range(0..live.len());
            let off = live.swap_remove(idx);
            pool.free(off).expect("free");
        }
    }
    for off in live.drain(..) {
        pool.free(off).expect("drain free");
    }
    assert_eq!(pool.heap_stats().curr_allocated, 0);
}

#[test]
fn test_page_size() {
    let (_store, pool) = make_pool(2, 2, 100);
    assert_eq!(pool.page_size(), ZONE);
}

#[test]
fn test_store_size_validation() {
    // Too small for even one zone.
    let tiny = Rc::new(MemStore::new(8192));
    assert!(Pool::create(
        tiny,
        &PoolConfig {
            cache_size: ZONE,
            nemb_pct: None
        }
    )
    .is_err());

    // Cache below the minimum page count for a paged heap.
    let store = Rc::new(MemStore::new(4096 + 64 * ZONE));
    assert_eq!(store.size(), 4096 + 64 * ZONE);
    assert!(Pool::create(
        store,
        &PoolConfig {
            cache_size: 4 * ZONE,
            nemb_pct: Some(80)
        }
    )
    .is_err());
}
