// # Common Types and Constants
//
// Shared type aliases, layout constants, allocation flags and small
// alignment/bit helpers used across the heap, cache, WAL and transaction
// modules. Environment tunables are parsed once per process.

use once_cell::sync::Lazy;

/// Offset into the meta blob (byte address on the backing store).
pub type BlobOff = u64;

/// WAL transaction identifier, allocated by the backing store.
/// Monotonically increasing; 0 is reserved for "none".
pub type TxId = u64;

// ============================================================================
// Layout constants
// ============================================================================

/// Size of a zone, the unit of mapping and eviction.
pub const ZONE_MAX_SIZE: u64 = 16 * 1024 * 1024;

/// Size of a chunk, the subdivision of a zone.
pub const CHUNKSIZE: u64 = 256 * 1024;

/// Bytes of zone metadata (zone header plus chunk header table).
pub const ZONE_META_SIZE: u64 = 4096;

/// Number of data chunks in a full zone.
pub const MAX_CHUNK: u32 = ((ZONE_MAX_SIZE - ZONE_META_SIZE) / CHUNKSIZE) as u32;

/// Smallest blob remainder that still counts as a zone.
pub const ZONE_MIN_SIZE: u64 = ZONE_META_SIZE + CHUNKSIZE;

/// Size of the heap header at blob offset 0.
pub const HEAP_HDR_SIZE: u64 = 4096;

/// Largest single allocation served by the heap.
pub const DAV_MAX_ALLOC_SIZE: u64 = 0x3FFD_FFFC0;

/// Cacheline granule used by the ulog layout.
pub const CACHELINE_SIZE: usize = 64;

/// Granularity of the cache dirty bitmap.
pub const UMEM_CACHE_CHUNK_SZ: u64 = 4096;
pub const UMEM_CACHE_CHUNK_SZ_SHIFT: u32 = 12;

/// Minimum number of cache pages a paged pool must own.
pub const UMEM_CACHE_MIN_PAGES: u32 = 16;

/// Free pages always held back for non-evictable zone growth.
pub const UMEM_CACHE_RSRVD_PAGES: u32 = 4;

/// Bits per bitmap word, for runs and for the cache dirty map.
pub const RUN_BITS_PER_VALUE: u32 = 64;

pub const HEAP_NEMB_PCT_DEFAULT: u32 = 80;
pub const HEAP_NEMB_EMPTY_THRESHOLD: u32 = 16;

// ============================================================================
// Allocation flags (stable public constants)
// ============================================================================

pub const FLAG_ZERO: u64 = 1 << 0;
pub const FLAG_NO_FLUSH: u64 = 1 << 1;
pub const FLAG_NO_SNAPSHOT: u64 = 1 << 2;
pub const FLAG_ASSUME_INITIALIZED: u64 = 1 << 3;
pub const FLAG_TX_NO_ABORT: u64 = 1 << 4;
pub const FLAG_WAL_CPTR: u64 = 1 << 5;

/// Encode an allocation class id into the flags word.
#[inline]
pub const fn class_id_flag(id: u16) -> u64 {
    (id as u64) << 48
}

/// Encode an evictable zone id into the flags word.
#[inline]
pub const fn ezone_id_flag(id: u32) -> u64 {
    (id as u64) << 16
}

#[inline]
pub const fn class_id_from_flags(flags: u64) -> u16 {
    (flags >> 48) as u16
}

#[inline]
pub const fn ezone_id_from_flags(flags: u64) -> u32 {
    ((flags >> 16) & 0xFFFF_FFFF) as u32
}

pub const VALID_ALLOC_FLAGS: u64 = FLAG_ZERO
    | FLAG_NO_FLUSH
    | FLAG_NO_SNAPSHOT
    | FLAG_ASSUME_INITIALIZED
    | FLAG_TX_NO_ABORT
    | FLAG_WAL_CPTR
    | (0xFFFF << 48)
    | (0xFFFF_FFFF << 16);

pub const VALID_XADD_FLAGS: u64 =
    FLAG_NO_FLUSH | FLAG_NO_SNAPSHOT | FLAG_ASSUME_INITIALIZED | FLAG_TX_NO_ABORT;

// ============================================================================
// Alignment helpers
// ============================================================================

#[inline]
pub const fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down(v: u64, align: u64) -> u64 {
    v & !(align - 1)
}

#[inline]
pub const fn is_power_of_two(v: u64) -> bool {
    v != 0 && (v & (v - 1)) == 0
}

/// Blob offset of the first byte of a zone.
#[inline]
pub const fn zone_offset(zone_id: u32) -> BlobOff {
    HEAP_HDR_SIZE + zone_id as u64 * ZONE_MAX_SIZE
}

/// Zone id owning a blob offset.
#[inline]
pub const fn zone_id_of(off: BlobOff) -> u32 {
    ((off - HEAP_HDR_SIZE) / ZONE_MAX_SIZE) as u32
}

// ============================================================================
// Environment tunables
// ============================================================================

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Percentage of the cache reserved for non-evictable zones. Values outside
/// 1..=100 fall back to the default.
pub static NEMB_PCT: Lazy<u32> = Lazy::new(|| {
    match env_u32("DAOS_MD_ON_SSD_NEMB_PCT") {
        Some(v) if v >= 1 && v <= 100 => v,
        Some(v) => {
            tracing::warn!(value = v, "invalid DAOS_MD_ON_SSD_NEMB_PCT, using default");
            HEAP_NEMB_PCT_DEFAULT
        }
        None => HEAP_NEMB_PCT_DEFAULT,
    }
});

/// Count of empty non-evictable memory buckets that triggers forced
/// recycling. Zero means "use default".
pub static NEMB_EMPTY_RECYCLE_THRESHOLD: Lazy<u32> = Lazy::new(|| {
    match env_u32("DAOS_NEMB_EMPTY_RECYCLE_THRESHOLD") {
        Some(0) | None => HEAP_NEMB_EMPTY_THRESHOLD,
        Some(v) => v,
    }
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_down(65, 64), 64);
        assert!(is_power_of_two(4096));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(48));
    }

    #[test]
    fn test_zone_math() {
        assert_eq!(MAX_CHUNK, 63);
        assert_eq!(zone_offset(0), 4096);
        assert_eq!(zone_offset(1), 4096 + ZONE_MAX_SIZE);
        assert_eq!(zone_id_of(zone_offset(2) + 123), 2);
    }

    #[test]
    fn test_flag_encoding() {
        let f = class_id_flag(7) | ezone_id_flag(3) | FLAG_ZERO;
        assert_eq!(class_id_from_flags(f), 7);
        assert_eq!(ezone_id_from_flags(f), 3);
        assert_ne!(f & FLAG_ZERO, 0);
    }
}
