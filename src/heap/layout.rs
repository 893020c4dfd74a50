// On-blob layout: heap header, zone metadata, chunk headers, run headers,
// allocation headers and the zone-info vector. Everything here is a plain
// byte view; layouts are pinned by compile-time size asserts and all
// fields are little-endian on disk (the structs are only ever serialized
// through `bytemuck` on little-endian hosts, matching the store format).

use crate::checksum;
use crate::common::{BlobOff, CHUNKSIZE, HEAP_HDR_SIZE, MAX_CHUNK, ZONE_META_SIZE};
use crate::error::{HeapError, Result};
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::{offset_of, size_of};

pub const HEAP_SIGNATURE: [u8; 16] = *b"DAOS_HEAP\0\0\0\0\0\0\0";
pub const HEAP_MAJOR: u32 = 1;
pub const HEAP_MINOR: u32 = 2;

pub const ZONE_HEADER_MAGIC: u32 = 0xC3F0_BA11;

/// Zone role flags.
pub const ZONE_EVICTABLE_MB: u32 = 0x1;
pub const ZONE_SOE_MB: u32 = 0x2;

// ============================================================================
// Heap header (blob offset 0, 4096 bytes)
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct HeapHeader {
    pub signature: [u8; 16],
    pub major: u32,
    pub minor: u32,
    pub heap_size: u64,
    pub cache_size: u64,
    pub heap_hdr_size: u64,
    pub chunksize: u64,
    pub chunks_per_zone: u64,
    pub nemb_pct: u8,
    pub reserved: [u8; 7],
    pub pad: [u8; 4016],
    pub checksum: u64,
}

const_assert_eq!(size_of::<HeapHeader>(), HEAP_HDR_SIZE as usize);

impl HeapHeader {
    pub fn build(heap_size: u64, cache_size: u64, nemb_pct: u32) -> Self {
        let mut hdr = Self::zeroed();
        hdr.signature = HEAP_SIGNATURE;
        hdr.major = HEAP_MAJOR;
        hdr.minor = HEAP_MINOR;
        hdr.heap_size = heap_size;
        hdr.cache_size = cache_size;
        hdr.heap_hdr_size = HEAP_HDR_SIZE;
        hdr.chunksize = CHUNKSIZE;
        hdr.chunks_per_zone = MAX_CHUNK as u64;
        hdr.nemb_pct = nemb_pct as u8;
        hdr.seal();
        hdr
    }

    pub fn seal(&mut self) {
        self.checksum = 0;
        let csum_off = offset_of!(HeapHeader, checksum);
        let bytes = bytemuck::bytes_of(self);
        let csum = checksum::compute(bytes, Some(csum_off));
        self.checksum = csum;
    }

    /// Verify checksum, version and geometry against the opening pool.
    pub fn verify(&self, heap_size: u64, cache_size: u64) -> Result<()> {
        let bytes = bytemuck::bytes_of(self);
        if !checksum::verify(bytes, offset_of!(HeapHeader, checksum)) {
            return Err(HeapError::CorruptHeader("invalid header checksum".into()));
        }
        if self.signature != HEAP_SIGNATURE {
            return Err(HeapError::CorruptHeader("bad signature".into()));
        }
        if self.major != HEAP_MAJOR || self.minor > HEAP_MINOR {
            return Err(HeapError::CorruptHeader(format!(
                "layout version mismatch: {}.{}",
                self.major, self.minor
            )));
        }
        if self.heap_size != heap_size {
            return Err(HeapError::CorruptHeader(format!(
                "meta store size mismatch: created with {}, opened with {}",
                self.heap_size, heap_size
            )));
        }
        if self.cache_size != cache_size {
            return Err(HeapError::CorruptHeader(format!(
                "cache size mismatch: created with {}, opened with {}",
                self.cache_size, cache_size
            )));
        }
        if self.nemb_pct > 100 {
            return Err(HeapError::CorruptHeader(format!(
                "nemb pct value {} is incorrect",
                self.nemb_pct
            )));
        }
        if self.heap_hdr_size != HEAP_HDR_SIZE
            || self.chunksize != CHUNKSIZE
            || self.chunks_per_zone != MAX_CHUNK as u64
        {
            return Err(HeapError::CorruptHeader("incompatible heap geometry".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Zone metadata (first 4096 bytes of each zone)
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ZoneHeader {
    pub magic: u32,
    pub size_idx: u32,
    pub flags: u32,
    pub pad0: u32,
    pub sp_usage: u64,
    pub zone0_zinfo_off: u64,
    pub zone0_zinfo_size: u64,
    /// reserved[0] holds the root object offset, reserved[1] its size.
    pub reserved: [u64; 2],
    pub sp_usage_glob: u64,
}

const_assert_eq!(size_of::<ZoneHeader>(), 64);

pub const CHUNK_TYPE_FREE: u16 = 1;
pub const CHUNK_TYPE_USED: u16 = 2;
pub const CHUNK_TYPE_RUN: u16 = 3;

/// Chunk header flags (run header variant and alignment).
pub const CHUNK_FLAG_COMPACT_HDR: u16 = 0x1;
pub const CHUNK_FLAG_HEADER_NONE: u16 = 0x2;
pub const CHUNK_FLAG_ALIGNED: u16 = 0x4;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ChunkHeader {
    pub ctype: u16,
    pub flags: u16,
    pub size_idx: u32,
}

const_assert_eq!(size_of::<ChunkHeader>(), 8);

impl ChunkHeader {
    pub fn new(ctype: u16, flags: u16, size_idx: u32) -> Self {
        Self {
            ctype,
            flags,
            size_idx,
        }
    }

    /// The 8-byte little-endian word the redo log writes for this header.
    pub fn as_word(&self) -> u64 {
        u64::from_le_bytes(bytemuck::bytes_of(self).try_into().unwrap())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ZoneMeta {
    pub header: ZoneHeader,
    pub chunk_headers: [ChunkHeader; MAX_CHUNK as usize],
    pub pad: [u8; 3528],
}

const_assert_eq!(size_of::<ZoneMeta>(), ZONE_META_SIZE as usize);

// ============================================================================
// Run chunks
// ============================================================================

pub const RUN_BASE_METADATA_SIZE: u64 = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ChunkRunHeader {
    pub block_size: u64,
    pub alignment: u64,
}

const_assert_eq!(size_of::<ChunkRunHeader>(), RUN_BASE_METADATA_SIZE as usize);

// ============================================================================
// Allocation headers
// ============================================================================

/// Compact header: size (with flags in the top 16 bits) and the caller's
/// extra word (type number).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AllocHdrCompact {
    pub size: u64,
    pub extra: u64,
}

const_assert_eq!(size_of::<AllocHdrCompact>(), 16);

/// Legacy 64-byte header kept for class-registration compatibility.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AllocHdrLegacy {
    pub size: u64,
    pub type_num: u64,
    pub root_size: u64,
    pub unused: [u64; 5],
}

const_assert_eq!(size_of::<AllocHdrLegacy>(), 64);

pub const ALLOC_HDR_SIZE_SHIFT: u64 = 48;
pub const ALLOC_HDR_SIZE_MASK: u64 = (1 << ALLOC_HDR_SIZE_SHIFT) - 1;

#[inline]
pub fn alloc_hdr_pack(size: u64, flags: u16) -> u64 {
    debug_assert_eq!(size & !ALLOC_HDR_SIZE_MASK, 0);
    size | ((flags as u64) << ALLOC_HDR_SIZE_SHIFT)
}

#[inline]
pub fn alloc_hdr_unpack(word: u64) -> (u64, u16) {
    (
        word & ALLOC_HDR_SIZE_MASK,
        (word >> ALLOC_HDR_SIZE_SHIFT) as u16,
    )
}

// ============================================================================
// Zone info vector (lives in the heap, referenced from zone 0)
// ============================================================================

pub const ZINFO_VERSION: u32 = 0x1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ZinfoVecHdr {
    pub version: u32,
    pub num_elems: u32,
}

/// Per-zone record: bit 0 allotted, bit 1 evictable, bits 2..5 usage hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZinfoElem {
    pub allotted: bool,
    pub evictable: bool,
    pub usage_hint: u8,
}

impl ZinfoElem {
    pub fn pack(self) -> u8 {
        (self.allotted as u8) | (self.evictable as u8) << 1 | (self.usage_hint & 0x7) << 2
    }

    pub fn unpack(b: u8) -> Self {
        Self {
            allotted: b & 0x1 != 0,
            evictable: b & 0x2 != 0,
            usage_hint: (b >> 2) & 0x7,
        }
    }
}

pub fn zinfo_size(nzones: u32) -> u64 {
    size_of::<ZinfoVecHdr>() as u64 + nzones as u64
}

// ============================================================================
// Blob offset helpers
// ============================================================================

#[inline]
pub fn zone_header_off(zone_id: u32) -> BlobOff {
    crate::common::zone_offset(zone_id)
}

#[inline]
pub fn chunk_header_off(zone_id: u32, chunk_id: u32) -> BlobOff {
    zone_header_off(zone_id) + size_of::<ZoneHeader>() as u64 + chunk_id as u64 * 8
}

#[inline]
pub fn chunk_data_off(zone_id: u32, chunk_id: u32) -> BlobOff {
    zone_header_off(zone_id) + ZONE_META_SIZE + chunk_id as u64 * CHUNKSIZE
}

#[inline]
pub fn sp_usage_off(zone_id: u32) -> BlobOff {
    zone_header_off(zone_id) + offset_of!(ZoneHeader, sp_usage) as u64
}

#[inline]
pub fn sp_usage_glob_off() -> BlobOff {
    zone_header_off(0) + offset_of!(ZoneHeader, sp_usage_glob) as u64
}

#[inline]
pub fn zinfo_ref_off() -> (BlobOff, BlobOff) {
    (
        zone_header_off(0) + offset_of!(ZoneHeader, zone0_zinfo_off) as u64,
        zone_header_off(0) + offset_of!(ZoneHeader, zone0_zinfo_size) as u64,
    )
}

#[inline]
pub fn root_ref_off() -> (BlobOff, BlobOff) {
    let base = zone_header_off(0) + offset_of!(ZoneHeader, reserved) as u64;
    (base, base + 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_and_corruption() {
        let hdr = HeapHeader::build(256 << 20, 256 << 20, 80);
        assert!(hdr.verify(256 << 20, 256 << 20).is_ok());
        assert!(hdr.verify(128 << 20, 256 << 20).is_err());

        let mut bytes = bytemuck::bytes_of(&hdr).to_vec();
        bytes[100] ^= 0x1;
        let bad: HeapHeader = bytemuck::pod_read_unaligned(&bytes);
        assert!(bad.verify(256 << 20, 256 << 20).is_err());
    }

    #[test]
    fn test_chunk_header_word() {
        let hdr = ChunkHeader::new(CHUNK_TYPE_RUN, CHUNK_FLAG_COMPACT_HDR, 4);
        let word = hdr.as_word();
        let back: ChunkHeader = bytemuck::pod_read_unaligned(&word.to_le_bytes());
        assert_eq!(back, hdr);
    }

    #[test]
    fn test_zinfo_elem_packing() {
        let e = ZinfoElem {
            allotted: true,
            evictable: false,
            usage_hint: 3,
        };
        assert_eq!(ZinfoElem::unpack(e.pack()), e);
    }

    #[test]
    fn test_alloc_hdr_packing() {
        let w = alloc_hdr_pack(12345, 0x2);
        assert_eq!(alloc_hdr_unpack(w), (12345, 0x2));
    }

    #[test]
    fn test_layout_offsets() {
        assert_eq!(zone_header_off(0), 4096);
        assert_eq!(chunk_header_off(0, 0), 4096 + 64);
        assert_eq!(chunk_data_off(0, 0), 8192);
        assert_eq!(chunk_data_off(1, 2), 4096 + (16 << 20) + 4096 + 2 * 262144);
    }
}
