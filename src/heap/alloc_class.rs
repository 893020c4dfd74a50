// Allocation classes: how requests of a given size are served. A class
// describes the unit size, the run geometry and the allocation header
// variant. Class 255 is the built-in huge class backed by whole chunks;
// the run classes cover small sizes with a multiplicative progression and
// can be extended through registration.

use crate::common::{align_up, CHUNKSIZE, DAV_MAX_ALLOC_SIZE, MAX_CHUNK};
use crate::error::{HeapError, Result};
use crate::heap::layout::{
    CHUNK_FLAG_ALIGNED, CHUNK_FLAG_COMPACT_HDR, CHUNK_FLAG_HEADER_NONE, RUN_BASE_METADATA_SIZE,
};

pub const MAX_ALLOCATION_CLASSES: usize = 255;
pub const DEFAULT_ALLOC_CLASS_ID: u8 = 255;

/// Largest unit size served from runs; anything bigger goes to chunks.
pub const MAX_RUN_UNIT_SIZE: u64 = CHUNKSIZE / 4;
/// Smallest default unit size.
const MIN_RUN_UNIT_SIZE: u64 = 128;
/// Unit sizes are multiples of this.
const ALLOC_BLOCK_SIZE: u64 = 16;
/// Aim for at least this many units per default run.
const RUN_MIN_NALLOCS: u64 = 32;
/// Default runs never span more than this many chunks.
const RUN_SIZE_IDX_CAP: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassType {
    Huge,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Legacy,
    Compact,
    None,
}

impl HeaderType {
    #[inline]
    pub fn size(self) -> u64 {
        match self {
            HeaderType::Legacy => 64,
            HeaderType::Compact => 16,
            HeaderType::None => 0,
        }
    }

    pub fn chunk_flags(self) -> u16 {
        match self {
            HeaderType::Legacy => 0,
            HeaderType::Compact => CHUNK_FLAG_COMPACT_HDR,
            HeaderType::None => CHUNK_FLAG_HEADER_NONE,
        }
    }

    pub fn from_chunk_flags(flags: u16) -> Self {
        if flags & CHUNK_FLAG_HEADER_NONE != 0 {
            HeaderType::None
        } else if flags & CHUNK_FLAG_COMPACT_HDR != 0 {
            HeaderType::Compact
        } else {
            HeaderType::Legacy
        }
    }
}

/// Geometry of a run of a given class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunDesc {
    pub unit_size: u64,
    pub alignment: u64,
    /// Chunks per run.
    pub size_idx: u32,
    /// Units per run.
    pub nallocs: u32,
    /// Bitmap words covering `nallocs`.
    pub bmap_words: u32,
}

impl RunDesc {
    /// Solve the unit count: the bitmap grows with the unit count, which
    /// shrinks the data area, so iterate to the fixpoint.
    pub fn compute(unit_size: u64, alignment: u64, size_idx: u32) -> Self {
        let content = size_idx as u64 * CHUNKSIZE - RUN_BASE_METADATA_SIZE;
        let align_pad = alignment; // worst case
        let mut nallocs = (content.saturating_sub(align_pad)) / unit_size;
        loop {
            let bmap_bytes = align_up(nallocs.div_ceil(64) * 8, 8);
            let fit = (content.saturating_sub(bmap_bytes + align_pad)) / unit_size;
            if fit >= nallocs {
                break;
            }
            nallocs = fit;
        }
        let bmap_words = nallocs.div_ceil(64) as u32;
        Self {
            unit_size,
            alignment,
            size_idx,
            nallocs: nallocs as u32,
            bmap_words,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AllocClass {
    pub id: u8,
    pub ctype: ClassType,
    pub header: HeaderType,
    pub unit_size: u64,
    /// Run geometry; unset for the huge class.
    pub rdsc: Option<RunDesc>,
}

impl AllocClass {
    pub fn chunk_flags(&self) -> u16 {
        let mut flags = self.header.chunk_flags();
        if self.rdsc.map(|r| r.alignment != 0).unwrap_or(false) {
            flags |= CHUNK_FLAG_ALIGNED;
        }
        flags
    }
}

pub struct AllocClassCollection {
    classes: Vec<Option<AllocClass>>,
    huge: AllocClass,
}

impl AllocClassCollection {
    /// Default classes: the huge class plus a multiplicative progression
    /// of run unit sizes.
    pub fn new() -> Self {
        let mut collection = Self {
            classes: (0..MAX_ALLOCATION_CLASSES).map(|_| None).collect(),
            huge: AllocClass {
                id: DEFAULT_ALLOC_CLASS_ID,
                ctype: ClassType::Huge,
                header: HeaderType::Compact,
                unit_size: CHUNKSIZE,
                rdsc: None,
            },
        };

        let mut id = 0u8;
        let mut unit = MIN_RUN_UNIT_SIZE;
        while unit <= MAX_RUN_UNIT_SIZE {
            let size_idx = Self::default_run_size_idx(unit);
            collection.classes[id as usize] = Some(AllocClass {
                id,
                ctype: ClassType::Run,
                header: HeaderType::Compact,
                unit_size: unit,
                rdsc: Some(RunDesc::compute(unit, 0, size_idx)),
            });
            id += 1;
            unit = align_up(unit + unit / 4, ALLOC_BLOCK_SIZE);
        }
        collection
    }

    fn default_run_size_idx(unit: u64) -> u32 {
        let want = RUN_MIN_NALLOCS * unit + RUN_BASE_METADATA_SIZE + RUN_MIN_NALLOCS.div_ceil(64) * 8;
        (want.div_ceil(CHUNKSIZE) as u32).min(RUN_SIZE_IDX_CAP)
    }

    pub fn by_id(&self, id: u8) -> Option<&AllocClass> {
        if id == DEFAULT_ALLOC_CLASS_ID {
            Some(&self.huge)
        } else {
            self.classes[id as usize].as_ref()
        }
    }

    pub fn huge(&self) -> &AllocClass {
        &self.huge
    }

    /// The class that best fits an allocation of `size` user bytes.
    pub fn by_alloc_size(&self, size: u64) -> &AllocClass {
        let mut best: Option<&AllocClass> = None;
        for c in self.classes.iter().flatten() {
            let need = size + c.header.size();
            if need <= c.unit_size {
                match best {
                    Some(b) if b.unit_size <= c.unit_size => {}
                    _ => best = Some(c),
                }
            }
        }
        best.unwrap_or(&self.huge)
    }

    /// Find the run class matching persistent run metadata.
    pub fn by_run(&self, block_size: u64, chunk_flags: u16, size_idx: u32) -> Option<&AllocClass> {
        self.classes.iter().flatten().find(|c| {
            c.unit_size == block_size
                && c.chunk_flags() == chunk_flags
                && c.rdsc.map(|r| r.size_idx) == Some(size_idx)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocClass> {
        self.classes.iter().flatten()
    }

    fn first_free_slot(&self) -> Option<u8> {
        // Registered classes grow from the top, below the huge sentinel.
        (0..MAX_ALLOCATION_CLASSES as u16)
            .rev()
            .map(|i| i as u8)
            .find(|&i| self.classes[i as usize].is_none())
    }

    /// Register a caller-defined run class; `class_id == 0` auto-assigns.
    /// Returns the final id and the units per run.
    pub fn register(
        &mut self,
        class_id: u16,
        unit_size: u64,
        alignment: u64,
        units_per_block: u32,
        header: HeaderType,
    ) -> Result<(u8, u32)> {
        if unit_size == 0 || unit_size > DAV_MAX_ALLOC_SIZE || units_per_block == 0 {
            return Err(HeapError::InvalidArgument(
                "unit size or units per block out of range".into(),
            ));
        }
        if alignment != 0 && unit_size % alignment != 0 {
            return Err(HeapError::InvalidArgument(
                "unit size must be evenly divisible by alignment".into(),
            ));
        }
        if alignment > 2 * 1024 * 1024 {
            return Err(HeapError::InvalidArgument(
                "alignment cannot be larger than 2 megabytes".into(),
            ));
        }
        if class_id as usize >= MAX_ALLOCATION_CLASSES {
            return Err(HeapError::ClassIdRange(class_id));
        }

        let id = if class_id == 0 {
            self.first_free_slot().ok_or_else(|| {
                HeapError::OutOfSpace("no available free allocation class identifier".into())
            })?
        } else {
            if self.classes[class_id as usize].is_some() {
                return Err(HeapError::AlreadyExists(format!(
                    "allocation class {class_id}"
                )));
            }
            class_id as u8
        };

        let mut runsize = CHUNKSIZE;
        while units_per_block as u64 * unit_size + RUN_BASE_METADATA_SIZE > runsize {
            runsize += CHUNKSIZE;
        }
        if alignment != 0 {
            runsize += alignment;
        }
        let size_idx = ((runsize.div_ceil(CHUNKSIZE)) as u32).min(MAX_CHUNK);

        let rdsc = RunDesc::compute(unit_size, alignment, size_idx);
        let class = AllocClass {
            id,
            ctype: ClassType::Run,
            header,
            unit_size,
            rdsc: Some(rdsc),
        };
        self.classes[id as usize] = Some(class);
        Ok((id, rdsc.nallocs))
    }
}

impl Default for AllocClassCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_collection_covers_small_sizes() {
        let c = AllocClassCollection::new();
        for size in [1u64, 17, 100, 128, 1000, 5000, 60_000] {
            let class = c.by_alloc_size(size);
            assert_eq!(class.ctype, ClassType::Run, "size {size}");
            assert!(class.unit_size >= size + class.header.size());
        }
        assert_eq!(c.by_alloc_size(300_000).ctype, ClassType::Huge);
    }

    #[test]
    fn test_rounding_is_tight() {
        // The chosen class is the smallest unit that fits the request.
        let c = AllocClassCollection::new();
        let class = c.by_alloc_size(100);
        for other in c.iter() {
            if other.unit_size >= 100 + other.header.size() {
                assert!(class.unit_size <= other.unit_size);
            }
        }
    }

    #[test]
    fn test_run_desc_fixpoint() {
        let r = RunDesc::compute(128, 0, 1);
        // Units, bitmap and header all fit inside the chunk.
        let used = r.nallocs as u64 * 128 + r.bmap_words as u64 * 8 + RUN_BASE_METADATA_SIZE;
        assert!(used <= CHUNKSIZE);
        // And adding one more unit would not.
        let one_more = (r.nallocs as u64 + 1) * 128
            + ((r.nallocs as u64 + 1).div_ceil(64)) * 8
            + RUN_BASE_METADATA_SIZE;
        assert!(one_more > CHUNKSIZE);
    }

    #[test]
    fn test_register_validation() {
        let mut c = AllocClassCollection::new();
        assert!(c.register(0, 0, 0, 10, HeaderType::Compact).is_err());
        assert!(c.register(0, 100, 7, 10, HeaderType::Compact).is_err());
        assert!(c
            .register(0, 4 << 20, 4 << 20, 1, HeaderType::None)
            .is_err());
        assert!(matches!(
            c.register(300, 128, 0, 10, HeaderType::Compact),
            Err(HeapError::ClassIdRange(300))
        ));

        let (id, nallocs) = c.register(0, 96, 0, 100, HeaderType::Compact).unwrap();
        assert!(nallocs >= 100);
        assert!(c.by_id(id).is_some());
        assert!(matches!(
            c.register(id as u16, 96, 0, 100, HeaderType::Compact),
            Err(HeapError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_by_run_lookup() {
        let c = AllocClassCollection::new();
        let class = c.by_alloc_size(200);
        let rdsc = class.rdsc.unwrap();
        let found = c
            .by_run(class.unit_size, class.chunk_flags(), rdsc.size_idx)
            .expect("class found by run metadata");
        assert_eq!(found.id, class.id);
        assert!(c.by_run(class.unit_size + 8, class.chunk_flags(), rdsc.size_idx).is_none());
    }
}
