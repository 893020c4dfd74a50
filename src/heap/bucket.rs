// Buckets: the per-class allocation frontends. A run bucket wraps one
// active run whose free unit ranges live in the container; the default
// bucket fronts the FREE chunk extents of its memory bucket. Buckets are
// taken out of the owning MBRT for the duration of an operation and put
// back afterwards, which is the ownership shape behind the C acquire/
// release bracket.

use crate::cache::PageCache;
use crate::heap::container::Container;
use crate::heap::memblock::{run_free_ranges, run_free_space, MemoryBlock};

#[derive(Debug)]
pub struct Bucket {
    pub class_id: u8,
    container: Container,
    /// The attached run (whole-run block), if any.
    active: Option<MemoryBlock>,
}

impl Bucket {
    pub fn new_run(class_id: u8) -> Self {
        Self {
            class_id,
            container: Container::new_seglists(),
            active: None,
        }
    }

    pub fn new_default() -> Self {
        Self {
            class_id: crate::heap::alloc_class::DEFAULT_ALLOC_CLASS_ID,
            container: Container::new_bestfit(),
            active: None,
        }
    }

    #[inline]
    pub fn active_run(&self) -> Option<&MemoryBlock> {
        self.active.as_ref()
    }

    pub fn insert_block(&mut self, m: MemoryBlock) {
        self.container.insert(m);
    }

    /// Remove this exact block; used when coalescing neighbors.
    pub fn remove_block(&mut self, m: &MemoryBlock) -> bool {
        self.container.remove_exact(m)
    }

    /// Take a best-fit block of `size_idx` chunks/units.
    pub fn alloc_block(&mut self, size_idx: u32) -> Option<MemoryBlock> {
        self.container.get_bestfit(size_idx)
    }

    /// Attach a run and expose its free ranges for allocation.
    pub fn attach_run(&mut self, cache: &PageCache, run: MemoryBlock) {
        debug_assert!(self.active.is_none());
        debug_assert_eq!(run.block_off, 0);
        for range in run_free_ranges(cache, &run) {
            self.container.insert(range);
        }
        self.active = Some(run);
    }

    /// Detach the active run. Returns the run and whether it is entirely
    /// free (no live allocations).
    pub fn detach_run(&mut self, cache: &PageCache) -> Option<(MemoryBlock, bool)> {
        let run = self.active.take()?;
        self.container.drain();
        let empty = run_free_space(cache, &run) == run.rdsc.expect("run geometry").nallocs;
        Some((run, empty))
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    pub fn drain(&mut self) -> Vec<MemoryBlock> {
        self.active = None;
        self.container.drain()
    }
}

/// Bucket slot inside an MBRT: a class may have no bucket at all, and an
/// existing bucket may be temporarily taken by an operation.
#[derive(Debug)]
pub enum BucketSlot {
    Absent,
    Present(Bucket),
    Taken,
}

impl BucketSlot {
    pub fn is_present(&self) -> bool {
        matches!(self, BucketSlot::Present(_))
    }

    pub fn take(&mut self) -> Option<Bucket> {
        match std::mem::replace(self, BucketSlot::Taken) {
            BucketSlot::Present(b) => Some(b),
            other => {
                *self = other;
                None
            }
        }
    }

    pub fn put_back(&mut self, b: Bucket) {
        debug_assert!(matches!(self, BucketSlot::Taken));
        *self = BucketSlot::Present(b);
    }
}
