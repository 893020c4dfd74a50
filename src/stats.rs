// Heap allocation statistics. The transient counters live with the heap
// runtime; the persistent byte count is the `sp_usage_glob` word of the
// zone-0 header and is only re-logged when it actually changed.

/// DRAM-only counters, rebuilt on every open.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapTransientStats {
    /// Bytes allocated out of runs.
    pub run_allocated: u64,
    /// Bytes of chunks currently backing runs.
    pub run_active: u64,
}

/// Snapshot returned to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes currently allocated, headers included (persistent).
    pub curr_allocated: u64,
    pub run_allocated: u64,
    pub run_active: u64,
}

/// Usage of a single memory bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbStats {
    pub allocated: u64,
    pub maxsz: u64,
}
