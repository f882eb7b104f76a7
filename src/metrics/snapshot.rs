#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineMetricsSnapshot {
    pub evict_count: u64,
    pub cell_evict_count: u64,
    pub destruct_count: u64,
    pub remat_count: u64,
    pub remat_failure_count: u64,
    pub cannot_evict_count: u64,
    pub alloc_retry_count: u64,

    // profiling accumulators, charged only when profiling is on
    pub base_compute_ns: u64,
    pub remat_compute_ns: u64,
    pub search_ns: u64,
    pub cost_ns: u64,
}
