use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::snapshot::EngineMetricsSnapshot;

/// Engine-wide event counters and profiling accumulators.
///
/// Event counters are always live. The `*_ns` accumulators are charged only
/// when [`EngineConfig::profile`](crate::config::EngineConfig::profile) is
/// set; the engine checks the flag before calling the `add_*` methods, the
/// counters themselves are unconditional.
///
/// All counters are relaxed atomics: they order nothing and are read only
/// through [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub evict_count: AtomicU64,
    pub cell_evict_count: AtomicU64,
    pub destruct_count: AtomicU64,
    pub remat_count: AtomicU64,
    pub remat_failure_count: AtomicU64,
    pub cannot_evict_count: AtomicU64,
    pub alloc_retry_count: AtomicU64,

    pub base_compute_ns: AtomicU64,
    pub remat_compute_ns: AtomicU64,
    pub search_ns: AtomicU64,
    pub cost_ns: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_pool_evict(&self, cells: u64) {
        self.evict_count.fetch_add(1, Ordering::Relaxed);
        self.cell_evict_count.fetch_add(cells, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pool_destruct(&self, cells: u64) {
        self.destruct_count.fetch_add(1, Ordering::Relaxed);
        self.cell_evict_count.fetch_add(cells, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remat(&self) {
        self.remat_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remat_failure(&self) {
        self.remat_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cannot_evict(&self) {
        self.cannot_evict_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alloc_retry(&self) {
        self.alloc_retry_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_base_compute_ns(&self, ns: u64) {
        self.base_compute_ns.fetch_add(ns, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_remat_compute_ns(&self, ns: u64) {
        self.remat_compute_ns.fetch_add(ns, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_search_ns(&self, ns: u64) {
        self.search_ns.fetch_add(ns, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_cost_ns(&self, ns: u64) {
        self.cost_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Copies every counter into a plain value struct.
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            evict_count: self.evict_count.load(Ordering::Relaxed),
            cell_evict_count: self.cell_evict_count.load(Ordering::Relaxed),
            destruct_count: self.destruct_count.load(Ordering::Relaxed),
            remat_count: self.remat_count.load(Ordering::Relaxed),
            remat_failure_count: self.remat_failure_count.load(Ordering::Relaxed),
            cannot_evict_count: self.cannot_evict_count.load(Ordering::Relaxed),
            alloc_retry_count: self.alloc_retry_count.load(Ordering::Relaxed),
            base_compute_ns: self.base_compute_ns.load(Ordering::Relaxed),
            remat_compute_ns: self.remat_compute_ns.load(Ordering::Relaxed),
            search_ns: self.search_ns.load(Ordering::Relaxed),
            cost_ns: self.cost_ns.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter and accumulator.
    pub fn reset(&self) {
        self.evict_count.store(0, Ordering::Relaxed);
        self.cell_evict_count.store(0, Ordering::Relaxed);
        self.destruct_count.store(0, Ordering::Relaxed);
        self.remat_count.store(0, Ordering::Relaxed);
        self.remat_failure_count.store(0, Ordering::Relaxed);
        self.cannot_evict_count.store(0, Ordering::Relaxed);
        self.alloc_retry_count.store(0, Ordering::Relaxed);
        self.base_compute_ns.store(0, Ordering::Relaxed);
        self.remat_compute_ns.store(0, Ordering::Relaxed);
        self.search_ns.store(0, Ordering::Relaxed);
        self.cost_ns.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = EngineMetrics::new();
        metrics.record_pool_evict(3);
        metrics.record_pool_destruct(1);
        metrics.record_remat();
        metrics.add_search_ns(250);

        let snap = metrics.snapshot();
        assert_eq!(snap.evict_count, 1);
        assert_eq!(snap.destruct_count, 1);
        assert_eq!(snap.cell_evict_count, 4);
        assert_eq!(snap.remat_count, 1);
        assert_eq!(snap.search_ns, 250);
    }

    #[test]
    fn reset_zeroes_everything() {
        let metrics = EngineMetrics::new();
        metrics.record_remat_failure();
        metrics.record_cannot_evict();
        metrics.record_alloc_retry();
        metrics.add_base_compute_ns(10);
        metrics.add_remat_compute_ns(20);
        metrics.add_cost_ns(30);
        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap, EngineMetricsSnapshot::default());
    }
}
