//! # Rematerialization Engine
//!
//! The engine ties the pieces together: per-device pool indexes, the budget
//! enforcer, registration of source and computed values, and the allocation
//! paths that trade eviction for capacity.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │ RematEngine<T>  (cheap Clone, all state behind Arc)                    │
//! │                                                                        │
//! │   EngineShared                                                         │
//! │   ├── alloc: Arc<dyn DeviceAllocator>     host memory seam             │
//! │   ├── config: EngineConfig                immutable after build        │
//! │   ├── metrics: EngineMetrics              atomic counters              │
//! │   ├── forest: Mutex<EcnForest>            merged eviction costs,       │
//! │   │                                       shared across devices        │
//! │   └── tables: RwLock<map device → DeviceTable>                         │
//! │        ├── pools:  Mutex<map identity-addr → Weak<AliasPool>>          │
//! │        └── budget: Mutex<Option<usize>>   soft resident-bytes limit    │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Allocation paths
//!
//! | Path                  | Budget pre-enforced | Capacity retry |
//! |-----------------------|---------------------|----------------|
//! | `register_value`      | yes (best effort)   | yes            |
//! | `register_weight`     | yes (best effort)   | yes            |
//! | `register_computed`   | yes (best effort)   | yes            |
//! | rematerialization     | **no**              | yes            |
//!
//! Rematerialization deliberately skips budget enforcement: restoring an
//! evicted value must never evict an unrelated resident one to stay under a
//! soft limit, or a tight budget would thrash pairs of values forever. Only
//! true allocator exhaustion triggers reclaim on that path.
//!
//! ## Victim selection
//!
//! The enforcer scans the device's eligible pools, scores each with
//! [`AliasPool`] cost (scores decay with staleness, so they cannot be kept
//! in a heap), and evicts the lowest-scored pool that is still eligible by
//! the time its lock is taken. `sample_rate` trades scan time for victim
//! optimality on large populations; `min_evictable_bytes` keeps the scan off
//! pools too small to be worth freeing.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use rematkit::builder::EngineBuilder;
//! use rematkit::traits::{DeviceId, MeterAllocator};
//!
//! let dev = DeviceId::new(0);
//! let engine = EngineBuilder::new(Arc::new(MeterAllocator::unbounded())).build();
//!
//! let base = engine.register_value(vec![1u8; 64], 64, dev).unwrap();
//! let doubled = engine
//!     .register_computed(
//!         |inputs: &[Arc<Vec<u8>>]| Ok(inputs[0].iter().map(|b| b * 2).collect()),
//!         &[&base],
//!         vec![2u8; 64],
//!         64,
//!         dev,
//!         Duration::from_micros(50),
//!     )
//!     .unwrap();
//!
//! engine.set_budget(dev, 64);
//! engine.enforce(dev).unwrap();
//! assert!(engine.resident(dev) <= 64);
//!
//! // Access brings evicted values back transparently.
//! assert_eq!(*doubled.get().unwrap(), vec![2u8; 64]);
//! ```

use std::cmp::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rustc_hash::FxHashMap;

use crate::cell::{CellHandle, ValueCell};
use crate::config::EngineConfig;
use crate::ds::EcnForest;
use crate::error::AllocError;
use crate::metrics::EngineMetrics;
use crate::pool::AliasPool;
use crate::remat::{RecomputeFn, RecomputeSpec};
use crate::traits::{DeviceAddr, DeviceAllocator, DeviceId};

// ---------------------------------------------------------------------------
// DeviceTable
// ---------------------------------------------------------------------------

/// Per-device bookkeeping: the pool index and the soft budget. Created
/// lazily on first use of a device.
pub(crate) struct DeviceTable<T> {
    /// Keyed by identity address. Weak: the index never keeps a pool alive.
    pub(crate) pools: Mutex<FxHashMap<DeviceAddr, Weak<AliasPool<T>>>>,
    pub(crate) budget: Mutex<Option<usize>>,
}

impl<T> DeviceTable<T> {
    fn new() -> Self {
        Self {
            pools: Mutex::new(FxHashMap::default()),
            budget: Mutex::new(None),
        }
    }

    pub(crate) fn add_pool(&self, identity: DeviceAddr, pool: Weak<AliasPool<T>>) {
        self.pools.lock().insert(identity, pool);
    }

    pub(crate) fn erase_pool(&self, identity: DeviceAddr) {
        self.pools.lock().remove(&identity);
    }

    /// Live pools, with dead index entries pruned on the way. Pool methods
    /// are never called while the index lock is held.
    fn live_pools(&self) -> Vec<Arc<AliasPool<T>>> {
        let mut pools = self.pools.lock();
        pools.retain(|_, weak| weak.strong_count() > 0);
        pools.values().filter_map(Weak::upgrade).collect()
    }
}

// ---------------------------------------------------------------------------
// EngineShared
// ---------------------------------------------------------------------------

pub(crate) struct EngineShared<T> {
    pub(crate) alloc: Arc<dyn DeviceAllocator>,
    pub(crate) config: EngineConfig,
    pub(crate) metrics: EngineMetrics,
    /// One arena for every device: recompute chains cross devices, so a
    /// merged cost node must be reachable from any member pool's eviction.
    pub(crate) forest: Mutex<EcnForest>,
    tables: RwLock<FxHashMap<DeviceId, Arc<DeviceTable<T>>>>,
}

impl<T> EngineShared<T> {
    pub(crate) fn table(&self, device: DeviceId) -> Arc<DeviceTable<T>> {
        if let Some(table) = self.tables.read().get(&device) {
            return Arc::clone(table);
        }
        let mut tables = self.tables.write();
        Arc::clone(
            tables
                .entry(device)
                .or_insert_with(|| Arc::new(DeviceTable::new())),
        )
    }

    /// Allocates, evicting one victim at a time on capacity failure until
    /// the allocator accepts or nothing evictable remains. No budget checks.
    pub(crate) fn allocate_under_capacity(
        &self,
        device: DeviceId,
        bytes: usize,
    ) -> Result<DeviceAddr, AllocError> {
        loop {
            match self.alloc.allocate(device, bytes) {
                Ok(addr) => return Ok(addr),
                Err(err) => {
                    self.metrics.record_alloc_retry();
                    if !self.evict_one(device) {
                        warn!(
                            "allocation of {bytes} bytes on {device} failed with nothing left to evict"
                        );
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Evicts until the device's resident bytes drop to `target`, or returns
    /// false once no eligible victim remains.
    pub(crate) fn shrink_to(&self, device: DeviceId, target: usize) -> bool {
        while self.alloc.resident(device) > target {
            if !self.evict_one(device) {
                return false;
            }
        }
        true
    }

    /// One enforcement round: score every eligible pool and evict the
    /// cheapest that is still eligible when its lock is taken.
    pub(crate) fn evict_one(&self, device: DeviceId) -> bool {
        let timer = self.config.profile.then(Instant::now);
        let table = self.table(device);

        let eligible: Vec<Arc<AliasPool<T>>> = table
            .live_pools()
            .into_iter()
            .filter(|pool| {
                self.config.admits_size(pool.memory_size()) && pool.budget_candidate()
            })
            .collect();
        if eligible.is_empty() {
            self.metrics.record_cannot_evict();
            if let Some(start) = timer {
                self.metrics.add_search_ns(start.elapsed().as_nanos() as u64);
            }
            return false;
        }

        // Optional sampling, falling back to the full population rather than
        // stalling when the draw comes up empty.
        let picked: Vec<Arc<AliasPool<T>>> = match self.config.sample_rate {
            Some(rate) => {
                let mut rng = rand::thread_rng();
                let sampled: Vec<_> = eligible
                    .iter()
                    .filter(|_| rng.gen::<f64>() < rate)
                    .cloned()
                    .collect();
                if sampled.is_empty() {
                    eligible
                } else {
                    sampled
                }
            }
            None => eligible,
        };

        let now = Instant::now();
        let mut scored: Vec<(f64, Arc<AliasPool<T>>)> = picked
            .into_iter()
            .map(|pool| (pool.cost(now), pool))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        if let Some(start) = timer {
            self.metrics.add_search_ns(start.elapsed().as_nanos() as u64);
        }

        for (score, pool) in scored {
            if pool.try_evict_eligible() {
                trace!(
                    "budget eviction picked pool {} on {} (score {:.3e})",
                    pool.identity(),
                    device,
                    score
                );
                return true;
            }
        }
        self.metrics.record_cannot_evict();
        false
    }
}

// ---------------------------------------------------------------------------
// RematEngine
// ---------------------------------------------------------------------------

/// Shared-ownership handle to one engine instance.
///
/// All state lives behind an `Arc`; clone freely and use from any thread.
pub struct RematEngine<T> {
    shared: Arc<EngineShared<T>>,
}

impl<T> Clone for RematEngine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> RematEngine<T> {
    pub(crate) fn from_parts(alloc: Arc<dyn DeviceAllocator>, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                alloc,
                config,
                metrics: EngineMetrics::new(),
                forest: Mutex::new(EcnForest::new()),
                tables: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    // ------- registration -------

    /// Tracks a source value: memory-managed but, lacking a recompute
    /// descriptor, never automatically evicted.
    pub fn register_value(
        &self,
        value: T,
        bytes: usize,
        device: DeviceId,
    ) -> Result<CellHandle<T>, AllocError> {
        self.register_impl(value, bytes, device, false, None)
    }

    /// Tracks a weight: like a source value, and additionally exempt from
    /// every automatic trigger even while unreferenced.
    pub fn register_weight(
        &self,
        value: T,
        bytes: usize,
        device: DeviceId,
    ) -> Result<CellHandle<T>, AllocError> {
        self.register_impl(value, bytes, device, true, None)
    }

    /// Tracks a computed value together with the recipe to recompute it.
    ///
    /// `op` receives the materialized inputs in the order given here and
    /// must be a pure function of them; it will run again, possibly many
    /// times and from other threads, whenever the value needs restoring.
    /// `compute_cost` is the host's estimate of one execution, the numerator
    /// of the eviction score. The new value's pool and each input's pool
    /// become cost neighbors.
    pub fn register_computed(
        &self,
        op: impl Fn(&[Arc<T>]) -> Result<T, String> + Send + Sync + 'static,
        inputs: &[&CellHandle<T>],
        value: T,
        bytes: usize,
        device: DeviceId,
        compute_cost: Duration,
    ) -> Result<CellHandle<T>, AllocError> {
        let input_cells: Vec<Arc<ValueCell<T>>> = inputs
            .iter()
            .map(|handle| Arc::clone(handle.cell()))
            .collect();
        let op: RecomputeFn<T> = Arc::new(op);
        let spec = Arc::new(RecomputeSpec::new(op, input_cells, compute_cost));
        if self.shared.config.profile {
            self.shared
                .metrics
                .add_base_compute_ns(compute_cost.as_nanos() as u64);
        }

        let handle = self.register_impl(value, bytes, device, false, Some(spec))?;
        for input in inputs {
            input.pool().touch();
            input.pool().add_neighbor(handle.pool());
            handle.pool().add_neighbor(input.pool());
        }
        Ok(handle)
    }

    fn register_impl(
        &self,
        value: T,
        bytes: usize,
        device: DeviceId,
        weight: bool,
        spec: Option<Arc<RecomputeSpec<T>>>,
    ) -> Result<CellHandle<T>, AllocError> {
        let table = self.shared.table(device);

        // Best-effort budget headroom before the bytes land.
        let limit = *table.budget.lock();
        if let Some(limit) = limit {
            let target = limit.saturating_sub(bytes.min(limit));
            if !self.shared.shrink_to(device, target) {
                warn!("budget on {device} cannot make room for {bytes} new bytes");
            }
        }

        let addr = self.shared.allocate_under_capacity(device, bytes)?;
        let pool = AliasPool::new(
            Arc::clone(&self.shared),
            Arc::clone(&table),
            device,
            bytes,
            weight,
            addr,
            spec.clone(),
        );
        table.add_pool(addr, Arc::downgrade(&pool));
        let cell = ValueCell::new(Arc::clone(&pool), spec, Arc::new(value));
        pool.add_cell(&cell);
        trace!("registered pool {} on {device} ({bytes} bytes)", pool.identity());
        Ok(CellHandle::new(cell))
    }

    // ------- budget -------

    /// Sets the device's soft resident-bytes limit. Takes effect on the next
    /// registration or [`enforce`](Self::enforce) call.
    pub fn set_budget(&self, device: DeviceId, limit: usize) {
        *self.shared.table(device).budget.lock() = Some(limit);
        debug!("budget on {device} set to {limit} bytes");
    }

    /// Removes the device's budget.
    pub fn clear_budget(&self, device: DeviceId) {
        *self.shared.table(device).budget.lock() = None;
    }

    /// Current budget for the device, if any.
    pub fn budget(&self, device: DeviceId) -> Option<usize> {
        *self.shared.table(device).budget.lock()
    }

    /// Evicts until the device is under its budget.
    ///
    /// Returns an error when no eligible victim remains while still over;
    /// its `requested` field carries the remaining overage.
    pub fn enforce(&self, device: DeviceId) -> Result<(), AllocError> {
        let table = self.shared.table(device);
        let limit = match *table.budget.lock() {
            Some(limit) => limit,
            None => return Ok(()),
        };
        loop {
            let resident = self.shared.alloc.resident(device);
            if resident <= limit {
                return Ok(());
            }
            if !self.shared.evict_one(device) {
                warn!(
                    "budget enforcement exhausted on {device}: {resident} resident, {limit} allowed"
                );
                return Err(AllocError::new(device, resident - limit, resident));
            }
        }
    }

    // ------- reclamation -------

    /// Soft-evicts every currently eligible pool on the device in one sweep.
    /// Pinned, weight, locked, and in-use pools stay resident, and everything
    /// taken comes back on access. Returns the bytes released.
    pub fn force_reclaim(&self, device: DeviceId) -> usize {
        let mut freed = 0;
        for pool in self.shared.table(device).live_pools() {
            if pool.try_evict_eligible() {
                freed += pool.memory_size();
            }
        }
        debug!("forced reclaim on {device} released {freed} bytes");
        freed
    }

    /// Device teardown: force-destructs every tracked pool regardless of
    /// counters, pins, or weight status, drops the budget, and empties the
    /// pool index. Source values become unrecoverable; computed values come
    /// back on access. The device stays usable afterwards.
    pub fn clear_device(&self, device: DeviceId) {
        let table = self.shared.table(device);
        let mut freed = 0;
        for pool in table.live_pools() {
            freed += pool.force_evict_counting();
        }
        *table.budget.lock() = None;
        table.pools.lock().clear();
        debug!("cleared {device}: {freed} bytes released");
    }

    // ------- introspection -------

    /// Engine-wide event counters and timing accumulators.
    #[inline]
    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }

    /// Resident bytes on the device, as reported by the allocator.
    #[inline]
    pub fn resident(&self, device: DeviceId) -> usize {
        self.shared.alloc.resident(device)
    }

    /// Number of live tracked pools on the device.
    pub fn pool_count(&self, device: DeviceId) -> usize {
        self.shared.table(device).live_pools().len()
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

impl<T> std::fmt::Debug for RematEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RematEngine")
            .field("devices", &self.shared.tables.read().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
