//! # Alias Pools
//!
//! The unit of memory accounting: one or more value cells sharing a single
//! device memory block. The pool owns the reference-count state machine that
//! gates eviction, the eviction mechanics themselves, and the cost scoring
//! used by the budget enforcer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            AliasPool<T>                                  │
//! │                                                                          │
//! │  immutable:  device, memory_size, is_weight, identity addr, head spec    │
//! │                                                                          │
//! │  state (Mutex<PoolState>):                                               │
//! │    external_count   handles held by the host        ──┐                  │
//! │    lock_count       active use scopes                 │ all zero +       │
//! │    remat_pending    in-flight remats reading us     ──┤ !retain +        │
//! │    retain           pinned by the host                │ !is_weight       │
//! │    evicted          bytes currently freed             │   ⇒ auto         │
//! │    resident_addr    current allocator reservation   ──┘   destruct       │
//! │    last_used        staleness clock                                      │
//! │    cells            Weak<ValueCell>  (members)                           │
//! │    neighbors        Weak<AliasPool>  (cost coupling only)                │
//! │                                                                          │
//! │  ecn (Mutex<Option<EcnId>>): merged cost node while evicted              │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Eviction state machine
//!
//! ```text
//!                  evict(Soft)                     set_not_evicted
//!   RESIDENT ────────────────────────▶ EVICTED ────────────────────▶ RESIDENT
//!      │        seed+merge cost node      │       subtract head cost,
//!      │        free bytes                │       re-register in index
//!      │                                  │
//!      │ evict(Destruct)                  │ (cells keep their descriptor:
//!      ▼   = Soft + forget identity       │  get() rematerializes)
//!   DESTRUCTED                            ▼
//!      ▲                              ... get()
//!      └── evict(Force): teardown only, lenient, frees unconditionally
//! ```
//!
//! Soft and Destruct assert their preconditions (`!evicted`, no locks,
//! `memory_size > 0`, no outstanding cost node, head descriptor present);
//! violating them is an engine bug and panics. Force asserts nothing.
//!
//! ## Cost model
//!
//! ```text
//!   total = head baseline + Σ neighbor merged-node costs (per class, once)
//!   score = total_secs / (memory_size × staleness_secs)
//!   score ×= 1 + dependency_penalty × recompute_depth      (advisory)
//! ```
//!
//! Lower score ⇒ evicted earlier: cheap-to-recompute, large, stale pools go
//! first. The head baseline is zero while the descriptor's seeded cost node
//! is outstanding, so an evicted-and-merged chain never double-counts.
//!
//! ## Lock order
//!
//! `state` may be held while taking, one at a time: the engine's shared
//! forest lock, the device pool index lock, a neighbor's `ecn` slot, or a
//! member cell's buffer. Those four are leaves. Two `state` locks are never
//! held at once; neighbor inspection goes through `ecn` slots, never
//! neighbor `state`.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;

use crate::cell::ValueCell;
use crate::ds::EcnId;
use crate::manager::{DeviceTable, EngineShared};
use crate::remat::RecomputeSpec;
use crate::traits::{DeviceAddr, DeviceId};

/// Recursion cap for the advisory recompute-depth probe.
const DEP_PROBE_MAX_DEPTH: u32 = 32;

// ---------------------------------------------------------------------------
// EvictMode / PoolCounters
// ---------------------------------------------------------------------------

/// How an eviction disposes of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictMode {
    /// Reversible: free the bytes, record a merged cost node, keep the pool
    /// tracked so `get()` can rematerialize.
    Soft,
    /// Irreversible: soft eviction plus permanent removal from the pool
    /// index. Used once no future access is possible.
    Destruct,
    /// Teardown only: free whatever is resident, skip cost-node bookkeeping,
    /// tolerate any counter state.
    Force,
}

/// Point-in-time snapshot of a pool's counters, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounters {
    pub external: u32,
    pub locks: u32,
    pub remat_pending: u32,
    pub retain: bool,
    pub evicted: bool,
}

// ---------------------------------------------------------------------------
// PoolState
// ---------------------------------------------------------------------------

pub(crate) struct PoolState<T> {
    pub(crate) external_count: u32,
    pub(crate) lock_count: u32,
    pub(crate) remat_pending: u32,
    pub(crate) retain: bool,
    pub(crate) evicted: bool,
    /// One thread at a time runs the slow rematerialization path.
    pub(crate) rematerializing: bool,
    pub(crate) last_used: Instant,
    pub(crate) resident_addr: Option<DeviceAddr>,
    pub(crate) cells: Vec<Weak<ValueCell<T>>>,
    pub(crate) neighbors: Vec<Weak<AliasPool<T>>>,
    /// Latest completed advisory depth-probe result.
    dependency: u32,
    dep_probe: Option<Receiver<u32>>,
}

// ---------------------------------------------------------------------------
// AliasPool
// ---------------------------------------------------------------------------

/// Memory-accounting unit grouping the value cells that share one block.
///
/// Created by the engine's `register_*` operations; reached by the host
/// through [`CellHandle::pool`](crate::cell::CellHandle::pool). All mutation
/// goes through the engine except [`evict`](Self::evict), which is exposed
/// for host-driven checkpointing and carries the documented preconditions.
pub struct AliasPool<T> {
    pub(crate) shared: Arc<EngineShared<T>>,
    pub(crate) table: Arc<DeviceTable<T>>,
    device: DeviceId,
    bytes: usize,
    weight: bool,
    identity: DeviceAddr,
    head: Option<Arc<RecomputeSpec<T>>>,
    pub(crate) state: Mutex<PoolState<T>>,
    pub(crate) remat_done: Condvar,
    /// Merged cost node while evicted. Leaf lock: readable from a neighbor's
    /// eviction pass without touching this pool's `state`.
    ecn: Mutex<Option<EcnId>>,
}

impl<T> AliasPool<T> {
    pub(crate) fn new(
        shared: Arc<EngineShared<T>>,
        table: Arc<DeviceTable<T>>,
        device: DeviceId,
        bytes: usize,
        weight: bool,
        identity: DeviceAddr,
        head: Option<Arc<RecomputeSpec<T>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared,
            table,
            device,
            bytes,
            weight,
            identity,
            head,
            state: Mutex::new(PoolState {
                external_count: 0,
                lock_count: 0,
                remat_pending: 0,
                retain: false,
                evicted: false,
                rematerializing: false,
                last_used: Instant::now(),
                resident_addr: Some(identity),
                cells: Vec::new(),
                neighbors: Vec::new(),
                dependency: 0,
                dep_probe: None,
            }),
            remat_done: Condvar::new(),
            ecn: Mutex::new(None),
        })
    }

    /// Device this pool's memory is charged on.
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Size of the shared memory block in bytes.
    #[inline]
    pub fn memory_size(&self) -> usize {
        self.bytes
    }

    /// True for pools registered as weights (exempt from automatic
    /// destruction).
    #[inline]
    pub fn is_weight(&self) -> bool {
        self.weight
    }

    /// Stable index key: the address of this pool's first allocation.
    #[inline]
    pub fn identity(&self) -> DeviceAddr {
        self.identity
    }

    /// True while the pool's bytes are freed.
    #[inline]
    pub fn is_evicted(&self) -> bool {
        self.state.lock().evicted
    }

    /// Snapshot of the reference counters.
    pub fn counters(&self) -> PoolCounters {
        let st = self.state.lock();
        PoolCounters {
            external: st.external_count,
            locks: st.lock_count,
            remat_pending: st.remat_pending,
            retain: st.retain,
            evicted: st.evicted,
        }
    }

    pub(crate) fn head(&self) -> Option<&Arc<RecomputeSpec<T>>> {
        self.head.as_ref()
    }

    pub(crate) fn touch(&self) {
        self.state.lock().last_used = Instant::now();
    }

    /// Marks the pool as pinned: never automatically evicted or destructed.
    pub(crate) fn pin(&self) {
        self.state.lock().retain = true;
    }

    // ------- counter transitions -------

    pub(crate) fn acquire_external(&self) {
        self.state.lock().external_count += 1;
    }

    pub(crate) fn release_external(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.external_count > 0, "external_count underflow");
        st.external_count -= 1;
        self.maybe_destruct_locked(&mut st, false);
    }

    pub(crate) fn lock_use(&self) {
        self.state.lock().lock_count += 1;
    }

    pub(crate) fn unlock_use(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.lock_count > 0, "lock_count underflow");
        st.lock_count -= 1;
        self.maybe_destruct_locked(&mut st, false);
    }

    pub(crate) fn begin_remat_hold(&self) {
        self.state.lock().remat_pending += 1;
    }

    pub(crate) fn end_remat_hold(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.remat_pending > 0, "remat_pending underflow");
        st.remat_pending -= 1;
        self.maybe_destruct_locked(&mut st, true);
    }

    /// Zero-crossing check shared by every counter decrement: a pool nobody
    /// holds, locks, or reads is destructed on the spot. Weight and pinned
    /// pools are exempt; the remat path additionally honors the configured
    /// linger window for freshly rematerialized values.
    fn maybe_destruct_locked(&self, st: &mut PoolState<T>, from_remat: bool) {
        if st.evicted || st.retain || self.weight || st.rematerializing {
            return;
        }
        if st.external_count > 0 || st.lock_count > 0 || st.remat_pending > 0 {
            return;
        }
        if st.resident_addr.is_none() || self.head.is_none() || self.bytes == 0 {
            return;
        }
        if self.ecn.lock().is_some() {
            return;
        }
        if from_remat {
            let linger = self.shared.config.remat_linger;
            if !linger.is_zero() && st.last_used.elapsed() < linger {
                return;
            }
        }
        self.evict_locked(st, EvictMode::Destruct);
    }

    // ------- membership wiring -------

    pub(crate) fn add_neighbor(&self, other: &Arc<AliasPool<T>>) {
        if std::ptr::eq(self, Arc::as_ptr(other)) {
            return;
        }
        self.state.lock().neighbors.push(Arc::downgrade(other));
    }

    // ------- eviction -------

    /// Evicts the pool in the given mode.
    ///
    /// `Soft` and `Destruct` panic if the pool is already evicted, has
    /// outstanding locks, owns no bytes, carries a live merged cost node, or
    /// has no recompute descriptor. `Force` tolerates any state.
    pub fn evict(&self, mode: EvictMode) {
        let mut st = self.state.lock();
        self.evict_locked(&mut st, mode);
    }

    /// Cell-level eviction entry point: evicts softly unless the pool is
    /// already evicted or mid-rematerialization, in which case it is a no-op.
    pub(crate) fn evict_if_resident(&self) {
        let mut st = self.state.lock();
        if st.evicted || st.rematerializing {
            return;
        }
        self.evict_locked(&mut st, EvictMode::Soft);
    }

    /// Force-evicts and reports the bytes actually released, for reclaim
    /// accounting.
    pub(crate) fn force_evict_counting(&self) -> usize {
        let mut st = self.state.lock();
        let was_resident = st.resident_addr.is_some();
        self.evict_locked(&mut st, EvictMode::Force);
        if was_resident {
            self.bytes
        } else {
            0
        }
    }

    /// Evicts softly only if the pool is still eligible under its own lock,
    /// skipping (instead of panicking) when a racing handle made it
    /// ineligible since it was scored. Entry point for the budget enforcer
    /// and the manual reclaim sweep.
    pub(crate) fn try_evict_eligible(&self) -> bool {
        let mut st = self.state.lock();
        if !self.budget_eligible(&st) {
            return false;
        }
        self.evict_locked(&mut st, EvictMode::Soft);
        true
    }

    /// True when the budget enforcer may evict this pool right now.
    pub(crate) fn budget_candidate(&self) -> bool {
        self.budget_eligible(&self.state.lock())
    }

    fn budget_eligible(&self, st: &PoolState<T>) -> bool {
        self.bytes > 0
            && !st.evicted
            && !st.retain
            && !st.rematerializing
            && st.lock_count == 0
            && st.remat_pending == 0
            && !(self.weight && st.external_count > 0)
            && st.resident_addr.is_some()
            && self.head.is_some()
            && self.ecn.lock().is_none()
    }

    fn evict_locked(&self, st: &mut PoolState<T>, mode: EvictMode) {
        if mode == EvictMode::Force {
            let freed = st.resident_addr.take();
            let mut cleared = 0u64;
            if freed.is_some() {
                cleared = Self::clear_cells(st);
            }
            st.evicted = true;
            if let Some(addr) = freed {
                self.shared.alloc.free(self.device, addr);
                self.shared.metrics.record_pool_destruct(cleared);
                debug!(
                    "force-destructed pool {} on {} ({} bytes)",
                    self.identity, self.device, self.bytes
                );
            }
            self.table.erase_pool(self.identity);
            return;
        }

        assert!(
            !st.evicted,
            "evict on already-evicted pool {}",
            self.identity
        );
        assert!(
            !st.rematerializing,
            "evict on pool {} during rematerialization",
            self.identity
        );
        assert!(
            st.lock_count == 0,
            "evict on pool {} with {} outstanding locks",
            self.identity,
            st.lock_count
        );
        assert!(self.bytes > 0, "evict on zero-size pool {}", self.identity);
        assert!(
            self.ecn.lock().is_none(),
            "evict on pool {} with live merged cost node",
            self.identity
        );
        let head = match &self.head {
            Some(head) => head,
            None => panic!("evict on pool {} with no recompute descriptor", self.identity),
        };

        // Couple this pool's recompute cost with every live neighbor's.
        let neighbor_ids = Self::neighbor_ecn_locked(st);
        let seed = {
            let mut forest = self.shared.forest.lock();
            let seed = head.ecn_handle(&mut forest);
            for id in neighbor_ids {
                forest.merge(seed, id);
            }
            seed
        };
        *self.ecn.lock() = Some(seed);

        st.evicted = true;
        let cleared = Self::clear_cells(st);
        let addr = match st.resident_addr.take() {
            Some(addr) => addr,
            None => panic!("evict on pool {} with no resident bytes", self.identity),
        };
        self.shared.alloc.free(self.device, addr);

        match mode {
            EvictMode::Soft => {
                self.shared.metrics.record_pool_evict(cleared);
                debug!(
                    "evicted pool {} on {} ({} bytes, {} cells)",
                    self.identity, self.device, self.bytes, cleared
                );
            }
            EvictMode::Destruct => {
                self.table.erase_pool(self.identity);
                self.shared.metrics.record_pool_destruct(cleared);
                debug!(
                    "destructed pool {} on {} ({} bytes, {} cells)",
                    self.identity, self.device, self.bytes, cleared
                );
            }
            EvictMode::Force => unreachable!(),
        }
    }

    /// Clears every live member cell, pruning dead weak refs swap-with-last.
    fn clear_cells(st: &mut PoolState<T>) -> u64 {
        let mut cleared = 0u64;
        let mut i = 0;
        while i < st.cells.len() {
            match st.cells[i].upgrade() {
                Some(cell) => {
                    cell.clear();
                    cleared += 1;
                    i += 1;
                }
                None => {
                    st.cells.swap_remove(i);
                }
            }
        }
        cleared
    }

    /// Collects the merged cost nodes of all live neighbors, pruning dead
    /// weak refs swap-with-last. Duplicate class handles are fine: merge and
    /// summation both deduplicate by class.
    fn neighbor_ecn_locked(st: &mut PoolState<T>) -> Vec<EcnId> {
        let mut ids = Vec::new();
        let mut i = 0;
        while i < st.neighbors.len() {
            match st.neighbors[i].upgrade() {
                Some(neighbor) => {
                    if let Some(id) = *neighbor.ecn.lock() {
                        ids.push(id);
                    }
                    i += 1;
                }
                None => {
                    st.neighbors.swap_remove(i);
                }
            }
        }
        ids
    }

    // ------- un-eviction -------

    /// Transitions the pool back to resident after a cell rematerialized.
    ///
    /// Caller holds the state lock, has already stored the fresh residency
    /// address, and clears the head descriptor's seed cache afterwards.
    pub(crate) fn set_not_evicted_locked(self: &Arc<Self>, st: &mut PoolState<T>) {
        if !st.evicted {
            return;
        }
        st.evicted = false;
        let head = match &self.head {
            Some(head) => head,
            None => panic!(
                "un-evict on pool {} with no recompute descriptor",
                self.identity
            ),
        };
        // Withdraw this pool's share from the merged chain before leaving it.
        let node = self.ecn.lock().take();
        if let Some(id) = node {
            let mut forest = self.shared.forest.lock();
            let remaining = forest.get(id).saturating_sub(head.compute_cost());
            forest.update(id, remaining);
        }
        self.table.add_pool(self.identity, Arc::downgrade(self));
        trace!("pool {} back to resident on {}", self.identity, self.device);
    }

    // ------- cost scoring -------

    /// Eviction score at `now`: higher means more valuable to keep.
    pub(crate) fn cost(&self, now: Instant) -> f64 {
        let timer = self.shared.config.profile.then(Instant::now);

        let mut st = self.state.lock();
        self.poll_dependency(&mut st);
        let head = match &self.head {
            Some(head) => head,
            None => panic!("cost on pool {} with no recompute descriptor", self.identity),
        };
        let neighbor_ids = Self::neighbor_ecn_locked(&mut st);
        let total = {
            let mut forest = self.shared.forest.lock();
            let mut total = head.baseline_cost();
            let mut classes = FxHashSet::default();
            for id in neighbor_ids {
                let root = forest.find(id);
                if classes.insert(root) {
                    total = total.saturating_add(forest.get(root));
                }
            }
            total
        };
        let staleness = now
            .saturating_duration_since(st.last_used)
            .as_secs_f64()
            .max(1e-9);
        let mut score = total.as_secs_f64() / (self.bytes as f64 * staleness);
        let penalty = self.shared.config.dependency_penalty;
        if penalty > 0.0 {
            score *= 1.0 + penalty * f64::from(st.dependency);
        }
        drop(st);

        if let Some(start) = timer {
            self.shared
                .metrics
                .add_cost_ns(start.elapsed().as_nanos() as u64);
        }
        trace!("scored pool {} at {:.3e}", self.identity, score);
        score
    }

    /// Reads the advisory depth probe if it completed; never blocks.
    fn poll_dependency(&self, st: &mut PoolState<T>) {
        if let Some(rx) = &st.dep_probe {
            match rx.try_recv() {
                Ok(depth) => {
                    st.dependency = depth;
                    st.dep_probe = None;
                }
                Err(TryRecvError::Disconnected) => {
                    st.dep_probe = None;
                }
                Err(TryRecvError::Empty) => {}
            }
        }
    }
}

impl<T: Send + Sync + 'static> AliasPool<T> {
    pub(crate) fn add_cell(self: &Arc<Self>, cell: &Arc<ValueCell<T>>) {
        self.state.lock().cells.push(Arc::downgrade(cell));
        if self.shared.config.dependency_penalty > 0.0 {
            self.refresh_dependency();
        }
    }

    /// Fire-and-forget probe of the newest cell's recompute depth.
    ///
    /// The result is read opportunistically by `cost()`; until it lands the
    /// neutral value (0) applies. Spawn failure is ignored: the signal is
    /// advisory.
    pub(crate) fn refresh_dependency(self: &Arc<Self>) {
        let newest = {
            let st = self.state.lock();
            match st.cells.last() {
                Some(weak) => weak.clone(),
                None => return,
            }
        };
        let (tx, rx) = mpsc::sync_channel(1);
        self.state.lock().dep_probe = Some(rx);
        let _ = thread::Builder::new()
            .name("rematkit-precheck".to_string())
            .spawn(move || {
                let depth = newest
                    .upgrade()
                    .map(|cell| cell.recompute_depth(DEP_PROBE_MAX_DEPTH))
                    .unwrap_or(0);
                let _ = tx.try_send(depth);
            });
    }
}

impl<T> Drop for AliasPool<T> {
    fn drop(&mut self) {
        // Last owner is gone: return any resident bytes to the allocator and
        // drop out of the index. Uncontended by construction.
        let mut st = self.state.lock();
        self.evict_locked(&mut st, EvictMode::Force);
    }
}

impl<T> std::fmt::Debug for AliasPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("AliasPool")
            .field("device", &self.device)
            .field("bytes", &self.bytes)
            .field("weight", &self.weight)
            .field("identity", &self.identity)
            .field("evicted", &st.evicted)
            .field("external", &st.external_count)
            .field("locks", &st.lock_count)
            .field("remat_pending", &st.remat_pending)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EngineBuilder;
    use crate::manager::RematEngine;
    use crate::traits::{DeviceAllocator, MeterAllocator};

    const DEV: DeviceId = DeviceId::new(0);
    const OTHER: DeviceId = DeviceId::new(1);

    fn engine() -> (RematEngine<Vec<u8>>, Arc<MeterAllocator>) {
        let meter = Arc::new(MeterAllocator::unbounded());
        let engine = EngineBuilder::new(meter.clone()).build();
        (engine, meter)
    }

    fn payload(n: usize) -> Vec<u8> {
        vec![0xab; n]
    }

    mod counters {
        use super::*;

        #[test]
        fn test_release_external_destructs_computed_pool() {
            let (engine, meter) = engine();
            let handle = engine
                .register_computed(|_| Ok(payload(64)), &[], payload(64), 64, DEV, Duration::from_millis(1))
                .unwrap();
            assert_eq!(meter.resident(DEV), 64);

            drop(handle);
            assert_eq!(meter.resident(DEV), 0, "zero-crossing must free the bytes");
            assert_eq!(engine.metrics().snapshot().destruct_count, 1);
        }

        #[test]
        fn test_clone_tracks_external_count() {
            let (engine, meter) = engine();
            let a = engine
                .register_computed(|_| Ok(payload(8)), &[], payload(8), 8, DEV, Duration::from_millis(1))
                .unwrap();
            let b = a.clone();
            assert_eq!(a.pool().counters().external, 2);

            drop(a);
            assert_eq!(meter.resident(DEV), 8, "one holder remains");
            drop(b);
            assert_eq!(meter.resident(DEV), 0);
        }

        #[test]
        fn test_use_lock_defers_destruct_until_unlock() {
            let (engine, meter) = engine();
            let handle = engine
                .register_computed(|_| Ok(payload(32)), &[], payload(32), 32, DEV, Duration::from_millis(1))
                .unwrap();
            let guard = handle.lock_for_use().unwrap();

            drop(handle);
            assert_eq!(meter.resident(DEV), 32, "locked pool must stay resident");

            drop(guard);
            assert_eq!(meter.resident(DEV), 0, "unlock zero-crossing must destruct");
        }

        #[test]
        fn test_weight_pool_is_never_auto_destructed() {
            let (engine, meter) = engine();
            let weight = engine.register_weight(payload(16), 16, DEV).unwrap();
            let _consumer = engine
                .register_computed(
                    |inputs| Ok(inputs[0].as_ref().clone()),
                    &[&weight],
                    payload(16),
                    16,
                    DEV,
                    Duration::from_millis(1),
                )
                .unwrap();

            drop(weight);
            assert_eq!(
                meter.resident(DEV),
                32,
                "weights are exempt from the release zero-crossing"
            );
        }

        #[test]
        fn test_pinned_pool_survives_release() {
            let (engine, meter) = engine();
            let handle = engine
                .register_computed(|_| Ok(payload(16)), &[], payload(16), 16, DEV, Duration::from_millis(1))
                .unwrap();
            let _consumer = engine
                .register_computed(
                    |inputs| Ok(inputs[0].as_ref().clone()),
                    &[&handle],
                    payload(16),
                    16,
                    DEV,
                    Duration::from_millis(1),
                )
                .unwrap();
            handle.pin();

            drop(handle);
            assert_eq!(meter.resident(DEV), 32, "pinned pool must skip the destruct");
        }

        #[test]
        fn test_source_value_without_descriptor_is_not_destructed() {
            let (engine, meter) = engine();
            let handle = engine.register_value(payload(16), 16, DEV).unwrap();
            drop(handle);
            // No descriptor, so the zero-crossing cannot destruct-evict; the
            // bytes are reclaimed by the pool's own drop.
            assert_eq!(meter.resident(DEV), 0);
        }
    }

    mod eviction {
        use super::*;

        #[test]
        fn test_soft_evict_frees_and_seeds_cost_node() {
            let (engine, meter) = engine();
            let handle = engine
                .register_computed(|_| Ok(payload(128)), &[], payload(128), 128, DEV, Duration::from_millis(4))
                .unwrap();
            let pool = handle.pool().clone();

            pool.evict(EvictMode::Soft);
            assert!(pool.is_evicted());
            assert!(!handle.is_materialized());
            assert_eq!(meter.resident(DEV), 0);

            let id = pool.ecn.lock().unwrap();
            assert_eq!(
                pool.shared.forest.lock().get(id),
                Duration::from_millis(4),
                "seed must carry the head compute cost"
            );
        }

        #[test]
        #[should_panic(expected = "already-evicted")]
        fn test_double_evict_panics() {
            let (engine, _meter) = engine();
            let handle = engine
                .register_computed(|_| Ok(payload(8)), &[], payload(8), 8, DEV, Duration::from_millis(1))
                .unwrap();
            handle.pool().evict(EvictMode::Soft);
            handle.pool().evict(EvictMode::Soft);
        }

        #[test]
        #[should_panic(expected = "outstanding locks")]
        fn test_evict_with_locks_panics() {
            let (engine, _meter) = engine();
            let handle = engine
                .register_computed(|_| Ok(payload(8)), &[], payload(8), 8, DEV, Duration::from_millis(1))
                .unwrap();
            let _guard = handle.lock_for_use().unwrap();
            handle.pool().evict(EvictMode::Soft);
        }

        #[test]
        fn test_neighbor_costs_merge_on_chained_evict() {
            let (engine, _meter) = engine();
            let a = engine
                .register_computed(|_| Ok(payload(10)), &[], payload(10), 10, DEV, Duration::from_millis(10))
                .unwrap();
            let b = engine
                .register_computed(
                    |inputs| Ok(inputs[0].as_ref().clone()),
                    &[&a],
                    payload(10),
                    10,
                    DEV,
                    Duration::from_millis(30),
                )
                .unwrap();

            a.pool().evict(EvictMode::Soft);
            b.pool().evict(EvictMode::Soft);

            let id = b.pool().ecn.lock().unwrap();
            assert_eq!(
                b.pool().shared.forest.lock().get(id),
                Duration::from_millis(40),
                "chained eviction must sum the coupled costs"
            );
        }

        #[test]
        fn test_cross_device_chain_merges_in_shared_forest() {
            let (engine, meter) = engine();
            let a = engine
                .register_computed(|_| Ok(payload(10)), &[], payload(10), 10, DEV, Duration::from_millis(10))
                .unwrap();
            // Churn the arena so node indices seen from the two devices
            // cannot line up by accident.
            a.evict();
            a.get().unwrap();
            a.evict();

            let b = engine
                .register_computed(
                    |inputs| Ok(inputs[0].as_ref().clone()),
                    &[&a],
                    payload(10),
                    10,
                    OTHER,
                    Duration::from_millis(30),
                )
                .unwrap();
            b.evict();

            let id = b.pool().ecn.lock().unwrap();
            assert_eq!(
                b.pool().shared.forest.lock().get(id),
                Duration::from_millis(40),
                "a chain spanning devices must couple in the one shared arena"
            );

            assert_eq!(*b.get().unwrap(), payload(10));
            assert!(a.is_materialized(), "restoring b must restore its input");
            assert_eq!(meter.resident(DEV), 10);
            assert_eq!(meter.resident(OTHER), 10);
        }

        #[test]
        fn test_unevict_withdraws_head_share() {
            let (engine, _meter) = engine();
            let a = engine
                .register_computed(|_| Ok(payload(10)), &[], payload(10), 10, DEV, Duration::from_millis(10))
                .unwrap();
            let b = engine
                .register_computed(
                    |inputs| Ok(inputs[0].as_ref().clone()),
                    &[&a],
                    payload(10),
                    10,
                    DEV,
                    Duration::from_millis(30),
                )
                .unwrap();

            a.pool().evict(EvictMode::Soft);
            b.pool().evict(EvictMode::Soft);
            a.get().unwrap();

            let id = b.pool().ecn.lock().unwrap();
            assert_eq!(
                b.pool().shared.forest.lock().get(id),
                Duration::from_millis(30),
                "rematerialized member must withdraw its own head cost"
            );
        }
    }

    mod cost_model {
        use super::*;

        #[test]
        fn test_cheap_large_pool_scores_below_costly_small_pool() {
            let (engine, _meter) = engine();
            // P: large and cheap to recompute. Q: small and expensive.
            let p = engine
                .register_computed(|_| Ok(payload(100)), &[], payload(100), 100, DEV, Duration::from_millis(10))
                .unwrap();
            let q = engine
                .register_computed(|_| Ok(payload(50)), &[], payload(50), 50, DEV, Duration::from_millis(100))
                .unwrap();

            std::thread::sleep(Duration::from_millis(5));
            let now = Instant::now();
            assert!(
                p.pool().cost(now) < q.pool().cost(now),
                "large cheap pools must rank first for eviction"
            );
        }

        #[test]
        fn test_dependency_penalty_raises_score() {
            let meter = Arc::new(MeterAllocator::unbounded());
            let mut config = crate::config::EngineConfig::default();
            config.dependency_penalty = 1.0;
            let engine: RematEngine<Vec<u8>> = EngineBuilder::new(meter)
                .config(config)
                .try_build()
                .unwrap();

            let handle = engine
                .register_computed(|_| Ok(payload(10)), &[], payload(10), 10, DEV, Duration::from_millis(10))
                .unwrap();
            let pool = handle.pool().clone();

            std::thread::sleep(Duration::from_millis(5));
            let now = Instant::now();
            let base = pool.cost(now);
            {
                // Pin the depth; drop any probe still in flight so the second
                // scoring pass cannot overwrite it.
                let mut st = pool.state.lock();
                st.dependency = 3;
                st.dep_probe = None;
            }
            let penalized = pool.cost(now);
            assert!(
                (penalized / base - 4.0).abs() < 1e-6,
                "penalty 1.0 with depth 3 must quadruple the score"
            );
        }

        #[test]
        fn test_staleness_lowers_score() {
            let (engine, _meter) = engine();
            let handle = engine
                .register_computed(|_| Ok(payload(10)), &[], payload(10), 10, DEV, Duration::from_millis(10))
                .unwrap();
            let pool = handle.pool().clone();

            std::thread::sleep(Duration::from_millis(2));
            let earlier = pool.cost(Instant::now());
            std::thread::sleep(Duration::from_millis(10));
            let later = pool.cost(Instant::now());
            assert!(later < earlier, "stale pools must score lower");
        }
    }
}
