//! # Value Cells and Handles
//!
//! A [`ValueCell`] is one tracked value: a buffer slot plus the recompute
//! descriptor that can refill it. [`CellHandle`] is the host's owning view;
//! its clone/drop lifecycle drives the pool's `external_count`, and its
//! [`get`](CellHandle::get) transparently rematerializes evicted values.
//!
//! Rematerialization is coalesced per pool: one thread claims the pool's
//! `rematerializing` flag and runs the recompute, while concurrent readers
//! block on the pool's condvar and pick up the committed buffer. Inputs are
//! pinned with use-locks *before* they are materialized, so no eviction can
//! slip in between an input coming back and the recompute reading it.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::RematError;
use crate::pool::AliasPool;
use crate::remat::RecomputeSpec;
use crate::traits::DeviceId;

// ---------------------------------------------------------------------------
// ValueCell
// ---------------------------------------------------------------------------

/// One tracked value inside an alias pool.
///
/// The buffer slot is empty while the pool is evicted (and for sibling cells
/// of a pool where only one member has been rematerialized so far). The
/// recompute descriptor is `None` for source values, which therefore cannot
/// be rematerialized.
pub struct ValueCell<T> {
    pool: Arc<AliasPool<T>>,
    remat: Option<Arc<RecomputeSpec<T>>>,
    buf: Mutex<Option<Arc<T>>>,
}

impl<T> ValueCell<T> {
    pub(crate) fn new(
        pool: Arc<AliasPool<T>>,
        remat: Option<Arc<RecomputeSpec<T>>>,
        value: Arc<T>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            remat,
            buf: Mutex::new(Some(value)),
        })
    }

    #[inline]
    pub(crate) fn pool(&self) -> &Arc<AliasPool<T>> {
        &self.pool
    }

    #[inline]
    pub(crate) fn spec(&self) -> Option<&Arc<RecomputeSpec<T>>> {
        self.remat.as_ref()
    }

    /// True while this cell's buffer is filled.
    #[inline]
    pub(crate) fn is_materialized(&self) -> bool {
        self.buf.lock().is_some()
    }

    /// Empties the buffer slot. Called by the pool during eviction.
    pub(crate) fn clear(&self) {
        *self.buf.lock() = None;
    }

    /// Number of evicted ancestors a recompute of this cell would have to
    /// restore first, capped at `cap`. Resident inputs contribute nothing.
    /// Advisory only: reads racy residency without any pool lock.
    pub(crate) fn recompute_depth(&self, cap: u32) -> u32 {
        if cap == 0 {
            return 0;
        }
        let Some(spec) = &self.remat else {
            return 0;
        };
        let mut depth = 0;
        for input in spec.inputs() {
            if !input.is_materialized() {
                depth = depth.max(1 + input.recompute_depth(cap - 1));
            }
        }
        depth
    }

    /// Returns the value, rematerializing it first if the pool is evicted.
    ///
    /// Panics if the value is gone and carries no recompute descriptor; that
    /// state is reachable only through contract violations (accessing a
    /// source value after device teardown).
    pub(crate) fn get(self: &Arc<Self>) -> Result<Arc<T>, RematError> {
        let was_evicted = loop {
            let mut st = self.pool.state.lock();
            if let Some(value) = &*self.buf.lock() {
                st.last_used = Instant::now();
                return Ok(value.clone());
            }
            if !st.rematerializing {
                st.rematerializing = true;
                break st.evicted;
            }
            // Another thread is recomputing this pool; pick up its result.
            self.pool.remat_done.wait(&mut st);
        };

        let guard = RematFlagGuard { pool: &*self.pool };
        let result = self.rematerialize(was_evicted);
        if let Err(err) = &result {
            self.pool.shared.metrics.record_remat_failure();
            warn!(
                "rematerialization failed on pool {}: {err}",
                self.pool.identity()
            );
        }
        drop(guard);
        result
    }

    /// Slow path. The caller holds the pool's `rematerializing` flag, which
    /// keeps the pool's evicted/resident status frozen until commit.
    fn rematerialize(self: &Arc<Self>, was_evicted: bool) -> Result<Arc<T>, RematError> {
        let spec = match &self.remat {
            Some(spec) => Arc::clone(spec),
            None => panic!(
                "get() on evicted value of pool {} with no recompute descriptor",
                self.pool.identity()
            ),
        };

        // Pin every input before touching any of their values.
        let holds: Vec<InputHold<T>> = spec.inputs().iter().map(InputHold::acquire).collect();
        let mut args = Vec::with_capacity(holds.len());
        for hold in &holds {
            args.push(hold.materialize()?);
        }

        let started = Instant::now();
        let value = Arc::new(spec.invoke(&args)?);
        let elapsed = started.elapsed();

        let shared = &self.pool.shared;
        if shared.config.profile {
            shared
                .metrics
                .add_remat_compute_ns(elapsed.as_nanos() as u64);
        }

        if was_evicted {
            // Restoring an evicted value must never evict somebody else to
            // make room; only true capacity exhaustion triggers reclaim.
            let addr = shared.allocate_under_capacity(self.pool.device(), self.pool.memory_size())?;
            let mut st = self.pool.state.lock();
            st.resident_addr = Some(addr);
            *self.buf.lock() = Some(Arc::clone(&value));
            self.pool.set_not_evicted_locked(&mut st);
            st.last_used = Instant::now();
        } else {
            // Sibling refill: the pool already owns its bytes.
            let mut st = self.pool.state.lock();
            *self.buf.lock() = Some(Arc::clone(&value));
            st.last_used = Instant::now();
        }

        spec.clear_ecn();
        shared.metrics.record_remat();
        debug!("rematerialized value on pool {}", self.pool.identity());
        Ok(value)
    }
}

impl<T> std::fmt::Debug for ValueCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCell")
            .field("materialized", &self.is_materialized())
            .field("has_descriptor", &self.remat.is_some())
            .finish_non_exhaustive()
    }
}

/// Clears the pool's `rematerializing` flag and wakes waiters on every exit
/// path, including panics out of the recompute op.
struct RematFlagGuard<'a, T> {
    pool: &'a AliasPool<T>,
}

impl<T> Drop for RematFlagGuard<'_, T> {
    fn drop(&mut self) {
        let mut st = self.pool.state.lock();
        st.rematerializing = false;
        drop(st);
        self.pool.remat_done.notify_all();
    }
}

// ---------------------------------------------------------------------------
// InputHold
// ---------------------------------------------------------------------------

/// Use-lock on a recompute input, held from before the input is materialized
/// until after the dependent value committed. If the input was evicted at
/// acquire time it also carries a remat-pending hold, whose release honors
/// the configured linger window.
struct InputHold<T> {
    cell: Arc<ValueCell<T>>,
    remat_hold: bool,
}

impl<T> InputHold<T> {
    fn acquire(cell: &Arc<ValueCell<T>>) -> Self {
        cell.pool.lock_use();
        let remat_hold = cell.pool.state.lock().evicted;
        if remat_hold {
            cell.pool.begin_remat_hold();
        }
        Self {
            cell: Arc::clone(cell),
            remat_hold,
        }
    }

    fn materialize(&self) -> Result<Arc<T>, RematError> {
        self.cell.get()
    }
}

impl<T> Drop for InputHold<T> {
    fn drop(&mut self) {
        // The remat hold drops last so the final zero-crossing sees it and
        // applies the linger window.
        self.cell.pool.unlock_use();
        if self.remat_hold {
            self.cell.pool.end_remat_hold();
        }
    }
}

// ---------------------------------------------------------------------------
// CellHandle
// ---------------------------------------------------------------------------

/// Owning host handle to a tracked value.
///
/// Cloning and dropping handles drives the pool's `external_count`; when the
/// last handle (and every other holder) is gone the pool destructs itself.
/// All access goes through [`get`](Self::get), which transparently
/// rematerializes evicted values.
pub struct CellHandle<T> {
    cell: Arc<ValueCell<T>>,
}

impl<T> CellHandle<T> {
    pub(crate) fn new(cell: Arc<ValueCell<T>>) -> Self {
        cell.pool.acquire_external();
        Self { cell }
    }

    #[inline]
    pub(crate) fn cell(&self) -> &Arc<ValueCell<T>> {
        &self.cell
    }

    /// The pool this value is accounted in.
    #[inline]
    pub fn pool(&self) -> &Arc<AliasPool<T>> {
        self.cell.pool()
    }

    /// Returns the value, rematerializing it first if it was evicted.
    pub fn get(&self) -> Result<Arc<T>, RematError> {
        self.cell.get()
    }

    /// Frees this value's bytes, recording the merged cost node that lets
    /// [`get`](Self::get) bring it back later. No-op when already evicted.
    ///
    /// Panics if the pool holds outstanding use-locks; evicting a value that
    /// is an input to a running operation is a contract violation.
    pub fn evict(&self) {
        self.cell.pool().evict_if_resident();
    }

    /// True while the value is resident; false after eviction.
    #[inline]
    pub fn is_materialized(&self) -> bool {
        self.cell.is_materialized()
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.cell.pool().device()
    }

    #[inline]
    pub fn memory_size(&self) -> usize {
        self.cell.pool().memory_size()
    }

    /// Exempts the pool from automatic eviction and destruction.
    pub fn pin(&self) {
        self.cell.pool().pin();
    }

    /// Materializes the value and pins its pool, for handing the buffer to
    /// code outside the engine's control.
    pub fn export(&self) -> Result<Arc<T>, RematError> {
        let value = self.cell.get()?;
        self.cell.pool().pin();
        Ok(value)
    }

    /// Materializes the value and holds a use-lock on its pool until the
    /// returned guard drops. While any guard is live the pool cannot be
    /// evicted.
    pub fn lock_for_use(&self) -> Result<UseGuard<T>, RematError> {
        self.cell.pool().lock_use();
        match self.cell.get() {
            Ok(value) => Ok(UseGuard {
                cell: Arc::clone(&self.cell),
                value,
            }),
            Err(err) => {
                self.cell.pool().unlock_use();
                Err(err)
            }
        }
    }
}

impl<T> Clone for CellHandle<T> {
    fn clone(&self) -> Self {
        self.cell.pool.acquire_external();
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Drop for CellHandle<T> {
    fn drop(&mut self) {
        self.cell.pool.release_external();
    }
}

impl<T> std::fmt::Debug for CellHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellHandle")
            .field("device", &self.device())
            .field("memory_size", &self.memory_size())
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UseGuard
// ---------------------------------------------------------------------------

/// Use-scope over a materialized value. Dereferences to the value; dropping
/// it releases the pool's use-lock.
pub struct UseGuard<T> {
    cell: Arc<ValueCell<T>>,
    value: Arc<T>,
}

impl<T> UseGuard<T> {
    /// Shared reference to the guarded value.
    #[inline]
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }
}

impl<T> std::ops::Deref for UseGuard<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for UseGuard<T> {
    fn drop(&mut self) {
        self.cell.pool().unlock_use();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
