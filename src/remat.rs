//! Recompute descriptors: how to regenerate an evicted value.
//!
//! A [`RecomputeSpec`] is recorded when the host registers a computed value:
//! the operation closure, the input cells it reads, and the host's estimate
//! of the operation's compute cost. The descriptor is immutable; the one
//! mutable slot is a cached merged-cost-node seed, which ties the
//! evict/un-evict cycle together:
//!
//! - On soft eviction the owning pool asks the descriptor for its cost node
//!   ([`ecn_handle`](RecomputeSpec::ecn_handle)); the first call seeds a
//!   fresh node carrying `compute_cost` and caches it.
//! - While the seed is outstanding, [`baseline_cost`](RecomputeSpec::baseline_cost)
//!   reports zero: the cost already lives in the merged node, and counting it
//!   again would double-charge the pool in `cost()`.
//! - When a rematerialization commits, the cache is cleared
//!   ([`clear_ecn`](RecomputeSpec::clear_ecn)) and the baseline reverts to
//!   `compute_cost`.
//!
//! Input handles are strong references: a descriptor keeps the cells it
//! needs alive (evicted or not), which is what makes recursive
//! rematerialization well-defined.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cell::ValueCell;
use crate::ds::{EcnForest, EcnId};
use crate::error::RematError;

/// Operation closure replayed to regenerate a value from materialized inputs.
///
/// The host returns either the recomputed value or a message describing why
/// the operation failed; the engine wraps the latter in
/// [`RematError::Op`](crate::error::RematError::Op).
pub type RecomputeFn<T> = Arc<dyn Fn(&[Arc<T>]) -> Result<T, String> + Send + Sync>;

/// Immutable record of how to regenerate one value.
///
/// Built by [`RematEngine::register_computed`](crate::manager::RematEngine::register_computed);
/// owned by the output cell and by the output pool as its cost baseline.
pub struct RecomputeSpec<T> {
    inputs: Vec<Arc<ValueCell<T>>>,
    op: RecomputeFn<T>,
    compute_cost: Duration,
    ecn_seed: Mutex<Option<EcnId>>,
}

impl<T> RecomputeSpec<T> {
    pub(crate) fn new(
        op: RecomputeFn<T>,
        inputs: Vec<Arc<ValueCell<T>>>,
        compute_cost: Duration,
    ) -> Self {
        Self {
            inputs,
            op,
            compute_cost,
            ecn_seed: Mutex::new(None),
        }
    }

    /// Input cells read by the recorded operation, in recorded order.
    #[inline]
    pub(crate) fn inputs(&self) -> &[Arc<ValueCell<T>>] {
        &self.inputs
    }

    /// Host-estimated cost of one replay of the operation.
    #[inline]
    pub fn compute_cost(&self) -> Duration {
        self.compute_cost
    }

    /// Replays the operation against materialized input values.
    pub(crate) fn invoke(&self, materialized: &[Arc<T>]) -> Result<T, RematError> {
        (self.op)(materialized).map_err(RematError::Op)
    }

    /// Cost contribution of this descriptor to its pool's `cost()`.
    ///
    /// Zero while the seeded cost node is outstanding (the cost is already
    /// accumulated in the merged class), `compute_cost` otherwise.
    pub(crate) fn baseline_cost(&self) -> Duration {
        if self.ecn_seed.lock().is_some() {
            Duration::ZERO
        } else {
            self.compute_cost
        }
    }

    /// Returns the cached cost-node seed, creating and caching it on first
    /// use. Caller holds the device forest lock.
    pub(crate) fn ecn_handle(&self, forest: &mut EcnForest) -> EcnId {
        let mut seed = self.ecn_seed.lock();
        match *seed {
            Some(id) => id,
            None => {
                let id = forest.seed(self.compute_cost);
                *seed = Some(id);
                id
            }
        }
    }

    /// Drops the cached seed after a successful rematerialization.
    pub(crate) fn clear_ecn(&self) {
        *self.ecn_seed.lock() = None;
    }
}

impl<T> fmt::Debug for RecomputeSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecomputeSpec")
            .field("inputs", &self.inputs.len())
            .field("compute_cost", &self.compute_cost)
            .field("ecn_seed", &*self.ecn_seed.lock())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
