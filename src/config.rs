//! Engine configuration.
//!
//! All runtime toggles live here and are passed in at construction; the
//! engine keeps no ambient mutable globals. Fields map to eviction-policy
//! knobs of the enforcer and the pool state machine:
//!
//! | Field                 | Type            | Default | Description                                  |
//! |-----------------------|-----------------|---------|----------------------------------------------|
//! | `profile`             | `bool`          | false   | Charge timing accumulators in the metrics    |
//! | `sample_rate`         | `Option<f64>`   | None    | Score a random candidate sample per round    |
//! | `min_evictable_bytes` | `usize`         | 0       | Enforcer skips pools smaller than this       |
//! | `dependency_penalty`  | `f64`           | 0.0     | Weight of the advisory recompute-depth signal|
//! | `remat_linger`        | `Duration`      | 0       | Grace window before a spent remat is freed   |
//!
//! ## Example Usage
//!
//! ```
//! use std::time::Duration;
//!
//! use rematkit::config::EngineConfig;
//!
//! let mut config = EngineConfig::default();
//! config.profile = true;
//! config.min_evictable_bytes = 1024;
//! config.remat_linger = Duration::from_millis(5);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration for a [`RematEngine`](crate::manager::RematEngine).
///
/// Construct with [`EngineConfig::default`], adjust fields, and hand to
/// [`EngineBuilder`](crate::builder::EngineBuilder), which validates via
/// [`EngineConfig::validate`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Charge nanosecond accumulators (`base_compute_ns`, `remat_compute_ns`,
    /// `search_ns`, `cost_ns`) in the engine metrics. Event counters are
    /// always live regardless of this flag.
    pub profile: bool,
    /// When set, each enforcement round scores only a random fraction of the
    /// eligible pools instead of all of them. Must lie in `(0, 1]`. Trades
    /// victim optimality for scan time on very large pool populations.
    pub sample_rate: Option<f64>,
    /// Pools with `memory_size` below this are never selected by the budget
    /// enforcer. They remain subject to the automatic destruct triggers.
    pub min_evictable_bytes: usize,
    /// Weight of the advisory recompute-depth signal in cost scoring. Zero
    /// disables the cross-pool dependency precheck entirely. Deeply
    /// depended-upon pools score higher (are kept longer) as this grows.
    pub dependency_penalty: f64,
    /// Grace window for freshly rematerialized pools: when the last pending
    /// rematerialization releases its hold, the pool is destructed
    /// immediately only if it was last used at least this long ago.
    pub remat_linger: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: false,
            sample_rate: None,
            min_evictable_bytes: 0,
            dependency_penalty: 0.0,
            remat_linger: Duration::ZERO,
        }
    }
}

impl EngineConfig {
    /// Checks every field against its documented range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(rate) = self.sample_rate {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(ConfigError::new(format!(
                    "sample_rate must be in (0, 1], got {rate}"
                )));
            }
        }
        if !self.dependency_penalty.is_finite() || self.dependency_penalty < 0.0 {
            return Err(ConfigError::new(format!(
                "dependency_penalty must be finite and >= 0, got {}",
                self.dependency_penalty
            )));
        }
        Ok(())
    }

    /// True when the enforcer should consider a pool of `bytes` at all.
    #[inline]
    pub(crate) fn admits_size(&self, bytes: usize) -> bool {
        bytes >= self.min_evictable_bytes
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn sample_rate_bounds() {
        let mut config = EngineConfig::default();
        config.sample_rate = Some(1.0);
        assert!(config.validate().is_ok());

        config.sample_rate = Some(0.0);
        assert!(config.validate().is_err());

        config.sample_rate = Some(1.5);
        assert!(config.validate().is_err());

        config.sample_rate = Some(f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn dependency_penalty_must_be_finite_nonnegative() {
        let mut config = EngineConfig::default();
        config.dependency_penalty = 100.0;
        assert!(config.validate().is_ok());

        config.dependency_penalty = -0.5;
        assert!(config.validate().is_err());

        config.dependency_penalty = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn size_admission_threshold() {
        let mut config = EngineConfig::default();
        assert!(config.admits_size(0));
        config.min_evictable_bytes = 64;
        assert!(!config.admits_size(63));
        assert!(config.admits_size(64));
    }
}
