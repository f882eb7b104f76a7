//! Error types for the rematkit library.
//!
//! ## Key Components
//!
//! - [`AllocError`]: Returned when the device allocator cannot produce memory,
//!   even after eviction. Recoverable upstream; carries the device, the
//!   requested size, and the bytes resident at the time of failure.
//! - [`RematError`]: Returned when an evicted value cannot be rematerialized,
//!   either because allocation failed ([`RematError::Alloc`]) or because the
//!   recorded host operation failed ([`RematError::Op`]).
//! - [`ConfigError`]: Returned when engine configuration parameters are
//!   invalid (e.g. out-of-range sample rates, negative penalties).
//!
//! Broken internal invariants (double eviction, eviction with live locks,
//! recomputing without a descriptor) are not represented here: those are
//! contract violations and panic at the point of detection.
//!
//! ## Example Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use rematkit::builder::EngineBuilder;
//! use rematkit::config::EngineConfig;
//! use rematkit::error::ConfigError;
//! use rematkit::traits::MeterAllocator;
//!
//! // Fallible construction for user-configurable parameters.
//! let mut config = EngineConfig::default();
//! config.sample_rate = Some(2.0); // out of range
//!
//! let bad: Result<rematkit::manager::RematEngine<Vec<u8>>, ConfigError> =
//!     EngineBuilder::new(Arc::new(MeterAllocator::unbounded()))
//!         .config(config)
//!         .try_build();
//! assert!(bad.is_err());
//! ```

use std::fmt;

use crate::traits::DeviceId;

// ---------------------------------------------------------------------------
// AllocError
// ---------------------------------------------------------------------------

/// Error returned when the device allocator fails to produce memory.
///
/// Produced by [`DeviceAllocator::allocate`](crate::traits::DeviceAllocator::allocate)
/// implementations and propagated by the engine once eviction can free nothing
/// further. Carries enough context for the host runtime to decide whether to
/// retry, spill, or abort the surrounding computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocError {
    device: DeviceId,
    requested: usize,
    resident: usize,
}

impl AllocError {
    /// Creates a new `AllocError` for a failed request of `requested` bytes
    /// on `device` while `resident` bytes were charged.
    #[inline]
    pub fn new(device: DeviceId, requested: usize, resident: usize) -> Self {
        Self {
            device,
            requested,
            resident,
        }
    }

    /// Device the allocation was attempted on.
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Bytes requested by the failed allocation.
    #[inline]
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Bytes resident on the device when the allocation failed.
    #[inline]
    pub fn resident(&self) -> usize {
        self.resident
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocation of {} bytes on {} failed ({} bytes resident)",
            self.requested, self.device, self.resident
        )
    }
}

impl std::error::Error for AllocError {}

// ---------------------------------------------------------------------------
// RematError
// ---------------------------------------------------------------------------

/// Error returned when an evicted value cannot be rematerialized.
///
/// Surfaces from [`CellHandle::get`](crate::cell::CellHandle::get) when the
/// replayed computation cannot complete. The engine never substitutes a
/// default or stale value: the caller receives exactly why the value is
/// unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RematError {
    /// Re-allocation of the value's memory failed under pressure.
    Alloc(AllocError),
    /// The recorded host operation itself failed; carries its message.
    Op(String),
}

impl RematError {
    /// Creates an operation-failure error with the given description.
    #[inline]
    pub fn op(msg: impl Into<String>) -> Self {
        Self::Op(msg.into())
    }
}

impl fmt::Display for RematError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(err) => write!(f, "value unavailable: {err}"),
            Self::Op(msg) => write!(f, "value unavailable: recorded operation failed: {msg}"),
        }
    }
}

impl std::error::Error for RematError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Alloc(err) => Some(err),
            Self::Op(_) => None,
        }
    }
}

impl From<AllocError> for RematError {
    fn from(err: AllocError) -> Self {
        Self::Alloc(err)
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when engine configuration parameters are invalid.
///
/// Produced by [`EngineBuilder::try_build`](crate::builder::EngineBuilder::try_build)
/// and [`EngineConfig::validate`](crate::config::EngineConfig::validate).
/// Carries a human-readable description of which parameter failed validation.
///
/// # Example
///
/// ```
/// use rematkit::config::EngineConfig;
///
/// let mut config = EngineConfig::default();
/// config.dependency_penalty = -1.0;
/// let err = config.validate().unwrap_err();
/// assert!(err.to_string().contains("dependency_penalty"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
