//! # Host Runtime Seams
//!
//! This module defines the boundary between the engine and the host value
//! runtime: the device allocator the engine charges memory against, the
//! identifier newtypes shared across the crate, and a metering reference
//! allocator used by tests, benches, and examples.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────────────┐          ┌──────────────────────────────┐
//!   │        host runtime          │          │         RematEngine          │
//!   │                              │          │                              │
//!   │  produces values             │ register │  AliasPool accounting        │
//!   │  executes recorded ops  ─────┼─────────▶│  eviction / remat driver     │
//!   │                              │          │                              │
//!   └──────────────┬───────────────┘          └──────────────┬───────────────┘
//!                  │                                         │
//!                  │ owns                                    │ charges / credits
//!                  ▼                                         ▼
//!   ┌─────────────────────────────────────────────────────────────────────────┐
//!   │                     DeviceAllocator (this module)                       │
//!   │                                                                         │
//!   │   allocate(device, bytes) → Result<DeviceAddr, AllocError>              │
//!   │   free(device, addr)                                                    │
//!   │   resident(device) → usize                                              │
//!   └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine holds the allocator as `Arc<dyn DeviceAllocator>`: it is a
//! ledger seam, not an ownership seam. Values themselves live wherever the
//! host puts them; the allocator tracks how many device bytes each value is
//! charged for, so budget enforcement has a single source of truth.
//!
//! ## Item Summary
//!
//! | Item              | Kind    | Purpose                                    |
//! |-------------------|---------|--------------------------------------------|
//! | `DeviceId`        | newtype | Device index used to partition accounting  |
//! | `DeviceAddr`      | newtype | Opaque device address handle               |
//! | `DeviceAllocator` | trait   | Charge/credit seam invoked by evict/remat  |
//! | `MeterAllocator`  | struct  | Bump-addressed metering reference impl     |
//!
//! ## Example Usage
//!
//! ```
//! use rematkit::traits::{DeviceAllocator, DeviceId, MeterAllocator};
//!
//! let meter = MeterAllocator::with_capacity(1024);
//! let dev = DeviceId::new(0);
//!
//! let a = meter.allocate(dev, 512).unwrap();
//! assert_eq!(meter.resident(dev), 512);
//!
//! // Capacity is per device: a second 1024-byte request must fail.
//! assert!(meter.allocate(dev, 1024).is_err());
//!
//! meter.free(dev, a);
//! assert_eq!(meter.resident(dev), 0);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::AllocError;

// ---------------------------------------------------------------------------
// DeviceId / DeviceAddr
// ---------------------------------------------------------------------------

/// Index of a device whose memory the engine accounts for.
///
/// Pools, budgets, and allocator charges are all partitioned by device; the
/// engine never moves a value between devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Creates a device id from its raw index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw device index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Opaque device address returned by an allocator.
///
/// The engine treats addresses as tokens: it records them, keys its pool
/// index by them, and hands them back to `free`. It never dereferences them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddr(u64);

impl DeviceAddr {
    /// Creates an address handle from its raw value.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DeviceAllocator
// ---------------------------------------------------------------------------

/// Charge/credit seam between the engine and the host's device memory.
///
/// Implementations must be cheap to call and thread-safe: eviction credits
/// memory from whichever thread triggered it, and rematerialization charges
/// memory from the thread that touched the evicted value.
///
/// `allocate` failing is a recoverable condition (see
/// [`AllocError`](crate::error::AllocError)); the engine responds by evicting
/// and retrying before propagating the failure.
pub trait DeviceAllocator: Send + Sync {
    /// Charges `bytes` on `device`, returning the address of the reservation.
    fn allocate(&self, device: DeviceId, bytes: usize) -> Result<DeviceAddr, AllocError>;

    /// Credits back the reservation previously returned for `addr`.
    fn free(&self, device: DeviceId, addr: DeviceAddr);

    /// Bytes currently charged on `device`.
    fn resident(&self, device: DeviceId) -> usize;
}

// ---------------------------------------------------------------------------
// MeterAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DeviceMeter {
    resident: usize,
    peak: usize,
    live: FxHashMap<DeviceAddr, usize>,
}

/// Metering allocator: a pure ledger with bump-assigned addresses.
///
/// Tracks per-device resident bytes against an optional capacity and
/// remembers every outstanding reservation, so tests can detect leaks and
/// double frees. Addresses are unique for the lifetime of the allocator and
/// never reused.
///
/// This is the reference [`DeviceAllocator`] used throughout the crate's
/// tests and benches; hosts with a real device allocator implement the trait
/// over their own bookkeeping instead.
#[derive(Debug)]
pub struct MeterAllocator {
    capacity: Option<usize>,
    next_addr: AtomicU64,
    devices: Mutex<FxHashMap<DeviceId, DeviceMeter>>,
}

impl MeterAllocator {
    /// Creates a meter with no capacity limit.
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            next_addr: AtomicU64::new(0x1000),
            devices: Mutex::new(FxHashMap::default()),
        }
    }

    /// Creates a meter that fails allocations pushing any single device
    /// above `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::unbounded()
        }
    }

    /// Highest resident byte count ever observed on `device`.
    pub fn peak(&self, device: DeviceId) -> usize {
        self.devices
            .lock()
            .get(&device)
            .map(|m| m.peak)
            .unwrap_or(0)
    }

    /// Number of outstanding reservations on `device`.
    pub fn live_allocations(&self, device: DeviceId) -> usize {
        self.devices
            .lock()
            .get(&device)
            .map(|m| m.live.len())
            .unwrap_or(0)
    }
}

impl DeviceAllocator for MeterAllocator {
    fn allocate(&self, device: DeviceId, bytes: usize) -> Result<DeviceAddr, AllocError> {
        let mut devices = self.devices.lock();
        let meter = devices.entry(device).or_default();
        if let Some(capacity) = self.capacity {
            if meter.resident + bytes > capacity {
                return Err(AllocError::new(device, bytes, meter.resident));
            }
        }
        let addr = DeviceAddr::new(self.next_addr.fetch_add(bytes.max(1) as u64, Ordering::Relaxed));
        meter.resident += bytes;
        meter.peak = meter.peak.max(meter.resident);
        meter.live.insert(addr, bytes);
        Ok(addr)
    }

    fn free(&self, device: DeviceId, addr: DeviceAddr) {
        let mut devices = self.devices.lock();
        let meter = devices.entry(device).or_default();
        let bytes = meter
            .live
            .remove(&addr)
            .unwrap_or_else(|| panic!("free of unknown address {addr} on {device}"));
        meter.resident -= bytes;
    }

    fn resident(&self, device: DeviceId) -> usize {
        self.devices
            .lock()
            .get(&device)
            .map(|m| m.resident)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
