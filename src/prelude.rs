pub use crate::builder::EngineBuilder;
pub use crate::cell::{CellHandle, UseGuard};
pub use crate::config::EngineConfig;
pub use crate::ds::{EcnForest, EcnId};
pub use crate::error::{AllocError, ConfigError, RematError};
pub use crate::manager::RematEngine;
pub use crate::metrics::{EngineMetrics, EngineMetricsSnapshot};
pub use crate::pool::{AliasPool, EvictMode, PoolCounters};
pub use crate::remat::RecomputeFn;
pub use crate::traits::{DeviceAddr, DeviceAllocator, DeviceId, MeterAllocator};
