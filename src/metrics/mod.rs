pub mod metrics_impl;
pub mod snapshot;

pub use metrics_impl::EngineMetrics;
pub use snapshot::EngineMetricsSnapshot;
