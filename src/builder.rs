//! Engine builder.
//!
//! Single construction path for [`RematEngine`]: takes the device allocator
//! seam, validates the configuration, and fixes the tracked value type.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use rematkit::builder::EngineBuilder;
//! use rematkit::traits::{DeviceId, MeterAllocator};
//!
//! let engine = EngineBuilder::new(Arc::new(MeterAllocator::unbounded())).build::<Vec<u8>>();
//! let handle = engine.register_value(vec![1u8; 4], 4, DeviceId::new(0)).unwrap();
//! assert_eq!(*handle.get().unwrap(), vec![1u8; 4]);
//! ```

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::manager::RematEngine;
use crate::traits::DeviceAllocator;

/// Builder for [`RematEngine`] instances.
pub struct EngineBuilder {
    alloc: Arc<dyn DeviceAllocator>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Starts a builder over the given allocator with default configuration.
    pub fn new(alloc: Arc<dyn DeviceAllocator>) -> Self {
        Self {
            alloc,
            config: EngineConfig::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine, validating the configuration first.
    pub fn try_build<T: Send + Sync + 'static>(self) -> Result<RematEngine<T>, ConfigError> {
        self.config.validate()?;
        Ok(RematEngine::from_parts(self.alloc, self.config))
    }

    /// Builds the engine. Panics on invalid configuration; use
    /// [`try_build`](Self::try_build) to handle that case.
    pub fn build<T: Send + Sync + 'static>(self) -> RematEngine<T> {
        match self.try_build() {
            Ok(engine) => engine,
            Err(err) => panic!("invalid engine configuration: {err}"),
        }
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{DeviceId, MeterAllocator};

    #[test]
    fn test_default_build_round_trip() {
        let engine = EngineBuilder::new(Arc::new(MeterAllocator::unbounded())).build::<String>();
        let handle = engine
            .register_value("hello".to_string(), 5, DeviceId::new(0))
            .unwrap();
        assert_eq!(*handle.get().unwrap(), "hello");
    }

    #[test]
    fn test_custom_config_is_applied() {
        let mut config = EngineConfig::default();
        config.profile = true;
        config.min_evictable_bytes = 128;

        let engine = EngineBuilder::new(Arc::new(MeterAllocator::unbounded()))
            .config(config)
            .try_build::<Vec<u8>>()
            .unwrap();
        assert!(engine.config().profile);
        assert_eq!(engine.config().min_evictable_bytes, 128);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.sample_rate = Some(0.0);

        let result = EngineBuilder::new(Arc::new(MeterAllocator::unbounded()))
            .config(config)
            .try_build::<Vec<u8>>();
        assert!(result.is_err());
    }

    #[test]
    #[should_panic(expected = "invalid engine configuration")]
    fn test_build_panics_on_invalid_config() {
        let mut config = EngineConfig::default();
        config.dependency_penalty = -1.0;

        let _ = EngineBuilder::new(Arc::new(MeterAllocator::unbounded()))
            .config(config)
            .build::<Vec<u8>>();
    }
}
