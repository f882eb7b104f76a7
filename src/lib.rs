//! rematkit: eviction and rematerialization engine for device-resident values.
//!
//! See `DESIGN.md` for design decisions and internal architecture notes.

pub mod builder;
pub mod cell;
pub mod config;
pub mod ds;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod prelude;
pub mod remat;
pub mod traits;

pub use crate::builder::EngineBuilder;
pub use crate::cell::{CellHandle, UseGuard};
pub use crate::manager::RematEngine;
pub use crate::traits::{DeviceAllocator, DeviceId};
