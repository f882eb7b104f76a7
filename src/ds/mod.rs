pub mod ecn;

pub use ecn::{EcnForest, EcnId};
