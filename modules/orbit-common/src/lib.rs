pub mod config;
pub mod error;

pub use config::{SchedulerConfig, StoreConfig};
pub use error::{OrbitError, Result};
