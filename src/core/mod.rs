// Core infrastructure shared by every engine component

pub mod config;
pub mod errors;
pub mod metrics;

// Re-export commonly used types
pub use config::{EngineConfig, EngineConfigBuilder};
pub use errors::{EngineError, Result};
pub use metrics::{EngineMetrics, MetricsSnapshot};
