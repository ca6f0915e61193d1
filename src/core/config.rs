use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{EngineError, Result};

/// Engine configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Worker pool configuration
    /// Maximum number of node jobs processed concurrently
    pub max_workers: usize,

    // Broker configuration
    /// Number of callback delivery partitions, each with one consumer task
    pub broker_partitions: usize,

    // Node execution configuration
    /// Timeout armed for nodes whose plan node declares none
    #[serde(with = "duration_secs_opt")]
    pub default_node_timeout: Option<Duration>,
    /// Validity window of an execution-input wait, in calendar months
    pub input_validity_months: u32,
    /// Wait before a retried node is started when its policy names none
    #[serde(with = "duration_secs")]
    pub default_retry_wait: Duration,

    // Event configuration
    /// Capacity of the status event channel
    pub event_capacity: usize,

    // Storage configuration
    /// Database path for persistence
    pub db_path: Option<PathBuf>,
    /// Database page cache capacity in bytes
    pub db_cache_capacity: u64,
    /// zstd level for persisted records
    pub compression_level: i32,

    // Recovery configuration
    /// Run the status sweep when the engine is built
    pub enable_recovery: bool,
    /// Resubmit QUEUED nodes found by the sweep
    pub resubmit_queued_on_recovery: bool,
    /// Mark RUNNING nodes that never suspended as ERRORED
    pub error_interrupted_on_recovery: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            max_workers: cpu_count * 2,
            broker_partitions: cpu_count.max(2),

            default_node_timeout: None,
            input_validity_months: 6,
            default_retry_wait: Duration::from_secs(0),

            event_capacity: 1024,

            db_path: None,
            db_cache_capacity: 64 * 1024 * 1024, // 64MB
            compression_level: 3,

            enable_recovery: true,
            resubmit_queued_on_recovery: true,
            error_interrupted_on_recovery: true,
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(EngineError::InvalidConfiguration(
                "max_workers must be greater than 0".to_string(),
            ));
        }
        if self.broker_partitions == 0 {
            return Err(EngineError::InvalidConfiguration(
                "broker_partitions must be greater than 0".to_string(),
            ));
        }
        if self.input_validity_months == 0 {
            return Err(EngineError::InvalidConfiguration(
                "input_validity_months must be greater than 0".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::InvalidConfiguration(
                "event_capacity must be greater than 0".to_string(),
            ));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(EngineError::InvalidConfiguration(
                "compression_level must be within 1..=22".to_string(),
            ));
        }
        if let Some(timeout) = self.default_node_timeout {
            if timeout.is_zero() {
                return Err(EngineError::InvalidConfiguration(
                    "default_node_timeout must be non-zero when set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Create a configuration suited to tests and local runs
    pub fn development() -> Self {
        Self {
            max_workers: 4,
            broker_partitions: 2,
            event_capacity: 256,
            ..Default::default()
        }
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    pub fn broker_partitions(mut self, partitions: usize) -> Self {
        self.config.broker_partitions = partitions;
        self
    }

    pub fn default_node_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.default_node_timeout = timeout;
        self
    }

    pub fn input_validity_months(mut self, months: u32) -> Self {
        self.config.input_validity_months = months;
        self
    }

    pub fn default_retry_wait(mut self, wait: Duration) -> Self {
        self.config.default_retry_wait = wait;
        self
    }

    /// Set database path
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = Some(path.into());
        self
    }

    /// Enable/disable the status sweep at build time
    pub fn recovery(mut self, enabled: bool) -> Self {
        self.config.enable_recovery = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Durations are written as whole seconds in config files
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
