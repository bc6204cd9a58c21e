//! # Scanner Configuration System
//!
//! Typed configuration for the scheduling center and the scanning nodes. Values
//! are layered by [`ConfigManager`]: built-in defaults, then `config/vulnscan.toml`,
//! then `config/vulnscan.<environment>.toml`, then `VULNSCAN__SECTION__KEY`
//! environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use vulnscan_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let partition_size = manager.config().scheduler.partition_size;
//! let heartbeat = manager.config().node.heartbeat_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::{bus_defaults, node_defaults, scheduler_defaults, task_defaults};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Task manager and dispatcher settings
    pub scheduler: SchedulerConfig,

    /// Defaults applied to task options left unset by the caller
    pub task_defaults: TaskDefaultsConfig,

    /// Node agent and worker pool settings
    pub node: NodeConfig,

    /// Plugin registry settings
    pub plugins: PluginsConfig,

    /// Message bus settings
    pub bus: BusConfig,

    /// Durable state store settings
    pub database: DatabaseConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

impl ScannerConfig {
    /// Validate the whole configuration tree
    pub fn validate(&self) -> ConfigResult<()> {
        self.scheduler.validate()?;
        self.task_defaults.validate()?;
        self.node.validate()?;
        self.bus.validate()?;
        Ok(())
    }
}

/// Load-score weights used by node selection
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadWeights {
    pub cpu: f64,
    pub memory: f64,
    pub shards: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            cpu: scheduler_defaults::WEIGHT_CPU,
            memory: scheduler_defaults::WEIGHT_MEMORY,
            shards: scheduler_defaults::WEIGHT_SHARDS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of targets per shard
    pub partition_size: usize,
    /// Retries before a shard fails terminally
    pub max_shard_retries: u32,
    /// Queue depth beyond which new tasks are rejected
    pub queue_watermark: usize,
    pub assignment_ack_timeout_secs: u64,
    /// Silence after which a node is marked offline
    pub heartbeat_timeout_secs: u64,
    /// Additional silence after which an offline node is purged
    pub node_purge_grace_secs: u64,
    /// Queue wait after which a shard starts gaining priority
    pub aging_threshold_secs: u64,
    /// One priority step is gained per interval past the threshold
    pub aging_interval_secs: u64,
    /// How long a deleted task waits for cancellation acknowledgements
    pub delete_ack_timeout_secs: u64,
    pub dispatch_tick_ms: u64,
    pub load_weights: LoadWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            partition_size: scheduler_defaults::PARTITION_SIZE,
            max_shard_retries: scheduler_defaults::MAX_SHARD_RETRIES,
            queue_watermark: scheduler_defaults::QUEUE_WATERMARK,
            assignment_ack_timeout_secs: scheduler_defaults::ASSIGNMENT_ACK_TIMEOUT_SECS,
            heartbeat_timeout_secs: scheduler_defaults::HEARTBEAT_TIMEOUT_SECS,
            node_purge_grace_secs: scheduler_defaults::NODE_PURGE_GRACE_SECS,
            aging_threshold_secs: scheduler_defaults::AGING_THRESHOLD_SECS,
            aging_interval_secs: scheduler_defaults::AGING_INTERVAL_SECS,
            delete_ack_timeout_secs: scheduler_defaults::DELETE_ACK_TIMEOUT_SECS,
            dispatch_tick_ms: scheduler_defaults::DISPATCH_TICK_MS,
            load_weights: LoadWeights::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn assignment_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.assignment_ack_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn node_purge_grace(&self) -> Duration {
        Duration::from_secs(self.node_purge_grace_secs)
    }

    pub fn aging_threshold(&self) -> Duration {
        Duration::from_secs(self.aging_threshold_secs)
    }

    pub fn aging_interval(&self) -> Duration {
        Duration::from_secs(self.aging_interval_secs)
    }

    pub fn delete_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_ack_timeout_secs)
    }

    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.partition_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.partition_size",
                self.partition_size,
                "partition size must be at least 1",
            ));
        }
        if self.queue_watermark == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.queue_watermark",
                self.queue_watermark,
                "watermark must be at least 1",
            ));
        }
        if self.assignment_ack_timeout_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.assignment_ack_timeout_secs",
                self.assignment_ack_timeout_secs,
                "timeout must be positive",
            ));
        }
        if self.heartbeat_timeout_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.heartbeat_timeout_secs",
                self.heartbeat_timeout_secs,
                "timeout must be positive",
            ));
        }
        if self.aging_interval_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.aging_interval_secs",
                self.aging_interval_secs,
                "interval must be positive",
            ));
        }
        if self.dispatch_tick_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.dispatch_tick_ms",
                self.dispatch_tick_ms,
                "tick must be positive",
            ));
        }

        let weights = &self.load_weights;
        for (field, value) in [
            ("scheduler.load_weights.cpu", weights.cpu),
            ("scheduler.load_weights.memory", weights.memory),
            ("scheduler.load_weights.shards", weights.shards),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value,
                    "weight must be a non-negative finite number",
                ));
            }
        }
        if weights.cpu + weights.memory + weights.shards <= 0.0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.load_weights",
                format!("{weights:?}"),
                "at least one weight must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskDefaultsConfig {
    pub priority: u8,
    pub concurrency: usize,
    pub execution_timeout_secs: u64,
    pub rate_limit: u32,
}

impl Default for TaskDefaultsConfig {
    fn default() -> Self {
        Self {
            priority: task_defaults::PRIORITY,
            concurrency: task_defaults::CONCURRENCY,
            execution_timeout_secs: task_defaults::EXECUTION_TIMEOUT_SECS,
            rate_limit: task_defaults::RATE_LIMIT,
        }
    }
}

impl TaskDefaultsConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !(task_defaults::MIN_PRIORITY..=task_defaults::MAX_PRIORITY).contains(&self.priority) {
            return Err(ConfigurationError::invalid_value(
                "task_defaults.priority",
                self.priority,
                "priority must be within 1..=10",
            ));
        }
        if self.concurrency == 0 || self.execution_timeout_secs == 0 || self.rate_limit == 0 {
            return Err(ConfigurationError::invalid_value(
                "task_defaults",
                format!("{self:?}"),
                "concurrency, execution timeout and rate limit must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identifier; generated at startup when absent
    pub node_id: Option<String>,
    /// Concurrent plugin executions on this node
    pub worker_concurrency: usize,
    /// Shard slots advertised to the dispatcher
    pub max_active_shards: usize,
    pub heartbeat_interval_secs: u64,
    /// Concurrent plugins against a single target
    pub per_target_concurrency: usize,
    /// Bound on executions waiting for a worker
    pub ready_queue_capacity: usize,
    /// Targets of one shard that may be in flight at the same time
    pub target_window: usize,
    pub poll_interval_ms: u64,
    pub checkpoint_dir: PathBuf,
    /// Buffer of the asset/stats event channel; overflow is dropped
    pub event_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            worker_concurrency: node_defaults::WORKER_CONCURRENCY,
            max_active_shards: node_defaults::MAX_ACTIVE_SHARDS,
            heartbeat_interval_secs: node_defaults::HEARTBEAT_INTERVAL_SECS,
            per_target_concurrency: node_defaults::PER_TARGET_CONCURRENCY,
            ready_queue_capacity: node_defaults::READY_QUEUE_CAPACITY,
            target_window: node_defaults::TARGET_WINDOW,
            poll_interval_ms: node_defaults::POLL_INTERVAL_MS,
            checkpoint_dir: PathBuf::from("tmp/checkpoints"),
            event_buffer: node_defaults::EVENT_BUFFER,
        }
    }
}

impl NodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        for (field, value) in [
            ("node.worker_concurrency", self.worker_concurrency),
            ("node.max_active_shards", self.max_active_shards),
            ("node.per_target_concurrency", self.per_target_concurrency),
            ("node.ready_queue_capacity", self.ready_queue_capacity),
            ("node.target_window", self.target_window),
            ("node.event_buffer", self.event_buffer),
        ] {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value,
                    "value must be at least 1",
                ));
            }
        }
        if self.heartbeat_interval_secs == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "node.heartbeat_interval_secs",
                self.heartbeat_interval_secs,
                "heartbeat and poll intervals must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory holding plugin manifests; the static registry is used when absent
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Time a received message stays invisible before redelivery
    pub visibility_timeout_secs: u64,
    pub receive_batch_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: bus_defaults::VISIBILITY_TIMEOUT_SECS,
            receive_batch_size: bus_defaults::RECEIVE_BATCH_SIZE,
        }
    }
}

impl BusConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.visibility_timeout_secs == 0 || self.receive_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "bus",
                format!("{self:?}"),
                "visibility timeout and batch size must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection string; the in-memory store is used when absent
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive overriding the environment default
    pub level: Option<String>,
    pub directory: PathBuf,
    pub json_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            directory: PathBuf::from("log"),
            json_file: true,
        }
    }
}
