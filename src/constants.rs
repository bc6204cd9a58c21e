//! # System Constants
//!
//! Core constants, queue names and defaults that define the operational
//! boundaries of the scheduling center and the scanning nodes.

// Re-export state types for convenience
pub use crate::state_machine::{ShardState as ShardStatus, TaskState as TaskStatus};

/// Message bus queue names
pub mod queues {
    /// Execution results and shard reports flowing from nodes to the scheduling center
    pub const RESULTS: &str = "scan.results";
    /// Node heartbeats carrying capacity snapshots
    pub const HEARTBEATS: &str = "scan.heartbeats";

    const ASSIGNMENTS_PREFIX: &str = "scan.assignments";
    const CONTROL_PREFIX: &str = "scan.control";

    /// Per-node assignment queue
    pub fn assignments(node_id: &str) -> String {
        format!("{ASSIGNMENTS_PREFIX}.{node_id}")
    }

    /// Per-node control queue (cancellation signals)
    pub fn control(node_id: &str) -> String {
        format!("{CONTROL_PREFIX}.{node_id}")
    }
}

/// Task option defaults applied when a request leaves them unset
pub mod task_defaults {
    pub const PRIORITY: u8 = 5;
    pub const MIN_PRIORITY: u8 = 1;
    pub const MAX_PRIORITY: u8 = 10;
    pub const CONCURRENCY: usize = 50;
    pub const EXECUTION_TIMEOUT_SECS: u64 = 30;
    /// Plugin executions per second against a single target
    pub const RATE_LIMIT: u32 = 100;
}

/// Scheduler defaults
pub mod scheduler_defaults {
    pub const PARTITION_SIZE: usize = 256;
    pub const MAX_SHARD_RETRIES: u32 = 3;
    pub const QUEUE_WATERMARK: usize = 10_000;
    pub const ASSIGNMENT_ACK_TIMEOUT_SECS: u64 = 30;
    pub const HEARTBEAT_TIMEOUT_SECS: u64 = 30;
    pub const NODE_PURGE_GRACE_SECS: u64 = 300;
    pub const AGING_THRESHOLD_SECS: u64 = 60;
    pub const AGING_INTERVAL_SECS: u64 = 10;
    pub const DELETE_ACK_TIMEOUT_SECS: u64 = 60;
    pub const DISPATCH_TICK_MS: u64 = 200;
    pub const WEIGHT_CPU: f64 = 0.4;
    pub const WEIGHT_MEMORY: f64 = 0.3;
    pub const WEIGHT_SHARDS: f64 = 0.3;
}

/// Node agent defaults
pub mod node_defaults {
    /// Worker pool size: concurrent plugin executions per node
    pub const WORKER_CONCURRENCY: usize = 100;
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
    pub const PER_TARGET_CONCURRENCY: usize = 8;
    pub const READY_QUEUE_CAPACITY: usize = 256;
    pub const TARGET_WINDOW: usize = 4;
    /// Shard slots advertised to the dispatcher as the node's `max_concurrency`
    pub const MAX_ACTIVE_SHARDS: usize = 8;
    pub const POLL_INTERVAL_MS: u64 = 100;
    pub const EVENT_BUFFER: usize = 1024;
}

/// Message bus defaults
pub mod bus_defaults {
    pub const VISIBILITY_TIMEOUT_SECS: u64 = 30;
    pub const RECEIVE_BATCH_SIZE: usize = 32;
}
