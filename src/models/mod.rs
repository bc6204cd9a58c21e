pub mod execution;
pub mod node;
pub mod plugin;
pub mod shard;
pub mod targets;
pub mod task;

// Re-export core models for easy access
pub use execution::{DedupKey, ExecutionError, ExecutionErrorKind, ExecutionResult, ExecutionStatus};
pub use node::{Heartbeat, Node, NodeCapacity, NodeStatus};
pub use plugin::{PluginDescriptor, Severity};
pub use shard::{Assignment, AssignmentToken, Shard, ShardId, ShardOutcome, ShardReport};
pub use targets::{expand_targets, partition_targets};
pub use task::{
    FailurePolicy, FindingSummary, NewTask, ScanPolicy, Task, TaskId, TaskOptions, TaskProgress,
};
