//! # Scheduling Center
//!
//! Server side of the scanner: accepts scan tasks, splits them into shards and
//! places the shards on worker nodes.
//!
//! ## Core Components
//!
//! - **TaskManager**: task lifecycle, shard bookkeeping and status aggregation
//! - **Dispatcher**: priority queue with aging, node load index, assignment
//!   acks and node liveness
//! - **ResultProcessor**: applies heartbeats, acks, execution results and shard
//!   reports arriving on the bus
//! - **SchedulingCenter**: wires the above to a state store and a message bus
//!
//! All shard mutations go through the [`TaskManager`]; the [`Dispatcher`] owns
//! queue and node state and is reached only through its [`DispatcherHandle`].

pub mod core;
pub mod dispatcher;
pub mod result_processor;
pub mod task_manager;

pub use core::{store_from_config, SchedulingCenter};
pub use dispatcher::{
    Dispatcher, DispatcherCommand, DispatcherHandle, DispatcherSnapshot, NodeEntry, QueueEntry,
};
pub use result_processor::ResultProcessor;
pub use task_manager::{
    RecoveredAssignment, RecoveredState, TaskManager, TaskQuery, TaskStatusView,
};

/// Convert a configured duration to chrono, saturating far in the future
pub(crate) fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
