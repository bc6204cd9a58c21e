//! # Scheduling Center Metrics
//!
//! Task lifecycle counters and dispatcher gauges.
//!
//! Labels stay low-cardinality: task and shard ids belong in spans and logs.

use crate::state_machine::TaskState;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static ORCHESTRATION_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    ORCHESTRATION_METER
        .get_or_init(|| opentelemetry::global::meter_provider().meter("vulnscan-scheduler"))
}

// Counters

/// Tasks accepted by the task manager
///
/// Labels:
/// - policy: full, redline, smart, specified
pub fn tasks_created_total() -> Counter<u64> {
    meter()
        .u64_counter("vulnscan.tasks.total")
        .with_description("Total number of scan tasks created")
        .build()
}

/// Tasks that reached a terminal state
///
/// Labels:
/// - status: completed, failed, cancelled
pub fn tasks_finished_total() -> Counter<u64> {
    meter()
        .u64_counter("vulnscan.tasks.completed")
        .with_description("Total number of scan tasks that reached a terminal state")
        .build()
}

/// Shard assignments published to nodes
///
/// Labels:
/// - attempt: first, retry
pub fn shards_dispatched_total() -> Counter<u64> {
    meter()
        .u64_counter("vulnscan.shards.dispatched.total")
        .with_description("Total number of shard assignments sent to nodes")
        .build()
}

/// Shards put back on the dispatch queue after leaving a node
///
/// Labels:
/// - reason: released, unrequested_cancel, reclaimed
pub fn shards_requeued_total() -> Counter<u64> {
    meter()
        .u64_counter("vulnscan.shards.requeued.total")
        .with_description("Total number of shards returned to the dispatch queue")
        .build()
}

// Gauges

/// Nodes currently online
pub fn nodes_online() -> Gauge<u64> {
    meter()
        .u64_gauge("vulnscan.nodes.online")
        .with_description("Number of online scanner nodes")
        .build()
}

/// Nodes holding at least one shard
pub fn nodes_busy() -> Gauge<u64> {
    meter()
        .u64_gauge("vulnscan.nodes.busy")
        .with_description("Number of scanner nodes running shards")
        .build()
}

/// Shards waiting in the dispatch queue
pub fn dispatch_queue_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("vulnscan.dispatch.queue_depth")
        .with_description("Number of shards waiting for a node")
        .build()
}

// Static instances

pub static TASKS_CREATED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
pub static TASKS_FINISHED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
pub static SHARDS_DISPATCHED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
pub static SHARDS_REQUEUED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
pub static NODES_ONLINE: OnceLock<Gauge<u64>> = OnceLock::new();
pub static NODES_BUSY: OnceLock<Gauge<u64>> = OnceLock::new();
pub static DISPATCH_QUEUE_DEPTH: OnceLock<Gauge<u64>> = OnceLock::new();

pub fn init() {
    TASKS_CREATED_TOTAL.get_or_init(tasks_created_total);
    TASKS_FINISHED_TOTAL.get_or_init(tasks_finished_total);
    SHARDS_DISPATCHED_TOTAL.get_or_init(shards_dispatched_total);
    SHARDS_REQUEUED_TOTAL.get_or_init(shards_requeued_total);
    NODES_ONLINE.get_or_init(nodes_online);
    NODES_BUSY.get_or_init(nodes_busy);
    DISPATCH_QUEUE_DEPTH.get_or_init(dispatch_queue_depth);
}

/// Count a task entering `status` if that state is terminal
pub fn record_task_finished(status: TaskState) {
    if !status.is_terminal() {
        return;
    }
    if let Some(counter) = TASKS_FINISHED_TOTAL.get() {
        counter.add(1, &[KeyValue::new("status", status.to_string())]);
    }
}

pub fn record_shard_requeued(reason: &'static str) {
    if let Some(counter) = SHARDS_REQUEUED_TOTAL.get() {
        counter.add(1, &[KeyValue::new("reason", reason)]);
    }
}

/// Label for an assignment attempt number
pub fn attempt_label(attempt: u32) -> &'static str {
    if attempt <= 1 {
        "first"
    } else {
        "retry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_label() {
        assert_eq!(attempt_label(0), "first");
        assert_eq!(attempt_label(1), "first");
        assert_eq!(attempt_label(2), "retry");
    }

    #[test]
    fn test_recording_without_provider_is_a_no_op() {
        init();
        record_task_finished(TaskState::Running);
        record_task_finished(TaskState::Completed);
        record_shard_requeued("reclaimed");
        if let Some(gauge) = NODES_ONLINE.get() {
            gauge.record(3, &[]);
        }
    }
}
