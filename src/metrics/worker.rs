//! # Node Metrics
//!
//! Plugin execution counters and timings recorded by the shard runner, plus the
//! node agent's active shard gauge.

use crate::models::{ExecutionResult, ExecutionStatus};
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static WORKER_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    WORKER_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("vulnscan-node"))
}

/// Plugin executions finished on this node
///
/// Labels:
/// - status: success, fail, timeout
pub fn plugin_executions_total() -> Counter<u64> {
    meter()
        .u64_counter("vulnscan.scans.total")
        .with_description("Total number of plugin executions")
        .build()
}

/// Wall time of one plugin execution in seconds
///
/// Labels:
/// - status: success, fail, timeout
pub fn plugin_execution_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("vulnscan.scan.duration")
        .with_description("Plugin execution duration in seconds")
        .with_unit("s")
        .build()
}

/// Executions that reported the target vulnerable
///
/// Labels:
/// - severity: critical, high, medium, low, info
pub fn vulns_found_total() -> Counter<u64> {
    meter()
        .u64_counter("vulnscan.vulns.found")
        .with_description("Total vulnerabilities found")
        .build()
}

/// Shards currently running on a node
///
/// Labels:
/// - node_id: Node identifier
pub fn active_shards() -> Gauge<u64> {
    meter()
        .u64_gauge("vulnscan.node.active_shards")
        .with_description("Number of shards running on this node")
        .build()
}

pub static PLUGIN_EXECUTIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
pub static PLUGIN_EXECUTION_DURATION: OnceLock<Histogram<f64>> = OnceLock::new();
pub static VULNS_FOUND_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
pub static ACTIVE_SHARDS: OnceLock<Gauge<u64>> = OnceLock::new();

pub fn init() {
    PLUGIN_EXECUTIONS_TOTAL.get_or_init(plugin_executions_total);
    PLUGIN_EXECUTION_DURATION.get_or_init(plugin_execution_duration);
    VULNS_FOUND_TOTAL.get_or_init(vulns_found_total);
    ACTIVE_SHARDS.get_or_init(active_shards);
}

pub fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Success => "success",
        ExecutionStatus::Fail => "fail",
        ExecutionStatus::Timeout => "timeout",
    }
}

/// Record one finished plugin execution
pub fn record_execution(result: &ExecutionResult) {
    let status = [KeyValue::new("status", status_label(result.status()))];
    if let Some(counter) = PLUGIN_EXECUTIONS_TOTAL.get() {
        counter.add(1, &status);
    }
    if let Some(histogram) = PLUGIN_EXECUTION_DURATION.get() {
        histogram.record(result.duration_ms as f64 / 1000.0, &status);
    }
    if result.vulnerable {
        if let Some(counter) = VULNS_FOUND_TOTAL.get() {
            counter.add(1, &[KeyValue::new("severity", result.severity.to_string())]);
        }
    }
}
