//! # OpenTelemetry Metrics
//!
//! Instruments for the scheduling center and the scanning nodes, recorded
//! through the global OpenTelemetry meter provider.
//!
//! - `orchestration`: task creation and terminal states, shard dispatch, node
//!   and queue gauges
//! - `worker`: plugin executions and findings, plus the active shard gauge
//!
//! The crate only depends on the OpenTelemetry API. The embedding process owns
//! the exporter: it installs its provider with
//! `opentelemetry::global::set_meter_provider` and then calls [`init_metrics`].
//! Without a provider every instrument is a no-op.
//!
//! ```rust
//! use opentelemetry::KeyValue;
//! use vulnscan_core::metrics::{self, orchestration::TASKS_CREATED_TOTAL};
//!
//! metrics::init_metrics();
//! if let Some(counter) = TASKS_CREATED_TOTAL.get() {
//!     counter.add(1, &[KeyValue::new("policy", "full")]);
//! }
//! ```

use std::sync::OnceLock;

pub mod orchestration;
pub mod worker;

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Register every instrument with the current global meter provider. Safe to
/// call more than once; only the first call has an effect.
pub fn init_metrics() {
    METRICS_INITIALIZED.get_or_init(|| {
        orchestration::init();
        worker::init();
        tracing::debug!("Metrics instruments registered (orchestration, worker)");
    });
}
