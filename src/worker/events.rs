//! Asset and execution-statistics events for external collaborators.
//!
//! Emission never blocks the scan path: when the channel is full or its
//! receiver is gone the event is dropped and counted.

use crate::models::{ExecutionStatus, ShardId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Fingerprint data observed for a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEvent {
    pub task_id: TaskId,
    pub target: String,
    pub tags: BTreeSet<String>,
    pub observed_at: DateTime<Utc>,
}

/// One plugin execution, for the statistics pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatEvent {
    pub task_id: TaskId,
    pub shard_id: ShardId,
    pub target: String,
    pub plugin_id: String,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    pub vulnerable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeEvent {
    Asset(AssetEvent),
    Stat(StatEvent),
}

impl NodeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Asset(_) => "asset",
            Self::Stat(_) => "stat",
        }
    }
}

/// Non-blocking sender half of the event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<NodeEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<NodeEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A sink whose events all go nowhere
    pub fn disconnected() -> Self {
        Self::channel(1).0
    }

    pub fn emit(&self, event: NodeEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(error = %e, "Node event dropped");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat() -> NodeEvent {
        NodeEvent::Stat(StatEvent {
            task_id: TaskId::new(),
            shard_id: ShardId::new(),
            target: "10.0.0.1".into(),
            plugin_id: "p".into(),
            status: ExecutionStatus::Success,
            duration_ms: 3,
            vulnerable: false,
        })
    }

    #[tokio::test]
    async fn test_events_delivered_while_capacity_remains() {
        let (sink, mut rx) = EventSink::channel(2);
        sink.emit(stat());
        assert_eq!(rx.recv().await.unwrap().event_type(), "stat");
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_overflow_and_closed_channel_are_counted_not_blocking() {
        let (sink, rx) = EventSink::channel(1);
        sink.emit(stat());
        sink.emit(stat());
        assert_eq!(sink.dropped(), 1);
        drop(rx);
        sink.emit(stat());
        assert_eq!(sink.dropped(), 2);

        let nowhere = EventSink::disconnected();
        nowhere.emit(stat());
        assert_eq!(nowhere.dropped(), 1);
    }
}
