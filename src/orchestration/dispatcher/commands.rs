//! Commands accepted by the dispatcher loop and the handle used to send them.

use super::load_index::NodeEntry;
use super::priority_queue::QueueEntry;
use crate::models::{AssignmentToken, Heartbeat, ShardId, TaskId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// A shard held by a node under one assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldShard {
    pub shard_id: ShardId,
    pub node_id: String,
    pub token: AssignmentToken,
}

#[derive(Debug)]
pub enum DispatcherCommand {
    /// Queue a shard for assignment
    Enqueue(QueueEntry),
    /// Stop dispatching a paused task and ask its nodes to release their shards
    HoldTask {
        task_id: TaskId,
        in_flight: Vec<HeldShard>,
    },
    /// Drop a deleted task's queued shards and cancel the ones on nodes
    CancelTask {
        task_id: TaskId,
        in_flight: Vec<HeldShard>,
        force: bool,
    },
    Heartbeat(Heartbeat),
    ShardAcked {
        shard_id: ShardId,
        token: AssignmentToken,
    },
    /// The shard is no longer held by any node
    ShardSettled { shard_id: ShardId },
    Snapshot {
        resp: oneshot::Sender<DispatcherSnapshot>,
    },
}

impl DispatcherCommand {
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::Enqueue(_) => "enqueue",
            Self::HoldTask { .. } => "hold_task",
            Self::CancelTask { .. } => "cancel_task",
            Self::Heartbeat(_) => "heartbeat",
            Self::ShardAcked { .. } => "shard_acked",
            Self::ShardSettled { .. } => "shard_settled",
            Self::Snapshot { .. } => "snapshot",
        }
    }
}

/// Point-in-time view of the dispatcher's state
#[derive(Debug, Clone)]
pub struct DispatcherSnapshot {
    pub queued: Vec<QueueEntry>,
    pub nodes: Vec<NodeEntry>,
    pub pending_acks: usize,
}

/// Queue depth shared between the dispatcher and its callers. Counts queued
/// shards plus enqueue commands not yet picked up.
#[derive(Debug, Default)]
pub(crate) struct QueueGauge {
    pub(crate) in_transit: AtomicUsize,
    pub(crate) queued: AtomicUsize,
}

impl QueueGauge {
    fn depth(&self) -> usize {
        self.in_transit.load(Ordering::Acquire) + self.queued.load(Ordering::Acquire)
    }
}

/// Cloneable sender side of the dispatcher loop. Sends never block; a stopped
/// dispatcher is logged and otherwise ignored, since its state is rebuilt from
/// the store on restart.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherCommand>,
    gauge: Arc<QueueGauge>,
}

/// Receiving side, consumed by [`super::Dispatcher::new`]
#[derive(Debug)]
pub struct DispatcherInbox {
    pub(crate) rx: mpsc::UnboundedReceiver<DispatcherCommand>,
    pub(crate) gauge: Arc<QueueGauge>,
}

impl DispatcherHandle {
    pub fn channel() -> (Self, DispatcherInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gauge = Arc::new(QueueGauge::default());
        (
            Self {
                tx,
                gauge: gauge.clone(),
            },
            DispatcherInbox { rx, gauge },
        )
    }

    /// Shards waiting for a node, including enqueues still in the channel
    pub fn queue_depth(&self) -> usize {
        self.gauge.depth()
    }

    pub fn enqueue(&self, entry: QueueEntry) {
        self.gauge.in_transit.fetch_add(1, Ordering::AcqRel);
        if !self.send(DispatcherCommand::Enqueue(entry)) {
            self.gauge.in_transit.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn hold_task(&self, task_id: TaskId, in_flight: Vec<HeldShard>) {
        self.send(DispatcherCommand::HoldTask { task_id, in_flight });
    }

    pub fn cancel_task(&self, task_id: TaskId, in_flight: Vec<HeldShard>, force: bool) {
        self.send(DispatcherCommand::CancelTask {
            task_id,
            in_flight,
            force,
        });
    }

    pub fn heartbeat(&self, heartbeat: Heartbeat) {
        self.send(DispatcherCommand::Heartbeat(heartbeat));
    }

    pub fn shard_acked(&self, shard_id: ShardId, token: AssignmentToken) {
        self.send(DispatcherCommand::ShardAcked { shard_id, token });
    }

    pub fn shard_settled(&self, shard_id: ShardId) {
        self.send(DispatcherCommand::ShardSettled { shard_id });
    }

    /// Ask the loop for a snapshot; `None` once the dispatcher has stopped
    pub async fn snapshot(&self) -> Option<DispatcherSnapshot> {
        let (resp, rx) = oneshot::channel();
        if !self.send(DispatcherCommand::Snapshot { resp }) {
            return None;
        }
        rx.await.ok()
    }

    fn send(&self, command: DispatcherCommand) -> bool {
        let command_type = command.command_type();
        match self.tx.send(command) {
            Ok(()) => true,
            Err(_) => {
                warn!(command = command_type, "Dispatcher is not running; command dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_enqueue_counts_toward_depth_until_received() {
        let (handle, mut inbox) = DispatcherHandle::channel();
        handle.enqueue(QueueEntry {
            shard_id: ShardId::new(),
            task_id: TaskId::new(),
            priority: 5,
            enqueued_at: Utc::now(),
        });
        assert_eq!(handle.queue_depth(), 1);
        assert!(matches!(
            inbox.rx.recv().await,
            Some(DispatcherCommand::Enqueue(_))
        ));
    }

    #[tokio::test]
    async fn test_send_after_dispatcher_dropped_is_ignored() {
        let (handle, inbox) = DispatcherHandle::channel();
        drop(inbox);
        handle.enqueue(QueueEntry {
            shard_id: ShardId::new(),
            task_id: TaskId::new(),
            priority: 5,
            enqueued_at: Utc::now(),
        });
        assert_eq!(handle.queue_depth(), 0);
        assert!(handle.snapshot().await.is_none());
    }
}
