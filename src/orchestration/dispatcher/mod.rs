//! # Dispatcher
//!
//! Single-owner loop that matches queued shards to nodes.
//!
//! The dispatcher owns the [`ShardQueue`] and the [`LoadIndex`]; everything else
//! talks to it through a [`DispatcherHandle`]. On each command batch and on every
//! dispatch tick it:
//!
//! 1. expires unacknowledged assignments and silent nodes, re-queuing their shards,
//! 2. purges deleted tasks and long-offline nodes,
//! 3. assigns queued shards to the least-loaded nodes with free slots.
//!
//! Shard state lives in the [`TaskManager`]; an assignment is persisted there
//! before the message is published, and reverted if the publish fails.

mod commands;
mod load_index;
mod priority_queue;

pub use commands::{
    DispatcherCommand, DispatcherHandle, DispatcherInbox, DispatcherSnapshot, HeldShard,
};
pub use load_index::{HeartbeatEffect, LoadIndex, LostNode, NodeEntry};
pub use priority_queue::{QueueEntry, ShardQueue};

use crate::config::SchedulerConfig;
use crate::constants::queues;
use crate::error::{ScanError, ScanResult};
use crate::logging::{log_error, log_node_operation, log_shard_operation};
use crate::messaging::{BusMessage, ControlAction, ControlMessage, MessageBus, SignalledShard};
use crate::metrics::orchestration::{
    attempt_label, DISPATCH_QUEUE_DEPTH, NODES_BUSY, NODES_ONLINE, SHARDS_DISPATCHED_TOTAL,
};
use crate::models::{AssignmentToken, Heartbeat, NodeStatus, ShardId, TaskId};
use crate::orchestration::chrono_duration;
use crate::orchestration::task_manager::TaskManager;
use crate::persistence::StateStore;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct PendingAck {
    task_id: TaskId,
    node_id: String,
    token: AssignmentToken,
    deadline: DateTime<Utc>,
}

pub struct Dispatcher {
    config: SchedulerConfig,
    task_manager: Arc<TaskManager>,
    store: Arc<dyn StateStore>,
    bus: Arc<dyn MessageBus>,
    queue: ShardQueue,
    index: LoadIndex,
    pending_acks: HashMap<ShardId, PendingAck>,
    inbox: DispatcherInbox,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queued", &self.queue.len())
            .field("nodes", &self.index.len())
            .field("pending_acks", &self.pending_acks.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        config: SchedulerConfig,
        task_manager: Arc<TaskManager>,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn MessageBus>,
        inbox: DispatcherInbox,
    ) -> Self {
        let queue = ShardQueue::new(config.aging_threshold(), config.aging_interval());
        let index = LoadIndex::new(config.load_weights);
        Self {
            config,
            task_manager,
            store,
            bus,
            queue,
            index,
            pending_acks: HashMap::new(),
            inbox,
        }
    }

    /// Rebuild the queue and load index from the store after a restart.
    ///
    /// Known nodes get a fresh heartbeat window; shards held by nodes that are
    /// no longer known are re-queued.
    pub async fn rebuild_from_store(&mut self) -> ScanResult<()> {
        let recovered = self.task_manager.recover().await?;
        let now = Utc::now();

        for mut node in self.store.list_nodes().await? {
            if node.status != NodeStatus::Offline {
                node.last_heartbeat = now;
            }
            self.index.restore(node);
        }

        for entry in recovered.queued {
            self.queue.push(entry);
        }

        let ack_deadline = now + chrono_duration(self.config.assignment_ack_timeout());
        for held in recovered.in_flight {
            let node_known = self
                .index
                .get(&held.node_id)
                .is_some_and(|entry| entry.node.status != NodeStatus::Offline);
            if !node_known {
                self.task_manager
                    .requeue_shard(held.shard_id, held.token, "node unknown after restart")
                    .await?;
                continue;
            }

            self.index
                .record_assignment(&held.node_id, held.shard_id, held.token, held.assigned_at);
            if !held.acked {
                let task_id = self.task_manager.get_shard(held.shard_id).await?.task_id;
                self.pending_acks.insert(
                    held.shard_id,
                    PendingAck {
                        task_id,
                        node_id: held.node_id,
                        token: held.token,
                        deadline: ack_deadline,
                    },
                );
            }
        }

        self.update_gauge();
        info!(
            queued = self.queue.len(),
            nodes = self.index.len(),
            pending_acks = self.pending_acks.len(),
            "🔄 Dispatcher state rebuilt"
        );
        Ok(())
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> ScanResult<()> {
        info!(
            tick_ms = self.config.dispatch_tick_ms,
            "🚀 Dispatcher started"
        );

        let mut tick = tokio::time::interval(self.config.dispatch_tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut aging = tokio::time::interval(self.config.aging_interval());
        aging.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.inbox.rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                    self.drain_commands().await;
                    self.dispatch_pending(Utc::now()).await;
                }
                _ = tick.tick() => self.tick(Utc::now()).await,
                _ = aging.tick() => {
                    let moved = self.queue.age(Utc::now());
                    if moved > 0 {
                        debug!(moved = moved, "Aged starved shards");
                    }
                }
            }
        }

        info!(queued = self.queue.len(), "🛑 Dispatcher stopped");
        Ok(())
    }

    /// Handle every command already waiting in the inbox
    async fn drain_commands(&mut self) {
        while let Ok(command) = self.inbox.rx.try_recv() {
            self.handle_command(command).await;
        }
    }

    async fn handle_command(&mut self, command: DispatcherCommand) {
        debug!(command = command.command_type(), "Dispatcher command");
        match command {
            DispatcherCommand::Enqueue(entry) => {
                self.inbox.gauge.in_transit.fetch_sub(1, Ordering::AcqRel);
                self.queue.push(entry);
            }
            DispatcherCommand::HoldTask { task_id, in_flight } => {
                let dropped = self.queue.remove_task(task_id).len();
                debug!(task_id = %task_id, dropped = dropped, "Holding task");
                self.signal_nodes(task_id, in_flight, ControlAction::Pause, false)
                    .await;
            }
            DispatcherCommand::CancelTask {
                task_id,
                in_flight,
                force,
            } => {
                self.queue.remove_task(task_id);
                self.signal_nodes(task_id, in_flight, ControlAction::Cancel, force)
                    .await;
            }
            DispatcherCommand::Heartbeat(heartbeat) => self.apply_heartbeat(heartbeat).await,
            DispatcherCommand::ShardAcked { shard_id, token } => {
                if self
                    .pending_acks
                    .get(&shard_id)
                    .is_some_and(|pending| pending.token == token)
                {
                    self.pending_acks.remove(&shard_id);
                }
            }
            DispatcherCommand::ShardSettled { shard_id } => {
                self.pending_acks.remove(&shard_id);
                self.index.release(shard_id);
            }
            DispatcherCommand::Snapshot { resp } => {
                let snapshot = DispatcherSnapshot {
                    queued: self.queue.iter().copied().collect(),
                    nodes: self.index.nodes().cloned().collect(),
                    pending_acks: self.pending_acks.len(),
                };
                let _ = resp.send(snapshot);
            }
        }
        self.update_gauge();
    }

    async fn apply_heartbeat(&mut self, heartbeat: Heartbeat) {
        let now = Utc::now();
        let (effect, node) = self.index.apply_heartbeat(&heartbeat, now);
        let node = node.clone();

        match effect {
            HeartbeatEffect::Registered => log_node_operation(
                "register",
                &node.id,
                &node.status.to_string(),
                Some(&format!("max_concurrency={}", node.capacity.max_concurrency)),
            ),
            HeartbeatEffect::Recovered => {
                log_node_operation("recover", &node.id, &node.status.to_string(), None)
            }
            HeartbeatEffect::Updated => {}
        }

        if let Err(e) = self.store.save_node(&node).await {
            log_error("dispatcher", "save_node", &e.to_string(), Some(&node.id));
        }

        if heartbeat.status == NodeStatus::Offline {
            let shards = self.index.take_shards(&node.id);
            log_node_operation(
                "offline",
                &node.id,
                "offline",
                Some(&format!("{} shards re-queued", shards.len())),
            );
            for (shard_id, token) in shards {
                self.pending_acks.remove(&shard_id);
                self.requeue(shard_id, token, "node went offline").await;
            }
        }
    }

    /// Expire timed-out acks and silent nodes, purge what is due, then dispatch
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        self.expire_acks(now).await;
        self.expire_nodes(now).await;

        for node_id in self
            .index
            .purge(now, chrono_duration(self.config.node_purge_grace()))
        {
            log_node_operation("purge", &node_id, "removed", None);
            if let Err(e) = self.store.delete_node(&node_id).await {
                log_error("dispatcher", "delete_node", &e.to_string(), Some(&node_id));
            }
        }

        if let Err(e) = self.task_manager.purge_deleted(now).await {
            log_error("dispatcher", "purge_deleted", &e.to_string(), None);
        }

        self.drain_commands().await;
        self.dispatch_pending(now).await;
    }

    async fn expire_acks(&mut self, now: DateTime<Utc>) {
        let expired: Vec<(ShardId, PendingAck)> = self
            .pending_acks
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(shard_id, pending)| (*shard_id, pending.clone()))
            .collect();

        for (shard_id, pending) in expired {
            self.pending_acks.remove(&shard_id);
            self.index.release(shard_id);
            let reason = ScanError::AssignmentTimeout {
                shard_id: shard_id.to_string(),
                node_id: pending.node_id.clone(),
            }
            .to_string();
            warn!(shard_id = %shard_id, node_id = %pending.node_id, "⏰ Assignment not acknowledged in time");

            // The node may still pick the message up later; make sure it drops it
            self.signal_nodes(
                pending.task_id,
                vec![HeldShard {
                    shard_id,
                    node_id: pending.node_id,
                    token: pending.token,
                }],
                ControlAction::Cancel,
                true,
            )
            .await;
            self.requeue(shard_id, pending.token, &reason).await;
        }
    }

    async fn expire_nodes(&mut self, now: DateTime<Utc>) {
        let lost = self
            .index
            .expire(now, chrono_duration(self.config.heartbeat_timeout()));

        for LostNode {
            node_id,
            shards,
            silence,
        } in lost
        {
            let error = ScanError::NodeLost {
                node_id: node_id.clone(),
                silence: silence.to_std().unwrap_or_default(),
            };
            log_error(
                "dispatcher",
                "heartbeat",
                &error.to_string(),
                Some(&format!("{} shards re-queued", shards.len())),
            );
            if let Some(entry) = self.index.get(&node_id) {
                if let Err(e) = self.store.save_node(&entry.node).await {
                    log_error("dispatcher", "save_node", &e.to_string(), Some(&node_id));
                }
            }

            let mut by_task: BTreeMap<TaskId, Vec<HeldShard>> = BTreeMap::new();
            for (shard_id, token) in shards {
                self.pending_acks.remove(&shard_id);
                if let Ok(shard) = self.task_manager.get_shard(shard_id).await {
                    by_task
                        .entry(shard.task_id)
                        .or_default()
                        .push(HeldShard {
                            shard_id,
                            node_id: node_id.clone(),
                            token,
                        });
                }
                self.requeue(shard_id, token, &error.to_string()).await;
            }
            // A node that comes back must not keep running superseded shards
            for (task_id, held) in by_task {
                self.signal_nodes(task_id, held, ControlAction::Cancel, true)
                    .await;
            }
        }
    }

    async fn requeue(&self, shard_id: ShardId, token: AssignmentToken, reason: &str) {
        if let Err(e) = self
            .task_manager
            .requeue_shard(shard_id, token, reason)
            .await
        {
            log_error(
                "dispatcher",
                "requeue_shard",
                &e.to_string(),
                Some(&shard_id.to_string()),
            );
        }
    }

    /// Assign queued shards while some node has a free slot
    pub async fn dispatch_pending(&mut self, now: DateTime<Utc>) -> usize {
        let mut dispatched = 0;
        let ack_deadline = now + chrono_duration(self.config.assignment_ack_timeout());

        loop {
            let Some(node_id) = self.index.select().map(str::to_string) else {
                break;
            };
            let Some(entry) = self.queue.pop() else {
                break;
            };

            let token = AssignmentToken::new();
            let assignment = match self
                .task_manager
                .assign_shard(entry.shard_id, &node_id, token, now)
                .await
            {
                Ok(Some(assignment)) => assignment,
                // Stale entry: shard moved on or its task is held
                Ok(None) => continue,
                Err(e) => {
                    log_error(
                        "dispatcher",
                        "assign_shard",
                        &e.to_string(),
                        Some(&entry.shard_id.to_string()),
                    );
                    self.queue.push_front(entry);
                    break;
                }
            };

            let attempt = assignment.attempt;
            let published = self
                .bus
                .publish(
                    &queues::assignments(&node_id),
                    &BusMessage::Assignment(assignment),
                )
                .await;
            if let Err(e) = published {
                log_error(
                    "dispatcher",
                    "publish_assignment",
                    &e.to_string(),
                    Some(&entry.shard_id.to_string()),
                );
                if let Err(e) = self
                    .task_manager
                    .revert_assignment(entry.shard_id, token)
                    .await
                {
                    log_error(
                        "dispatcher",
                        "revert_assignment",
                        &e.to_string(),
                        Some(&entry.shard_id.to_string()),
                    );
                }
                self.queue.push_front(entry);
                break;
            }

            self.index
                .record_assignment(&node_id, entry.shard_id, token, now);
            self.pending_acks.insert(
                entry.shard_id,
                PendingAck {
                    task_id: entry.task_id,
                    node_id: node_id.clone(),
                    token,
                    deadline: ack_deadline,
                },
            );
            log_shard_operation(
                "dispatch",
                Some(&entry.task_id.to_string()),
                Some(&entry.shard_id.to_string()),
                Some(&node_id),
                "assigned",
                Some(&format!("attempt {attempt}")),
            );
            if let Some(counter) = SHARDS_DISPATCHED_TOTAL.get() {
                counter.add(1, &[KeyValue::new("attempt", attempt_label(attempt))]);
            }
            dispatched += 1;
        }

        self.update_gauge();
        dispatched
    }

    /// Publish one control message per node holding shards of `task_id`
    async fn signal_nodes(
        &self,
        task_id: TaskId,
        held: Vec<HeldShard>,
        action: ControlAction,
        force: bool,
    ) {
        let mut by_node: BTreeMap<String, Vec<SignalledShard>> = BTreeMap::new();
        for held_shard in held {
            by_node
                .entry(held_shard.node_id)
                .or_default()
                .push(SignalledShard {
                    shard_id: held_shard.shard_id,
                    token: held_shard.token,
                });
        }

        for (node_id, shards) in by_node {
            let message = BusMessage::Control(ControlMessage {
                task_id,
                shards,
                action,
                force,
            });
            if let Err(e) = self
                .bus
                .publish(&queues::control(&node_id), &message)
                .await
            {
                log_error(
                    "dispatcher",
                    "publish_control",
                    &e.to_string(),
                    Some(&node_id),
                );
            }
        }
    }

    fn update_gauge(&self) {
        self.inbox
            .gauge
            .queued
            .store(self.queue.len(), Ordering::Release);

        if let Some(gauge) = DISPATCH_QUEUE_DEPTH.get() {
            gauge.record(self.queue.len() as u64, &[]);
        }
        let (online, busy) = self.node_counts();
        if let Some(gauge) = NODES_ONLINE.get() {
            gauge.record(online as u64, &[]);
        }
        if let Some(gauge) = NODES_BUSY.get() {
            gauge.record(busy as u64, &[]);
        }
    }

    /// Online nodes, and how many of those hold shards
    fn node_counts(&self) -> (usize, usize) {
        self.index
            .nodes()
            .filter(|entry| entry.node.status == NodeStatus::Online)
            .fold((0, 0), |(online, busy), entry| {
                (online + 1, busy + usize::from(entry.active_shards() > 0))
            })
    }
}
