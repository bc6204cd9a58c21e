//! # Node Agent
//!
//! The scanning node's link to the scheduling center. It
//!
//! - publishes heartbeats with a capacity snapshot on a fixed interval,
//! - pulls assignments from `scan.assignments.<node>`, acknowledges them and
//!   starts a [`ShardRunner`] for each, never holding more shards than it
//!   advertises,
//! - applies pause/cancel signals from `scan.control.<node>`,
//! - drains on shutdown: it stops pulling new work but keeps heartbeating as
//!   `draining` and keeps honouring control signals until its shards finish.
//!
//! Assignments are de-duplicated by token, so a redelivered assignment never
//! starts a second run. Control signals are addressed by token as well: a
//! signal meant for an earlier run of a shard never reaches a later one.

use super::capacity::LoadProbe;
use super::checkpoint::CheckpointStore;
use super::events::EventSink;
use super::fingerprint::FingerprintProvider;
use super::pool::WorkerPool;
use super::shard_runner::{RunnerContext, RunnerLimits, ShardControl, ShardRunner};
use crate::config::{BusConfig, NodeConfig};
use crate::constants::queues;
use crate::error::ScanResult;
use crate::logging::{log_error, log_node_operation, log_shard_operation};
use crate::metrics::worker::ACTIVE_SHARDS;
use crate::messaging::{
    AssignmentAck, BusMessage, ControlAction, ControlMessage, MessageBus, ReceivedMessage,
    ShardAssignment, SignalledShard,
};
use crate::models::{
    AssignmentToken, Heartbeat, NodeCapacity, NodeStatus, ShardId, ShardOutcome, ShardReport,
    TaskId,
};
use crate::registry::{PluginRegistry, Sandbox};
use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Control signals for shards this node has not picked up yet are kept this long
const PENDING_CONTROL_TTL: Duration = Duration::from_secs(600);

/// Tokens of finished runs are remembered this long to swallow redeliveries
const FINISHED_TOKEN_TTL: Duration = Duration::from_secs(600);

/// Node-side collaborators
pub struct NodeDependencies {
    pub sandbox: Arc<dyn Sandbox>,
    pub fingerprints: Arc<dyn FingerprintProvider>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub load_probe: Arc<dyn LoadProbe>,
    pub events: EventSink,
}

struct RunningShard {
    task_id: TaskId,
    token: AssignmentToken,
    control: ShardControl,
}

struct TaskSlot {
    limit: Arc<Semaphore>,
    shards: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingControl {
    action: ControlAction,
    force: bool,
    received: Instant,
}

/// Lock order: `running`, then `accepted_tokens`, then `pending_controls`
#[derive(Default)]
struct AgentState {
    running: Mutex<HashMap<ShardId, RunningShard>>,
    task_slots: Mutex<HashMap<TaskId, TaskSlot>>,
    /// `None` while the run is live, otherwise when it finished
    accepted_tokens: Mutex<HashMap<AssignmentToken, Option<Instant>>>,
    pending_controls: Mutex<HashMap<AssignmentToken, PendingControl>>,
    draining: AtomicBool,
}

impl AgentState {
    /// Returns false when the token was already accepted
    fn accept(&self, token: AssignmentToken) -> bool {
        let mut accepted = self.accepted_tokens.lock();
        if accepted.contains_key(&token) {
            return false;
        }
        accepted.insert(token, None);
        true
    }

    fn finish(&self, token: AssignmentToken, at: Instant) {
        if let Some(finished) = self.accepted_tokens.lock().get_mut(&token) {
            *finished = Some(at);
        }
    }

    /// Forget finished runs and unclaimed signals older than their TTLs
    fn prune(&self, now: Instant) {
        self.accepted_tokens.lock().retain(|_, finished| match finished {
            None => true,
            Some(at) => now.saturating_duration_since(*at) < FINISHED_TOKEN_TTL,
        });
        self.pending_controls
            .lock()
            .retain(|_, pending| now.saturating_duration_since(pending.received) < PENDING_CONTROL_TTL);
    }

    fn task_limit(&self, task_id: TaskId, concurrency: usize) -> Arc<Semaphore> {
        let mut slots = self.task_slots.lock();
        let slot = slots.entry(task_id).or_insert_with(|| TaskSlot {
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            shards: 0,
        });
        slot.shards += 1;
        slot.limit.clone()
    }

    fn release_task_slot(&self, task_id: TaskId) {
        let mut slots = self.task_slots.lock();
        if let Some(slot) = slots.get_mut(&task_id) {
            slot.shards = slot.shards.saturating_sub(1);
            if slot.shards == 0 {
                slots.remove(&task_id);
            }
        }
    }
}

pub struct NodeAgent {
    node_id: String,
    max_active_shards: usize,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    visibility_timeout: Duration,
    receive_batch: usize,
    tags: Vec<String>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<PluginRegistry>,
    pool: Arc<WorkerPool>,
    runner_ctx: RunnerContext,
    load_probe: Arc<dyn LoadProbe>,
    state: Arc<AgentState>,
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent")
            .field("node_id", &self.node_id)
            .field("running", &self.running_shards())
            .finish()
    }
}

impl NodeAgent {
    pub fn new(
        config: &NodeConfig,
        bus_config: &BusConfig,
        bus: Arc<dyn MessageBus>,
        registry: Arc<PluginRegistry>,
        deps: NodeDependencies,
    ) -> Self {
        crate::metrics::init_metrics();
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", &Uuid::new_v4().simple().to_string()[..8]));
        let pool = Arc::new(WorkerPool::start(
            config.worker_concurrency,
            config.ready_queue_capacity,
            deps.sandbox,
        ));
        let runner_ctx = RunnerContext {
            node_id: node_id.clone(),
            bus: bus.clone(),
            pool: pool.clone(),
            fingerprints: deps.fingerprints,
            checkpoints: deps.checkpoints,
            events: deps.events,
            limits: RunnerLimits {
                per_target_concurrency: config.per_target_concurrency,
                target_window: config.target_window,
            },
        };

        Self {
            node_id,
            max_active_shards: config.max_active_shards,
            heartbeat_interval: config.heartbeat_interval(),
            poll_interval: config.poll_interval(),
            visibility_timeout: bus_config.visibility_timeout(),
            receive_batch: bus_config.receive_batch_size.max(1),
            tags: Vec::new(),
            bus,
            registry,
            pool,
            runner_ctx,
            load_probe: deps.load_probe,
            state: Arc::new(AgentState::default()),
        }
    }

    /// Labels advertised in heartbeats
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn running_shards(&self) -> usize {
        self.state.running.lock().len()
    }

    pub fn is_draining(&self) -> bool {
        self.state.draining.load(Ordering::SeqCst)
    }

    /// Run until `shutdown` fires, then drain
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> ScanResult<()> {
        self.bus.ensure_queue(&queues::assignments(&self.node_id)).await?;
        self.bus.ensure_queue(&queues::control(&self.node_id)).await?;
        log_node_operation("start", &self.node_id, "online", None);

        // Heartbeats outlive `shutdown` so the center sees the drain
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = {
            let agent = self.clone();
            let stop = heartbeat_stop.clone();
            tokio::spawn(async move { agent.heartbeat_loop(stop).await })
        };

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        log_error("node_agent", "poll", &e.to_string(), Some(&self.node_id));
                    }
                }
            }
        }

        self.drain().await;
        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat loop ended abnormally");
        }
        if let Err(e) = self.send_heartbeat(NodeStatus::Offline).await {
            warn!(error = %e, "Failed to publish final heartbeat");
        }
        self.pool.shutdown().await;
        log_node_operation("stop", &self.node_id, "offline", None);
        Ok(())
    }

    async fn heartbeat_loop(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.send_heartbeat(NodeStatus::Online).await {
                        warn!(node_id = %self.node_id, error = %e, "Heartbeat publish failed");
                    }
                }
            }
        }
    }

    /// Publish a heartbeat; `Online` is downgraded to `Draining` while draining
    pub async fn send_heartbeat(&self, status: NodeStatus) -> ScanResult<()> {
        let status = if status == NodeStatus::Online && self.is_draining() {
            NodeStatus::Draining
        } else {
            status
        };
        let load = self.load_probe.sample().await;
        let heartbeat = Heartbeat {
            node_id: self.node_id.clone(),
            status,
            capacity: NodeCapacity {
                max_concurrency: self.max_active_shards,
                active_shards: self.running_shards(),
                cpu_load: load.cpu_load,
                memory_load: load.memory_load,
            },
            tags: self.tags.clone(),
            sent_at: Utc::now(),
        };
        self.bus
            .publish(queues::HEARTBEATS, &BusMessage::Heartbeat(heartbeat))
            .await?;
        Ok(())
    }

    /// One pass over the control and assignment queues; returns messages handled
    pub async fn poll_once(&self) -> ScanResult<usize> {
        let mut handled = 0;

        let control_queue = queues::control(&self.node_id);
        for received in self
            .bus
            .receive(&control_queue, self.receive_batch, self.visibility_timeout)
            .await?
        {
            if let BusMessage::Control(control) = &received.message {
                self.apply_control(control);
            }
            self.bus.ack(&control_queue, received.id).await?;
            handled += 1;
        }

        if self.is_draining() {
            return Ok(handled);
        }

        let free = self.max_active_shards.saturating_sub(self.running_shards());
        if free == 0 {
            return Ok(handled);
        }
        let assignment_queue = queues::assignments(&self.node_id);
        for received in self
            .bus
            .receive(&assignment_queue, free.min(self.receive_batch), self.visibility_timeout)
            .await?
        {
            self.handle_assignment(&assignment_queue, received).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn handle_assignment(&self, queue: &str, received: ReceivedMessage) -> ScanResult<()> {
        let BusMessage::Assignment(assignment) = received.message else {
            warn!(queue = %queue, message_id = received.id, "Unexpected message on assignment queue");
            self.bus.ack(queue, received.id).await?;
            return Ok(());
        };

        self.state.prune(Instant::now());
        if !self.state.accept(assignment.token) {
            debug!(shard_id = %assignment.shard_id, token = %assignment.token, "Duplicate assignment ignored");
            self.bus.ack(queue, received.id).await?;
            return Ok(());
        }

        self.bus
            .publish(
                queues::RESULTS,
                &BusMessage::Ack(AssignmentAck {
                    shard_id: assignment.shard_id,
                    node_id: self.node_id.clone(),
                    token: assignment.token,
                }),
            )
            .await?;
        self.bus.ack(queue, received.id).await?;
        self.start_shard(assignment).await;
        Ok(())
    }

    async fn start_shard(&self, mut assignment: ShardAssignment) {
        let shard_id = assignment.shard_id;
        let task_id = assignment.task_id;

        match self.runner_ctx.checkpoints.load(shard_id).await {
            Ok(Some(local)) if local.token == assignment.token => {
                assignment.start_offset = assignment.start_offset.max(local.checkpoint);
            }
            Ok(_) => {}
            Err(e) => warn!(shard_id = %shard_id, error = %e, "Local checkpoint unreadable"),
        }

        let control = ShardControl::new();
        if let Some(pending) = self.state.pending_controls.lock().remove(&assignment.token) {
            control.signal(pending.action, pending.force);
        }

        let previous = self.state.running.lock().insert(
            shard_id,
            RunningShard {
                task_id,
                token: assignment.token,
                control: control.clone(),
            },
        );
        if let Some(previous) = previous {
            // Superseded by a newer assignment of the same shard
            previous.control.signal(ControlAction::Cancel, true);
            self.state.release_task_slot(previous.task_id);
        }
        record_active_shards(&self.node_id, self.running_shards());

        let task_limit = self
            .state
            .task_limit(task_id, assignment.options.concurrency);
        let snapshot = self.registry.snapshot();
        let token = assignment.token;
        let start_offset = assignment.start_offset;

        log_shard_operation(
            "accept",
            Some(&task_id.to_string()),
            Some(&shard_id.to_string()),
            Some(&self.node_id),
            "running",
            Some(&format!("attempt {} from offset {start_offset}", assignment.attempt)),
        );

        let runner = ShardRunner::new(
            self.runner_ctx.clone(),
            assignment,
            snapshot,
            task_limit,
            control,
        );
        let state = self.state.clone();
        let bus = self.bus.clone();
        let node_id = self.node_id.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                log_error("shard_runner", "run", &e.to_string(), Some(&shard_id.to_string()));
                let report = ShardReport {
                    shard_id,
                    task_id,
                    node_id: node_id.clone(),
                    token,
                    outcome: ShardOutcome::Failed {
                        reason: e.to_string(),
                        retryable: e.is_retryable(),
                    },
                    checkpoint: start_offset,
                };
                if let Err(e) = bus
                    .publish(queues::RESULTS, &BusMessage::ShardReport(report))
                    .await
                {
                    warn!(shard_id = %shard_id, error = %e, "Failed to report shard failure");
                }
            }

            let mut running = state.running.lock();
            if running.get(&shard_id).is_some_and(|r| r.token == token) {
                running.remove(&shard_id);
                let active = running.len();
                drop(running);
                state.release_task_slot(task_id);
                record_active_shards(&node_id, active);
            } else {
                drop(running);
            }
            state.finish(token, Instant::now());
        });
    }

    fn apply_control(&self, control: &ControlMessage) {
        let now = Instant::now();
        let (mut applied, mut deferred, mut stale) = (0usize, 0usize, 0usize);
        {
            let running = self.state.running.lock();
            let accepted = self.state.accepted_tokens.lock();
            let mut pending = self.state.pending_controls.lock();
            for SignalledShard { shard_id, token } in &control.shards {
                match running.get(shard_id) {
                    Some(shard) if shard.token == *token => {
                        shard.control.signal(control.action, control.force);
                        applied += 1;
                    }
                    // The addressed run already finished or was superseded
                    _ if accepted.contains_key(token) => stale += 1,
                    _ => {
                        pending.insert(
                            *token,
                            PendingControl {
                                action: control.action,
                                force: control.force,
                                received: now,
                            },
                        );
                        deferred += 1;
                    }
                }
            }
        }
        self.state.prune(now);

        if stale > 0 {
            debug!(node_id = %self.node_id, task_id = %control.task_id, stale, "Ignored signals for earlier runs");
        }
        info!(
            node_id = %self.node_id,
            task_id = %control.task_id,
            action = ?control.action,
            force = control.force,
            applied,
            deferred,
            "Control signal applied"
        );
    }

    async fn drain(&self) {
        self.state.draining.store(true, Ordering::SeqCst);
        if let Err(e) = self.send_heartbeat(NodeStatus::Draining).await {
            warn!(error = %e, "Failed to announce draining");
        }
        log_node_operation(
            "drain",
            &self.node_id,
            "draining",
            Some(&format!("{} shards in flight", self.running_shards())),
        );
        // poll_once only reads the control queue while draining
        while self.running_shards() > 0 {
            tokio::time::sleep(self.poll_interval).await;
            if let Err(e) = self.poll_once().await {
                log_error("node_agent", "drain_poll", &e.to_string(), Some(&self.node_id));
            }
        }
    }
}

fn record_active_shards(node_id: &str, active: usize) {
    if let Some(gauge) = ACTIVE_SHARDS.get() {
        gauge.record(active as u64, &[KeyValue::new("node_id", node_id.to_string())]);
    }
}
