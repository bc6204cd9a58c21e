//! # Task Manager
//!
//! Owns the lifecycle of scan tasks and their shards on the scheduling center.
//!
//! ## Responsibilities
//!
//! - **Creation**: validates a request, expands and partitions its targets and
//!   hands the shards to the dispatcher
//! - **Pause / Resume / Delete**: moves the task and tells the dispatcher which
//!   shards to hold, release or cancel
//! - **Aggregation**: applies shard reports and execution results and derives the
//!   task status from its shards
//! - **Assignment bookkeeping**: the dispatcher assigns, reverts and requeues
//!   shards through this type, so every shard mutation happens under one lock
//!
//! Every mutation is written through to the [`StateStore`] before it is
//! acknowledged, and the in-memory table can be rebuilt from the store with
//! [`TaskManager::recover`].

use crate::config::{SchedulerConfig, TaskDefaultsConfig};
use crate::error::{ScanError, ScanResult};
use crate::logging::{log_error, log_shard_operation, log_task_operation};
use crate::metrics::orchestration::{
    record_shard_requeued, record_task_finished, TASKS_CREATED_TOTAL,
};
use crate::messaging::{AssignmentAck, ResultDeduplicator, ShardAssignment};
use crate::models::task::priority_in_range;
use crate::models::{
    expand_targets, partition_targets, Assignment, AssignmentToken, ExecutionResult, NewTask,
    ScanPolicy, Shard, ShardId, ShardOutcome, ShardReport, Task, TaskId, TaskOptions, TaskProgress,
};
use crate::orchestration::chrono_duration;
use crate::orchestration::dispatcher::{DispatcherHandle, HeldShard, QueueEntry};
use crate::persistence::StateStore;
use crate::state_machine::{
    aggregate_task_event, ShardCounts, ShardEvent, ShardState, ShardStateMachine, TaskEvent,
    TaskState, TaskStateMachine,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use opentelemetry::KeyValue;
use tracing::{debug, info, instrument, warn};

/// Task as returned to callers, with its shard breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task: Task,
    pub shards: ShardCounts,
}

/// Filter and page for [`TaskManager::list_tasks`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub status: Option<TaskState>,
    /// 1-based
    pub page: usize,
    pub per_page: usize,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            status: None,
            page: 1,
            per_page: 20,
        }
    }
}

impl TaskQuery {
    pub fn with_status(mut self, status: TaskState) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_page(mut self, page: usize, per_page: usize) -> Self {
        self.page = page;
        self.per_page = per_page;
        self
    }
}

/// An in-flight shard found in the store during recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredAssignment {
    pub shard_id: ShardId,
    pub node_id: String,
    pub token: AssignmentToken,
    pub assigned_at: DateTime<Utc>,
    pub acked: bool,
}

/// What the dispatcher needs to rebuild its queue and load index
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    pub queued: Vec<QueueEntry>,
    pub in_flight: Vec<RecoveredAssignment>,
}

#[derive(Debug)]
struct TaskEntry {
    task: Task,
    /// Ordered by sequence
    shards: Vec<Shard>,
    /// Shards cancelled here whose nodes have not confirmed yet
    pending_cancel: HashSet<ShardId>,
    purge_after: Option<DateTime<Utc>>,
    /// Shard positions changed since the last write-through
    dirty: BTreeSet<usize>,
}

impl TaskEntry {
    fn new(task: Task, shards: Vec<Shard>) -> Self {
        Self {
            task,
            shards,
            pending_cancel: HashSet::new(),
            purge_after: None,
            dirty: BTreeSet::new(),
        }
    }

    fn position(&self, shard_id: ShardId) -> Option<usize> {
        self.shards.iter().position(|s| s.id == shard_id)
    }

    fn counts(&self) -> ShardCounts {
        ShardCounts::from_states(self.shards.iter().map(|s| s.status))
    }

    fn refresh_progress(&mut self) {
        self.task.progress.completed = self.shards.iter().map(|s| s.checkpoint).sum();
    }

    fn held_shards(&self) -> Vec<HeldShard> {
        self.shards
            .iter()
            .filter(|s| s.status.is_in_flight())
            .filter_map(|s| {
                s.assignment.as_ref().map(|a| HeldShard {
                    shard_id: s.id,
                    node_id: a.node_id.clone(),
                    token: a.token,
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct TaskTable {
    tasks: HashMap<TaskId, TaskEntry>,
    shard_index: HashMap<ShardId, TaskId>,
}

impl TaskTable {
    fn insert(&mut self, entry: TaskEntry) {
        for shard in &entry.shards {
            self.shard_index.insert(shard.id, entry.task.id);
        }
        self.tasks.insert(entry.task.id, entry);
    }

    fn remove(&mut self, task_id: TaskId) -> Option<TaskEntry> {
        let entry = self.tasks.remove(&task_id)?;
        for shard in &entry.shards {
            self.shard_index.remove(&shard.id);
        }
        Some(entry)
    }

    /// Task entry and shard position for a shard id
    fn locate_mut(&mut self, shard_id: ShardId) -> Option<(&mut TaskEntry, usize)> {
        let task_id = *self.shard_index.get(&shard_id)?;
        let entry = self.tasks.get_mut(&task_id)?;
        let idx = entry.position(shard_id)?;
        Some((entry, idx))
    }

    fn live_mut(&mut self, task_id: TaskId) -> ScanResult<&mut TaskEntry> {
        self.tasks
            .get_mut(&task_id)
            .filter(|e| !e.task.is_deleted())
            .ok_or_else(|| ScanError::not_found("task", task_id))
    }
}

struct ValidatedRequest {
    name: String,
    policy: ScanPolicy,
    priority: u8,
    options: TaskOptions,
}

fn queue_entry(shard: &Shard) -> QueueEntry {
    QueueEntry {
        shard_id: shard.id,
        task_id: shard.task_id,
        priority: shard.priority,
        enqueued_at: shard.enqueued_at,
    }
}

fn stale(shard_id: ShardId) -> ScanError {
    ScanError::StaleAssignment {
        shard_id: shard_id.to_string(),
    }
}

pub struct TaskManager {
    store: Arc<dyn StateStore>,
    dispatcher: DispatcherHandle,
    scheduler: SchedulerConfig,
    defaults: TaskDefaultsConfig,
    shard_machine: ShardStateMachine,
    table: RwLock<TaskTable>,
    /// Shared with the result consumer; purged shards drop their keys here
    results_seen: Arc<ResultDeduplicator>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("max_shard_retries", &self.shard_machine.max_retries())
            .field("queue_depth", &self.dispatcher.queue_depth())
            .finish()
    }
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        dispatcher: DispatcherHandle,
        scheduler: SchedulerConfig,
        defaults: TaskDefaultsConfig,
    ) -> Self {
        let shard_machine = ShardStateMachine::new(scheduler.max_shard_retries);
        Self {
            store,
            dispatcher,
            scheduler,
            defaults,
            shard_machine,
            table: RwLock::new(TaskTable::default()),
            results_seen: Arc::new(ResultDeduplicator::new()),
        }
    }

    /// De-duplication state for execution results of this manager's shards
    pub fn result_dedup(&self) -> Arc<ResultDeduplicator> {
        self.results_seen.clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.dispatcher.queue_depth()
    }

    // ------------------------------------------------------------------
    // Caller-facing operations
    // ------------------------------------------------------------------

    /// Validate, persist and shard a new task. The task is stored as `pending`
    /// first; a failure while sharding leaves it `failed` with the reason.
    #[instrument(skip(self, request), fields(task_name = %request.name))]
    pub async fn create_task(&self, request: NewTask) -> ScanResult<TaskId> {
        let validated = self.validate(&request)?;

        let depth = self.dispatcher.queue_depth();
        if depth > self.scheduler.queue_watermark {
            warn!(
                depth = depth,
                watermark = self.scheduler.queue_watermark,
                "Rejecting task: dispatch queue above watermark"
            );
            return Err(ScanError::Overloaded {
                depth,
                watermark: self.scheduler.queue_watermark,
            });
        }

        let targets = expand_targets(&request.targets)?;
        let now = Utc::now();
        let mut task = Task {
            id: TaskId::new(),
            name: validated.name,
            targets: request.targets,
            auth_ref: request.auth_ref,
            policy: validated.policy,
            vuln_ids: request.vuln_ids,
            priority: validated.priority,
            options: validated.options,
            status: TaskState::Pending,
            progress: TaskProgress {
                total: targets.len(),
                completed: 0,
            },
            findings: Default::default(),
            error_message: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.store.save_task(&task).await?;

        let task_id = task.id.to_string();
        log_task_operation(
            "create",
            Some(&task_id),
            Some(&task.name),
            "pending",
            Some(&format!("{} targets", targets.len())),
        );

        let shards = match self.shard_task(&mut task, targets, now).await {
            Ok(shards) => shards,
            Err(e) => {
                task.status = TaskState::Failed;
                task.error_message = Some(e.to_string());
                task.touch();
                record_task_finished(TaskState::Failed);
                if let Err(save_error) = self.store.save_task(&task).await {
                    log_error(
                        "task_manager",
                        "create_task",
                        &save_error.to_string(),
                        Some(&task_id),
                    );
                }
                return Err(e);
            }
        };

        if let Some(counter) = TASKS_CREATED_TOTAL.get() {
            counter.add(1, &[KeyValue::new("policy", task.policy.to_string())]);
        }
        let entries: Vec<QueueEntry> = shards.iter().map(queue_entry).collect();
        let shard_count = shards.len();
        let id = task.id;
        self.table.write().await.insert(TaskEntry::new(task, shards));
        for entry in entries {
            self.dispatcher.enqueue(entry);
        }

        info!(task_id = %id, shards = shard_count, "✅ Task created and queued for dispatch");
        Ok(id)
    }

    fn validate(&self, request: &NewTask) -> ScanResult<ValidatedRequest> {
        if request.targets.iter().all(|t| t.trim().is_empty()) {
            return Err(ScanError::validation("target set is empty"));
        }

        let policy: ScanPolicy = request
            .policy
            .trim()
            .to_ascii_lowercase()
            .parse()
            .map_err(ScanError::validation)?;
        if policy == ScanPolicy::Specified && request.vuln_ids.is_empty() {
            return Err(ScanError::validation(
                "specified policy requires a vuln-id allow-list",
            ));
        }

        let priority = request.priority.unwrap_or(self.defaults.priority);
        if !priority_in_range(priority) {
            return Err(ScanError::validation(format!(
                "priority {priority} outside 1..=10"
            )));
        }

        let options = TaskOptions {
            concurrency: request.concurrency.unwrap_or(self.defaults.concurrency),
            execution_timeout_secs: request
                .execution_timeout_secs
                .unwrap_or(self.defaults.execution_timeout_secs),
            rate_limit: request.rate_limit.unwrap_or(self.defaults.rate_limit),
            failure_policy: request.failure_policy.unwrap_or_default(),
            partition_size: request
                .partition_size
                .unwrap_or(self.scheduler.partition_size),
        };
        for (field, value) in [
            ("concurrency", options.concurrency as u64),
            ("execution_timeout_secs", options.execution_timeout_secs),
            ("rate_limit", u64::from(options.rate_limit)),
            ("partition_size", options.partition_size as u64),
        ] {
            if value == 0 {
                return Err(ScanError::validation(format!("{field} must be positive")));
            }
        }

        let name = match request.name.trim() {
            "" => format!("scan-{}", &TaskId::new().to_string()[..8]),
            name => name.to_string(),
        };

        Ok(ValidatedRequest {
            name,
            policy,
            priority,
            options,
        })
    }

    async fn shard_task(
        &self,
        task: &mut Task,
        targets: Vec<String>,
        now: DateTime<Utc>,
    ) -> ScanResult<Vec<Shard>> {
        task.status = TaskStateMachine::determine_target_state(task.status, &TaskEvent::BeginSharding)?;

        let shards: Vec<Shard> = partition_targets(targets, task.options.partition_size)
            .into_iter()
            .enumerate()
            .map(|(sequence, partition)| {
                let mut shard = Shard::new(task.id, sequence as u32, partition, task.priority);
                shard.enqueued_at = now;
                shard.updated_at = now;
                shard
            })
            .collect();
        self.store.save_shards(&shards).await?;

        task.status = TaskStateMachine::determine_target_state(task.status, &TaskEvent::ShardsQueued)?;
        task.updated_at = now;
        self.store.save_task(task).await?;
        Ok(shards)
    }

    /// Halt dispatch of a task; nodes stop its shards at the next target boundary.
    /// Pausing a paused task is a no-op.
    #[instrument(skip(self))]
    pub async fn pause_task(&self, task_id: TaskId) -> ScanResult<()> {
        let mut table = self.table.write().await;
        let entry = table.live_mut(task_id)?;

        match entry.task.status {
            TaskState::Paused => return Ok(()),
            status if !status.is_dispatchable() => {
                return Err(ScanError::invalid_state("task", task_id, status, "pause"))
            }
            _ => {}
        }

        let mut updated = entry.task.clone();
        updated.status = TaskStateMachine::determine_target_state(updated.status, &TaskEvent::Pause)?;
        updated.touch();
        self.store.save_task(&updated).await?;
        entry.task = updated;

        let held = entry.held_shards();
        let held_count = held.len();
        self.dispatcher.hold_task(task_id, held);

        log_task_operation(
            "pause",
            Some(&task_id.to_string()),
            Some(&entry.task.name),
            "paused",
            Some(&format!("{held_count} shards signalled")),
        );
        Ok(())
    }

    /// Put a paused task back to work. Queued shards restart at their checkpoints;
    /// shards still winding down re-queue themselves when they report.
    #[instrument(skip(self))]
    pub async fn resume_task(&self, task_id: TaskId) -> ScanResult<()> {
        let mut table = self.table.write().await;
        let entry = table.live_mut(task_id)?;

        match entry.task.status {
            TaskState::Paused => {}
            TaskState::Dispatching | TaskState::Running => return Ok(()),
            status => return Err(ScanError::invalid_state("task", task_id, status, "resume")),
        }

        let mut updated = entry.task.clone();
        updated.status = TaskStateMachine::determine_target_state(updated.status, &TaskEvent::Resume)?;
        updated.touch();
        self.store.save_task(&updated).await?;
        entry.task = updated;

        let now = Utc::now();
        let mut requeued = 0;
        for shard in entry.shards.iter_mut().filter(|s| s.status == ShardState::Queued) {
            shard.enqueued_at = now;
            self.dispatcher.enqueue(queue_entry(shard));
            requeued += 1;
        }

        log_task_operation(
            "resume",
            Some(&task_id.to_string()),
            Some(&entry.task.name),
            &entry.task.status.to_string(),
            Some(&format!("{requeued} shards re-queued")),
        );
        Ok(())
    }

    /// Cancel a task. Queued shards are dropped at once; shards on nodes are
    /// signalled and the record is purged once they confirm or the delete-ack
    /// timeout passes. Deleting twice is a no-op.
    #[instrument(skip(self))]
    pub async fn delete_task(&self, task_id: TaskId, force: bool) -> ScanResult<()> {
        let mut table = self.table.write().await;
        let entry = table
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| ScanError::not_found("task", task_id))?;
        if entry.task.is_deleted() {
            return Ok(());
        }

        let now = Utc::now();
        entry.task.deleted_at = Some(now);
        if !entry.task.status.is_terminal() {
            entry.task.status =
                TaskStateMachine::determine_target_state(entry.task.status, &TaskEvent::Cancel)?;
            record_task_finished(entry.task.status);
        }
        entry.task.updated_at = now;
        self.cancel_remaining(entry, force, now)?;
        entry.purge_after = Some(now + chrono_duration(self.scheduler.delete_ack_timeout()));
        self.persist(entry).await?;

        let awaiting = entry.pending_cancel.len();
        log_task_operation(
            "delete",
            Some(&task_id.to_string()),
            Some(&entry.task.name),
            "cancelled",
            Some(&format!("{awaiting} shards awaiting cancellation")),
        );

        if awaiting == 0 {
            self.purge_entry(&mut table, task_id).await?;
        }
        Ok(())
    }

    /// Apply a node's shard report. Reports for terminal shards are ignored and
    /// reports carrying a superseded token are rejected as stale.
    #[instrument(skip(self, report), fields(shard_id = %report.shard_id, outcome = report.outcome.name()))]
    pub async fn record_shard_result(&self, report: &ShardReport) -> ScanResult<ShardState> {
        let mut table = self.table.write().await;
        let now = Utc::now();

        let purge = {
            let (entry, idx) = table
                .locate_mut(report.shard_id)
                .ok_or_else(|| ScanError::not_found("shard", report.shard_id))?;

            if entry.shards[idx].current_token() != Some(report.token) {
                return Err(stale(report.shard_id));
            }

            let status = entry.shards[idx].status;
            if status.is_terminal() {
                let confirms = report.outcome != ShardOutcome::Progress
                    && entry.pending_cancel.remove(&report.shard_id);
                if !confirms {
                    debug!(status = %status, "Ignoring report for finished shard");
                    return Ok(status);
                }
                self.dispatcher.shard_settled(report.shard_id);
                if !(entry.task.is_deleted() && entry.pending_cancel.is_empty()) {
                    return Ok(status);
                }
                Some(entry.task.id)
            } else {
                if entry.shards[idx].advance_checkpoint(report.checkpoint) {
                    entry.dirty.insert(idx);
                }

                let event = match &report.outcome {
                    ShardOutcome::Progress => {
                        (status == ShardState::Assigned).then_some(ShardEvent::Start)
                    }
                    ShardOutcome::Completed => {
                        let total = entry.shards[idx].targets.len();
                        entry.shards[idx].advance_checkpoint(total);
                        Some(ShardEvent::Complete)
                    }
                    ShardOutcome::Failed { reason, retryable } => Some(ShardEvent::Fail {
                        reason: reason.clone(),
                        retryable: *retryable,
                    }),
                    ShardOutcome::Released => {
                        record_shard_requeued("released");
                        Some(ShardEvent::Release)
                    }
                    // Only delete and fail-fast cancel shards, and both settle
                    // them here first; any other cancel came from a stale signal
                    ShardOutcome::Cancelled => {
                        warn!(
                            node_id = %report.node_id,
                            "Unrequested cancellation; shard goes back to the queue"
                        );
                        record_shard_requeued("unrequested_cancel");
                        Some(ShardEvent::Release)
                    }
                };
                if let Some(event) = event {
                    self.transition_shard(entry, idx, &event, true, now)?;
                }

                self.reconcile(entry, now)?;
                self.persist(entry).await?;
                return Ok(entry.shards[idx].status);
            }
        };

        if let Some(task_id) = purge {
            self.purge_entry(&mut table, task_id).await?;
        }
        Ok(ShardState::Cancelled)
    }

    /// Apply one execution result: the first result proves the shard started,
    /// and vulnerable findings are counted by severity
    #[instrument(skip(self, result), fields(shard_id = %result.shard_id, plugin_id = %result.plugin_id))]
    pub async fn record_execution_result(&self, result: &ExecutionResult) -> ScanResult<()> {
        let mut table = self.table.write().await;
        let (entry, idx) = table
            .locate_mut(result.shard_id)
            .ok_or_else(|| ScanError::not_found("shard", result.shard_id))?;

        if entry.shards[idx].current_token() != Some(result.token) {
            return Err(stale(result.shard_id));
        }
        if entry.shards[idx].status.is_terminal() {
            debug!("Ignoring execution result for finished shard");
            return Ok(());
        }

        let now = Utc::now();
        let mut changed = false;
        if entry.shards[idx].status == ShardState::Assigned {
            self.transition_shard(entry, idx, &ShardEvent::Start, true, now)?;
            self.reconcile(entry, now)?;
            changed = true;
        }
        if result.vulnerable {
            entry.task.findings.record(result.severity);
            entry.task.updated_at = now;
            changed = true;
        }

        if changed {
            self.persist(entry).await?;
        }
        Ok(())
    }

    pub async fn get_task(&self, task_id: TaskId) -> ScanResult<TaskStatusView> {
        let table = self.table.read().await;
        let entry = table
            .tasks
            .get(&task_id)
            .ok_or_else(|| ScanError::not_found("task", task_id))?;
        Ok(TaskStatusView {
            task: entry.task.clone(),
            shards: entry.counts(),
        })
    }

    /// Tasks newest first, deleted tasks excluded
    pub async fn list_tasks(&self, query: &TaskQuery) -> Vec<Task> {
        let table = self.table.read().await;
        let mut tasks: Vec<&Task> = table
            .tasks
            .values()
            .map(|e| &e.task)
            .filter(|t| !t.is_deleted())
            .filter(|t| query.status.map_or(true, |status| t.status == status))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let per_page = query.per_page.max(1);
        let skip = query.page.max(1).saturating_sub(1).saturating_mul(per_page);
        tasks.into_iter().skip(skip).take(per_page).cloned().collect()
    }

    pub async fn list_shards(&self, task_id: TaskId) -> ScanResult<Vec<Shard>> {
        let table = self.table.read().await;
        table
            .tasks
            .get(&task_id)
            .map(|e| e.shards.clone())
            .ok_or_else(|| ScanError::not_found("task", task_id))
    }

    pub async fn get_shard(&self, shard_id: ShardId) -> ScanResult<Shard> {
        let table = self.table.read().await;
        table
            .shard_index
            .get(&shard_id)
            .and_then(|task_id| table.tasks.get(task_id))
            .and_then(|entry| entry.shards.iter().find(|s| s.id == shard_id))
            .cloned()
            .ok_or_else(|| ScanError::not_found("shard", shard_id))
    }

    // ------------------------------------------------------------------
    // Dispatcher-facing bookkeeping
    // ------------------------------------------------------------------

    /// Assign a queued shard to a node. Returns `None` when the queue entry is
    /// stale: the shard moved on, or its task is paused or gone.
    pub async fn assign_shard(
        &self,
        shard_id: ShardId,
        node_id: &str,
        token: AssignmentToken,
        now: DateTime<Utc>,
    ) -> ScanResult<Option<ShardAssignment>> {
        let mut table = self.table.write().await;
        let Some((entry, idx)) = table.locate_mut(shard_id) else {
            return Ok(None);
        };
        if entry.task.is_deleted()
            || !entry.task.status.is_dispatchable()
            || entry.shards[idx].status != ShardState::Queued
        {
            return Ok(None);
        }

        self.transition_shard(entry, idx, &ShardEvent::Assign, true, now)?;
        let shard = &mut entry.shards[idx];
        shard.attempts += 1;
        shard.assignment = Some(Assignment {
            node_id: node_id.to_string(),
            token,
            attempt: shard.attempts,
            assigned_at: now,
            acked_at: None,
        });
        self.reconcile(entry, now)?;

        if let Err(e) = self.persist(entry).await {
            undo_assignment(&mut entry.shards[idx]);
            return Err(e);
        }

        let shard = &entry.shards[idx];
        let task = &entry.task;
        Ok(Some(ShardAssignment {
            shard_id,
            task_id: task.id,
            node_id: node_id.to_string(),
            token,
            attempt: shard.attempts,
            targets: shard.targets.clone(),
            start_offset: shard.checkpoint,
            policy: task.policy,
            vuln_ids: task.vuln_ids.clone(),
            auth_ref: task.auth_ref.clone(),
            options: task.options.clone(),
            assigned_at: now,
        }))
    }

    /// Undo an assignment whose message never reached the bus. No retry is consumed.
    pub async fn revert_assignment(
        &self,
        shard_id: ShardId,
        token: AssignmentToken,
    ) -> ScanResult<bool> {
        let mut table = self.table.write().await;
        let Some((entry, idx)) = table.locate_mut(shard_id) else {
            return Ok(false);
        };
        let shard = &mut entry.shards[idx];
        if shard.status != ShardState::Assigned || shard.current_token() != Some(token) {
            return Ok(false);
        }
        undo_assignment(shard);
        entry.dirty.insert(idx);
        self.persist(entry).await?;
        Ok(true)
    }

    /// Record a node's acceptance of an assignment
    pub async fn acknowledge_assignment(&self, ack: &AssignmentAck) -> ScanResult<()> {
        let mut table = self.table.write().await;
        let (entry, idx) = table
            .locate_mut(ack.shard_id)
            .ok_or_else(|| ScanError::not_found("shard", ack.shard_id))?;
        if entry.shards[idx].current_token() != Some(ack.token) {
            return Err(stale(ack.shard_id));
        }

        let now = Utc::now();
        if let Some(assignment) = entry.shards[idx].assignment.as_mut() {
            if assignment.acked_at.is_none() {
                assignment.acked_at = Some(now);
                entry.dirty.insert(idx);
            }
        }
        if entry.shards[idx].status == ShardState::Assigned {
            self.transition_shard(entry, idx, &ShardEvent::Start, true, now)?;
            self.reconcile(entry, now)?;
        }
        self.persist(entry).await
    }

    /// Take a shard back from its node (ack timeout, node loss), consuming one
    /// retry. Ignored unless `token` is still the shard's live assignment.
    pub async fn requeue_shard(
        &self,
        shard_id: ShardId,
        token: AssignmentToken,
        reason: &str,
    ) -> ScanResult<Option<ShardState>> {
        let mut table = self.table.write().await;
        let Some((entry, idx)) = table.locate_mut(shard_id) else {
            return Ok(None);
        };
        let shard = &entry.shards[idx];
        if !shard.status.is_in_flight() || shard.current_token() != Some(token) {
            return Ok(None);
        }

        let now = Utc::now();
        let state = self.transition_shard(
            entry,
            idx,
            &ShardEvent::Requeue {
                reason: reason.to_string(),
            },
            true,
            now,
        )?;
        record_shard_requeued("reclaimed");
        self.reconcile(entry, now)?;
        self.persist(entry).await?;
        Ok(Some(state))
    }

    /// Purge deleted tasks whose cancellations settled or timed out
    pub async fn purge_deleted(&self, now: DateTime<Utc>) -> ScanResult<Vec<TaskId>> {
        let mut table = self.table.write().await;
        let due: Vec<TaskId> = table
            .tasks
            .values()
            .filter(|e| e.task.is_deleted())
            .filter(|e| e.pending_cancel.is_empty() || e.purge_after.is_some_and(|at| at <= now))
            .map(|e| e.task.id)
            .collect();

        for task_id in &due {
            self.purge_entry(&mut table, *task_id).await?;
        }
        Ok(due)
    }

    /// Load every task and shard from the store. Tasks already in memory are
    /// kept; tasks interrupted before dispatch are failed; deleted tasks are purged.
    pub async fn recover(&self) -> ScanResult<RecoveredState> {
        let stored = self.store.list_tasks().await?;
        let now = Utc::now();
        let mut table = self.table.write().await;
        let mut recovered = RecoveredState::default();

        for task in stored {
            if table.tasks.contains_key(&task.id) {
                continue;
            }
            if task.is_deleted() {
                self.store.delete_task(task.id).await?;
                continue;
            }

            let shards = self.store.list_shards(task.id).await?;
            let mut entry = TaskEntry::new(task, shards);

            if matches!(entry.task.status, TaskState::Pending | TaskState::Sharding) {
                let event = TaskEvent::Fail("interrupted before dispatch".to_string());
                entry.task.status = TaskStateMachine::determine_target_state(entry.task.status, &event)?;
                entry.task.error_message = event.error_message().map(str::to_string);
                entry.task.updated_at = now;
                self.cancel_remaining(&mut entry, false, now)?;
                self.persist(&mut entry).await?;
            }

            for shard in &entry.shards {
                match shard.status {
                    ShardState::Queued if entry.task.status.is_dispatchable() => {
                        recovered.queued.push(queue_entry(shard));
                    }
                    ShardState::Assigned | ShardState::Running => {
                        if let Some(assignment) = &shard.assignment {
                            recovered.in_flight.push(RecoveredAssignment {
                                shard_id: shard.id,
                                node_id: assignment.node_id.clone(),
                                token: assignment.token,
                                assigned_at: assignment.assigned_at,
                                acked: assignment.acked_at.is_some(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            table.insert(entry);
        }

        info!(
            tasks = table.tasks.len(),
            queued = recovered.queued.len(),
            in_flight = recovered.in_flight.len(),
            "🔄 Task table recovered from store"
        );
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Apply a shard event. A shard back in `Queued` is re-enqueued while its
    /// task is dispatchable; `settle` frees the node slot when the shard leaves
    /// its node.
    fn transition_shard(
        &self,
        entry: &mut TaskEntry,
        idx: usize,
        event: &ShardEvent,
        settle: bool,
        now: DateTime<Utc>,
    ) -> ScanResult<ShardState> {
        let dispatchable = entry.task.status.is_dispatchable() && !entry.task.is_deleted();
        let shard = &mut entry.shards[idx];
        let from = shard.status;
        let next = self
            .shard_machine
            .transition(from, shard.retry_count, event)?;

        shard.status = next.state;
        shard.retry_count = next.retry_count;
        shard.updated_at = now;
        if let Some(reason) = event.reason() {
            shard.last_error = Some(reason.to_string());
        }

        let node_id = shard.assigned_node().map(str::to_string);
        if next.state == ShardState::Queued {
            shard.assignment = None;
            shard.enqueued_at = now;
            if dispatchable {
                self.dispatcher.enqueue(queue_entry(shard));
            }
        }
        if settle && from.is_in_flight() && !next.state.is_in_flight() {
            self.dispatcher.shard_settled(shard.id);
        }
        entry.dirty.insert(idx);

        log_shard_operation(
            event.event_type(),
            Some(&shard.task_id.to_string()),
            Some(&shard.id.to_string()),
            node_id.as_deref(),
            &next.state.to_string(),
            event.reason(),
        );
        Ok(next.state)
    }

    /// Bring the task status in line with its shards. Escalating to `failed`
    /// cancels whatever is still unfinished.
    fn reconcile(&self, entry: &mut TaskEntry, now: DateTime<Utc>) -> ScanResult<()> {
        entry.refresh_progress();
        let counts = entry.counts();
        let Some(event) =
            aggregate_task_event(entry.task.status, &counts, entry.task.options.failure_policy)
        else {
            return Ok(());
        };

        let next = TaskStateMachine::determine_target_state(entry.task.status, &event)?;
        entry.task.status = next;
        entry.task.updated_at = now;
        record_task_finished(next);
        if let Some(message) = event.error_message() {
            entry.task.error_message = Some(message.to_string());
        }
        log_task_operation(
            event.event_type(),
            Some(&entry.task.id.to_string()),
            Some(&entry.task.name),
            &next.to_string(),
            event.error_message(),
        );

        if next == TaskState::Failed {
            self.cancel_remaining(entry, false, now)?;
        }
        Ok(())
    }

    /// Cancel every unfinished shard; shards on nodes wait for confirmation
    fn cancel_remaining(
        &self,
        entry: &mut TaskEntry,
        force: bool,
        now: DateTime<Utc>,
    ) -> ScanResult<()> {
        let mut held = Vec::new();
        for idx in 0..entry.shards.len() {
            let shard = &entry.shards[idx];
            if shard.status.is_terminal() {
                continue;
            }
            let holder = shard
                .status
                .is_in_flight()
                .then(|| shard.assignment.as_ref())
                .flatten()
                .map(|a| HeldShard {
                    shard_id: shard.id,
                    node_id: a.node_id.clone(),
                    token: a.token,
                });

            self.transition_shard(entry, idx, &ShardEvent::Cancel, false, now)?;
            if let Some(held_shard) = holder {
                entry.pending_cancel.insert(held_shard.shard_id);
                held.push(held_shard);
            }
        }
        entry.refresh_progress();
        self.dispatcher.cancel_task(entry.task.id, held, force);
        Ok(())
    }

    /// Write the task and its changed shards through to the store
    async fn persist(&self, entry: &mut TaskEntry) -> ScanResult<()> {
        if !entry.dirty.is_empty() {
            let changed: Vec<Shard> = entry
                .dirty
                .iter()
                .filter_map(|idx| entry.shards.get(*idx).cloned())
                .collect();
            self.store.save_shards(&changed).await?;
            entry.dirty.clear();
        }
        self.store.save_task(&entry.task).await?;
        Ok(())
    }

    async fn purge_entry(&self, table: &mut TaskTable, task_id: TaskId) -> ScanResult<()> {
        self.store.delete_task(task_id).await?;
        if let Some(entry) = table.remove(task_id) {
            for shard_id in &entry.pending_cancel {
                self.dispatcher.shard_settled(*shard_id);
            }
            let shard_ids: HashSet<ShardId> = entry.shards.iter().map(|s| s.id).collect();
            self.results_seen.forget_shards(&shard_ids);
            log_task_operation(
                "purge",
                Some(&task_id.to_string()),
                Some(&entry.task.name),
                "purged",
                (!entry.pending_cancel.is_empty()).then_some("cancellation not confirmed"),
            );
        }
        Ok(())
    }
}

fn undo_assignment(shard: &mut Shard) {
    shard.status = ShardState::Queued;
    shard.assignment = None;
    shard.attempts = shard.attempts.saturating_sub(1);
}
