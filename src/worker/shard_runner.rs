//! # Shard Runner
//!
//! Executes one shard assignment on a node.
//!
//! Targets are taken in partition order from the assignment's start offset, with
//! up to `target_window` targets in flight. For each target the plugins matching
//! its fingerprint under the task policy run concurrently, bounded by the
//! per-target sub-limit, the task's node-wide concurrency and the per-target
//! rate limit. A target is finished once all its executions reported; the
//! checkpoint advances over the contiguous prefix of finished targets and is
//! saved locally and reported after every advance.
//!
//! Pause and cancel are cooperative: no new target starts once the shard is
//! signalled, and targets already started run to completion unless the signal
//! was forced, in which case running executions are aborted and their targets
//! stay unfinished.

use super::checkpoint::{CheckpointStore, CheckpointTracker, LocalCheckpoint};
use super::events::{AssetEvent, EventSink, NodeEvent, StatEvent};
use super::fingerprint::FingerprintProvider;
use super::pool::WorkerPool;
use super::rate_limiter::TargetRateLimiter;
use crate::constants::queues;
use crate::error::{ScanError, ScanResult};
use crate::logging::log_shard_operation;
use crate::messaging::{BusMessage, ControlAction, MessageBus, ShardAssignment};
use crate::metrics::worker as metrics;
use crate::models::{
    ExecutionErrorKind, ExecutionResult, ShardOutcome, ShardReport,
};
use crate::registry::{CheckContext, LoadedPlugin, RegistrySnapshot, SandboxLimits};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_BACKOFF: Duration = Duration::from_millis(100);

/// Stop signals for one running shard
#[derive(Debug, Clone, Default)]
pub struct ShardControl {
    stop: CancellationToken,
    abort: CancellationToken,
    action: Arc<Mutex<Option<ControlAction>>>,
}

impl ShardControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the shard to stop at the next target boundary. Cancel takes
    /// precedence over an earlier pause.
    pub fn signal(&self, action: ControlAction, force: bool) {
        {
            let mut current = self.action.lock();
            if *current != Some(ControlAction::Cancel) {
                *current = Some(action);
            }
        }
        self.stop.cancel();
        if force {
            self.abort.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn action(&self) -> Option<ControlAction> {
        *self.action.lock()
    }
}

/// Node-side limits applied to every shard
#[derive(Debug, Clone, Copy)]
pub struct RunnerLimits {
    pub per_target_concurrency: usize,
    pub target_window: usize,
}

/// Collaborators shared by all shard runners on a node
#[derive(Clone)]
pub struct RunnerContext {
    pub node_id: String,
    pub bus: Arc<dyn MessageBus>,
    pub pool: Arc<WorkerPool>,
    pub fingerprints: Arc<dyn FingerprintProvider>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub events: EventSink,
    pub limits: RunnerLimits,
}

/// What a finished run reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRunSummary {
    pub outcome: ShardOutcome,
    pub checkpoint: usize,
    pub executions: usize,
}

pub struct ShardRunner {
    ctx: RunnerContext,
    assignment: ShardAssignment,
    snapshot: Arc<RegistrySnapshot>,
    task_limit: Arc<Semaphore>,
    control: ShardControl,
    rate_limiter: TargetRateLimiter,
}

impl ShardRunner {
    /// `snapshot` is the registry version this shard runs against for its whole
    /// lifetime; `task_limit` is shared by all shards of the task on this node.
    pub fn new(
        ctx: RunnerContext,
        assignment: ShardAssignment,
        snapshot: Arc<RegistrySnapshot>,
        task_limit: Arc<Semaphore>,
        control: ShardControl,
    ) -> Self {
        let rate_limiter = TargetRateLimiter::new(assignment.options.rate_limit);
        Self {
            ctx,
            assignment,
            snapshot,
            task_limit,
            control,
            rate_limiter,
        }
    }

    #[instrument(skip(self), fields(shard_id = %self.assignment.shard_id, attempt = self.assignment.attempt))]
    pub async fn run(self) -> ScanResult<ShardRunSummary> {
        let total = self.assignment.targets.len();
        let start = self.assignment.start_offset.min(total);
        let mut tracker = CheckpointTracker::new(start, total);
        let window = self.ctx.limits.target_window.max(1);
        let mut executions = 0usize;

        info!(
            start_offset = start,
            targets = total,
            registry_version = self.snapshot.version(),
            "Shard execution started"
        );

        let mut in_flight = FuturesUnordered::new();
        let mut next = start;
        loop {
            while in_flight.len() < window && next < total && !self.control.is_stopped() {
                in_flight.push(self.scan_target(next));
                next += 1;
            }

            let Some(finished) = in_flight.next().await else {
                break;
            };
            let target = finished?;
            executions += target.executions;
            if target.completed {
                self.rate_limiter.forget(&self.assignment.targets[target.index]);
                if tracker.mark_finished(target.index) {
                    self.checkpoint_advanced(tracker.checkpoint()).await?;
                }
            }
        }

        let outcome = if tracker.is_complete() {
            ShardOutcome::Completed
        } else {
            match self.control.action() {
                Some(ControlAction::Cancel) => ShardOutcome::Cancelled,
                _ => ShardOutcome::Released,
            }
        };

        self.report(outcome.clone(), tracker.checkpoint()).await?;
        if let Err(e) = self.ctx.checkpoints.remove(self.assignment.shard_id).await {
            warn!(error = %e, "Failed to remove local checkpoint");
        }

        log_shard_operation(
            "execute",
            Some(&self.assignment.task_id.to_string()),
            Some(&self.assignment.shard_id.to_string()),
            Some(&self.ctx.node_id),
            outcome.name(),
            Some(&format!("checkpoint {}/{total}", tracker.checkpoint())),
        );

        Ok(ShardRunSummary {
            outcome,
            checkpoint: tracker.checkpoint(),
            executions,
        })
    }

    async fn scan_target(&self, index: usize) -> ScanResult<TargetScan> {
        let target = &self.assignment.targets[index];
        let fingerprint = self.ctx.fingerprints.fingerprint(target).await;
        if !fingerprint.is_empty() {
            self.ctx.events.emit(NodeEvent::Asset(AssetEvent {
                task_id: self.assignment.task_id,
                target: target.clone(),
                tags: fingerprint.clone(),
                observed_at: Utc::now(),
            }));
        }

        let plugins = self.snapshot.match_plugins(
            &fingerprint,
            self.assignment.policy,
            &self.assignment.vuln_ids,
        );
        debug!(target = %target, plugins = plugins.len(), "Target matched plugins");

        let per_target = Semaphore::new(self.ctx.limits.per_target_concurrency.max(1));
        let runs = plugins.into_iter().map(|plugin| {
            let ctx = CheckContext::new(
                self.assignment.task_id,
                self.assignment.shard_id,
                target.clone(),
                self.assignment.auth_ref.clone(),
                fingerprint.clone(),
            );
            self.run_plugin(index, plugin, ctx, &per_target)
        });

        let mut completed = true;
        let mut executions = 0;
        for run in futures::future::join_all(runs).await {
            executions += 1;
            completed &= run?;
        }

        Ok(TargetScan {
            index,
            completed,
            executions,
        })
    }

    /// Returns `false` when the execution was aborted and the target must be rescanned
    async fn run_plugin(
        &self,
        index: usize,
        plugin: Arc<LoadedPlugin>,
        ctx: CheckContext,
        per_target: &Semaphore,
    ) -> ScanResult<bool> {
        let _target_permit = per_target
            .acquire()
            .await
            .map_err(|e| ScanError::internal(e.to_string()))?;
        let _task_permit = self
            .task_limit
            .acquire()
            .await
            .map_err(|e| ScanError::internal(e.to_string()))?;
        if self.control.abort.is_cancelled() {
            return Ok(false);
        }
        self.rate_limiter.acquire(&ctx.target).await;

        let target = ctx.target.clone();
        let limits = SandboxLimits::with_abort(
            self.assignment.options.execution_timeout(),
            self.control.abort.clone(),
        );
        let outcome = self.ctx.pool.execute(plugin.clone(), ctx, limits).await?;

        let (vulnerable, details, error) = match outcome.result {
            Ok(check) => (check.vulnerable, check.details, None),
            Err(e) => (false, serde_json::Value::Null, Some(e)),
        };
        let aborted = error
            .as_ref()
            .is_some_and(|e| e.kind == ExecutionErrorKind::Cancelled);
        if aborted {
            return Ok(false);
        }

        let result = ExecutionResult {
            task_id: self.assignment.task_id,
            shard_id: self.assignment.shard_id,
            token: self.assignment.token,
            attempt: self.assignment.attempt,
            target: target.clone(),
            target_index: index,
            plugin_id: plugin.descriptor.id.clone(),
            plugin_version: plugin.descriptor.version.clone(),
            severity: plugin.descriptor.severity,
            vulnerable,
            details,
            duration_ms: outcome.duration.as_millis() as u64,
            error,
            finished_at: Utc::now(),
        };

        self.ctx.events.emit(NodeEvent::Stat(StatEvent {
            task_id: result.task_id,
            shard_id: result.shard_id,
            target,
            plugin_id: result.plugin_id.clone(),
            status: result.status(),
            duration_ms: result.duration_ms,
            vulnerable,
        }));

        metrics::record_execution(&result);
        self.publish(&BusMessage::ExecutionResult(result)).await?;
        Ok(true)
    }

    async fn checkpoint_advanced(&self, checkpoint: usize) -> ScanResult<()> {
        let local = LocalCheckpoint::new(self.assignment.shard_id, self.assignment.token, checkpoint);
        if let Err(e) = self.ctx.checkpoints.save(&local).await {
            warn!(error = %e, checkpoint = checkpoint, "Failed to persist local checkpoint");
        }
        self.report(ShardOutcome::Progress, checkpoint).await
    }

    async fn report(&self, outcome: ShardOutcome, checkpoint: usize) -> ScanResult<()> {
        let report = ShardReport {
            shard_id: self.assignment.shard_id,
            task_id: self.assignment.task_id,
            node_id: self.ctx.node_id.clone(),
            token: self.assignment.token,
            outcome,
            checkpoint,
        };
        self.publish(&BusMessage::ShardReport(report)).await
    }

    async fn publish(&self, message: &BusMessage) -> ScanResult<()> {
        let mut attempt = 1;
        loop {
            match self.ctx.bus.publish(queues::RESULTS, message).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < PUBLISH_ATTEMPTS => {
                    warn!(
                        error = %e,
                        attempt = attempt,
                        message_type = message.message_type(),
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(PUBLISH_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

struct TargetScan {
    index: usize,
    completed: bool,
    executions: usize,
}
