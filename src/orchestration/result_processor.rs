//! Consumes node traffic from the bus and applies it to the scheduling center.
//!
//! Heartbeats go to the dispatcher; acks, execution results and shard reports go
//! to the [`TaskManager`]. Delivery is at-least-once, so execution results are
//! de-duplicated before they touch finding counts, and a message is acked only
//! once its effect is durable. Failures worth retrying leave the message on the
//! queue; anything else is logged and dropped.

use crate::config::BusConfig;
use crate::constants::queues;
use crate::error::{ScanError, ScanResult};
use crate::logging::log_error;
use crate::messaging::{BusMessage, MessageBus, ReceivedMessage, ResultDeduplicator};
use crate::orchestration::dispatcher::DispatcherHandle;
use crate::orchestration::task_manager::TaskManager;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with a message after handling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Retry,
}

#[derive(Debug)]
pub struct ResultProcessor {
    bus: Arc<dyn MessageBus>,
    task_manager: Arc<TaskManager>,
    dispatcher: DispatcherHandle,
    dedup: Arc<ResultDeduplicator>,
    visibility_timeout: Duration,
    batch_size: usize,
}

impl ResultProcessor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        task_manager: Arc<TaskManager>,
        dispatcher: DispatcherHandle,
        bus_config: &BusConfig,
    ) -> Self {
        let dedup = task_manager.result_dedup();
        Self {
            bus,
            task_manager,
            dispatcher,
            dedup,
            visibility_timeout: bus_config.visibility_timeout(),
            batch_size: bus_config.receive_batch_size.max(1),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, poll_interval: Duration) {
        info!("🚀 Result processor started");
        loop {
            let handled = match self.process_batch().await {
                Ok(handled) => handled,
                Err(e) => {
                    log_error("result_processor", "process_batch", &e.to_string(), None);
                    0
                }
            };
            if handled > 0 {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        info!("🛑 Result processor stopped");
    }

    /// Drain one batch from the heartbeat and result queues; returns how many
    /// messages were handled
    pub async fn process_batch(&self) -> ScanResult<usize> {
        let mut handled = 0;
        for queue in [queues::HEARTBEATS, queues::RESULTS] {
            let messages = self
                .bus
                .receive(queue, self.batch_size, self.visibility_timeout)
                .await?;
            for received in messages {
                let disposition = self.handle(&received).await;
                match disposition {
                    Disposition::Ack => self.bus.ack(queue, received.id).await?,
                    Disposition::Retry => self.bus.nack(queue, received.id, true).await?,
                }
                handled += 1;
            }
        }
        Ok(handled)
    }

    async fn handle(&self, received: &ReceivedMessage) -> Disposition {
        let message_type = received.message.message_type();
        let outcome = match &received.message {
            BusMessage::Heartbeat(heartbeat) => {
                self.dispatcher.heartbeat(heartbeat.clone());
                Ok(())
            }
            BusMessage::Ack(ack) => self
                .task_manager
                .acknowledge_assignment(ack)
                .await
                .map(|()| self.dispatcher.shard_acked(ack.shard_id, ack.token)),
            BusMessage::ExecutionResult(result) => {
                let key = result.dedup_key();
                if !self.dedup.first_delivery(key.clone()) {
                    debug!(shard_id = %result.shard_id, plugin_id = %result.plugin_id, "Duplicate execution result");
                    return Disposition::Ack;
                }
                let outcome = self.task_manager.record_execution_result(result).await;
                if outcome.as_ref().is_err_and(ScanError::is_retryable) {
                    self.dedup.forget(&key);
                }
                outcome
            }
            BusMessage::ShardReport(report) => self
                .task_manager
                .record_shard_result(report)
                .await
                .map(|state| {
                    if state.is_terminal() {
                        self.dedup.forget_shard(report.shard_id);
                    }
                }),
            BusMessage::Assignment(_) | BusMessage::Control(_) => {
                warn!(
                    queue = %received.queue,
                    message_type = message_type,
                    "Unexpected message on scheduling queue"
                );
                Ok(())
            }
        };

        match outcome {
            Ok(()) => Disposition::Ack,
            Err(ScanError::StaleAssignment { shard_id }) => {
                debug!(shard_id = %shard_id, message_type = message_type, "Dropping stale message");
                Disposition::Ack
            }
            Err(e @ ScanError::NotFound { .. }) => {
                debug!(error = %e, message_type = message_type, "Dropping message for unknown entity");
                Disposition::Ack
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    error = %e,
                    message_type = message_type,
                    receive_count = received.receive_count,
                    "Retrying message"
                );
                Disposition::Retry
            }
            Err(e) => {
                log_error(
                    "result_processor",
                    message_type,
                    &e.to_string(),
                    Some(&received.id.to_string()),
                );
                Disposition::Ack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SchedulerConfig, TaskDefaultsConfig};
    use crate::messaging::{AssignmentAck, InMemoryMessageBus};
    use crate::models::{
        AssignmentToken, ExecutionResult, NewTask, Severity, ShardOutcome, ShardReport,
    };
    use crate::orchestration::dispatcher::DispatcherCommand;
    use crate::persistence::InMemoryStateStore;
    use crate::state_machine::{ShardState, TaskState};
    use chrono::Utc;

    struct Harness {
        processor: ResultProcessor,
        manager: Arc<TaskManager>,
        bus: Arc<InMemoryMessageBus>,
        inbox: crate::orchestration::dispatcher::DispatcherInbox,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStateStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        bus.ensure_queue(queues::RESULTS).await.unwrap();
        bus.ensure_queue(queues::HEARTBEATS).await.unwrap();
        let (handle, inbox) = DispatcherHandle::channel();
        let manager = Arc::new(TaskManager::new(
            store,
            handle.clone(),
            SchedulerConfig::default(),
            TaskDefaultsConfig::default(),
        ));
        let processor =
            ResultProcessor::new(bus.clone(), manager.clone(), handle, &BusConfig::default());
        Harness {
            processor,
            manager,
            bus,
            inbox,
        }
    }

    fn vulnerable_result(
        assignment: &crate::messaging::ShardAssignment,
    ) -> ExecutionResult {
        ExecutionResult {
            task_id: assignment.task_id,
            shard_id: assignment.shard_id,
            token: assignment.token,
            attempt: assignment.attempt,
            target: assignment.targets[0].clone(),
            target_index: 0,
            plugin_id: "CVE-2017-5638".into(),
            plugin_version: "1.2.0".into(),
            severity: Severity::High,
            vulnerable: true,
            details: serde_json::json!({}),
            duration_ms: 40,
            error: None,
            finished_at: Utc::now(),
        }
    }

    async fn assigned(h: &mut Harness) -> crate::messaging::ShardAssignment {
        h.manager
            .create_task(NewTask::new("results", vec!["10.1.0.1".into()], "full"))
            .await
            .unwrap();
        let mut inbox_shard = None;
        while let Ok(command) = h.inbox.rx.try_recv() {
            if let DispatcherCommand::Enqueue(entry) = command {
                inbox_shard = Some(entry.shard_id);
            }
        }
        h.manager
            .assign_shard(
                inbox_shard.unwrap(),
                "node-a",
                AssignmentToken::new(),
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_results_counted_once() {
        let mut h = harness().await;
        let assignment = assigned(&mut h).await;
        let result = vulnerable_result(&assignment);
        for _ in 0..2 {
            h.bus
                .publish(queues::RESULTS, &BusMessage::ExecutionResult(result.clone()))
                .await
                .unwrap();
        }

        assert_eq!(h.processor.process_batch().await.unwrap(), 2);
        let view = h.manager.get_task(assignment.task_id).await.unwrap();
        assert_eq!(view.task.findings.high, 1);
        assert_eq!(h.bus.queue_depth(queues::RESULTS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ack_then_completion_report() {
        let mut h = harness().await;
        let assignment = assigned(&mut h).await;

        h.bus
            .publish(
                queues::RESULTS,
                &BusMessage::Ack(AssignmentAck {
                    shard_id: assignment.shard_id,
                    node_id: "node-a".into(),
                    token: assignment.token,
                }),
            )
            .await
            .unwrap();
        h.processor.process_batch().await.unwrap();
        let shard = h.manager.get_shard(assignment.shard_id).await.unwrap();
        assert_eq!(shard.status, ShardState::Running);
        assert!(shard.assignment.unwrap().acked_at.is_some());

        h.bus
            .publish(
                queues::RESULTS,
                &BusMessage::ShardReport(ShardReport {
                    shard_id: assignment.shard_id,
                    task_id: assignment.task_id,
                    node_id: "node-a".into(),
                    token: assignment.token,
                    outcome: ShardOutcome::Completed,
                    checkpoint: 1,
                }),
            )
            .await
            .unwrap();
        h.processor.process_batch().await.unwrap();
        let view = h.manager.get_task(assignment.task_id).await.unwrap();
        assert_eq!(view.task.status, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_purged_task_releases_dedup_keys() {
        let mut h = harness().await;
        let assignment = assigned(&mut h).await;
        h.bus
            .publish(
                queues::RESULTS,
                &BusMessage::ExecutionResult(vulnerable_result(&assignment)),
            )
            .await
            .unwrap();
        h.processor.process_batch().await.unwrap();
        assert_eq!(h.processor.dedup.len(), 1);

        // The node never confirms the cancel, so the task is purged on timeout
        h.manager.delete_task(assignment.task_id, false).await.unwrap();
        let purged = h
            .manager
            .purge_deleted(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, vec![assignment.task_id]);
        assert!(h.processor.dedup.is_empty());
    }

    #[tokio::test]
    async fn test_stale_report_is_dropped() {
        let mut h = harness().await;
        let assignment = assigned(&mut h).await;

        h.bus
            .publish(
                queues::RESULTS,
                &BusMessage::ShardReport(ShardReport {
                    shard_id: assignment.shard_id,
                    task_id: assignment.task_id,
                    node_id: "node-old".into(),
                    token: AssignmentToken::new(),
                    outcome: ShardOutcome::Completed,
                    checkpoint: 1,
                }),
            )
            .await
            .unwrap();

        assert_eq!(h.processor.process_batch().await.unwrap(), 1);
        assert_eq!(h.bus.queue_depth(queues::RESULTS).await.unwrap(), 0);
        let shard = h.manager.get_shard(assignment.shard_id).await.unwrap();
        assert_eq!(shard.status, ShardState::Assigned);
    }
}
