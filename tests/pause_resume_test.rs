//! Pausing halts dispatch and releases running shards at a target boundary;
//! resuming continues from the recorded checkpoints.

mod common;

use common::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use vulnscan_core::error::ScanError;
use vulnscan_core::messaging::InMemoryMessageBus;
use vulnscan_core::models::{NewTask, Severity};
use vulnscan_core::orchestration::SchedulingCenter;
use vulnscan_core::persistence::InMemoryStateStore;
use vulnscan_core::state_machine::{ShardState, TaskState};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_releases_shards_and_resume_finishes_from_checkpoint() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let center = SchedulingCenter::start(fast_config(), Arc::new(InMemoryStateStore::new()), bus.clone())
        .await
        .unwrap();
    let registry = registry_with(vec![scripted_plugin(
        "slow-check",
        Severity::Low,
        &["10.30.0.7"],
        Duration::from_millis(150),
    )])
    .await;
    let recording = Arc::new(RecordingBus::new(bus.clone()));
    let node = spawn_node(node_agent_on("node-a", 1, recording.clone(), registry));

    let manager = center.task_manager().clone();
    let targets: Vec<String> = (1..=12).map(|i| format!("10.30.0.{i}")).collect();
    let task_id = manager
        .create_task(NewTask::new("pausable", targets, "full").with_partition_size(12))
        .await
        .unwrap();

    let progressed = wait_until(Duration::from_secs(10), || async {
        manager
            .list_shards(task_id)
            .await
            .map(|shards| shards.iter().any(|s| s.status == ShardState::Running && s.checkpoint > 0))
            .unwrap_or(false)
    })
    .await;
    assert!(progressed, "no shard made progress before pause");

    manager.pause_task(task_id).await.unwrap();
    // Pausing twice is a no-op
    manager.pause_task(task_id).await.unwrap();
    assert_eq!(
        manager.get_task(task_id).await.unwrap().task.status,
        TaskState::Paused
    );

    let released = wait_until(Duration::from_secs(10), || async {
        manager
            .get_task(task_id)
            .await
            .map(|view| view.shards.in_flight() == 0)
            .unwrap_or(false)
    })
    .await;
    assert!(released, "running shard was not released");

    let paused_shards = manager.list_shards(task_id).await.unwrap();
    let interrupted: Vec<_> = paused_shards
        .iter()
        .filter(|s| s.status == ShardState::Queued && s.checkpoint > 0)
        .map(|s| (s.id, s.checkpoint))
        .collect();
    assert!(!interrupted.is_empty(), "checkpoint lost on release");
    assert!(paused_shards.iter().all(|s| s.retry_count == 0));

    // Nothing is dispatched while paused
    tokio::time::sleep(Duration::from_millis(400)).await;
    let view = manager.get_task(task_id).await.unwrap();
    assert_eq!(view.task.status, TaskState::Paused);
    assert_eq!(view.shards.in_flight(), 0);
    assert_eq!(node.agent.running_shards(), 0);

    manager.resume_task(task_id).await.unwrap();
    let completed = wait_until(Duration::from_secs(20), || async {
        manager
            .get_task(task_id)
            .await
            .map(|view| view.task.status == TaskState::Completed)
            .unwrap_or(false)
    })
    .await;
    assert!(completed, "resumed task did not complete");

    let view = manager.get_task(task_id).await.unwrap();
    assert_eq!(view.task.progress.completed, 12);
    assert_eq!(view.task.findings.low, 1);
    for (shard_id, _) in interrupted {
        let shard = manager.get_shard(shard_id).await.unwrap();
        assert!(shard.attempts >= 2);
        assert_eq!(shard.status, ShardState::Completed);
    }

    // Resume picks up after the checkpoint: no target runs twice, none is skipped
    let mut runs_per_target: BTreeMap<String, usize> = BTreeMap::new();
    for result in recording.executions().iter().filter(|r| r.task_id == task_id) {
        *runs_per_target.entry(result.target.clone()).or_default() += 1;
    }
    assert_eq!(runs_per_target.len(), 12, "targets executed: {runs_per_target:?}");
    assert!(
        runs_per_target.values().all(|runs| *runs == 1),
        "targets executed more than once: {runs_per_target:?}"
    );

    node.stop().await;
    center.shutdown().await;
}

#[tokio::test]
async fn test_pause_and_resume_reject_invalid_states() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let center = SchedulingCenter::start(fast_config(), Arc::new(InMemoryStateStore::new()), bus)
        .await
        .unwrap();
    let manager = center.task_manager().clone();

    let task_id = manager
        .create_task(NewTask::new("idle", vec!["10.40.0.1".into()], "smart"))
        .await
        .unwrap();

    // Resuming a task that is not paused is a no-op
    manager.resume_task(task_id).await.unwrap();

    manager.delete_task(task_id, true).await.unwrap();
    let err = manager.pause_task(task_id).await.unwrap_err();
    assert!(matches!(
        err,
        ScanError::NotFound { .. } | ScanError::InvalidState { .. }
    ));

    let missing = manager.pause_task(vulnscan_core::models::TaskId::new()).await;
    assert!(matches!(missing, Err(ScanError::NotFound { .. })));

    center.shutdown().await;
}
