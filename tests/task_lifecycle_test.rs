//! End-to-end task lifecycle: scheduling center and node agents over the
//! in-memory bus.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use vulnscan_core::error::ScanError;
use vulnscan_core::messaging::InMemoryMessageBus;
use vulnscan_core::models::{NewTask, NodeStatus, Severity, TaskId};
use vulnscan_core::orchestration::{SchedulingCenter, TaskManager};
use vulnscan_core::persistence::InMemoryStateStore;
use vulnscan_core::state_machine::{ShardState, TaskState};

fn hosts(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("10.20.0.{i}")).collect()
}

async fn start_center(bus: Arc<InMemoryMessageBus>) -> SchedulingCenter {
    SchedulingCenter::start(fast_config(), Arc::new(InMemoryStateStore::new()), bus)
        .await
        .expect("scheduling center starts")
}

async fn wait_for_status(
    manager: &TaskManager,
    task_id: TaskId,
    status: TaskState,
    timeout: Duration,
) -> bool {
    wait_until(timeout, || async {
        manager
            .get_task(task_id)
            .await
            .map(|view| view.task.status == status)
            .unwrap_or(false)
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_completes_across_two_nodes() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let center = start_center(bus.clone()).await;
    let registry = registry_with(vec![
        scripted_plugin("http-banner", Severity::Info, &[], Duration::ZERO),
        scripted_plugin("weak-tls", Severity::High, &["10.20.0.3"], Duration::ZERO),
    ])
    .await;

    let first = spawn_node(node_agent("node-a", 2, bus.clone(), registry.clone()));
    let second = spawn_node(node_agent("node-b", 2, bus.clone(), registry.clone()));

    let manager = center.task_manager().clone();
    let task_id = manager
        .create_task(NewTask::new("nightly", hosts(5), "full"))
        .await
        .unwrap();
    assert_eq!(manager.list_shards(task_id).await.unwrap().len(), 3);

    assert!(
        wait_for_status(&manager, task_id, TaskState::Completed, Duration::from_secs(15)).await,
        "task did not complete: {:?}",
        manager.get_task(task_id).await.map(|v| v.task.status)
    );

    let view = manager.get_task(task_id).await.unwrap();
    assert_eq!(view.shards.completed, 3);
    assert_eq!(view.task.progress.completed, 5);
    assert_eq!(view.task.progress.total, 5);
    assert_eq!(view.task.findings.high, 1);
    assert_eq!(view.task.findings.total(), 1);
    assert!(manager
        .list_shards(task_id)
        .await
        .unwrap()
        .iter()
        .all(|s| s.status == ShardState::Completed && s.checkpoint == s.targets.len()));

    let nodes = center.list_nodes().await.unwrap();
    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["node-a", "node-b"]);

    first.stop().await;
    second.stop().await;
    center.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unacknowledged_shard_moves_to_live_node() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let center = start_center(bus.clone()).await;
    let registry = registry_with(vec![scripted_plugin(
        "open-port",
        Severity::Low,
        &[],
        Duration::ZERO,
    )])
    .await;

    // Registers with one heartbeat, then never polls its assignment queue
    let phantom = node_agent("phantom", 1, bus.clone(), registry.clone());
    phantom.send_heartbeat(NodeStatus::Online).await.unwrap();

    let manager = center.task_manager().clone();
    let task_id = manager
        .create_task(NewTask::new("handover", hosts(2), "full"))
        .await
        .unwrap();

    let assigned = wait_until(Duration::from_secs(5), || async {
        manager
            .list_shards(task_id)
            .await
            .map(|shards| shards.iter().any(|s| s.assigned_node() == Some("phantom")))
            .unwrap_or(false)
    })
    .await;
    assert!(assigned, "shard never assigned to the registered node");

    let live = spawn_node(node_agent("live", 2, bus.clone(), registry));
    assert!(wait_for_status(&manager, task_id, TaskState::Completed, Duration::from_secs(20)).await);

    let shard = &manager.list_shards(task_id).await.unwrap()[0];
    assert!(shard.retry_count >= 1);
    assert_eq!(shard.assigned_node(), Some("live"));

    live.stop().await;
    center.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deleting_running_task_stops_node_work() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let center = start_center(bus.clone()).await;
    let registry = registry_with(vec![scripted_plugin(
        "slow-check",
        Severity::Medium,
        &[],
        Duration::from_millis(200),
    )])
    .await;
    let node = spawn_node(node_agent("node-a", 2, bus.clone(), registry));

    let manager = center.task_manager().clone();
    let task_id = manager
        .create_task(NewTask::new("to-delete", hosts(40), "full").with_partition_size(4))
        .await
        .unwrap();

    let running = wait_until(Duration::from_secs(5), || async {
        node.agent.running_shards() > 0
    })
    .await;
    assert!(running, "node never picked up a shard");

    manager.delete_task(task_id, false).await.unwrap();
    // Deleting again is a no-op while cancellation settles
    let _ = manager.delete_task(task_id, false).await;

    assert!(manager
        .list_tasks(&Default::default())
        .await
        .iter()
        .all(|t| t.id != task_id));

    let purged = wait_until(Duration::from_secs(10), || async {
        matches!(
            manager.get_task(task_id).await,
            Err(ScanError::NotFound { .. })
        )
    })
    .await;
    assert!(purged, "deleted task was not purged");

    let idle = wait_until(Duration::from_secs(5), || async {
        node.agent.running_shards() == 0
    })
    .await;
    assert!(idle, "node kept running shards of a deleted task");

    node.stop().await;
    center.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_shutdown_reports_offline() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let center = start_center(bus.clone()).await;
    let registry = registry_with(vec![]).await;
    let node = spawn_node(node_agent("short-lived", 1, bus.clone(), registry));

    let registered = wait_until(Duration::from_secs(5), || async {
        center
            .get_node("short-lived")
            .await
            .map(|n| n.status == NodeStatus::Online)
            .unwrap_or(false)
    })
    .await;
    assert!(registered);

    node.stop().await;
    let offline = wait_until(Duration::from_secs(5), || async {
        center
            .get_node("short-lived")
            .await
            .map(|n| n.status == NodeStatus::Offline)
            .unwrap_or(false)
    })
    .await;
    assert!(offline);

    center.shutdown().await;
}
