//! Node agent behavior against a bare bus, without a scheduling center.

mod common;

use chrono::Utc;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vulnscan_core::config::{BusConfig, NodeConfig};
use vulnscan_core::constants::queues;
use vulnscan_core::messaging::{
    BusMessage, ControlAction, ControlMessage, InMemoryMessageBus, MessageBus, ShardAssignment,
    SignalledShard,
};
use vulnscan_core::models::{
    AssignmentToken, FailurePolicy, NodeStatus, ScanPolicy, Severity, ShardId, ShardOutcome,
    TaskId, TaskOptions,
};
use vulnscan_core::registry::InProcessSandbox;
use vulnscan_core::worker::{
    CheckpointStore, EventSink, FileCheckpointStore, LoadSample, LocalCheckpoint, NodeAgent,
    NodeDependencies, NodeEvent, StaticFingerprints, StaticLoadProbe,
};

fn assignment(node_id: &str, targets: usize, policy: ScanPolicy) -> ShardAssignment {
    ShardAssignment {
        shard_id: ShardId::new(),
        task_id: TaskId::new(),
        node_id: node_id.into(),
        token: AssignmentToken::new(),
        attempt: 1,
        targets: (1..=targets).map(|i| format!("10.80.0.{i}")).collect(),
        start_offset: 0,
        policy,
        vuln_ids: vec![],
        auth_ref: None,
        options: TaskOptions {
            concurrency: 8,
            execution_timeout_secs: 5,
            rate_limit: 1000,
            failure_policy: FailurePolicy::BestEffort,
            partition_size: targets,
        },
        assigned_at: Utc::now(),
    }
}

async fn deliver(bus: &InMemoryMessageBus, assignment: &ShardAssignment) {
    bus.ensure_queue(&queues::control(&assignment.node_id))
        .await
        .unwrap();
    bus.publish(
        &queues::assignments(&assignment.node_id),
        &BusMessage::Assignment(assignment.clone()),
    )
    .await
    .unwrap();
}

async fn results(bus: &InMemoryMessageBus) -> Vec<BusMessage> {
    bus.peek_all(queues::RESULTS).await
}

async fn final_report(bus: &InMemoryMessageBus, shard_id: ShardId) -> Option<ShardOutcome> {
    results(bus).await.into_iter().find_map(|m| match m {
        BusMessage::ShardReport(r)
            if r.shard_id == shard_id && r.outcome != ShardOutcome::Progress =>
        {
            Some(r.outcome)
        }
        _ => None,
    })
}

fn signalled(assignment: &ShardAssignment) -> SignalledShard {
    SignalledShard {
        shard_id: assignment.shard_id,
        token: assignment.token,
    }
}

async fn report_outcome(bus: &InMemoryMessageBus, token: AssignmentToken) -> Option<ShardOutcome> {
    results(bus).await.into_iter().find_map(|m| match m {
        BusMessage::ShardReport(r) if r.token == token && r.outcome != ShardOutcome::Progress => {
            Some(r.outcome)
        }
        _ => None,
    })
}

async fn heartbeat_statuses(bus: &InMemoryMessageBus, node_id: &str) -> Vec<NodeStatus> {
    bus.peek_all(queues::HEARTBEATS)
        .await
        .into_iter()
        .filter_map(|m| match m {
            BusMessage::Heartbeat(hb) if hb.node_id == node_id => Some(hb.status),
            _ => None,
        })
        .collect()
}

async fn execution_count(bus: &InMemoryMessageBus, shard_id: ShardId) -> usize {
    results(bus)
        .await
        .iter()
        .filter(|m| matches!(m, BusMessage::ExecutionResult(r) if r.shard_id == shard_id))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_never_exceeds_advertised_slots() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let registry = registry_with(vec![scripted_plugin(
        "slow",
        Severity::Info,
        &[],
        Duration::from_millis(300),
    )])
    .await;
    let agent = node_agent("narrow", 1, bus.clone(), registry);

    let first = assignment("narrow", 2, ScanPolicy::Full);
    let second = assignment("narrow", 2, ScanPolicy::Full);
    deliver(&bus, &first).await;
    deliver(&bus, &second).await;

    assert_eq!(agent.poll_once().await.unwrap(), 1);
    assert_eq!(agent.running_shards(), 1);
    assert_eq!(agent.poll_once().await.unwrap(), 0);

    let acks: Vec<_> = results(&bus)
        .await
        .into_iter()
        .filter_map(|m| match m {
            BusMessage::Ack(ack) => Some(ack.shard_id),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec![first.shard_id]);

    let freed = wait_until(Duration::from_secs(5), || async {
        agent.running_shards() == 0
    })
    .await;
    assert!(freed);
    assert_eq!(final_report(&bus, first.shard_id).await, Some(ShardOutcome::Completed));

    assert_eq!(agent.poll_once().await.unwrap(), 1);
    assert_eq!(agent.running_shards(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_signal_stops_shard_at_target_boundary() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let registry = registry_with(vec![scripted_plugin(
        "slow",
        Severity::Info,
        &[],
        Duration::from_millis(100),
    )])
    .await;
    let agent = node_agent("canceller", 1, bus.clone(), registry);

    let shard = assignment("canceller", 40, ScanPolicy::Full);
    deliver(&bus, &shard).await;
    agent.poll_once().await.unwrap();
    assert_eq!(agent.running_shards(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    bus.publish(
        &queues::control("canceller"),
        &BusMessage::Control(ControlMessage {
            task_id: shard.task_id,
            shards: vec![signalled(&shard)],
            action: ControlAction::Cancel,
            force: false,
        }),
    )
    .await
    .unwrap();
    agent.poll_once().await.unwrap();

    let stopped = wait_until(Duration::from_secs(5), || async {
        agent.running_shards() == 0
    })
    .await;
    assert!(stopped);
    assert_eq!(final_report(&bus, shard.shard_id).await, Some(ShardOutcome::Cancelled));
    assert!(execution_count(&bus, shard.shard_id).await < 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redelivered_assignment_resumes_from_local_checkpoint() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let registry = registry_with(vec![scripted_plugin("banner-check", Severity::Low, &[], Duration::ZERO)]).await;
    let dir = TempDir::new().unwrap();
    let checkpoints = Arc::new(FileCheckpointStore::new(dir.path()));

    let shard = assignment("resumer", 10, ScanPolicy::Full);
    checkpoints
        .save(&LocalCheckpoint::new(shard.shard_id, shard.token, 6))
        .await
        .unwrap();

    let agent = NodeAgent::new(
        &NodeConfig {
            node_id: Some("resumer".into()),
            max_active_shards: 1,
            ..NodeConfig::default()
        },
        &BusConfig::default(),
        bus.clone(),
        registry,
        NodeDependencies {
            sandbox: Arc::new(InProcessSandbox::new()),
            fingerprints: Arc::new(StaticFingerprints::new()),
            checkpoints: checkpoints.clone(),
            load_probe: Arc::new(StaticLoadProbe::new(LoadSample::new(0.2, 0.2))),
            events: EventSink::disconnected(),
        },
    );

    deliver(&bus, &shard).await;
    agent.poll_once().await.unwrap();
    let done = wait_until(Duration::from_secs(5), || async {
        final_report(&bus, shard.shard_id).await.is_some()
    })
    .await;
    assert!(done);

    assert_eq!(final_report(&bus, shard.shard_id).await, Some(ShardOutcome::Completed));
    assert_eq!(execution_count(&bus, shard.shard_id).await, 4);
    let indices: Vec<usize> = results(&bus)
        .await
        .into_iter()
        .filter_map(|m| match m {
            BusMessage::ExecutionResult(r) => Some(r.target_index),
            _ => None,
        })
        .collect();
    assert!(indices.iter().all(|i| *i >= 6));

    // Completed shards leave no local checkpoint behind
    let cleared = wait_until(Duration::from_secs(2), || async {
        checkpoints.load(shard.shard_id).await.unwrap().is_none()
    })
    .await;
    assert!(cleared);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_policy_selects_plugins_and_events_are_emitted() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let registry = registry_with(vec![
        scripted_plugin("generic-info", Severity::Info, &[], Duration::ZERO),
        scripted_plugin("generic-critical", Severity::Critical, &["10.80.0.1"], Duration::ZERO),
    ])
    .await;
    let (events, mut rx) = EventSink::channel(64);

    let agent = NodeAgent::new(
        &NodeConfig {
            node_id: Some("redliner".into()),
            max_active_shards: 1,
            ..NodeConfig::default()
        },
        &BusConfig::default(),
        bus.clone(),
        registry,
        NodeDependencies {
            sandbox: Arc::new(InProcessSandbox::new()),
            fingerprints: Arc::new(
                StaticFingerprints::new().with_target("10.80.0.1", ["http", "nginx"]),
            ),
            checkpoints: Arc::new(vulnscan_core::worker::InMemoryCheckpointStore::new()),
            load_probe: Arc::new(StaticLoadProbe::new(LoadSample::new(0.2, 0.2))),
            events,
        },
    );

    let shard = assignment("redliner", 2, ScanPolicy::Redline);
    deliver(&bus, &shard).await;
    agent.poll_once().await.unwrap();
    let done = wait_until(Duration::from_secs(5), || async {
        final_report(&bus, shard.shard_id).await.is_some()
    })
    .await;
    assert!(done);

    let executed: Vec<(String, bool)> = results(&bus)
        .await
        .into_iter()
        .filter_map(|m| match m {
            BusMessage::ExecutionResult(r) => Some((r.plugin_id, r.vulnerable)),
            _ => None,
        })
        .collect();
    assert_eq!(executed.len(), 2);
    assert!(executed.iter().all(|(id, _)| id == "generic-critical"));
    assert_eq!(executed.iter().filter(|(_, vulnerable)| *vulnerable).count(), 1);

    let mut assets = 0;
    let mut stats = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            NodeEvent::Asset(asset) => {
                assets += 1;
                assert_eq!(asset.target, "10.80.0.1");
                assert!(asset.tags.contains("nginx"));
            }
            NodeEvent::Stat(_) => stats += 1,
        }
    }
    assert_eq!(assets, 1);
    assert_eq!(stats, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_for_superseded_run_spares_the_reassignment() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let registry = registry_with(vec![scripted_plugin(
        "slow",
        Severity::Info,
        &[],
        Duration::from_millis(50),
    )])
    .await;
    let agent = node_agent("reassigned", 2, bus.clone(), registry);

    let first = assignment("reassigned", 6, ScanPolicy::Full);
    deliver(&bus, &first).await;
    agent.poll_once().await.unwrap();
    assert_eq!(agent.running_shards(), 1);

    // The center gave up on the first run: it cancels it and hands the
    // same shard back to this node in one go
    let mut second = first.clone();
    second.token = AssignmentToken::new();
    second.attempt = 2;
    bus.publish(
        &queues::control("reassigned"),
        &BusMessage::Control(ControlMessage {
            task_id: first.task_id,
            shards: vec![signalled(&first)],
            action: ControlAction::Cancel,
            force: true,
        }),
    )
    .await
    .unwrap();
    deliver(&bus, &second).await;
    agent.poll_once().await.unwrap();

    let done = wait_until(Duration::from_secs(5), || async {
        report_outcome(&bus, second.token).await.is_some()
    })
    .await;
    assert!(done);
    assert_eq!(report_outcome(&bus, second.token).await, Some(ShardOutcome::Completed));
    assert_ne!(report_outcome(&bus, first.token).await, Some(ShardOutcome::Completed));

    let second_run: Vec<usize> = results(&bus)
        .await
        .into_iter()
        .filter_map(|m| match m {
            BusMessage::ExecutionResult(r) if r.token == second.token => Some(r.target_index),
            _ => None,
        })
        .collect();
    assert_eq!(second_run.len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_draining_node_keeps_heartbeating_until_idle() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let registry = registry_with(vec![scripted_plugin(
        "long",
        Severity::Info,
        &[],
        Duration::from_millis(2500),
    )])
    .await;
    let node = spawn_node(node_agent("drainer", 1, bus.clone(), registry));

    let shard = assignment("drainer", 1, ScanPolicy::Full);
    deliver(&bus, &shard).await;
    let started = wait_until(Duration::from_secs(2), || async {
        node.agent.running_shards() == 1
    })
    .await;
    assert!(started);

    let agent = node.agent.clone();
    node.stop().await;
    assert!(agent.is_draining());
    assert_eq!(final_report(&bus, shard.shard_id).await, Some(ShardOutcome::Completed));

    let statuses = heartbeat_statuses(&bus, "drainer").await;
    let draining = statuses
        .iter()
        .filter(|s| **s == NodeStatus::Draining)
        .count();
    assert!(draining >= 2, "expected periodic draining heartbeats, got {statuses:?}");
    assert_eq!(statuses.last(), Some(&NodeStatus::Offline));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_draining_node_still_honours_cancel() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let registry = registry_with(vec![scripted_plugin(
        "slow",
        Severity::Info,
        &[],
        Duration::from_millis(100),
    )])
    .await;
    let node = spawn_node(node_agent("drain-cancel", 1, bus.clone(), registry));

    let shard = assignment("drain-cancel", 40, ScanPolicy::Full);
    deliver(&bus, &shard).await;
    let started = wait_until(Duration::from_secs(2), || async {
        node.agent.running_shards() == 1
    })
    .await;
    assert!(started);

    node.shutdown.cancel();
    let draining = wait_until(Duration::from_secs(2), || async { node.agent.is_draining() }).await;
    assert!(draining);
    bus.publish(
        &queues::control("drain-cancel"),
        &BusMessage::Control(ControlMessage {
            task_id: shard.task_id,
            shards: vec![signalled(&shard)],
            action: ControlAction::Cancel,
            force: false,
        }),
    )
    .await
    .unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(5), node.handle).await;
    assert!(stopped.is_ok());
    assert_eq!(final_report(&bus, shard.shard_id).await, Some(ShardOutcome::Cancelled));
    assert!(execution_count(&bus, shard.shard_id).await < 40);
}
