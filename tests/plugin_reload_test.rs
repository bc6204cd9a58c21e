//! Plugin loading from a manifest directory and hot reload.

mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vulnscan_core::constants::queues;
use vulnscan_core::messaging::{BusMessage, InMemoryMessageBus, MessageBus, ShardAssignment};
use vulnscan_core::models::{
    AssignmentToken, FailurePolicy, ScanPolicy, Severity, ShardId, TaskId, TaskOptions,
};
use vulnscan_core::registry::source::artifact_checksum;
use vulnscan_core::registry::{
    CheckContext, CheckError, CheckFactory, CheckOutcome, DirectoryPluginSource, PluginCheck,
    PluginManifest, PluginRegistry, RegistryError, StaticPluginSource,
};

/// Flags targets listed one per line in the plugin artifact
struct ListedTargets {
    targets: BTreeSet<String>,
}

#[async_trait]
impl PluginCheck for ListedTargets {
    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
        if self.targets.contains(&ctx.target) {
            Ok(CheckOutcome::vulnerable(serde_json::json!({ "listed": true })))
        } else {
            Ok(CheckOutcome::not_vulnerable())
        }
    }
}

fn listed_targets_factory() -> CheckFactory {
    Arc::new(|_manifest: &PluginManifest, artifact: &[u8]| {
        let targets = String::from_utf8_lossy(artifact)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Ok::<_, RegistryError>(Arc::new(ListedTargets { targets }) as Arc<dyn PluginCheck>)
    })
}

fn write_plugin(dir: &Path, id: &str, artifact: &str, checksum: Option<String>, tags: &[&str]) {
    fs::write(dir.join(format!("{id}.txt")), artifact).unwrap();
    let manifest = serde_json::json!({
        "id": id,
        "name": format!("{id} check"),
        "version": "2.1.0",
        "kind": "listed-targets",
        "artifact": format!("{id}.txt"),
        "checksum": checksum,
        "tags": tags,
        "severity": "critical",
    });
    fs::write(dir.join(format!("{id}.json")), manifest.to_string()).unwrap();
}

fn source(dir: &Path) -> Arc<DirectoryPluginSource> {
    Arc::new(DirectoryPluginSource::new(dir).with_kind("listed-targets", listed_targets_factory()))
}

#[tokio::test]
async fn test_directory_registry_loads_verified_plugins_and_reloads() {
    let dir = TempDir::new().unwrap();
    let body = "10.90.0.1\n10.90.0.2\n";
    write_plugin(dir.path(), "cve-2024-0001", body, Some(artifact_checksum(body.as_bytes())), &["http"]);
    write_plugin(dir.path(), "tampered", body, Some(artifact_checksum(b"original")), &["http"]);
    fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

    let registry = PluginRegistry::load(source(dir.path())).await.unwrap();
    assert_eq!(registry.version(), 1);
    let before = registry.snapshot();
    assert_eq!(before.len(), 1);
    let plugin = before.get("cve-2024-0001").unwrap();
    assert_eq!(plugin.descriptor.checksum, artifact_checksum(body.as_bytes()));
    assert_eq!(plugin.descriptor.severity, Severity::Critical);
    assert_eq!(before.lookup_by_tag("http").len(), 1);

    write_plugin(dir.path(), "generic-weak-creds", "10.90.0.3\n", None, &[]);
    assert_eq!(registry.reload().await.unwrap(), 2);

    let after = registry.snapshot();
    assert_eq!(after.version(), 2);
    assert_eq!(after.len(), 2);
    // A snapshot already handed out keeps its plugin set
    assert_eq!(before.version(), 1);
    assert!(before.get("generic-weak-creds").is_none());

    let http: BTreeSet<String> = ["http".to_string()].into_iter().collect();
    let smart: Vec<String> = after
        .match_plugins(&http, ScanPolicy::Smart, &[])
        .iter()
        .map(|p| p.id().to_string())
        .collect();
    assert_eq!(smart, vec!["cve-2024-0001"]);
    let full: Vec<String> = after
        .match_plugins(&http, ScanPolicy::Full, &[])
        .iter()
        .map(|p| p.id().to_string())
        .collect();
    assert_eq!(full, vec!["cve-2024-0001", "generic-weak-creds"]);
}

#[tokio::test]
async fn test_failed_reload_keeps_active_snapshot() {
    let dir = TempDir::new().unwrap();
    let plugins = dir.path().join("plugins");
    fs::create_dir(&plugins).unwrap();
    write_plugin(&plugins, "cve-2024-0002", "10.90.1.1\n", None, &["ssh"]);

    let registry = PluginRegistry::load(source(&plugins)).await.unwrap();
    fs::remove_dir_all(&plugins).unwrap();

    let err = registry.reload().await.unwrap_err();
    assert!(matches!(err, RegistryError::SourceUnavailable { .. }));
    assert_eq!(registry.version(), 1);
    assert!(registry.snapshot().get("cve-2024-0002").is_some());
}

fn shard_for(node_id: &str, target: &str) -> ShardAssignment {
    ShardAssignment {
        shard_id: ShardId::new(),
        task_id: TaskId::new(),
        node_id: node_id.into(),
        token: AssignmentToken::new(),
        attempt: 1,
        targets: vec![target.into()],
        start_offset: 0,
        policy: ScanPolicy::Full,
        vuln_ids: vec![],
        auth_ref: None,
        options: TaskOptions {
            concurrency: 4,
            execution_timeout_secs: 5,
            rate_limit: 100,
            failure_policy: FailurePolicy::BestEffort,
            partition_size: 1,
        },
        assigned_at: Utc::now(),
    }
}

async fn plugins_run_for(bus: &InMemoryMessageBus, shard_id: ShardId) -> Vec<String> {
    let mut ids: Vec<String> = bus
        .peek_all(queues::RESULTS)
        .await
        .into_iter()
        .filter_map(|m| match m {
            BusMessage::ExecutionResult(r) if r.shard_id == shard_id => Some(r.plugin_id),
            _ => None,
        })
        .collect();
    ids.sort();
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_shards_use_reloaded_plugins() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let static_source = Arc::new(StaticPluginSource::new(
        "bundled",
        vec![scripted_plugin("old-check", Severity::Medium, &[], Duration::ZERO)],
    ));
    let registry = Arc::new(PluginRegistry::load(static_source.clone()).await.unwrap());
    let agent = node_agent("reloader", 2, bus.clone(), registry.clone());
    bus.ensure_queue(&queues::control("reloader")).await.unwrap();

    let first = shard_for("reloader", "10.90.2.1");
    bus.publish(&queues::assignments("reloader"), &BusMessage::Assignment(first.clone()))
        .await
        .unwrap();
    agent.poll_once().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || async {
            agent.running_shards() == 0
        })
        .await
    );
    assert_eq!(plugins_run_for(&bus, first.shard_id).await, vec!["old-check"]);

    static_source.replace(vec![
        scripted_plugin("new-check", Severity::High, &[], Duration::ZERO),
        scripted_plugin("old-check", Severity::Medium, &[], Duration::ZERO),
    ]);
    assert_eq!(registry.reload().await.unwrap(), 2);

    let second = shard_for("reloader", "10.90.2.2");
    bus.publish(&queues::assignments("reloader"), &BusMessage::Assignment(second.clone()))
        .await
        .unwrap();
    agent.poll_once().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || async {
            agent.running_shards() == 0
        })
        .await
    );
    assert_eq!(
        plugins_run_for(&bus, second.shard_id).await,
        vec!["new-check", "old-check"]
    );
}
