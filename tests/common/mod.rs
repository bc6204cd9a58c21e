#![allow(dead_code)]

pub mod strategies;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vulnscan_core::config::{BusConfig, NodeConfig, ScannerConfig};
use vulnscan_core::messaging::{
    BusMessage, InMemoryMessageBus, MessageBus, MessagingError, ReceivedMessage,
};
use vulnscan_core::models::{ExecutionResult, PluginDescriptor, Severity};
use vulnscan_core::registry::{
    CheckContext, CheckError, CheckOutcome, InProcessSandbox, LoadedPlugin, PluginCheck,
    PluginRegistry, StaticPluginSource,
};
use vulnscan_core::worker::{
    EventSink, InMemoryCheckpointStore, LoadSample, NodeAgent, NodeDependencies,
    StaticFingerprints, StaticLoadProbe,
};

/// Scanner configuration with timings short enough for tests
pub fn fast_config() -> ScannerConfig {
    let mut config = ScannerConfig::default();
    config.scheduler.partition_size = 2;
    config.scheduler.assignment_ack_timeout_secs = 2;
    config.scheduler.heartbeat_timeout_secs = 2;
    config.scheduler.delete_ack_timeout_secs = 2;
    config.scheduler.dispatch_tick_ms = 20;
    config.bus.visibility_timeout_secs = 2;
    config
}

/// Check that reports `vulnerable` for targets in `hits`, optionally after a delay
pub struct ScriptedCheck {
    pub hits: BTreeSet<String>,
    pub delay: Duration,
}

#[async_trait]
impl PluginCheck for ScriptedCheck {
    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.hits.contains(&ctx.target) {
            Ok(CheckOutcome::vulnerable(
                serde_json::json!({ "target": ctx.target }),
            ))
        } else {
            Ok(CheckOutcome::not_vulnerable())
        }
    }
}

pub fn descriptor(id: &str, severity: Severity) -> PluginDescriptor {
    PluginDescriptor {
        id: id.into(),
        name: id.into(),
        version: "1.0.0".into(),
        checksum: String::new(),
        tags: BTreeSet::new(),
        severity,
        enabled: true,
    }
}

pub fn scripted_plugin(id: &str, severity: Severity, hits: &[&str], delay: Duration) -> LoadedPlugin {
    LoadedPlugin::new(
        descriptor(id, severity),
        Arc::new(ScriptedCheck {
            hits: hits.iter().map(|h| h.to_string()).collect(),
            delay,
        }),
    )
}

pub async fn registry_with(plugins: Vec<LoadedPlugin>) -> Arc<PluginRegistry> {
    Arc::new(
        PluginRegistry::load(Arc::new(StaticPluginSource::new("test", plugins)))
            .await
            .expect("registry loads"),
    )
}

/// A node agent running against `bus` until its token is cancelled
pub struct RunningNode {
    pub agent: Arc<NodeAgent>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl RunningNode {
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

pub fn node_agent(
    node_id: &str,
    max_active_shards: usize,
    bus: Arc<InMemoryMessageBus>,
    registry: Arc<PluginRegistry>,
) -> NodeAgent {
    node_agent_on(node_id, max_active_shards, bus, registry)
}

pub fn node_agent_on(
    node_id: &str,
    max_active_shards: usize,
    bus: Arc<dyn MessageBus>,
    registry: Arc<PluginRegistry>,
) -> NodeAgent {
    let config = NodeConfig {
        node_id: Some(node_id.into()),
        max_active_shards,
        worker_concurrency: 8,
        heartbeat_interval_secs: 1,
        poll_interval_ms: 10,
        target_window: 2,
        ..NodeConfig::default()
    };
    NodeAgent::new(
        &config,
        &BusConfig {
            visibility_timeout_secs: 2,
            ..BusConfig::default()
        },
        bus,
        registry,
        NodeDependencies {
            sandbox: Arc::new(InProcessSandbox::new()),
            fingerprints: Arc::new(StaticFingerprints::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            load_probe: Arc::new(StaticLoadProbe::new(LoadSample::new(0.1, 0.1))),
            events: EventSink::disconnected(),
        },
    )
}

pub fn spawn_node(agent: NodeAgent) -> RunningNode {
    let agent = Arc::new(agent);
    let shutdown = CancellationToken::new();
    let handle = {
        let agent = agent.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = agent.run(shutdown).await;
        })
    };
    RunningNode {
        agent,
        shutdown,
        handle,
    }
}

/// Bus wrapper that keeps a copy of every execution result published through
/// it, so tests can count executions after the center has consumed them
#[derive(Debug)]
pub struct RecordingBus {
    inner: Arc<InMemoryMessageBus>,
    executions: parking_lot::Mutex<Vec<ExecutionResult>>,
}

impl RecordingBus {
    pub fn new(inner: Arc<InMemoryMessageBus>) -> Self {
        Self {
            inner,
            executions: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn executions(&self) -> Vec<ExecutionResult> {
        self.executions.lock().clone()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn ensure_queue(&self, queue: &str) -> Result<(), MessagingError> {
        self.inner.ensure_queue(queue).await
    }

    async fn publish(&self, queue: &str, message: &BusMessage) -> Result<u64, MessagingError> {
        let id = self.inner.publish(queue, message).await?;
        if let BusMessage::ExecutionResult(result) = message {
            self.executions.lock().push(result.clone());
        }
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        self.inner.receive(queue, max_messages, visibility_timeout).await
    }

    async fn ack(&self, queue: &str, message_id: u64) -> Result<(), MessagingError> {
        self.inner.ack(queue, message_id).await
    }

    async fn nack(&self, queue: &str, message_id: u64, requeue: bool) -> Result<(), MessagingError> {
        self.inner.nack(queue, message_id, requeue).await
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, MessagingError> {
        self.inner.queue_depth(queue).await
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
