//! # Scheduling Center
//!
//! Single bootstrap path for the scheduling side of the scanner. Wires the
//! [`TaskManager`], [`Dispatcher`] and [`ResultProcessor`] to a state store and a
//! message bus, restores state from the store and runs the background loops
//! until [`SchedulingCenter::shutdown`].

use crate::config::{ConfigManager, DatabaseConfig, ScannerConfig};
use crate::constants::queues;
use crate::error::{ScanError, ScanResult};
use crate::messaging::MessageBus;
use crate::models::Node;
use crate::orchestration::dispatcher::{Dispatcher, DispatcherHandle, DispatcherSnapshot};
use crate::orchestration::result_processor::ResultProcessor;
use crate::orchestration::task_manager::TaskManager;
use crate::persistence::{InMemoryStateStore, StateStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Running scheduling center
pub struct SchedulingCenter {
    task_manager: Arc<TaskManager>,
    dispatcher: DispatcherHandle,
    store: Arc<dyn StateStore>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SchedulingCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingCenter")
            .field("task_manager", &self.task_manager)
            .field("running", &!self.shutdown.is_cancelled())
            .finish()
    }
}

impl SchedulingCenter {
    /// Load configuration for the detected environment and start with the
    /// configured store
    pub async fn from_environment(bus: Arc<dyn MessageBus>) -> ScanResult<Self> {
        info!("🔧 Initializing scheduling center with auto-detected environment configuration");
        let config_manager = ConfigManager::load()?;
        let config = config_manager.config().clone();
        let store = store_from_config(&config.database).await?;
        Self::start(config, store, bus).await
    }

    /// Validate the configuration, rebuild state from `store` and spawn the
    /// dispatcher and result processor loops
    pub async fn start(
        config: ScannerConfig,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn MessageBus>,
    ) -> ScanResult<Self> {
        config.validate()?;
        crate::metrics::init_metrics();
        info!("🏗️ Creating scheduling components");

        for queue in [queues::RESULTS, queues::HEARTBEATS] {
            bus.ensure_queue(queue).await?;
        }

        let (handle, inbox) = DispatcherHandle::channel();
        let task_manager = Arc::new(TaskManager::new(
            store.clone(),
            handle.clone(),
            config.scheduler.clone(),
            config.task_defaults.clone(),
        ));

        let mut dispatcher = Dispatcher::new(
            config.scheduler.clone(),
            task_manager.clone(),
            store.clone(),
            bus.clone(),
            inbox,
        );
        dispatcher.rebuild_from_store().await?;

        let processor = Arc::new(ResultProcessor::new(
            bus,
            task_manager.clone(),
            handle.clone(),
            &config.bus,
        ));

        let shutdown = CancellationToken::new();
        let mut handles = Vec::with_capacity(2);

        let dispatcher_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = dispatcher.run(dispatcher_shutdown).await {
                error!(error = %e, "Dispatcher loop exited with error");
            }
        }));

        let poll_interval = config.scheduler.dispatch_tick();
        handles.push(tokio::spawn(
            processor.run(shutdown.clone(), poll_interval),
        ));

        info!("✅ Scheduling center started");
        Ok(Self {
            task_manager,
            dispatcher: handle,
            store,
            shutdown,
            handles,
        })
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    /// Registered nodes as last persisted
    pub async fn list_nodes(&self) -> ScanResult<Vec<Node>> {
        let mut nodes = self.store.list_nodes().await?;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    pub async fn get_node(&self, node_id: &str) -> ScanResult<Node> {
        self.list_nodes()
            .await?
            .into_iter()
            .find(|n| n.id == node_id)
            .ok_or_else(|| ScanError::not_found("node", node_id))
    }

    pub async fn dispatcher_snapshot(&self) -> ScanResult<DispatcherSnapshot> {
        self.dispatcher
            .snapshot()
            .await
            .ok_or_else(|| ScanError::internal("dispatcher is not running"))
    }

    /// Stop the background loops and wait for them to exit
    pub async fn shutdown(mut self) {
        info!("🛑 Shutting down scheduling center");
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduling loop panicked");
            }
        }
    }
}

/// Postgres store when built with `postgres` and a URL is configured, the
/// in-memory store otherwise
pub async fn store_from_config(database: &DatabaseConfig) -> ScanResult<Arc<dyn StateStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &database.url {
        let store =
            crate::persistence::PgStateStore::connect(url, database.max_connections).await?;
        info!("📊 Using Postgres state store");
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "postgres"))]
    if database.url.is_some() {
        tracing::warn!("Database URL configured but postgres support is not compiled in");
    }
    info!("📊 Using in-memory state store");
    Ok(Arc::new(InMemoryStateStore::new()))
}
