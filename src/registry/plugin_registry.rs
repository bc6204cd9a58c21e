//! # Plugin Registry
//!
//! Serves immutable plugin snapshots for capability-tag lookup.
//!
//! ## Overview
//!
//! A [`RegistrySnapshot`] is built once per load and never mutated. Reloading
//! builds a complete new snapshot and swaps the active pointer, so an execution
//! that captured snapshot v1 keeps running against v1 while new lookups see v2.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//! use vulnscan_core::models::ScanPolicy;
//! use vulnscan_core::registry::{PluginRegistry, StaticPluginSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = PluginRegistry::load(Arc::new(StaticPluginSource::new("builtin", vec![]))).await?;
//! let snapshot = registry.snapshot();
//! let fingerprint: BTreeSet<String> = ["http".to_string()].into();
//! let plugins = snapshot.match_plugins(&fingerprint, ScanPolicy::Full, &[]);
//! println!("v{} matched {}", snapshot.version(), plugins.len());
//! registry.reload().await?;
//! # Ok(())
//! # }
//! ```

use super::check::LoadedPlugin;
use super::source::PluginSource;
use super::{RegistryError, RegistryResult};
use crate::logging::log_registry_operation;
use crate::models::ScanPolicy;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// One immutable generation of the plugin set
#[derive(Debug)]
pub struct RegistrySnapshot {
    version: u64,
    loaded_at: DateTime<Utc>,
    plugins: BTreeMap<String, Arc<LoadedPlugin>>,
    /// Enabled plugin ids per capability tag
    by_tag: HashMap<String, Vec<String>>,
    /// Enabled plugins without tags
    generic: Vec<String>,
}

impl RegistrySnapshot {
    pub fn build(version: u64, plugins: Vec<LoadedPlugin>) -> RegistryResult<Self> {
        let mut by_id = BTreeMap::new();
        let mut by_tag: HashMap<String, Vec<String>> = HashMap::new();
        let mut generic = Vec::new();

        for plugin in plugins {
            let id = plugin.descriptor.id.clone();
            if by_id.contains_key(&id) {
                return Err(RegistryError::DuplicatePlugin { plugin_id: id });
            }
            if plugin.descriptor.enabled {
                if plugin.descriptor.is_generic() {
                    generic.push(id.clone());
                }
                for tag in &plugin.descriptor.tags {
                    by_tag.entry(tag.clone()).or_default().push(id.clone());
                }
            }
            by_id.insert(id, Arc::new(plugin));
        }

        Ok(Self {
            version,
            loaded_at: Utc::now(),
            plugins: by_id,
            by_tag,
            generic,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        self.plugins.get(plugin_id).cloned()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<LoadedPlugin>> {
        self.plugins.values()
    }

    /// Enabled plugins carrying `tag`
    pub fn lookup_by_tag(&self, tag: &str) -> Vec<Arc<LoadedPlugin>> {
        self.by_tag
            .get(tag)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Plugins applicable to a target with the given fingerprint, ordered by id.
    ///
    /// `allow_list` holds vuln ids; when non-empty it restricts every policy, and
    /// under `Specified` it is the whole selection.
    pub fn match_plugins(
        &self,
        fingerprint: &BTreeSet<String>,
        policy: ScanPolicy,
        allow_list: &[String],
    ) -> Vec<Arc<LoadedPlugin>> {
        let mut selected: BTreeSet<&str> = BTreeSet::new();

        match policy {
            ScanPolicy::Specified => {
                for id in allow_list {
                    if self.plugins.get(id).is_some_and(|p| p.descriptor.enabled) {
                        selected.insert(id.as_str());
                    }
                }
            }
            ScanPolicy::Full | ScanPolicy::Redline | ScanPolicy::Smart => {
                for tag in fingerprint {
                    if let Some(ids) = self.by_tag.get(tag) {
                        selected.extend(ids.iter().map(String::as_str));
                    }
                }
                if policy != ScanPolicy::Smart {
                    selected.extend(self.generic.iter().map(String::as_str));
                }
                if !allow_list.is_empty() {
                    selected.retain(|id| allow_list.iter().any(|allowed| allowed.as_str() == *id));
                }
            }
        }

        selected
            .into_iter()
            .filter_map(|id| self.plugins.get(id))
            .filter(|p| policy != ScanPolicy::Redline || p.descriptor.severity.is_redline())
            .cloned()
            .collect()
    }
}

/// Registry holding the active snapshot
pub struct PluginRegistry {
    source: Arc<dyn PluginSource>,
    active: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes reloads so versions are handed out in order
    reload_lock: Mutex<()>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("source", &self.source.name())
            .field("version", &self.version())
            .finish()
    }
}

impl PluginRegistry {
    /// Load the initial snapshot (version 1) from a source
    pub async fn load(source: Arc<dyn PluginSource>) -> RegistryResult<Self> {
        let plugins = source.load().await?;
        let snapshot = RegistrySnapshot::build(1, plugins)?;
        log_registry_operation(
            "load",
            None,
            Some("1"),
            "success",
            Some(&format!("{} plugins from {}", snapshot.len(), source.name())),
        );
        Ok(Self {
            source,
            active: RwLock::new(Arc::new(snapshot)),
            reload_lock: Mutex::new(()),
        })
    }

    /// The active snapshot; callers keep it for the duration of their work
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.active.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.active.read().version
    }

    /// Build a new snapshot from the source and swap it in. On error the active
    /// snapshot stays in place.
    pub async fn reload(&self) -> RegistryResult<u64> {
        let _guard = self.reload_lock.lock().await;
        let next_version = self.version() + 1;

        let plugins = match self.source.load().await {
            Ok(plugins) => plugins,
            Err(e) => {
                log_registry_operation(
                    "reload",
                    None,
                    Some(&next_version.to_string()),
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        };
        let snapshot = Arc::new(RegistrySnapshot::build(next_version, plugins)?);
        let count = snapshot.len();
        *self.active.write() = snapshot;

        info!(version = next_version, plugins = count, "📚 Plugin registry reloaded");
        log_registry_operation(
            "reload",
            None,
            Some(&next_version.to_string()),
            "success",
            Some(&format!("{count} plugins")),
        );
        Ok(next_version)
    }
}
