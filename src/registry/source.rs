//! Plugin sources: where descriptors and check implementations come from.

use super::check::{LoadedPlugin, PluginCheck};
use super::{RegistryError, RegistryResult};
use crate::models::{PluginDescriptor, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Produces a fresh, complete plugin set on every call
#[async_trait]
pub trait PluginSource: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> RegistryResult<Vec<LoadedPlugin>>;
}

/// Hex SHA-256 of a plugin artifact
pub fn artifact_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Plugins supplied by the host program. `replace` installs the set returned by
/// the next load.
pub struct StaticPluginSource {
    name: String,
    plugins: parking_lot::RwLock<Vec<LoadedPlugin>>,
}

impl StaticPluginSource {
    pub fn new(name: impl Into<String>, plugins: Vec<LoadedPlugin>) -> Self {
        Self {
            name: name.into(),
            plugins: parking_lot::RwLock::new(plugins),
        }
    }

    pub fn replace(&self, plugins: Vec<LoadedPlugin>) {
        *self.plugins.write() = plugins;
    }
}

#[async_trait]
impl PluginSource for StaticPluginSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> RegistryResult<Vec<LoadedPlugin>> {
        Ok(self.plugins.read().clone())
    }
}

/// On-disk plugin manifest (`<dir>/<id>.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Check implementation, resolved through the factory table
    pub kind: String,
    /// Artifact path relative to the manifest directory
    pub artifact: PathBuf,
    /// Expected hex SHA-256 of the artifact
    pub checksum: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Kind-specific settings handed to the factory
    #[serde(default)]
    pub settings: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

/// Builds a check from its manifest and artifact bytes
pub type CheckFactory =
    Arc<dyn Fn(&PluginManifest, &[u8]) -> RegistryResult<Arc<dyn PluginCheck>> + Send + Sync>;

/// Loads JSON manifests from a directory and verifies artifact checksums.
/// Plugins failing verification are left out of the loaded set.
pub struct DirectoryPluginSource {
    directory: PathBuf,
    name: String,
    factories: HashMap<String, CheckFactory>,
}

impl DirectoryPluginSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            name: format!("directory:{}", directory.display()),
            directory,
            factories: HashMap::new(),
        }
    }

    /// Register the implementation for a manifest `kind`
    pub fn with_kind(mut self, kind: impl Into<String>, factory: CheckFactory) -> Self {
        self.factories.insert(kind.into(), factory);
        self
    }

    async fn load_manifest(&self, path: &Path) -> RegistryResult<LoadedPlugin> {
        let invalid = |reason: String| RegistryError::InvalidManifest {
            path: path.display().to_string(),
            reason,
        };

        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| invalid(e.to_string()))?;
        let manifest: PluginManifest =
            serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))?;

        let artifact_path = self.directory.join(&manifest.artifact);
        let artifact = tokio::fs::read(&artifact_path)
            .await
            .map_err(|e| invalid(format!("artifact {}: {e}", artifact_path.display())))?;
        let checksum = artifact_checksum(&artifact);

        if let Some(expected) = &manifest.checksum {
            if !expected.eq_ignore_ascii_case(&checksum) {
                return Err(RegistryError::ChecksumMismatch {
                    plugin_id: manifest.id.clone(),
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        let factory = self
            .factories
            .get(&manifest.kind)
            .ok_or_else(|| RegistryError::UnknownKind {
                plugin_id: manifest.id.clone(),
                kind: manifest.kind.clone(),
            })?;
        let check = factory(&manifest, &artifact)?;

        let descriptor = PluginDescriptor {
            id: manifest.id,
            name: manifest.name,
            version: manifest.version,
            checksum,
            tags: manifest.tags,
            severity: manifest.severity,
            enabled: manifest.enabled,
        };
        Ok(LoadedPlugin::new(descriptor, check))
    }
}

#[async_trait]
impl PluginSource for DirectoryPluginSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> RegistryResult<Vec<LoadedPlugin>> {
        let unavailable = |reason: String| RegistryError::SourceUnavailable {
            source_name: self.name.clone(),
            reason,
        };

        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let mut manifests = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                manifests.push(path);
            }
        }
        manifests.sort();

        let mut plugins = Vec::with_capacity(manifests.len());
        for path in manifests {
            match self.load_manifest(&path).await {
                Ok(plugin) => {
                    debug!(plugin_id = %plugin.id(), checksum = %plugin.descriptor.checksum, "Loaded plugin manifest");
                    plugins.push(plugin);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Rejected plugin manifest"),
            }
        }
        Ok(plugins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::check::{CheckContext, CheckError, CheckOutcome};
    use std::fs;
    use tempfile::TempDir;

    struct Marker;

    #[async_trait]
    impl PluginCheck for Marker {
        async fn run(&self, _ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
            Ok(CheckOutcome::not_vulnerable())
        }
    }

    fn marker_factory() -> CheckFactory {
        Arc::new(|_manifest: &PluginManifest, _artifact: &[u8]| {
            Ok::<_, RegistryError>(Arc::new(Marker) as Arc<dyn PluginCheck>)
        })
    }

    fn write_plugin(dir: &Path, id: &str, body: &[u8], checksum: Option<String>) {
        fs::write(dir.join(format!("{id}.bin")), body).unwrap();
        let manifest = serde_json::json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "kind": "marker",
            "artifact": format!("{id}.bin"),
            "checksum": checksum,
            "tags": ["http"],
            "severity": "high",
        });
        fs::write(dir.join(format!("{id}.json")), manifest.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_directory_source_verifies_checksums() {
        let dir = TempDir::new().unwrap();
        write_plugin(dir.path(), "good", b"payload", Some(artifact_checksum(b"payload")));
        write_plugin(dir.path(), "tampered", b"payload", Some(artifact_checksum(b"other")));
        write_plugin(dir.path(), "unpinned", b"x", None);

        let source = DirectoryPluginSource::new(dir.path()).with_kind("marker", marker_factory());
        let plugins = source.load().await.unwrap();
        let ids: Vec<&str> = plugins.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["good", "unpinned"]);
        assert_eq!(plugins[0].descriptor.checksum, artifact_checksum(b"payload"));
        assert_eq!(plugins[0].descriptor.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_plugin(dir.path(), "orphan", b"x", None);
        let source = DirectoryPluginSource::new(dir.path());
        assert!(source.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_unavailable() {
        let source = DirectoryPluginSource::new("/nonexistent/plugins");
        assert!(matches!(
            source.load().await,
            Err(RegistryError::SourceUnavailable { .. })
        ));
    }
}
