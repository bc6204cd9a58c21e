//! # Plugin Registry
//!
//! Loads plugin descriptors from a source, verifies their integrity and serves
//! immutable snapshots for capability-tag lookup. Plugin code runs behind a
//! [`Sandbox`].

pub mod check;
pub mod plugin_registry;
pub mod sandbox;
pub mod source;

use thiserror::Error;

pub use check::{CheckContext, CheckError, CheckOutcome, EgressGuard, LoadedPlugin, PluginCheck};
pub use plugin_registry::{PluginRegistry, RegistrySnapshot};
pub use sandbox::{InProcessSandbox, Sandbox, SandboxLimits};
pub use source::{
    CheckFactory, DirectoryPluginSource, PluginManifest, PluginSource, StaticPluginSource,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Plugin source {source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("Invalid manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("Checksum mismatch for plugin {plugin_id}: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        plugin_id: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown check kind '{kind}' for plugin {plugin_id}")]
    UnknownKind { plugin_id: String, kind: String },

    #[error("Duplicate plugin id {plugin_id}")]
    DuplicatePlugin { plugin_id: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;
