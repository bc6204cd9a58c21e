//! The contract between the engine and plugin code.

use crate::models::{PluginDescriptor, ShardId, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// What a check reports for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CheckOutcome {
    pub vulnerable: bool,
    /// Proof or diagnostic details
    pub details: serde_json::Value,
}

impl CheckOutcome {
    pub fn not_vulnerable() -> Self {
        Self::default()
    }

    pub fn vulnerable(details: serde_json::Value) -> Self {
        Self {
            vulnerable: true,
            details,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("check failed: {0}")]
    Failed(String),

    #[error("egress to {host} denied; only {allowed} is reachable")]
    EgressDenied { host: String, allowed: String },
}

/// Network egress policy of one execution: only the declared target is reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressGuard {
    allowed: String,
}

impl EgressGuard {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            allowed: target.into(),
        }
    }

    /// Authorize a connection to `host` (with or without a port suffix)
    pub fn authorize(&self, host: &str) -> Result<(), CheckError> {
        let bare = strip_port(host);
        if bare.eq_ignore_ascii_case(strip_port(&self.allowed)) {
            Ok(())
        } else {
            Err(CheckError::EgressDenied {
                host: host.to_string(),
                allowed: self.allowed.clone(),
            })
        }
    }
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 with port: [::1]:443
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        // A single colon separates host and port; more means a bare IPv6 address
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

/// Everything a check may see about the execution it belongs to
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub task_id: TaskId,
    pub shard_id: ShardId,
    pub target: String,
    pub auth_ref: Option<String>,
    pub fingerprint: BTreeSet<String>,
    egress: EgressGuard,
}

impl CheckContext {
    pub fn new(
        task_id: TaskId,
        shard_id: ShardId,
        target: impl Into<String>,
        auth_ref: Option<String>,
        fingerprint: BTreeSet<String>,
    ) -> Self {
        let target = target.into();
        Self {
            task_id,
            shard_id,
            egress: EgressGuard::new(target.clone()),
            target,
            auth_ref,
            fingerprint,
        }
    }

    pub fn egress(&self) -> &EgressGuard {
        &self.egress
    }
}

/// Executable part of a plugin
#[async_trait]
pub trait PluginCheck: Send + Sync {
    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError>;
}

/// A descriptor bound to its check implementation
#[derive(Clone)]
pub struct LoadedPlugin {
    pub descriptor: PluginDescriptor,
    pub check: Arc<dyn PluginCheck>,
}

impl LoadedPlugin {
    pub fn new(descriptor: PluginDescriptor, check: Arc<dyn PluginCheck>) -> Self {
        Self { descriptor, check }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
