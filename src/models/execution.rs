//! Outcome of one plugin run against one target. Never mutated after creation.

use crate::models::plugin::Severity;
use crate::models::shard::{AssignmentToken, ShardId};
use crate::models::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// Wall-clock limit exceeded; the run was aborted
    Timeout,
    /// The check returned an error or panicked
    PluginFailure,
    /// The sandbox refused an operation (e.g. egress to an undeclared host)
    SandboxViolation,
    /// Force-cancelled before finishing
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome classification used by execution statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Fail,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub shard_id: ShardId,
    pub token: AssignmentToken,
    pub attempt: u32,
    pub target: String,
    /// Index of the target within the shard's partition
    pub target_index: usize,
    pub plugin_id: String,
    pub plugin_version: String,
    pub severity: Severity,
    pub vulnerable: bool,
    pub details: serde_json::Value,
    pub duration_ms: u64,
    pub error: Option<ExecutionError>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            shard_id: self.shard_id,
            target: self.target.clone(),
            plugin_id: self.plugin_id.clone(),
            attempt: self.attempt,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        match &self.error {
            None => ExecutionStatus::Success,
            Some(e) if e.kind == ExecutionErrorKind::Timeout => ExecutionStatus::Timeout,
            Some(_) => ExecutionStatus::Fail,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.status() == ExecutionStatus::Timeout
    }
}

/// Identity of a result under at-least-once delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub shard_id: ShardId,
    pub target: String,
    pub plugin_id: String,
    pub attempt: u32,
}
