//! # Task Model
//!
//! A scan request spanning a target set. Owned by the task manager; the request
//! fields are fixed once the task is dispatched and only status, progress and
//! findings move afterwards.

use crate::constants::task_defaults;
use crate::models::plugin::Severity;
use crate::state_machine::TaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which plugins apply to a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanPolicy {
    /// Tag-matched plugins plus generic (untagged) plugins
    #[default]
    Full,
    /// As `Full`, restricted to critical and high severity
    Redline,
    /// Only plugins whose tags intersect the target fingerprint
    Smart,
    /// Exactly the task's vuln-id allow-list
    Specified,
}

impl fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Redline => write!(f, "redline"),
            Self::Smart => write!(f, "smart"),
            Self::Specified => write!(f, "specified"),
        }
    }
}

impl std::str::FromStr for ScanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "redline" => Ok(Self::Redline),
            "smart" => Ok(Self::Smart),
            "specified" => Ok(Self::Specified),
            _ => Err(format!("Unknown scan policy: {s}")),
        }
    }
}

/// How a terminally failed shard affects its task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the task and cancel the remaining shards
    FailFast,
    /// Let the remaining shards finish, then fail with partial results
    #[default]
    BestEffort,
}

/// Resolved execution options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Concurrent plugin executions for this task on one node
    pub concurrency: usize,
    pub execution_timeout_secs: u64,
    /// Executions per second against one target
    pub rate_limit: u32,
    pub failure_policy: FailurePolicy,
    pub partition_size: usize,
}

impl TaskOptions {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// A scan request as submitted by a caller. Unset options take configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub targets: Vec<String>,
    pub auth_ref: Option<String>,
    pub policy: String,
    #[serde(default)]
    pub vuln_ids: Vec<String>,
    pub priority: Option<u8>,
    pub concurrency: Option<usize>,
    pub execution_timeout_secs: Option<u64>,
    pub rate_limit: Option<u32>,
    pub failure_policy: Option<FailurePolicy>,
    pub partition_size: Option<usize>,
}

impl NewTask {
    pub fn new(name: impl Into<String>, targets: Vec<String>, policy: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            targets,
            policy: policy.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_partition_size(mut self, partition_size: usize) -> Self {
        self.partition_size = Some(partition_size);
        self
    }

    pub fn with_vuln_ids(mut self, vuln_ids: Vec<String>) -> Self {
        self.vuln_ids = vuln_ids;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = Some(failure_policy);
        self
    }

    pub fn with_execution_timeout(mut self, secs: u64) -> Self {
        self.execution_timeout_secs = Some(secs);
        self
    }

    pub fn with_auth_ref(mut self, auth_ref: impl Into<String>) -> Self {
        self.auth_ref = Some(auth_ref.into());
        self
    }
}

/// Target-level progress: `completed` is the sum of shard checkpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: usize,
    pub completed: usize,
}

impl TaskProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.completed as f64 / self.total as f64) * 100.0
    }
}

/// Vulnerable findings by severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub info: u64,
}

impl FindingSummary {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.critical + self.high + self.medium + self.low + self.info
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Targets as submitted (CIDRs, addresses, hostnames)
    pub targets: Vec<String>,
    pub auth_ref: Option<String>,
    pub policy: ScanPolicy,
    pub vuln_ids: Vec<String>,
    pub priority: u8,
    pub options: TaskOptions,
    pub status: TaskState,
    pub progress: TaskProgress,
    pub findings: FindingSummary,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the task is deleted; the record is purged after cancellation settles
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Priority bounds accepted on task creation
pub fn priority_in_range(priority: u8) -> bool {
    (task_defaults::MIN_PRIORITY..=task_defaults::MAX_PRIORITY).contains(&priority)
}
