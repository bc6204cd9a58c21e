//! # Shard Model
//!
//! A disjoint, independently assignable partition of a task's targets. The
//! checkpoint counts targets finished from the start of the partition and never
//! decreases.

use crate::models::task::TaskId;
use crate::state_machine::ShardState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub Uuid);

impl ShardId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ShardId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque id minted for one (shard, node, attempt) assignment. Reports carrying
/// any other token are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssignmentToken(pub Uuid);

impl AssignmentToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AssignmentToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssignmentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The live assignment of a shard to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub node_id: String,
    pub token: AssignmentToken,
    pub attempt: u32,
    pub assigned_at: DateTime<Utc>,
    pub acked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub task_id: TaskId,
    /// Position of this shard within its task
    pub sequence: u32,
    /// Expanded targets in partition order
    pub targets: Vec<String>,
    /// Task priority copied at creation for queue rebuilds
    pub priority: u8,
    pub status: ShardState,
    pub assignment: Option<Assignment>,
    /// Assignments issued so far; the current one carries this number
    pub attempts: u32,
    pub retry_count: u32,
    pub checkpoint: usize,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shard {
    pub fn new(task_id: TaskId, sequence: u32, targets: Vec<String>, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            id: ShardId::new(),
            task_id,
            sequence,
            targets,
            priority,
            status: ShardState::Queued,
            assignment: None,
            attempts: 0,
            retry_count: 0,
            checkpoint: 0,
            last_error: None,
            enqueued_at: now,
            updated_at: now,
        }
    }

    pub fn assigned_node(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.node_id.as_str())
    }

    pub fn current_token(&self) -> Option<AssignmentToken> {
        self.assignment.as_ref().map(|a| a.token)
    }

    /// Targets not yet covered by the checkpoint
    pub fn remaining_targets(&self) -> &[String] {
        let start = self.checkpoint.min(self.targets.len());
        &self.targets[start..]
    }

    /// Raise the checkpoint; lower values are ignored. Returns whether it moved.
    pub fn advance_checkpoint(&mut self, checkpoint: usize) -> bool {
        let bounded = checkpoint.min(self.targets.len());
        if bounded > self.checkpoint {
            self.checkpoint = bounded;
            true
        } else {
            false
        }
    }
}

/// Shard-level status reported by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShardOutcome {
    /// Checkpoint progress while executing
    Progress,
    Completed,
    Failed { reason: String, retryable: bool },
    /// Stopped at a target boundary because the task was paused
    Released,
    /// Stopped because the task was deleted
    Cancelled,
}

impl ShardOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Released => "released",
            Self::Cancelled => "cancelled",
        }
    }
}

/// `RecordShardResult` input: a node's view of a shard at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReport {
    pub shard_id: ShardId,
    pub task_id: TaskId,
    pub node_id: String,
    pub token: AssignmentToken,
    pub outcome: ShardOutcome,
    pub checkpoint: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> Shard {
        Shard::new(
            TaskId::new(),
            0,
            (1..=5).map(|i| format!("10.0.0.{i}")).collect(),
            5,
        )
    }

    #[test]
    fn test_checkpoint_never_decreases() {
        let mut s = shard();
        assert!(s.advance_checkpoint(3));
        assert!(!s.advance_checkpoint(2));
        assert_eq!(s.checkpoint, 3);
        assert!(!s.advance_checkpoint(3));
    }

    #[test]
    fn test_checkpoint_bounded_by_targets() {
        let mut s = shard();
        s.advance_checkpoint(99);
        assert_eq!(s.checkpoint, 5);
        assert!(s.remaining_targets().is_empty());
    }

    #[test]
    fn test_remaining_targets_after_checkpoint() {
        let mut s = shard();
        s.advance_checkpoint(3);
        assert_eq!(s.remaining_targets(), &["10.0.0.4", "10.0.0.5"]);
    }
}
