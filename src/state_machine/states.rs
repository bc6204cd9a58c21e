use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted and persisted, not yet split
    #[default]
    Pending,
    /// Targets are being partitioned into shards
    Sharding,
    /// Shards are queued, none has reached a node yet
    Dispatching,
    /// At least one shard has been handed to a node
    Running,
    /// Dispatch halted on request; shard checkpoints retained
    Paused,
    /// Every shard completed
    Completed,
    /// A shard failed terminally and the failure policy escalated it
    Failed,
    /// Deleted by the caller
    Cancelled,
}

impl TaskState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if shards of a task in this state may be handed to nodes
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Dispatching | Self::Running)
    }

    /// Check if this is an active state (task is being processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Dispatching | Self::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sharding => write!(f, "sharding"),
            Self::Dispatching => write!(f, "dispatching"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sharding" => Ok(Self::Sharding),
            "dispatching" => Ok(Self::Dispatching),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

/// Shard lifecycle states. A retryable failure is not a state of its own: the
/// shard returns to `Queued` with its retry count incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    /// Waiting in the dispatcher queue
    #[default]
    Queued,
    /// Assignment published, waiting for the node's ack
    Assigned,
    /// Acknowledged and executing on a node
    Running,
    Completed,
    /// Failed terminally (retries exhausted or unrecoverable)
    Failed,
    Cancelled,
}

impl ShardState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the shard is held by a node
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Assigned => write!(f, "assigned"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ShardState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid shard state: {s}")),
        }
    }
}
