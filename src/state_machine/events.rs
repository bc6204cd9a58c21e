use serde::{Deserialize, Serialize};

/// Events that can trigger task state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// Begin partitioning the target set
    BeginSharding,
    /// Shards are created and queued
    ShardsQueued,
    /// First shard reached a node
    Start,
    Pause,
    Resume,
    Complete,
    /// Mark task as failed with a reason
    Fail(String),
    Cancel,
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BeginSharding => "begin_sharding",
            Self::ShardsQueued => "shards_queued",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Events that can trigger shard state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ShardEvent {
    /// Dispatcher published an assignment
    Assign,
    /// Node acknowledged the assignment
    Start,
    Complete,
    /// Execution failed; retryable failures requeue while budget remains
    Fail { reason: String, retryable: bool },
    /// Ack timeout or node loss; consumes one retry
    Requeue { reason: String },
    /// Returned to the queue without consuming a retry (task paused)
    Release,
    Cancel,
}

impl ShardEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Assign => "assign",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail { .. } => "fail",
            Self::Requeue { .. } => "requeue",
            Self::Release => "release",
            Self::Cancel => "cancel",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Fail { reason, .. } | Self::Requeue { reason } => Some(reason),
            _ => None,
        }
    }
}
