//! # Bus Messages
//!
//! Everything exchanged between the scheduling center and the nodes. Messages are
//! serialized as JSON with an explicit `type` tag.

use super::errors::MessagingError;
use crate::models::{
    AssignmentToken, ExecutionResult, Heartbeat, ScanPolicy, ShardId, ShardReport, TaskId,
    TaskOptions,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Work order for one shard, addressed to one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub shard_id: ShardId,
    pub task_id: TaskId,
    pub node_id: String,
    pub token: AssignmentToken,
    pub attempt: u32,
    /// Full partition; execution starts at `start_offset`
    pub targets: Vec<String>,
    pub start_offset: usize,
    pub policy: ScanPolicy,
    pub vuln_ids: Vec<String>,
    pub auth_ref: Option<String>,
    pub options: TaskOptions,
    pub assigned_at: DateTime<Utc>,
}

/// Node's acceptance of an assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentAck {
    pub shard_id: ShardId,
    pub node_id: String,
    pub token: AssignmentToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Stop after the current target and release the shard
    Pause,
    /// Stop after the current target and discard the rest
    Cancel,
}

/// One assignment a control signal is aimed at. Nodes ignore signals whose
/// token does not match the run they hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalledShard {
    pub shard_id: ShardId,
    pub token: AssignmentToken,
}

/// Cooperative cancellation signal for shards held by one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub task_id: TaskId,
    pub shards: Vec<SignalledShard>,
    pub action: ControlAction,
    /// Abort in-flight plugin executions instead of letting them reach their timeout
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusMessage {
    Assignment(ShardAssignment),
    Ack(AssignmentAck),
    ExecutionResult(ExecutionResult),
    ShardReport(ShardReport),
    Heartbeat(Heartbeat),
    Control(ControlMessage),
}

impl BusMessage {
    /// Get a string representation of the message type for logging
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Assignment(_) => "assignment",
            Self::Ack(_) => "ack",
            Self::ExecutionResult(_) => "execution_result",
            Self::ShardReport(_) => "shard_report",
            Self::Heartbeat(_) => "heartbeat",
            Self::Control(_) => "control",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessagingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }
}

/// A message handed out by `MessageBus::receive`, invisible to other consumers
/// until acked, nacked or its visibility timeout lapses
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: u64,
    pub queue: String,
    /// Deliveries so far, including this one
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub message: BusMessage,
}

impl ReceivedMessage {
    pub fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }
}
