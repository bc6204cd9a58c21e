//! Registered scanning nodes and the heartbeats that keep them alive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Online,
    /// Finishing in-flight shards, accepting no new ones
    Draining,
    Offline,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Draining => write!(f, "draining"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Capacity snapshot carried by heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    /// Shard slots
    pub max_concurrency: usize,
    pub active_shards: usize,
    /// 0.0..=1.0
    pub cpu_load: f64,
    /// 0.0..=1.0
    pub memory_load: f64,
}

impl NodeCapacity {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            active_shards: 0,
            cpu_load: 0.0,
            memory_load: 0.0,
        }
    }

    pub fn has_slot(&self) -> bool {
        self.active_shards < self.max_concurrency
    }

    pub fn shard_ratio(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 1.0;
        }
        self.active_shards as f64 / self.max_concurrency as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub status: NodeStatus,
    pub capacity: NodeCapacity,
    pub tags: Vec<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub status: NodeStatus,
    pub capacity: NodeCapacity,
    pub tags: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Last time the node reported no active shards
    pub last_idle_at: Option<DateTime<Utc>>,
    pub offline_since: Option<DateTime<Utc>>,
}

impl Node {
    /// Create a node record from its first heartbeat
    pub fn from_heartbeat(heartbeat: &Heartbeat, received_at: DateTime<Utc>) -> Self {
        let mut node = Self {
            id: heartbeat.node_id.clone(),
            status: heartbeat.status,
            capacity: heartbeat.capacity,
            tags: heartbeat.tags.clone(),
            registered_at: received_at,
            last_heartbeat: received_at,
            last_idle_at: None,
            offline_since: None,
        };
        if heartbeat.capacity.active_shards == 0 {
            node.last_idle_at = Some(received_at);
        }
        node
    }

    pub fn apply_heartbeat(&mut self, heartbeat: &Heartbeat, received_at: DateTime<Utc>) {
        self.status = heartbeat.status;
        self.capacity = heartbeat.capacity;
        self.tags = heartbeat.tags.clone();
        self.last_heartbeat = received_at;
        self.offline_since = None;
        if heartbeat.capacity.active_shards == 0 {
            self.last_idle_at = Some(received_at);
        }
    }

    pub fn is_assignable(&self) -> bool {
        self.status == NodeStatus::Online && self.capacity.has_slot()
    }
}
