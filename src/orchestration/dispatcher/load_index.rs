//! Load index over registered nodes.
//!
//! A node's load is `w_cpu * cpu + w_mem * memory + w_shards * active / max`.
//! The least-loaded node with a free slot wins; ties go to the node idle most
//! recently, then the one assigned least recently, then the lowest id.

use crate::config::LoadWeights;
use crate::models::{AssignmentToken, Heartbeat, Node, NodeStatus, ShardId};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node: Node,
    /// Shards assigned to this node and not yet settled, with their tokens
    pub in_flight: HashMap<ShardId, AssignmentToken>,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

impl NodeEntry {
    fn new(node: Node) -> Self {
        Self {
            node,
            in_flight: HashMap::new(),
            last_assigned_at: None,
        }
    }

    /// Occupied slots: the node's own report or what we assigned, whichever is larger
    pub fn active_shards(&self) -> usize {
        self.node.capacity.active_shards.max(self.in_flight.len())
    }

    pub fn has_slot(&self) -> bool {
        self.active_shards() < self.node.capacity.max_concurrency
    }

    pub fn is_assignable(&self) -> bool {
        self.node.status == NodeStatus::Online && self.has_slot()
    }

    pub fn load_score(&self, weights: &LoadWeights) -> f64 {
        let shard_ratio = if self.node.capacity.max_concurrency == 0 {
            1.0
        } else {
            self.active_shards() as f64 / self.node.capacity.max_concurrency as f64
        };
        weights.cpu * self.node.capacity.cpu_load
            + weights.memory * self.node.capacity.memory_load
            + weights.shards * shard_ratio
    }
}

/// What a heartbeat did to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEffect {
    Registered,
    Updated,
    /// An offline node came back
    Recovered,
}

/// A node that went silent, with the shards taken from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostNode {
    pub node_id: String,
    pub shards: Vec<(ShardId, AssignmentToken)>,
    pub silence: chrono::Duration,
}

#[derive(Debug)]
pub struct LoadIndex {
    nodes: HashMap<String, NodeEntry>,
    holders: HashMap<ShardId, String>,
    weights: LoadWeights,
}

impl LoadIndex {
    pub fn new(weights: LoadWeights) -> Self {
        Self {
            nodes: HashMap::new(),
            holders: HashMap::new(),
            weights,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeEntry> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    /// Node currently holding a shard
    pub fn holder(&self, shard_id: ShardId) -> Option<&str> {
        self.holders.get(&shard_id).map(String::as_str)
    }

    /// Restore a persisted node record
    pub fn restore(&mut self, node: Node) {
        self.nodes
            .entry(node.id.clone())
            .or_insert_with(|| NodeEntry::new(node));
    }

    pub fn apply_heartbeat(&mut self, heartbeat: &Heartbeat, now: DateTime<Utc>) -> (HeartbeatEffect, &Node) {
        let mut effect = HeartbeatEffect::Updated;
        let entry = self
            .nodes
            .entry(heartbeat.node_id.clone())
            .and_modify(|entry| {
                if entry.node.status == NodeStatus::Offline && heartbeat.status != NodeStatus::Offline {
                    effect = HeartbeatEffect::Recovered;
                }
                entry.node.apply_heartbeat(heartbeat, now);
            })
            .or_insert_with(|| {
                effect = HeartbeatEffect::Registered;
                NodeEntry::new(Node::from_heartbeat(heartbeat, now))
            });
        if heartbeat.status == NodeStatus::Offline {
            entry.node.offline_since = Some(now);
        }
        (effect, &entry.node)
    }

    /// Pick the node for the next assignment
    pub fn select(&self) -> Option<&str> {
        self.nodes
            .values()
            .filter(|entry| entry.is_assignable())
            .min_by_key(|entry| {
                (
                    (entry.load_score(&self.weights) * 1_000_000.0).round() as i64,
                    Reverse(entry.node.last_idle_at),
                    entry.last_assigned_at,
                    entry.node.id.clone(),
                )
            })
            .map(|entry| entry.node.id.as_str())
    }

    pub fn record_assignment(
        &mut self,
        node_id: &str,
        shard_id: ShardId,
        token: AssignmentToken,
        now: DateTime<Utc>,
    ) {
        if let Some(entry) = self.nodes.get_mut(node_id) {
            entry.in_flight.insert(shard_id, token);
            entry.last_assigned_at = Some(now);
            self.holders.insert(shard_id, node_id.to_string());
        }
    }

    /// Forget a shard's holder; the slot counts as free until the next heartbeat
    pub fn release(&mut self, shard_id: ShardId) -> Option<String> {
        let node_id = self.holders.remove(&shard_id)?;
        if let Some(entry) = self.nodes.get_mut(&node_id) {
            if entry.in_flight.remove(&shard_id).is_some() {
                entry.node.capacity.active_shards =
                    entry.node.capacity.active_shards.saturating_sub(1);
            }
        }
        Some(node_id)
    }

    /// Mark nodes silent for longer than `timeout` offline and take their shards
    pub fn expire(&mut self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<LostNode> {
        let mut lost = Vec::new();
        for entry in self.nodes.values_mut() {
            if entry.node.status == NodeStatus::Offline {
                continue;
            }
            let silence = now - entry.node.last_heartbeat;
            if silence <= timeout {
                continue;
            }
            entry.node.status = NodeStatus::Offline;
            entry.node.offline_since = Some(now);
            let shards: Vec<(ShardId, AssignmentToken)> = entry.in_flight.drain().collect();
            for (shard_id, _) in &shards {
                self.holders.remove(shard_id);
            }
            lost.push(LostNode {
                node_id: entry.node.id.clone(),
                shards,
                silence,
            });
        }
        lost
    }

    /// Drop nodes offline for longer than `grace`; returns their ids
    pub fn purge(&mut self, now: DateTime<Utc>, grace: chrono::Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .nodes
            .values()
            .filter(|entry| {
                entry.node.status == NodeStatus::Offline
                    && entry
                        .node
                        .offline_since
                        .is_some_and(|since| now - since > grace)
            })
            .map(|entry| entry.node.id.clone())
            .collect();

        for node_id in &expired {
            if let Some(entry) = self.nodes.remove(node_id) {
                for shard_id in entry.in_flight.keys() {
                    self.holders.remove(shard_id);
                }
            }
        }
        expired
    }

    /// Take every shard held by a node that announced it is going offline
    pub fn take_shards(&mut self, node_id: &str) -> Vec<(ShardId, AssignmentToken)> {
        let Some(entry) = self.nodes.get_mut(node_id) else {
            return Vec::new();
        };
        let shards: Vec<(ShardId, AssignmentToken)> = entry.in_flight.drain().collect();
        for (shard_id, _) in &shards {
            self.holders.remove(shard_id);
        }
        shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeCapacity;

    fn heartbeat(node: &str, max: usize, active: usize, cpu: f64) -> Heartbeat {
        Heartbeat {
            node_id: node.into(),
            status: NodeStatus::Online,
            capacity: NodeCapacity {
                max_concurrency: max,
                active_shards: active,
                cpu_load: cpu,
                memory_load: 0.0,
            },
            tags: vec![],
            sent_at: Utc::now(),
        }
    }

    fn index() -> LoadIndex {
        LoadIndex::new(LoadWeights::default())
    }

    #[test]
    fn test_least_loaded_node_selected() {
        let now = Utc::now();
        let mut idx = index();
        idx.apply_heartbeat(&heartbeat("busy", 4, 1, 0.9), now);
        idx.apply_heartbeat(&heartbeat("calm", 4, 1, 0.1), now);
        assert_eq!(idx.select(), Some("calm"));
    }

    #[test]
    fn test_full_node_never_selected() {
        let now = Utc::now();
        let mut idx = index();
        idx.apply_heartbeat(&heartbeat("full", 1, 1, 0.0), now);
        assert_eq!(idx.select(), None);

        idx.apply_heartbeat(&heartbeat("spare", 1, 0, 0.0), now);
        assert_eq!(idx.select(), Some("spare"));
        idx.record_assignment("spare", ShardId::new(), AssignmentToken::new(), now);
        assert_eq!(idx.select(), None);
    }

    #[test]
    fn test_tie_prefers_recent_idle_then_least_recently_assigned() {
        let t0 = Utc::now();
        let mut idx = index();
        idx.apply_heartbeat(&heartbeat("a", 4, 0, 0.0), t0);
        idx.apply_heartbeat(&heartbeat("b", 4, 0, 0.0), t0 + chrono::Duration::seconds(1));
        // b was idle more recently
        assert_eq!(idx.select(), Some("b"));

        idx.apply_heartbeat(&heartbeat("a", 4, 0, 0.0), t0 + chrono::Duration::seconds(2));
        idx.apply_heartbeat(&heartbeat("b", 4, 0, 0.0), t0 + chrono::Duration::seconds(2));
        let shard = ShardId::new();
        idx.record_assignment("a", shard, AssignmentToken::new(), t0 + chrono::Duration::seconds(3));
        idx.release(shard);
        // Same load and idle time: b was never assigned
        assert_eq!(idx.select(), Some("b"));
    }

    #[test]
    fn test_silent_node_expires_then_purges() {
        let t0 = Utc::now();
        let mut idx = index();
        idx.apply_heartbeat(&heartbeat("n1", 2, 0, 0.0), t0);
        let shard = ShardId::new();
        let token = AssignmentToken::new();
        idx.record_assignment("n1", shard, token, t0);

        assert!(idx.expire(t0 + chrono::Duration::seconds(10), chrono::Duration::seconds(30)).is_empty());
        let lost = idx.expire(t0 + chrono::Duration::seconds(31), chrono::Duration::seconds(30));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].shards, vec![(shard, token)]);
        assert_eq!(idx.holder(shard), None);
        assert_eq!(idx.get("n1").unwrap().node.status, NodeStatus::Offline);

        assert!(idx.purge(t0 + chrono::Duration::seconds(60), chrono::Duration::seconds(300)).is_empty());
        assert_eq!(
            idx.purge(t0 + chrono::Duration::seconds(400), chrono::Duration::seconds(300)),
            vec!["n1".to_string()]
        );
        assert!(idx.is_empty());
    }

    #[test]
    fn test_offline_node_recovers_on_heartbeat() {
        let t0 = Utc::now();
        let mut idx = index();
        idx.apply_heartbeat(&heartbeat("n1", 2, 0, 0.0), t0);
        idx.expire(t0 + chrono::Duration::seconds(60), chrono::Duration::seconds(30));
        let (effect, node) =
            idx.apply_heartbeat(&heartbeat("n1", 2, 0, 0.0), t0 + chrono::Duration::seconds(61));
        assert_eq!(effect, HeartbeatEffect::Recovered);
        assert_eq!(node.status, NodeStatus::Online);
    }
}
