//! Priority queue of shards awaiting assignment.
//!
//! Ordered by effective priority (highest first), then FIFO. A shard that waited
//! longer than the aging threshold gains one priority step per aging interval,
//! capped at the maximum priority, so low-priority work is never starved.

use crate::constants::task_defaults;
use crate::models::{ShardId, TaskId};
use crate::orchestration::chrono_duration;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// A shard waiting for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub shard_id: ShardId,
    pub task_id: TaskId,
    /// Priority of the owning task
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: Reverse<u8>,
    seq: i64,
}

#[derive(Debug)]
pub struct ShardQueue {
    entries: BTreeMap<QueueKey, QueueEntry>,
    index: HashMap<ShardId, QueueKey>,
    next_seq: i64,
    next_front_seq: i64,
    aging_threshold: chrono::Duration,
    aging_interval: chrono::Duration,
}

impl ShardQueue {
    pub fn new(aging_threshold: Duration, aging_interval: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            next_front_seq: -1,
            aging_threshold: chrono_duration(aging_threshold),
            aging_interval: chrono_duration(aging_interval),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, shard_id: ShardId) -> bool {
        self.index.contains_key(&shard_id)
    }

    /// Add a shard at the back of its priority band; returns `false` if it is
    /// already queued
    pub fn push(&mut self, entry: QueueEntry) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(entry, seq)
    }

    /// Put a popped shard back ahead of its priority band
    pub fn push_front(&mut self, entry: QueueEntry) -> bool {
        let seq = self.next_front_seq;
        self.next_front_seq -= 1;
        self.insert(entry, seq)
    }

    fn insert(&mut self, entry: QueueEntry, seq: i64) -> bool {
        if self.index.contains_key(&entry.shard_id) {
            return false;
        }
        let key = QueueKey {
            rank: Reverse(entry.priority),
            seq,
        };
        self.index.insert(entry.shard_id, key);
        self.entries.insert(key, entry);
        true
    }

    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.values().next()
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        let (_, entry) = self.entries.pop_first()?;
        self.index.remove(&entry.shard_id);
        Some(entry)
    }

    pub fn remove(&mut self, shard_id: ShardId) -> Option<QueueEntry> {
        let key = self.index.remove(&shard_id)?;
        self.entries.remove(&key)
    }

    /// Remove every queued shard of a task
    pub fn remove_task(&mut self, task_id: TaskId) -> Vec<QueueEntry> {
        let shard_ids: Vec<ShardId> = self
            .entries
            .values()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.shard_id)
            .collect();
        shard_ids
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn effective_priority(&self, shard_id: ShardId) -> Option<u8> {
        self.index.get(&shard_id).map(|key| key.rank.0)
    }

    /// Priority after aging for an entry at `now`
    fn aged_priority(&self, entry: &QueueEntry, now: DateTime<Utc>) -> u8 {
        let waited = now - entry.enqueued_at;
        if waited < self.aging_threshold {
            return entry.priority;
        }
        let over = waited - self.aging_threshold;
        let steps = if self.aging_interval > chrono::Duration::zero() {
            1 + over.num_milliseconds() / self.aging_interval.num_milliseconds().max(1)
        } else {
            1
        };
        let aged = i64::from(entry.priority) + steps;
        aged.min(i64::from(task_defaults::MAX_PRIORITY)) as u8
    }

    /// Re-rank entries whose effective priority changed; returns how many moved
    pub fn age(&mut self, now: DateTime<Utc>) -> usize {
        let moves: Vec<(QueueKey, u8)> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                let aged = self.aged_priority(entry, now).max(key.rank.0);
                (aged != key.rank.0).then_some((*key, aged))
            })
            .collect();

        for (key, aged) in &moves {
            if let Some(entry) = self.entries.remove(key) {
                let new_key = QueueKey {
                    rank: Reverse(*aged),
                    seq: key.seq,
                };
                self.index.insert(entry.shard_id, new_key);
                self.entries.insert(new_key, entry);
            }
        }
        moves.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }
}
