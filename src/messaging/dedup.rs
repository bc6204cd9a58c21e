//! Consumer-side de-duplication for at-least-once delivery.

use crate::models::{DedupKey, ShardId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

/// Remembers which (shard, target, plugin, attempt) results were already applied
#[derive(Debug, Default)]
pub struct ResultDeduplicator {
    seen: DashMap<DedupKey, DateTime<Utc>>,
}

impl ResultDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key; returns `true` the first time it is seen
    pub fn first_delivery(&self, key: DedupKey) -> bool {
        let mut first = false;
        self.seen.entry(key).or_insert_with(|| {
            first = true;
            Utc::now()
        });
        first
    }

    /// Forget one key so a redelivery is applied again
    pub fn forget(&self, key: &DedupKey) {
        self.seen.remove(key);
    }

    /// Drop every key of a finished shard
    pub fn forget_shard(&self, shard_id: ShardId) {
        self.seen.retain(|key, _| key.shard_id != shard_id);
    }

    /// Drop every key of the given shards in one pass
    pub fn forget_shards(&self, shard_ids: &HashSet<ShardId>) {
        if shard_ids.is_empty() {
            return;
        }
        self.seen.retain(|key, _| !shard_ids.contains(&key.shard_id));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(shard_id: ShardId, attempt: u32) -> DedupKey {
        DedupKey {
            shard_id,
            target: "10.0.0.1".into(),
            plugin_id: "CVE-2021-44228".into(),
            attempt,
        }
    }

    #[test]
    fn test_redelivery_detected() {
        let dedup = ResultDeduplicator::new();
        let shard = ShardId::new();
        assert!(dedup.first_delivery(key(shard, 1)));
        assert!(!dedup.first_delivery(key(shard, 1)));
        // A new attempt is a distinct execution
        assert!(dedup.first_delivery(key(shard, 2)));
    }

    #[test]
    fn test_forget_shard() {
        let dedup = ResultDeduplicator::new();
        let a = ShardId::new();
        let b = ShardId::new();
        dedup.first_delivery(key(a, 1));
        dedup.first_delivery(key(b, 1));
        dedup.forget_shard(a);
        assert_eq!(dedup.len(), 1);
        assert!(dedup.first_delivery(key(a, 1)));
    }

    #[test]
    fn test_forget_shards_keeps_other_shards() {
        let dedup = ResultDeduplicator::new();
        let (a, b, c) = (ShardId::new(), ShardId::new(), ShardId::new());
        for shard in [a, b, c] {
            dedup.first_delivery(key(shard, 1));
            dedup.first_delivery(key(shard, 2));
        }
        dedup.forget_shards(&HashSet::from([a, c]));
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.first_delivery(key(b, 2)));
    }
}
