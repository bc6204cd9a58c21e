//! # Shard Checkpoints
//!
//! Targets within a shard may finish out of order, but the checkpoint only covers
//! the contiguous prefix of finished targets. It is persisted locally for crash
//! recovery and forwarded to the scheduling center in shard reports.

use crate::models::{AssignmentToken, ShardId};
use crate::persistence::PersistenceResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

/// Tracks finished target indexes and the contiguous prefix they cover
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    checkpoint: usize,
    total: usize,
    /// Finished indexes beyond the checkpoint
    ahead: BTreeSet<usize>,
}

impl CheckpointTracker {
    pub fn new(start_offset: usize, total: usize) -> Self {
        Self {
            checkpoint: start_offset.min(total),
            total,
            ahead: BTreeSet::new(),
        }
    }

    /// Record a finished target; returns `true` when the checkpoint advanced
    pub fn mark_finished(&mut self, index: usize) -> bool {
        if index < self.checkpoint || index >= self.total {
            return false;
        }
        self.ahead.insert(index);

        let before = self.checkpoint;
        while self.ahead.remove(&self.checkpoint) {
            self.checkpoint += 1;
        }
        self.checkpoint > before
    }

    pub fn checkpoint(&self) -> usize {
        self.checkpoint
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.checkpoint == self.total
    }
}

/// A checkpoint as persisted on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCheckpoint {
    pub shard_id: ShardId,
    pub token: AssignmentToken,
    pub checkpoint: usize,
    pub saved_at: DateTime<Utc>,
}

impl LocalCheckpoint {
    pub fn new(shard_id: ShardId, token: AssignmentToken, checkpoint: usize) -> Self {
        Self {
            shard_id,
            token,
            checkpoint,
            saved_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    async fn save(&self, checkpoint: &LocalCheckpoint) -> PersistenceResult<()>;

    async fn load(&self, shard_id: ShardId) -> PersistenceResult<Option<LocalCheckpoint>>;

    async fn remove(&self, shard_id: ShardId) -> PersistenceResult<()>;
}

/// One JSON file per shard under a directory
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, shard_id: ShardId) -> PathBuf {
        self.directory.join(format!("{shard_id}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &LocalCheckpoint) -> PersistenceResult<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.path_for(checkpoint.shard_id);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec(checkpoint)?).await?;
        // Rename keeps the previous checkpoint intact if the write is interrupted
        tokio::fs::rename(&staging, &path).await?;
        debug!(shard_id = %checkpoint.shard_id, checkpoint = checkpoint.checkpoint, "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, shard_id: ShardId) -> PersistenceResult<Option<LocalCheckpoint>> {
        match tokio::fs::read(self.path_for(shard_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, shard_id: ShardId) -> PersistenceResult<()> {
        match tokio::fs::remove_file(self.path_for(shard_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Volatile store for tests and nodes without local disk
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<ShardId, LocalCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &LocalCheckpoint) -> PersistenceResult<()> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.shard_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, shard_id: ShardId) -> PersistenceResult<Option<LocalCheckpoint>> {
        Ok(self.checkpoints.read().await.get(&shard_id).cloned())
    }

    async fn remove(&self, shard_id: ShardId) -> PersistenceResult<()> {
        self.checkpoints.write().await.remove(&shard_id);
        Ok(())
    }
}
