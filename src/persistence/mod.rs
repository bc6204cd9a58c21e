//! # Durable Scheduling State
//!
//! Task, shard and node records must survive a restart of the scheduling center.
//! The dispatcher's queue and load index are rebuilt from what is stored here.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::models::{Node, Shard, ShardId, Task, TaskId};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryStateStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStateStore;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt {entity} record {id}: {reason}")]
    Corrupt {
        entity: &'static str,
        id: String,
        reason: String,
    },
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for PersistenceError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(error.to_string())
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Durable store for scheduling records. Writes are upserts keyed by id, so
/// replaying an operation is harmless.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    async fn save_task(&self, task: &Task) -> PersistenceResult<()>;

    async fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<Task>>;

    async fn list_tasks(&self) -> PersistenceResult<Vec<Task>>;

    /// Remove a task together with its shards
    async fn delete_task(&self, task_id: TaskId) -> PersistenceResult<()>;

    async fn save_shards(&self, shards: &[Shard]) -> PersistenceResult<()>;

    async fn save_shard(&self, shard: &Shard) -> PersistenceResult<()> {
        self.save_shards(std::slice::from_ref(shard)).await
    }

    async fn get_shard(&self, shard_id: ShardId) -> PersistenceResult<Option<Shard>>;

    /// Shards of a task ordered by sequence
    async fn list_shards(&self, task_id: TaskId) -> PersistenceResult<Vec<Shard>>;

    async fn save_node(&self, node: &Node) -> PersistenceResult<()>;

    async fn list_nodes(&self) -> PersistenceResult<Vec<Node>>;

    async fn delete_node(&self, node_id: &str) -> PersistenceResult<()>;
}
