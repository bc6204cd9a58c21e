//! Postgres-backed state store. Records are JSONB documents next to the columns
//! needed for recovery queries.

use super::{PersistenceError, PersistenceResult, StateStore};
use crate::models::{Node, Shard, ShardId, Task, TaskId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

const SCHEMA: &str = include_str!("../../migrations/20251017000000_create_scan_state.sql");

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists
    pub async fn connect(url: &str, max_connections: u32) -> PersistenceResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Apply the schema; every statement is idempotent
    pub async fn run_migrations(&self) -> PersistenceResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("💾 DATABASE: scan state schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn decode<T: DeserializeOwned>(
        entity: &'static str,
        id: String,
        record: serde_json::Value,
    ) -> PersistenceResult<T> {
        serde_json::from_value(record).map_err(|e| PersistenceError::Corrupt {
            entity,
            id,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn save_task(&self, task: &Task) -> PersistenceResult<()> {
        let record = serde_json::to_value(task)?;
        sqlx::query(
            r#"
            INSERT INTO vulnscan_tasks (task_id, status, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (task_id) DO UPDATE
            SET status = EXCLUDED.status, record = EXCLUDED.record, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(task.id.0)
        .bind(task.status.to_string())
        .bind(record)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<Task>> {
        let row = sqlx::query("SELECT record FROM vulnscan_tasks WHERE task_id = $1")
            .bind(task_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Self::decode("task", task_id.to_string(), row.try_get("record")?))
            .transpose()
    }

    async fn list_tasks(&self) -> PersistenceResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT task_id, record FROM vulnscan_tasks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let id: uuid::Uuid = row.try_get("task_id")?;
                Self::decode("task", id.to_string(), row.try_get("record")?)
            })
            .collect()
    }

    async fn delete_task(&self, task_id: TaskId) -> PersistenceResult<()> {
        sqlx::query("DELETE FROM vulnscan_tasks WHERE task_id = $1")
            .bind(task_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_shards(&self, shards: &[Shard]) -> PersistenceResult<()> {
        let mut tx = self.pool.begin().await?;
        for shard in shards {
            let record = serde_json::to_value(shard)?;
            sqlx::query(
                r#"
                INSERT INTO vulnscan_shards (shard_id, task_id, sequence, status, record, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (shard_id) DO UPDATE
                SET status = EXCLUDED.status, record = EXCLUDED.record, updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(shard.id.0)
            .bind(shard.task_id.0)
            .bind(shard.sequence as i32)
            .bind(shard.status.to_string())
            .bind(record)
            .bind(shard.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_shard(&self, shard_id: ShardId) -> PersistenceResult<Option<Shard>> {
        let row = sqlx::query("SELECT record FROM vulnscan_shards WHERE shard_id = $1")
            .bind(shard_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Self::decode("shard", shard_id.to_string(), row.try_get("record")?))
            .transpose()
    }

    async fn list_shards(&self, task_id: TaskId) -> PersistenceResult<Vec<Shard>> {
        let rows = sqlx::query(
            "SELECT shard_id, record FROM vulnscan_shards WHERE task_id = $1 ORDER BY sequence",
        )
        .bind(task_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let id: uuid::Uuid = row.try_get("shard_id")?;
                Self::decode("shard", id.to_string(), row.try_get("record")?)
            })
            .collect()
    }

    async fn save_node(&self, node: &Node) -> PersistenceResult<()> {
        let record = serde_json::to_value(node)?;
        sqlx::query(
            r#"
            INSERT INTO vulnscan_nodes (node_id, status, record, last_heartbeat)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (node_id) DO UPDATE
            SET status = EXCLUDED.status, record = EXCLUDED.record, last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(&node.id)
        .bind(node.status.to_string())
        .bind(record)
        .bind(node.last_heartbeat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> PersistenceResult<Vec<Node>> {
        let rows = sqlx::query("SELECT node_id, record FROM vulnscan_nodes ORDER BY node_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("node_id")?;
                Self::decode("node", id, row.try_get("record")?)
            })
            .collect()
    }

    async fn delete_node(&self, node_id: &str) -> PersistenceResult<()> {
        sqlx::query("DELETE FROM vulnscan_nodes WHERE node_id = $1")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
