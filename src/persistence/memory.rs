use super::{PersistenceResult, StateStore};
use crate::models::{Node, Shard, ShardId, Task, TaskId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    shards: RwLock<HashMap<ShardId, Shard>>,
    nodes: RwLock<HashMap<String, Node>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_task(&self, task: &Task) -> PersistenceResult<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn list_tasks(&self) -> PersistenceResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn delete_task(&self, task_id: TaskId) -> PersistenceResult<()> {
        self.tasks.write().await.remove(&task_id);
        self.shards
            .write()
            .await
            .retain(|_, shard| shard.task_id != task_id);
        Ok(())
    }

    async fn save_shards(&self, shards: &[Shard]) -> PersistenceResult<()> {
        let mut stored = self.shards.write().await;
        for shard in shards {
            stored.insert(shard.id, shard.clone());
        }
        Ok(())
    }

    async fn get_shard(&self, shard_id: ShardId) -> PersistenceResult<Option<Shard>> {
        Ok(self.shards.read().await.get(&shard_id).cloned())
    }

    async fn list_shards(&self, task_id: TaskId) -> PersistenceResult<Vec<Shard>> {
        let mut shards: Vec<Shard> = self
            .shards
            .read()
            .await
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        shards.sort_by_key(|s| s.sequence);
        Ok(shards)
    }

    async fn save_node(&self, node: &Node) -> PersistenceResult<()> {
        self.nodes.write().await.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn list_nodes(&self) -> PersistenceResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn delete_node(&self, node_id: &str) -> PersistenceResult<()> {
        self.nodes.write().await.remove(node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTask, ScanPolicy, TaskOptions, TaskProgress};
    use crate::state_machine::TaskState;
    use chrono::Utc;

    fn task() -> Task {
        let request = NewTask::new("t", vec!["10.0.0.1".into()], "full");
        Task {
            id: TaskId::new(),
            name: request.name,
            targets: request.targets,
            auth_ref: None,
            policy: ScanPolicy::Full,
            vuln_ids: vec![],
            priority: 5,
            options: TaskOptions {
                concurrency: 1,
                execution_timeout_secs: 1,
                rate_limit: 1,
                failure_policy: Default::default(),
                partition_size: 1,
            },
            status: TaskState::Dispatching,
            progress: TaskProgress::default(),
            findings: Default::default(),
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_delete_task_cascades_to_shards() {
        let store = InMemoryStateStore::new();
        let task = task();
        store.save_task(&task).await.unwrap();
        let shards = vec![
            Shard::new(task.id, 1, vec!["b".into()], 5),
            Shard::new(task.id, 0, vec!["a".into()], 5),
        ];
        store.save_shards(&shards).await.unwrap();

        let listed = store.list_shards(task.id).await.unwrap();
        assert_eq!(listed.iter().map(|s| s.sequence).collect::<Vec<_>>(), vec![0, 1]);

        store.delete_task(task.id).await.unwrap();
        assert!(store.get_task(task.id).await.unwrap().is_none());
        assert!(store.list_shards(task.id).await.unwrap().is_empty());
    }
}
