use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use history_domain::{
    GetTasksRequest, GetTasksResponse, HistoryError, HistoryResult, Task, TaskCategory,
    TaskKey, TaskStore,
};
use tokio::sync::RwLock;
use tracing::debug;

use super::shard_store::InMemoryShardStore;

type TaskTable = BTreeMap<TaskKey, Task>;

/// 内存任务存储
///
/// 按 (分片, 类别) 分表, 表内按 TaskKey 有序。配置了分片存储时,
/// 写入和删除都在持有表锁时校验 range_id。
#[derive(Default)]
pub struct InMemoryTaskStore {
    tables: RwLock<HashMap<(i32, TaskCategory), TaskTable>>,
    fencing: Option<Arc<InMemoryShardStore>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fencing(shard_store: Arc<InMemoryShardStore>) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            fencing: Some(shard_store),
        }
    }

    pub async fn task_count(&self, shard_id: i32, category: TaskCategory) -> usize {
        self.tables
            .read()
            .await
            .get(&(shard_id, category))
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub async fn tasks(&self, shard_id: i32, category: TaskCategory) -> Vec<Task> {
        self.tables
            .read()
            .await
            .get(&(shard_id, category))
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn check_range_id(&self, shard_id: i32, range_id: i64) -> HistoryResult<()> {
        let Some(shards) = &self.fencing else {
            return Ok(());
        };
        match shards.range_id(shard_id).await {
            Some(actual) if actual == range_id => Ok(()),
            Some(actual) => Err(HistoryError::StaleRangeId {
                shard_id,
                expected: range_id,
                actual,
            }),
            None => Err(HistoryError::ShardNotOwned { shard_id }),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_tasks(&self, request: &GetTasksRequest) -> HistoryResult<GetTasksResponse> {
        if request.min_key >= request.max_key {
            return Ok(GetTasksResponse::default());
        }
        let tables = self.tables.read().await;
        let Some(table) = tables.get(&(request.shard_id, request.category)) else {
            return Ok(GetTasksResponse::default());
        };

        let mut matching = table
            .range((Bound::Excluded(request.min_key), Bound::Included(request.max_key)))
            .map(|(_, task)| task)
            .filter(|task| request.domain_filter.matches(&task.domain_id));
        let tasks: Vec<Task> = matching.by_ref().take(request.batch_size).cloned().collect();
        let more = matching.next().is_some();
        Ok(GetTasksResponse { tasks, more })
    }

    async fn complete_task(
        &self,
        shard_id: i32,
        range_id: i64,
        category: TaskCategory,
        key: TaskKey,
    ) -> HistoryResult<()> {
        let mut tables = self.tables.write().await;
        self.check_range_id(shard_id, range_id).await?;
        if let Some(table) = tables.get_mut(&(shard_id, category)) {
            table.remove(&key);
        }
        Ok(())
    }

    async fn range_complete_tasks(
        &self,
        shard_id: i32,
        range_id: i64,
        category: TaskCategory,
        inclusive_max: TaskKey,
    ) -> HistoryResult<u64> {
        let mut tables = self.tables.write().await;
        self.check_range_id(shard_id, range_id).await?;
        let Some(table) = tables.get_mut(&(shard_id, category)) else {
            return Ok(0);
        };
        let kept = match inclusive_max.task_id.checked_add(1) {
            Some(next) => table.split_off(&TaskKey::new(inclusive_max.visibility_ms, next)),
            None => match inclusive_max.visibility_ms.checked_add(1) {
                Some(next_ms) => table.split_off(&TaskKey::new(next_ms, i64::MIN)),
                None => TaskTable::new(),
            },
        };
        let deleted = table.len() as u64;
        *table = kept;
        debug!(shard_id, category = %category, up_to = %inclusive_max, deleted, "批量删除任务");
        Ok(deleted)
    }

    async fn put_tasks(&self, shard_id: i32, range_id: i64, tasks: &[Task]) -> HistoryResult<()> {
        let mut tables = self.tables.write().await;
        self.check_range_id(shard_id, range_id).await?;
        for task in tasks {
            tables
                .entry((shard_id, task.category))
                .or_default()
                .insert(task.key(), task.clone());
        }
        Ok(())
    }
}
