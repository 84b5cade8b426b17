//! 源集群侧: 从分片的复制队列读取任务响应远端拉取
//!
//! 复制队列的任务ID即消息ID。每个远端集群上报自己的已处理水位,
//! 所有已配置的远端都越过某条消息后才从队列中删除。

use std::collections::HashMap;
use std::sync::Arc;

use history_domain::{
    DomainFilter, GetReplicationMessagesRequest, GetTasksRequest, HistoryError, HistoryResult,
    ReplicationMessages, ReplicationTask, ShardContext, TaskCategory, TaskKey, TaskStore,
};
use history_observability::{metric_names, Scope, ScopedMetrics};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct SourceState {
    processed_levels: HashMap<String, i64>,
    last_deleted: i64,
}

pub struct ReplicationTaskSource {
    shard: Arc<dyn ShardContext>,
    task_store: Arc<dyn TaskStore>,
    remote_clusters: Vec<String>,
    state: Mutex<SourceState>,
    metrics: ScopedMetrics,
}

impl ReplicationTaskSource {
    pub fn new(
        shard: Arc<dyn ShardContext>,
        task_store: Arc<dyn TaskStore>,
        remote_clusters: Vec<String>,
    ) -> Self {
        let metrics = ScopedMetrics::new(Scope::ReplicatorQueueProcessor)
            .tagged("shard_id", shard.shard_id().to_string());
        Self {
            shard,
            task_store,
            remote_clusters,
            state: Mutex::new(SourceState::default()),
            metrics,
        }
    }

    pub fn shard_id(&self) -> i32 {
        self.shard.shard_id()
    }

    pub async fn get_replication_messages(
        &self,
        request: &GetReplicationMessagesRequest,
    ) -> HistoryResult<ReplicationMessages> {
        if !self.shard.is_valid() {
            return Err(HistoryError::ShardNotOwned {
                shard_id: self.shard.shard_id(),
            });
        }
        if request.shard_id != self.shard.shard_id() {
            return Err(HistoryError::invalid_argument(format!(
                "请求的分片 {} 与本分片 {} 不一致",
                request.shard_id,
                self.shard.shard_id()
            )));
        }
        if !self.remote_clusters.contains(&request.cluster_name) {
            return Err(HistoryError::invalid_argument(format!(
                "未知的远端集群: {}",
                request.cluster_name
            )));
        }

        self.record_processed(&request.cluster_name, request.last_processed_message_id)
            .await;

        let response = self
            .task_store
            .get_tasks(&GetTasksRequest {
                shard_id: self.shard.shard_id(),
                category: TaskCategory::Replication,
                min_key: TaskKey::immediate(request.last_retrieved_message_id),
                max_key: TaskKey::MAX,
                domain_filter: DomainFilter::all(),
                batch_size: request.batch_size.max(1),
            })
            .await?;

        let mut last_retrieved = request.last_retrieved_message_id;
        let mut tasks = Vec::with_capacity(response.tasks.len());
        for raw in &response.tasks {
            last_retrieved = last_retrieved.max(raw.task_id);
            match ReplicationTask::from_task(raw) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    self.metrics
                        .inc_with(metric_names::TASK_ERRORS, "error", e.metric_tag());
                    warn!(
                        shard_id = self.shard.shard_id(),
                        task_id = raw.task_id,
                        "无法解析复制任务, 跳过: {}",
                        e
                    );
                }
            }
        }
        self.metrics
            .add(metric_names::REPLICATION_TASKS_RETURNED, tasks.len() as u64);
        debug!(
            shard_id = self.shard.shard_id(),
            cluster = %request.cluster_name,
            returned = tasks.len(),
            last_retrieved,
            "返回复制消息"
        );

        Ok(ReplicationMessages {
            tasks,
            last_retrieved_message_id: last_retrieved,
            has_more: response.more,
        })
    }

    /// 记录远端水位, 所有远端都越过的部分从队列删除
    async fn record_processed(&self, cluster: &str, level: i64) {
        let mut state = self.state.lock().await;
        let entry = state.processed_levels.entry(cluster.to_string()).or_insert(level);
        *entry = (*entry).max(level);

        let min_level = self
            .remote_clusters
            .iter()
            .map(|c| state.processed_levels.get(c).copied())
            .collect::<Option<Vec<_>>>()
            .and_then(|levels| levels.into_iter().min());
        let Some(min_level) = min_level else {
            return;
        };
        if min_level <= state.last_deleted {
            return;
        }
        match self
            .task_store
            .range_complete_tasks(
                self.shard.shard_id(),
                self.shard.range_id(),
                TaskCategory::Replication,
                TaskKey::immediate(min_level),
            )
            .await
        {
            Ok(deleted) => {
                state.last_deleted = min_level;
                if deleted > 0 {
                    debug!(
                        shard_id = self.shard.shard_id(),
                        up_to = min_level,
                        deleted,
                        "已删除所有远端确认的复制任务"
                    );
                }
            }
            Err(e) => warn!(
                shard_id = self.shard.shard_id(),
                "删除已确认的复制任务失败: {}",
                e
            ),
        }
    }

    /// 写入新的复制任务, 任务ID取消息ID
    pub async fn append(&self, tasks: Vec<ReplicationTask>) -> HistoryResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let count = tasks.len();
        let rows: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let message_id = task.message_id;
                let mut row = task.into_task();
                row.shard_id = self.shard.shard_id();
                row.category = TaskCategory::Replication;
                row.task_id = message_id;
                row
            })
            .collect();
        let result = self
            .task_store
            .put_tasks(self.shard.shard_id(), self.shard.range_id(), &rows)
            .await;
        if let Err(e) = &result {
            if e.is_ownership_error() {
                self.shard.mark_ownership_lost(e);
            }
            return result;
        }
        info!(shard_id = self.shard.shard_id(), count, "已写入复制任务");
        Ok(())
    }
}
