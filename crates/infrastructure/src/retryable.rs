//! 按重试策略包装存储与远端客户端
//!
//! 只有 `is_retryable` 的错误会被重试, 围栏失败等错误原样返回。

use std::sync::Arc;

use async_trait::async_trait;
use history_core::{retry_with_policy, RetryPolicy};
use history_domain::{
    DlqEntry, DlqPage, DlqReadRequest, DlqStore, GetCrossClusterTasksRequest,
    GetCrossClusterTasksResponse, GetReplicationMessagesRequest, GetTasksRequest,
    GetTasksResponse, HistoryResult, RemoteAdminClient, ReplicationMessages,
    RespondCrossClusterTasksCompletedRequest, RespondCrossClusterTasksCompletedResponse,
    ShardInfo, ShardStore, Task, TaskCategory, TaskKey, TaskStore,
};

pub struct RetryableTaskStore {
    inner: Arc<dyn TaskStore>,
    policy: RetryPolicy,
}

impl RetryableTaskStore {
    pub fn new(inner: Arc<dyn TaskStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl TaskStore for RetryableTaskStore {
    async fn get_tasks(&self, request: &GetTasksRequest) -> HistoryResult<GetTasksResponse> {
        retry_with_policy(&self.policy, "get_tasks", || {
            let inner = Arc::clone(&self.inner);
            let request = request.clone();
            async move { inner.get_tasks(&request).await }
        })
        .await
    }

    async fn complete_task(
        &self,
        shard_id: i32,
        range_id: i64,
        category: TaskCategory,
        key: TaskKey,
    ) -> HistoryResult<()> {
        retry_with_policy(&self.policy, "complete_task", || {
            let inner = Arc::clone(&self.inner);
            async move { inner.complete_task(shard_id, range_id, category, key).await }
        })
        .await
    }

    async fn range_complete_tasks(
        &self,
        shard_id: i32,
        range_id: i64,
        category: TaskCategory,
        inclusive_max: TaskKey,
    ) -> HistoryResult<u64> {
        retry_with_policy(&self.policy, "range_complete_tasks", || {
            let inner = Arc::clone(&self.inner);
            async move {
                inner
                    .range_complete_tasks(shard_id, range_id, category, inclusive_max)
                    .await
            }
        })
        .await
    }

    async fn put_tasks(&self, shard_id: i32, range_id: i64, tasks: &[Task]) -> HistoryResult<()> {
        retry_with_policy(&self.policy, "put_tasks", || {
            let inner = Arc::clone(&self.inner);
            let tasks = tasks.to_vec();
            async move { inner.put_tasks(shard_id, range_id, &tasks).await }
        })
        .await
    }
}

pub struct RetryableShardStore {
    inner: Arc<dyn ShardStore>,
    policy: RetryPolicy,
}

impl RetryableShardStore {
    pub fn new(inner: Arc<dyn ShardStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ShardStore for RetryableShardStore {
    async fn get_or_create_shard(&self, shard_id: i32, owner: &str) -> HistoryResult<ShardInfo> {
        retry_with_policy(&self.policy, "get_or_create_shard", || {
            let inner = Arc::clone(&self.inner);
            let owner = owner.to_string();
            async move { inner.get_or_create_shard(shard_id, &owner).await }
        })
        .await
    }

    async fn update_shard(&self, shard: &ShardInfo, expected_range_id: i64) -> HistoryResult<()> {
        retry_with_policy(&self.policy, "update_shard", || {
            let inner = Arc::clone(&self.inner);
            let shard = shard.clone();
            async move { inner.update_shard(&shard, expected_range_id).await }
        })
        .await
    }
}

pub struct RetryableDlqStore {
    inner: Arc<dyn DlqStore>,
    policy: RetryPolicy,
}

impl RetryableDlqStore {
    pub fn new(inner: Arc<dyn DlqStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl DlqStore for RetryableDlqStore {
    async fn enqueue_message_to_dlq(&self, entry: &DlqEntry) -> HistoryResult<i64> {
        retry_with_policy(&self.policy, "enqueue_message_to_dlq", || {
            let inner = Arc::clone(&self.inner);
            let entry = entry.clone();
            async move { inner.enqueue_message_to_dlq(&entry).await }
        })
        .await
    }

    async fn read_messages_from_dlq(&self, request: &DlqReadRequest) -> HistoryResult<DlqPage> {
        retry_with_policy(&self.policy, "read_messages_from_dlq", || {
            let inner = Arc::clone(&self.inner);
            let request = request.clone();
            async move { inner.read_messages_from_dlq(&request).await }
        })
        .await
    }

    async fn range_delete_messages_from_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        inclusive_max_task_id: i64,
    ) -> HistoryResult<u64> {
        retry_with_policy(&self.policy, "range_delete_messages_from_dlq", || {
            let inner = Arc::clone(&self.inner);
            async move {
                inner
                    .range_delete_messages_from_dlq(shard_id, category, inclusive_max_task_id)
                    .await
            }
        })
        .await
    }

    async fn delete_messages_from_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        message_ids: &[i64],
    ) -> HistoryResult<u64> {
        retry_with_policy(&self.policy, "delete_messages_from_dlq", || {
            let inner = Arc::clone(&self.inner);
            let message_ids = message_ids.to_vec();
            async move {
                inner
                    .delete_messages_from_dlq(shard_id, category, &message_ids)
                    .await
            }
        })
        .await
    }

    async fn dlq_size(&self, shard_id: i32, category: TaskCategory) -> HistoryResult<u64> {
        retry_with_policy(&self.policy, "dlq_size", || {
            let inner = Arc::clone(&self.inner);
            async move { inner.dlq_size(shard_id, category).await }
        })
        .await
    }
}

pub struct RetryableRemoteAdminClient {
    inner: Arc<dyn RemoteAdminClient>,
    policy: RetryPolicy,
}

impl RetryableRemoteAdminClient {
    pub fn new(inner: Arc<dyn RemoteAdminClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl RemoteAdminClient for RetryableRemoteAdminClient {
    async fn get_cross_cluster_tasks(
        &self,
        request: GetCrossClusterTasksRequest,
    ) -> HistoryResult<GetCrossClusterTasksResponse> {
        retry_with_policy(&self.policy, "get_cross_cluster_tasks", || {
            let inner = Arc::clone(&self.inner);
            let request = request.clone();
            async move { inner.get_cross_cluster_tasks(request).await }
        })
        .await
    }

    async fn respond_cross_cluster_tasks_completed(
        &self,
        request: RespondCrossClusterTasksCompletedRequest,
    ) -> HistoryResult<RespondCrossClusterTasksCompletedResponse> {
        retry_with_policy(&self.policy, "respond_cross_cluster_tasks_completed", || {
            let inner = Arc::clone(&self.inner);
            let request = request.clone();
            async move { inner.respond_cross_cluster_tasks_completed(request).await }
        })
        .await
    }

    async fn get_replication_messages(
        &self,
        request: GetReplicationMessagesRequest,
    ) -> HistoryResult<ReplicationMessages> {
        retry_with_policy(&self.policy, "get_replication_messages", || {
            let inner = Arc::clone(&self.inner);
            let request = request.clone();
            async move { inner.get_replication_messages(request).await }
        })
        .await
    }
}
