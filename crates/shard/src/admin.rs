//! 管理接口: 为远端集群提供跨集群与复制拉取的源集群侧服务, 并暴露运维操作

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use history_domain::{
    ClusterRole, DlqPage, GetCrossClusterTasksRequest, GetCrossClusterTasksResponse,
    GetReplicationMessagesRequest, HistoryError, HistoryResult, RemoteAdminClient,
    ReplicationMessages, RespondCrossClusterTasksCompletedRequest,
    RespondCrossClusterTasksCompletedResponse, TaskCategory,
};
use history_observability::{metric_names, Scope, ScopedMetrics};
use history_queue::ProcessorSnapshot;
use tracing::{debug, info};

use crate::controller::{ShardController, ShardStatus};
use crate::engine::Engine;

pub struct AdminHandler {
    controller: Arc<ShardController>,
    metrics: ScopedMetrics,
}

impl AdminHandler {
    pub fn new(controller: Arc<ShardController>) -> Self {
        Self {
            controller,
            metrics: ScopedMetrics::new(Scope::AdminHandler),
        }
    }

    fn engine(&self, shard_id: i32) -> HistoryResult<Arc<dyn Engine>> {
        self.controller
            .owned_engine(shard_id)
            .ok_or(HistoryError::ShardNotOwned { shard_id })
    }

    pub fn describe_shards(&self) -> BTreeMap<i32, ShardStatus> {
        self.controller.shard_status()
    }

    pub fn describe_queue(
        &self,
        shard_id: i32,
        category: TaskCategory,
        role: ClusterRole,
    ) -> HistoryResult<ProcessorSnapshot> {
        self.engine(shard_id)?.describe_queue(category, role)
    }

    pub async fn reset_queue(&self, shard_id: i32, category: TaskCategory, role: ClusterRole) -> HistoryResult<()> {
        info!(shard_id, category = %category, role = %role, "运维重置队列");
        self.metrics.inc_with(metric_names::ADMIN_REQUESTS, "operation", "reset_queue");
        self.engine(shard_id)?.reset_queue(category, role).await
    }

    pub async fn read_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        page_token: Option<i64>,
        page_size: Option<usize>,
    ) -> HistoryResult<DlqPage> {
        self.engine(shard_id)?
            .read_dlq(category, page_token, page_size)
            .await
    }

    pub async fn purge_dlq(&self, shard_id: i32, category: TaskCategory, up_to_task_id: i64) -> HistoryResult<u64> {
        info!(shard_id, category = %category, up_to_task_id, "运维清除死信");
        self.metrics.inc_with(metric_names::ADMIN_REQUESTS, "operation", "purge_dlq");
        self.engine(shard_id)?.purge_dlq(category, up_to_task_id).await
    }

    pub async fn merge_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        up_to_task_id: Option<i64>,
    ) -> HistoryResult<usize> {
        info!(shard_id, category = %category, ?up_to_task_id, "运维合并死信");
        self.metrics.inc_with(metric_names::ADMIN_REQUESTS, "operation", "merge_dlq");
        self.engine(shard_id)?.merge_dlq(category, up_to_task_id).await
    }
}

#[async_trait]
impl RemoteAdminClient for AdminHandler {
    /// 本机不拥有的分片放入 `failed_shards`, 不影响其余分片
    async fn get_cross_cluster_tasks(
        &self,
        request: GetCrossClusterTasksRequest,
    ) -> HistoryResult<GetCrossClusterTasksResponse> {
        let mut response = GetCrossClusterTasksResponse::default();
        for (shard_id, watermark) in request.shard_watermarks {
            let tasks = match self.engine(shard_id) {
                Ok(engine) => {
                    engine
                        .get_cross_cluster_tasks(&request.target_cluster, watermark, request.batch_size)
                        .await
                }
                Err(e) => Err(e),
            };
            match tasks {
                Ok(tasks) => {
                    if !tasks.is_empty() {
                        debug!(shard_id, target = %request.target_cluster, count = tasks.len(), "投递跨集群任务");
                    }
                    response.tasks_by_shard.insert(shard_id, tasks);
                }
                Err(e) => {
                    response.failed_shards.insert(shard_id, e.to_string());
                }
            }
        }
        Ok(response)
    }

    async fn respond_cross_cluster_tasks_completed(
        &self,
        request: RespondCrossClusterTasksCompletedRequest,
    ) -> HistoryResult<RespondCrossClusterTasksCompletedResponse> {
        self.engine(request.shard_id)?
            .respond_cross_cluster_tasks_completed(&request.target_cluster, request.responses)
            .await
    }

    async fn get_replication_messages(
        &self,
        request: GetReplicationMessagesRequest,
    ) -> HistoryResult<ReplicationMessages> {
        self.engine(request.shard_id)?
            .get_replication_messages(&request)
            .await
    }
}
