//! 协作方接口: 工作流语义、域注册表、成员关系、远端集群客户端与分片上下文

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::entities::{ClusterRole, Task, TaskCategory, TaskKey};
use crate::messaging::{
    GetCrossClusterTasksRequest, GetCrossClusterTasksResponse, GetReplicationMessagesRequest,
    ReplicationMessages, ReplicationTask, RespondCrossClusterTasksCompletedRequest,
    RespondCrossClusterTasksCompletedResponse, ResendRequest,
};
use crate::value_objects::ProcessingQueueState;
use history_errors::{HistoryError, HistoryResult};

/// 执行一次任务时携带的上下文, 其中 `range_id` 是本次操作的围栏令牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub shard_id: i32,
    pub range_id: i64,
    pub role: ClusterRole,
    pub attempt: u32,
    pub current_cluster: String,
}

/// 任务的工作流侧执行, 由外部实现
///
/// 主动角色执行变更; 备用角色只做校验, 未追平时返回
/// `StandbyTaskPending` 或 `ResyncRequired`。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> HistoryResult<()>;
}

/// 域注册表: 域当前的活跃集群
#[async_trait]
pub trait DomainRegistry: Send + Sync {
    async fn active_cluster(&self, domain_id: &str) -> HistoryResult<String>;
}

/// 成员关系: 分片 -> 主机
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    async fn lookup(&self, shard_id: i32) -> HistoryResult<String>;
    /// 每次成员变化版本号递增
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// 带外重新同步
#[async_trait]
pub trait Resyncer: Send + Sync {
    async fn resend(&self, request: &ResendRequest) -> HistoryResult<()>;
}

/// 复制任务在本集群的应用
#[async_trait]
pub trait ReplicationApplier: Send + Sync {
    async fn apply(&self, task: &ReplicationTask) -> HistoryResult<()>;
}

/// 远端集群的管理接口
#[async_trait]
pub trait RemoteAdminClient: Send + Sync {
    async fn get_cross_cluster_tasks(
        &self,
        request: GetCrossClusterTasksRequest,
    ) -> HistoryResult<GetCrossClusterTasksResponse>;

    async fn respond_cross_cluster_tasks_completed(
        &self,
        request: RespondCrossClusterTasksCompletedRequest,
    ) -> HistoryResult<RespondCrossClusterTasksCompletedResponse>;

    async fn get_replication_messages(
        &self,
        request: GetReplicationMessagesRequest,
    ) -> HistoryResult<ReplicationMessages>;
}

/// 按集群名查找远端客户端
pub trait RemoteClusterClients: Send + Sync {
    fn admin_client(&self, cluster: &str) -> HistoryResult<Arc<dyn RemoteAdminClient>>;
    fn remote_clusters(&self) -> Vec<String>;
}

/// 已获取分片的上下文, 由分片控制器创建并交给处理器
#[async_trait]
pub trait ShardContext: Send + Sync {
    fn shard_id(&self) -> i32;
    fn range_id(&self) -> i64;
    fn owner(&self) -> String;
    fn current_cluster(&self) -> String;
    /// 分片关闭或所有权丢失时触发
    fn cancellation_token(&self) -> CancellationToken;

    fn is_valid(&self) -> bool {
        !self.cancellation_token().is_cancelled()
    }

    fn execution_context(&self, role: ClusterRole, attempt: u32) -> ExecutionContext {
        ExecutionContext {
            shard_id: self.shard_id(),
            range_id: self.range_id(),
            role,
            attempt,
            current_cluster: self.current_cluster(),
        }
    }

    /// 启动时加载的队列状态
    async fn queue_states(&self, category: TaskCategory, role: ClusterRole) -> Vec<ProcessingQueueState>;

    /// 带围栏的持久化
    async fn update_queue_states(
        &self,
        category: TaskCategory,
        role: ClusterRole,
        states: Vec<ProcessingQueueState>,
    ) -> HistoryResult<()>;

    /// 上报某角色的确认位置, 返回该类别所有角色中的最小值
    async fn report_ack_level(&self, category: TaskCategory, role: ClusterRole, level: TaskKey) -> TaskKey;

    async fn replication_ack_level(&self, cluster: &str) -> i64;

    async fn update_replication_ack_level(&self, cluster: &str, message_id: i64) -> HistoryResult<()>;

    /// 围栏失败时调用, 关闭分片
    fn mark_ownership_lost(&self, error: &HistoryError);
}
