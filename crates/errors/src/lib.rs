use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum HistoryError {
    #[error("持久化错误: {0}")]
    Persistence(String),
    #[error("持久化超时: {0}")]
    PersistenceTimeout(String),
    #[error("远端服务繁忙: {0}")]
    ServiceBusy(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("分片 {shard_id} 所有权已丢失, 当前所有者: {owner}")]
    ShardOwnershipLost { shard_id: i32, owner: String },
    #[error("分片 {shard_id} 的 rangeID 条件更新失败: 期望 {expected}, 实际 {actual}")]
    StaleRangeId {
        shard_id: i32,
        expected: i64,
        actual: i64,
    },
    #[error("分片 {shard_id} 不属于本节点")]
    ShardNotOwned { shard_id: i32 },
    #[error("实体不存在: {0}")]
    EntityNotFound(String),
    #[error("域不存在: {0}")]
    DomainNotFound(String),
    #[error("域 {domain_id} 在本集群未激活, 活跃集群: {active_cluster}")]
    DomainNotActive {
        domain_id: String,
        active_cluster: String,
    },
    #[error("备用任务等待复制追平: {0}")]
    StandbyTaskPending(String),
    #[error("需要重新同步 {workflow_id}/{run_id} 的事件 [{start_event_id}, {end_event_id})")]
    ResyncRequired {
        domain_id: String,
        workflow_id: String,
        run_id: String,
        start_event_id: i64,
        end_event_id: i64,
    },
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("任务执行发生panic: {0}")]
    TaskPanicked(String),
    #[error("不可重试错误: {0}")]
    NonRetryable(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("无效参数: {0}")]
    InvalidArgument(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("调度器繁忙")]
    SchedulerBusy,
    #[error("调度器已停止")]
    SchedulerStopped,
    #[error("任务已取消: {0}")]
    Cancelled(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// 错误分类, 决定任务处理路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// 带退避重试, 不向上传播
    Transient,
    /// 分片所有权/围栏失败, 处理器实例终止
    Ownership,
    /// 任务已过时, 跳过并确认
    Obsolete,
    /// 备用侧等待复制或重新同步后重试
    StandbyRetry,
    /// 毒任务, 进入死信队列
    NonRetryable,
}

impl HistoryError {
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }
    pub fn entity_not_found<S: Into<String>>(msg: S) -> Self {
        Self::EntityNotFound(msg.into())
    }
    pub fn non_retryable<S: Into<String>>(msg: S) -> Self {
        Self::NonRetryable(msg.into())
    }
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }
    pub fn task_execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
    pub fn ownership_lost<S: Into<String>>(shard_id: i32, owner: S) -> Self {
        Self::ShardOwnershipLost {
            shard_id,
            owner: owner.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            HistoryError::Persistence(_)
            | HistoryError::PersistenceTimeout(_)
            | HistoryError::ServiceBusy(_)
            | HistoryError::Network(_)
            | HistoryError::Timeout(_)
            | HistoryError::TaskExecution(_)
            | HistoryError::TaskPanicked(_)
            | HistoryError::SchedulerBusy => ErrorClass::Transient,
            HistoryError::ShardOwnershipLost { .. }
            | HistoryError::StaleRangeId { .. }
            | HistoryError::ShardNotOwned { .. } => ErrorClass::Ownership,
            HistoryError::EntityNotFound(_)
            | HistoryError::DomainNotFound(_)
            | HistoryError::Cancelled(_) => ErrorClass::Obsolete,
            HistoryError::DomainNotActive { .. }
            | HistoryError::StandbyTaskPending(_)
            | HistoryError::ResyncRequired { .. } => ErrorClass::StandbyRetry,
            HistoryError::NonRetryable(_)
            | HistoryError::Serialization(_)
            | HistoryError::InvalidArgument(_)
            | HistoryError::Configuration(_)
            | HistoryError::SchedulerStopped
            | HistoryError::Internal(_) => ErrorClass::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::StandbyRetry
        )
    }

    pub fn is_ownership_error(&self) -> bool {
        self.class() == ErrorClass::Ownership
    }

    pub fn is_obsolete(&self) -> bool {
        self.class() == ErrorClass::Obsolete
    }

    /// 指标标签用的短名称
    pub fn metric_tag(&self) -> &'static str {
        match self {
            HistoryError::Persistence(_) => "persistence",
            HistoryError::PersistenceTimeout(_) => "persistence_timeout",
            HistoryError::ServiceBusy(_) => "service_busy",
            HistoryError::Network(_) => "network",
            HistoryError::Timeout(_) => "timeout",
            HistoryError::ShardOwnershipLost { .. } => "shard_ownership_lost",
            HistoryError::StaleRangeId { .. } => "condition_failed",
            HistoryError::ShardNotOwned { .. } => "shard_not_owned",
            HistoryError::EntityNotFound(_) => "entity_not_found",
            HistoryError::DomainNotFound(_) => "domain_not_found",
            HistoryError::DomainNotActive { .. } => "domain_not_active",
            HistoryError::StandbyTaskPending(_) => "standby_pending",
            HistoryError::ResyncRequired { .. } => "resync_required",
            HistoryError::TaskExecution(_) => "task_execution",
            HistoryError::TaskPanicked(_) => "task_panicked",
            HistoryError::NonRetryable(_) => "non_retryable",
            HistoryError::Serialization(_) => "serialization",
            HistoryError::InvalidArgument(_) => "invalid_argument",
            HistoryError::Configuration(_) => "configuration",
            HistoryError::SchedulerBusy => "scheduler_busy",
            HistoryError::SchedulerStopped => "scheduler_stopped",
            HistoryError::Cancelled(_) => "cancelled",
            HistoryError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        HistoryError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for HistoryError {
    fn from(err: anyhow::Error) -> Self {
        HistoryError::Internal(err.to_string())
    }
}
