//! 指标作用域
//!
//! 每个处理组件对应一个作用域, 作用域名作为 `operation` 标签附加到所有指标上。
//! (类别, 角色) 到作用域的映射是启动时构建一次的只读表。

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use history_domain::{ClusterRole, TaskCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    TransferActiveQueueProcessor,
    TransferStandbyQueueProcessor,
    TimerActiveQueueProcessor,
    TimerStandbyQueueProcessor,
    CrossClusterQueueProcessor,
    ReplicatorQueueProcessor,
    ReplicationTaskProcessor,
    CrossClusterTaskFetcher,
    CrossClusterSourceTask,
    CrossClusterTargetTask,
    TaskScheduler,
    TaskPriorityAssigner,
    ShardController,
    ShardInfo,
    HistoryDlq,
    AdminHandler,
}

impl Scope {
    pub fn operation(&self) -> &'static str {
        match self {
            Scope::TransferActiveQueueProcessor => "TransferActiveQueueProcessor",
            Scope::TransferStandbyQueueProcessor => "TransferStandbyQueueProcessor",
            Scope::TimerActiveQueueProcessor => "TimerActiveQueueProcessor",
            Scope::TimerStandbyQueueProcessor => "TimerStandbyQueueProcessor",
            Scope::CrossClusterQueueProcessor => "CrossClusterQueueProcessor",
            Scope::ReplicatorQueueProcessor => "ReplicatorQueueProcessor",
            Scope::ReplicationTaskProcessor => "ReplicationTaskProcessor",
            Scope::CrossClusterTaskFetcher => "CrossClusterTaskFetcher",
            Scope::CrossClusterSourceTask => "CrossClusterSourceTask",
            Scope::CrossClusterTargetTask => "CrossClusterTargetTask",
            Scope::TaskScheduler => "TaskScheduler",
            Scope::TaskPriorityAssigner => "TaskPriorityAssigner",
            Scope::ShardController => "ShardController",
            Scope::ShardInfo => "ShardInfo",
            Scope::HistoryDlq => "HistoryDLQ",
            Scope::AdminHandler => "AdminHandler",
        }
    }

    /// 队列处理器的作用域, 不存在的组合返回 None
    pub fn for_queue(category: TaskCategory, role: ClusterRole) -> Option<Scope> {
        QUEUE_SCOPES.get(&(category, role)).copied()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation())
    }
}

static QUEUE_SCOPES: LazyLock<HashMap<(TaskCategory, ClusterRole), Scope>> = LazyLock::new(|| {
    HashMap::from([
        (
            (TaskCategory::Transfer, ClusterRole::Active),
            Scope::TransferActiveQueueProcessor,
        ),
        (
            (TaskCategory::Transfer, ClusterRole::Standby),
            Scope::TransferStandbyQueueProcessor,
        ),
        (
            (TaskCategory::Timer, ClusterRole::Active),
            Scope::TimerActiveQueueProcessor,
        ),
        (
            (TaskCategory::Timer, ClusterRole::Standby),
            Scope::TimerStandbyQueueProcessor,
        ),
        (
            (TaskCategory::CrossCluster, ClusterRole::Active),
            Scope::CrossClusterQueueProcessor,
        ),
        (
            (TaskCategory::Replication, ClusterRole::Active),
            Scope::ReplicatorQueueProcessor,
        ),
        (
            (TaskCategory::Replication, ClusterRole::Standby),
            Scope::ReplicationTaskProcessor,
        ),
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_scope_lookup() {
        assert_eq!(
            Scope::for_queue(TaskCategory::Timer, ClusterRole::Standby),
            Some(Scope::TimerStandbyQueueProcessor)
        );
        assert_eq!(
            Scope::for_queue(TaskCategory::CrossCluster, ClusterRole::Active)
                .map(|s| s.operation()),
            Some("CrossClusterQueueProcessor")
        );
        assert_eq!(
            Scope::for_queue(TaskCategory::CrossCluster, ClusterRole::Standby),
            None
        );
    }
}
