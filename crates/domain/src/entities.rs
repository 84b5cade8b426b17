use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::ProcessingQueueState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Transfer,
    Timer,
    CrossCluster,
    Replication,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 4] = [
        TaskCategory::Transfer,
        TaskCategory::Timer,
        TaskCategory::CrossCluster,
        TaskCategory::Replication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Transfer => "transfer",
            TaskCategory::Timer => "timer",
            TaskCategory::CrossCluster => "cross_cluster",
            TaskCategory::Replication => "replication",
        }
    }

    /// 定时类任务按可见时间排序, 其余按任务ID排序
    pub fn is_scheduled(&self) -> bool {
        matches!(self, TaskCategory::Timer)
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRole {
    Active,
    Standby,
}

impl ClusterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterRole::Active => "active",
            ClusterRole::Standby => "standby",
        }
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 队列内的全序键: (可见时间毫秒, 任务ID)
///
/// 非定时类任务的 `visibility_ms` 恒为 0, 因此只按任务ID排序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub visibility_ms: i64,
    pub task_id: i64,
}

impl TaskKey {
    pub const MIN: TaskKey = TaskKey {
        visibility_ms: i64::MIN,
        task_id: i64::MIN,
    };
    pub const MAX: TaskKey = TaskKey {
        visibility_ms: i64::MAX,
        task_id: i64::MAX,
    };

    pub fn new(visibility_ms: i64, task_id: i64) -> Self {
        Self {
            visibility_ms,
            task_id,
        }
    }

    pub fn immediate(task_id: i64) -> Self {
        Self::new(0, task_id)
    }

    /// 给定时间点之前(含)所有到期任务的上界
    pub fn due_before(visibility_ms: i64) -> Self {
        Self::new(visibility_ms, i64::MAX)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.visibility_ms == 0 {
            write!(f, "{}", self.task_id)
        } else {
            write!(f, "({}, {})", self.visibility_ms, self.task_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    // transfer
    TransferActivity,
    TransferDecision,
    CloseExecution,
    CancelExecution,
    SignalExecution,
    StartChildExecution,
    RecordWorkflowStarted,
    ResetWorkflow,
    UpsertWorkflowSearchAttributes,
    RecordWorkflowClosed,
    RecordChildExecutionCompleted,
    ApplyParentClosePolicy,
    // timer
    DecisionTimeout,
    ActivityTimeout,
    UserTimer,
    WorkflowTimeout,
    ActivityRetryTimer,
    WorkflowBackoffTimer,
    DeleteHistoryEvent,
    // cross-cluster
    CrossClusterStartChildExecution,
    CrossClusterCancelExecution,
    CrossClusterSignalExecution,
    CrossClusterRecordChildExecutionCompleted,
    CrossClusterApplyParentClosePolicy,
    // replication
    ReplicationHistory,
    ReplicationSyncActivity,
    ReplicationFailoverMarker,
}

impl TaskType {
    pub fn category(&self) -> TaskCategory {
        use TaskType::*;
        match self {
            TransferActivity
            | TransferDecision
            | CloseExecution
            | CancelExecution
            | SignalExecution
            | StartChildExecution
            | RecordWorkflowStarted
            | ResetWorkflow
            | UpsertWorkflowSearchAttributes
            | RecordWorkflowClosed
            | RecordChildExecutionCompleted
            | ApplyParentClosePolicy => TaskCategory::Transfer,
            DecisionTimeout | ActivityTimeout | UserTimer | WorkflowTimeout
            | ActivityRetryTimer | WorkflowBackoffTimer | DeleteHistoryEvent => {
                TaskCategory::Timer
            }
            CrossClusterStartChildExecution
            | CrossClusterCancelExecution
            | CrossClusterSignalExecution
            | CrossClusterRecordChildExecutionCompleted
            | CrossClusterApplyParentClosePolicy => TaskCategory::CrossCluster,
            ReplicationHistory | ReplicationSyncActivity | ReplicationFailoverMarker => {
                TaskCategory::Replication
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        use TaskType::*;
        match self {
            TransferActivity => "TransferActivityTask",
            TransferDecision => "TransferDecisionTask",
            CloseExecution => "TransferCloseExecution",
            CancelExecution => "TransferCancelExecution",
            SignalExecution => "TransferSignalExecution",
            StartChildExecution => "TransferStartChildExecution",
            RecordWorkflowStarted => "TransferRecordWorkflowStarted",
            ResetWorkflow => "TransferResetWorkflow",
            UpsertWorkflowSearchAttributes => "TransferUpsertWorkflowSearchAttributes",
            RecordWorkflowClosed => "TransferRecordWorkflowClosed",
            RecordChildExecutionCompleted => "TransferRecordChildExecutionCompleted",
            ApplyParentClosePolicy => "TransferApplyParentClosePolicy",
            DecisionTimeout => "TimerDecisionTimeout",
            ActivityTimeout => "TimerActivityTimeout",
            UserTimer => "TimerUserTimer",
            WorkflowTimeout => "TimerWorkflowTimeout",
            ActivityRetryTimer => "TimerActivityRetryTimer",
            WorkflowBackoffTimer => "TimerWorkflowBackoffTimer",
            DeleteHistoryEvent => "TimerDeleteHistoryEvent",
            CrossClusterStartChildExecution => "CrossClusterStartChildExecution",
            CrossClusterCancelExecution => "CrossClusterCancelExecution",
            CrossClusterSignalExecution => "CrossClusterSignalExecution",
            CrossClusterRecordChildExecutionCompleted => "CrossClusterRecordChildCompleted",
            CrossClusterApplyParentClosePolicy => "CrossClusterApplyParentClosePolicy",
            ReplicationHistory => "ReplicationHistory",
            ReplicationSyncActivity => "ReplicationSyncActivity",
            ReplicationFailoverMarker => "ReplicationFailoverMarker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub shard_id: i32,
    pub category: TaskCategory,
    pub task_type: TaskType,
    pub task_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub visibility_timestamp: DateTime<Utc>,
    /// 故障转移版本
    pub version: i64,
    pub attempt: u32,
    /// 仅跨集群任务使用
    pub target_cluster: Option<String>,
    pub payload: serde_json::Value,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        if self.category.is_scheduled() {
            TaskKey::new(self.visibility_timestamp.timestamp_millis(), self.task_id)
        } else {
            TaskKey::immediate(self.task_id)
        }
    }

    pub fn workflow_key(&self) -> String {
        format!("{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: i32,
    pub owner: String,
    /// 围栏令牌, 每次获取分片时递增
    pub range_id: i64,
    /// 每个类别的整体确认位置(所有角色中的最小值)
    pub ack_levels: HashMap<TaskCategory, TaskKey>,
    /// 键为 "category:role"
    pub queue_states: BTreeMap<String, Vec<ProcessingQueueState>>,
    /// 每个远端集群已处理的复制消息ID
    pub replication_ack_levels: BTreeMap<String, i64>,
    pub updated_at: DateTime<Utc>,
}

impl ShardInfo {
    pub fn new(shard_id: i32, owner: impl Into<String>) -> Self {
        Self {
            shard_id,
            owner: owner.into(),
            range_id: 0,
            ack_levels: HashMap::new(),
            queue_states: BTreeMap::new(),
            replication_ack_levels: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn queue_state_key(category: TaskCategory, role: ClusterRole) -> String {
        format!("{}:{}", category.as_str(), role.as_str())
    }

    pub fn ack_level(&self, category: TaskCategory) -> TaskKey {
        self.ack_levels
            .get(&category)
            .copied()
            .unwrap_or(TaskKey::MIN)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// 由存储分配, 入队前为 0
    pub message_id: i64,
    pub task: Task,
    pub failure_reason: String,
    pub first_failed_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(task: Task, failure_reason: impl Into<String>) -> Self {
        Self {
            message_id: 0,
            task,
            failure_reason: failure_reason.into(),
            first_failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn timer_task(task_id: i64, visibility_ms: i64) -> Task {
        Task {
            shard_id: 1,
            category: TaskCategory::Timer,
            task_type: TaskType::UserTimer,
            task_id,
            domain_id: "d".into(),
            workflow_id: "wf".into(),
            run_id: "run".into(),
            visibility_timestamp: Utc.timestamp_millis_opt(visibility_ms).unwrap(),
            version: 0,
            attempt: 0,
            target_cluster: None,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_timer_keys_order_by_visibility_first() {
        let early = timer_task(200, 1_000);
        let late = timer_task(100, 2_000);
        assert!(early.key() < late.key());
        assert!(late.key() < TaskKey::due_before(2_000));
        assert!(TaskKey::due_before(1_999) < late.key());
    }

    #[test]
    fn test_transfer_keys_order_by_task_id() {
        let mut task = timer_task(7, 5_000);
        task.category = TaskCategory::Transfer;
        task.task_type = TaskType::TransferActivity;
        assert_eq!(task.key(), TaskKey::immediate(7));
        assert!(TaskKey::MIN < task.key());
        assert!(task.key() < TaskKey::MAX);
    }

    #[test]
    fn test_task_type_category() {
        assert_eq!(TaskType::UserTimer.category(), TaskCategory::Timer);
        assert_eq!(
            TaskType::CrossClusterSignalExecution.category(),
            TaskCategory::CrossCluster
        );
        assert_eq!(
            TaskType::ReplicationHistory.category(),
            TaskCategory::Replication
        );
    }

    #[test]
    fn test_shard_info_round_trips_through_json() {
        let mut info = ShardInfo::new(3, "host-a");
        info.ack_levels
            .insert(TaskCategory::Transfer, TaskKey::immediate(10));
        let json = serde_json::to_string(&info).unwrap();
        let decoded: ShardInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.ack_level(TaskCategory::Transfer), TaskKey::immediate(10));
        assert_eq!(decoded.ack_level(TaskCategory::Timer), TaskKey::MIN);
    }
}
