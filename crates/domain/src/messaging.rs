//! 跨集群拉取协议与复制协议的消息定义

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entities::{Task, TaskCategory, TaskType};
use history_errors::{HistoryError, HistoryResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CrossClusterTaskOutcome {
    Applied,
    Failed { reason: String },
    /// 目标侧判定任务已无意义(例如子工作流已存在)
    NotApplicable,
}

impl CrossClusterTaskOutcome {
    /// 源集群只在正向响应时确认任务
    pub fn is_positive(&self) -> bool {
        matches!(
            self,
            CrossClusterTaskOutcome::Applied | CrossClusterTaskOutcome::NotApplicable
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossClusterTaskResponse {
    pub shard_id: i32,
    pub task_id: i64,
    pub task_type: TaskType,
    pub outcome: CrossClusterTaskOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCrossClusterTasksRequest {
    /// 请求方(目标)集群
    pub target_cluster: String,
    /// 分片 -> 目标侧已收到的最大任务ID, 源侧不再重复投递不超过该值的已投递任务
    pub shard_watermarks: BTreeMap<i32, i64>,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetCrossClusterTasksResponse {
    pub tasks_by_shard: BTreeMap<i32, Vec<Task>>,
    /// 源侧无法服务的分片及原因
    pub failed_shards: BTreeMap<i32, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondCrossClusterTasksCompletedRequest {
    pub shard_id: i32,
    pub target_cluster: String,
    pub responses: Vec<CrossClusterTaskResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RespondCrossClusterTasksCompletedResponse {
    pub acknowledged: usize,
    pub ignored: usize,
}

/// 复制任务: 携带事件区间 [first_event_id, next_event_id) 的引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub message_id: i64,
    pub source_cluster: String,
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub task: Task,
}

impl ReplicationTask {
    pub fn run_key(&self) -> String {
        self.task.workflow_key()
    }

    /// 转换为普通任务, 事件区间写入payload, 用于写入死信队列
    pub fn into_task(self) -> Task {
        let mut task = self.task;
        task.payload = serde_json::json!({
            "message_id": self.message_id,
            "source_cluster": self.source_cluster,
            "first_event_id": self.first_event_id,
            "next_event_id": self.next_event_id,
            "data": task.payload,
        });
        task
    }

    pub fn from_task(task: &Task) -> HistoryResult<Self> {
        if task.category != TaskCategory::Replication {
            return Err(HistoryError::invalid_argument(format!(
                "任务 {} 不是复制任务: {}",
                task.task_id, task.category
            )));
        }
        let payload = &task.payload;
        let field = |name: &str| {
            payload.get(name).and_then(|v| v.as_i64()).ok_or_else(|| {
                HistoryError::Serialization(format!("复制任务缺少字段 {name}"))
            })
        };
        let message_id = field("message_id")?;
        let first_event_id = field("first_event_id")?;
        let next_event_id = field("next_event_id")?;
        let source_cluster = payload
            .get("source_cluster")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HistoryError::Serialization("复制任务缺少字段 source_cluster".into()))?
            .to_string();
        let mut inner = task.clone();
        inner.payload = payload.get("data").cloned().unwrap_or(serde_json::Value::Null);
        Ok(Self {
            message_id,
            source_cluster,
            first_event_id,
            next_event_id,
            task: inner,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetReplicationMessagesRequest {
    pub shard_id: i32,
    /// 请求方集群
    pub cluster_name: String,
    pub last_retrieved_message_id: i64,
    pub last_processed_message_id: i64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMessages {
    pub tasks: Vec<ReplicationTask>,
    pub last_retrieved_message_id: i64,
    pub has_more: bool,
}

/// 带外重新同步请求: 从源集群补发缺失的事件区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub start_event_id: i64,
    pub end_event_id: i64,
}
