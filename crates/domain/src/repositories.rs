//! 持久化抽象
//!
//! 存储后端不在本仓库范围内, 这里只定义处理核心依赖的接口。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entities::{DlqEntry, ShardInfo, Task, TaskCategory, TaskKey};
use crate::value_objects::DomainFilter;
use history_errors::HistoryResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTasksRequest {
    pub shard_id: i32,
    pub category: TaskCategory,
    /// 不含
    pub min_key: TaskKey,
    /// 包含
    pub max_key: TaskKey,
    pub domain_filter: DomainFilter,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetTasksResponse {
    /// 按 TaskKey 升序
    pub tasks: Vec<Task>,
    /// 区间内还有未返回的任务
    pub more: bool,
}

/// 任务存储
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_tasks(&self, request: &GetTasksRequest) -> HistoryResult<GetTasksResponse>;
    /// 删除单个任务; `range_id` 与分片记录不一致时返回 `StaleRangeId`, 不做删除
    async fn complete_task(
        &self,
        shard_id: i32,
        range_id: i64,
        category: TaskCategory,
        key: TaskKey,
    ) -> HistoryResult<()>;
    /// 删除 key <= `inclusive_max` 的全部任务, 返回删除数量; 围栏校验同 `complete_task`
    async fn range_complete_tasks(
        &self,
        shard_id: i32,
        range_id: i64,
        category: TaskCategory,
        inclusive_max: TaskKey,
    ) -> HistoryResult<u64>;
    /// 写入新任务, 携带围栏令牌
    async fn put_tasks(&self, shard_id: i32, range_id: i64, tasks: &[Task]) -> HistoryResult<()>;
}

/// 分片元数据存储
#[async_trait]
pub trait ShardStore: Send + Sync {
    async fn get_or_create_shard(&self, shard_id: i32, owner: &str) -> HistoryResult<ShardInfo>;
    /// 条件更新: 存储中的 range_id 必须等于 `expected_range_id`, 否则返回 `StaleRangeId`
    async fn update_shard(&self, shard: &ShardInfo, expected_range_id: i64) -> HistoryResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqReadRequest {
    pub shard_id: i32,
    pub category: TaskCategory,
    /// 上一页最后一条消息ID
    pub page_token: Option<i64>,
    pub page_size: usize,
    /// 只读取任务ID <= 该值的消息
    pub up_to_task_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlqPage {
    pub entries: Vec<DlqEntry>,
    pub next_page_token: Option<i64>,
}

/// 死信队列存储
#[async_trait]
pub trait DlqStore: Send + Sync {
    /// 返回分配的消息ID
    async fn enqueue_message_to_dlq(&self, entry: &DlqEntry) -> HistoryResult<i64>;
    async fn read_messages_from_dlq(&self, request: &DlqReadRequest) -> HistoryResult<DlqPage>;
    /// 删除任务ID <= `inclusive_max_task_id` 的消息
    async fn range_delete_messages_from_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        inclusive_max_task_id: i64,
    ) -> HistoryResult<u64>;
    /// 按消息ID删除, 不存在的ID忽略
    async fn delete_messages_from_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        message_ids: &[i64],
    ) -> HistoryResult<u64>;
    async fn dlq_size(&self, shard_id: i32, category: TaskCategory) -> HistoryResult<u64>;
}
