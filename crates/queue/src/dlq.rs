//! 死信队列管理: 入队、分页读取、清除与运维触发的合并回放

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use history_core::{retry_with_policy, RetryPolicy};
use history_domain::{
    DlqEntry, DlqPage, DlqReadRequest, DlqStore, HistoryResult, Task, TaskCategory,
};
use history_observability::{metric_names, Scope, ScopedMetrics};
use tracing::{info, warn};

/// 合并时接收回放任务的一方(队列处理器或复制应用器)
#[async_trait]
pub trait DlqReplayTarget: Send + Sync {
    /// 全部任务处理结束后才返回; 成功或已重新写入死信队列都算处理结束。
    /// 返回 Err 时这一批死信保留。
    async fn replay(&self, tasks: Vec<Task>) -> HistoryResult<usize>;
}

pub struct DlqManager {
    store: Arc<dyn DlqStore>,
    retry: RetryPolicy,
    page_size: usize,
    metrics: ScopedMetrics,
}

impl DlqManager {
    pub fn new(store: Arc<dyn DlqStore>, retry: RetryPolicy, page_size: usize) -> Self {
        Self {
            store,
            retry,
            page_size: page_size.max(1),
            metrics: ScopedMetrics::new(Scope::HistoryDlq),
        }
    }

    /// 至少一次写入, 按持久化重试策略重试
    pub async fn enqueue(&self, task: &Task, reason: &str) -> HistoryResult<i64> {
        let entry = DlqEntry::new(task.clone(), reason);
        let result = retry_with_policy(&self.retry, "enqueue_message_to_dlq", || {
            let store = Arc::clone(&self.store);
            let entry = entry.clone();
            async move { store.enqueue_message_to_dlq(&entry).await }
        })
        .await;

        let tagged = self.metrics.clone().tagged("category", task.category.as_str());
        match &result {
            Ok(message_id) => {
                tagged.inc(metric_names::TASK_DLQ_ENQUEUED);
                warn!(
                    shard_id = task.shard_id,
                    category = %task.category,
                    task_id = task.task_id,
                    message_id = *message_id,
                    "任务已写入死信队列: {}",
                    reason
                );
            }
            Err(e) => {
                tagged.inc(metric_names::TASK_DLQ_ENQUEUE_FAILED);
                warn!(
                    shard_id = task.shard_id,
                    task_id = task.task_id,
                    "写入死信队列失败: {}",
                    e
                );
            }
        }
        result
    }

    /// 读取一页, 更早消息中已出现过的任务ID不再返回
    pub async fn read(
        &self,
        shard_id: i32,
        category: TaskCategory,
        page_token: Option<i64>,
        page_size: Option<usize>,
    ) -> HistoryResult<DlqPage> {
        let request = DlqReadRequest {
            shard_id,
            category,
            page_token,
            page_size: page_size.unwrap_or(self.page_size).max(1),
            up_to_task_id: None,
        };
        let mut page = self.store.read_messages_from_dlq(&request).await?;
        let mut seen = match page_token {
            Some(last_message_id) => {
                self.earlier_task_ids(shard_id, category, last_message_id, &page)
                    .await?
            }
            None => HashSet::new(),
        };
        page.entries.retain(|entry| seen.insert(entry.task.task_id));
        Ok(page)
    }

    /// 本页任务中在消息ID <= `last_message_id` 处已出现过的
    async fn earlier_task_ids(
        &self,
        shard_id: i32,
        category: TaskCategory,
        last_message_id: i64,
        page: &DlqPage,
    ) -> HistoryResult<HashSet<i64>> {
        let mut candidates: HashSet<i64> = page.entries.iter().map(|e| e.task.task_id).collect();
        let mut found = HashSet::new();
        let mut page_token = None;
        while !candidates.is_empty() {
            let request = DlqReadRequest {
                shard_id,
                category,
                page_token,
                page_size: self.page_size,
                up_to_task_id: None,
            };
            let earlier = self.store.read_messages_from_dlq(&request).await?;
            for entry in earlier
                .entries
                .iter()
                .take_while(|entry| entry.message_id <= last_message_id)
            {
                if candidates.remove(&entry.task.task_id) {
                    found.insert(entry.task.task_id);
                }
            }
            match earlier.next_page_token {
                Some(token) if token < last_message_id => page_token = Some(token),
                _ => break,
            }
        }
        Ok(found)
    }

    pub async fn purge(
        &self,
        shard_id: i32,
        category: TaskCategory,
        up_to_task_id: i64,
    ) -> HistoryResult<u64> {
        let deleted = self
            .store
            .range_delete_messages_from_dlq(shard_id, category, up_to_task_id)
            .await?;
        info!(
            shard_id = shard_id,
            category = %category,
            up_to_task_id = up_to_task_id,
            "清除死信消息 {} 条",
            deleted
        );
        self.report_size(shard_id, category).await;
        Ok(deleted)
    }

    /// 回放死信中任务ID不超过 `up_to_task_id` 的任务, 每批回放结束后按消息ID删除该批
    ///
    /// 回放前先取快照: 回放中再次失败的任务会以更大的消息ID重新写入, 不会被本次合并删除。
    pub async fn merge(
        &self,
        shard_id: i32,
        category: TaskCategory,
        up_to_task_id: Option<i64>,
        target: &dyn DlqReplayTarget,
    ) -> HistoryResult<usize> {
        let entries = self.snapshot(shard_id, category, up_to_task_id).await?;
        let mut seen = HashSet::new();
        let mut replayed = 0;
        let mut deleted = 0;

        for batch in entries.chunks(self.page_size) {
            let tasks: Vec<Task> = batch
                .iter()
                .filter(|entry| seen.insert(entry.task.task_id))
                .map(|entry| entry.task.clone())
                .collect();
            if !tasks.is_empty() {
                replayed += target.replay(tasks).await?;
            }
            let message_ids: Vec<i64> = batch.iter().map(|entry| entry.message_id).collect();
            deleted += self
                .store
                .delete_messages_from_dlq(shard_id, category, &message_ids)
                .await?;
        }

        info!(
            shard_id = shard_id,
            category = %category,
            deleted = deleted,
            "死信队列合并完成, 回放 {} 个任务",
            replayed
        );
        self.report_size(shard_id, category).await;
        Ok(replayed)
    }

    async fn snapshot(
        &self,
        shard_id: i32,
        category: TaskCategory,
        up_to_task_id: Option<i64>,
    ) -> HistoryResult<Vec<DlqEntry>> {
        let mut entries = Vec::new();
        let mut page_token = None;
        loop {
            let request = DlqReadRequest {
                shard_id,
                category,
                page_token,
                page_size: self.page_size,
                up_to_task_id,
            };
            let page = self.store.read_messages_from_dlq(&request).await?;
            entries.extend(page.entries);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(entries),
            }
        }
    }

    pub async fn size(&self, shard_id: i32, category: TaskCategory) -> HistoryResult<u64> {
        self.store.dlq_size(shard_id, category).await
    }

    async fn report_size(&self, shard_id: i32, category: TaskCategory) {
        if let Ok(size) = self.store.dlq_size(shard_id, category).await {
            self.metrics
                .clone()
                .tagged("category", category.as_str())
                .set_gauge(metric_names::DLQ_SIZE, size as f64);
        }
    }
}
