use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use history_domain::{DlqEntry, DlqPage, DlqReadRequest, DlqStore, HistoryResult, TaskCategory};
use tokio::sync::RwLock;

/// 内存死信队列, 消息ID全局递增
pub struct InMemoryDlqStore {
    queues: RwLock<HashMap<(i32, TaskCategory), BTreeMap<i64, DlqEntry>>>,
    next_message_id: AtomicI64,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            next_message_id: AtomicI64::new(1),
        }
    }

    pub async fn entries(&self, shard_id: i32, category: TaskCategory) -> Vec<DlqEntry> {
        self.queues
            .read()
            .await
            .get(&(shard_id, category))
            .map(|q| q.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryDlqStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn enqueue_message_to_dlq(&self, entry: &DlqEntry) -> HistoryResult<i64> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = entry.clone();
        stored.message_id = message_id;
        self.queues
            .write()
            .await
            .entry((entry.task.shard_id, entry.task.category))
            .or_default()
            .insert(message_id, stored);
        Ok(message_id)
    }

    async fn read_messages_from_dlq(&self, request: &DlqReadRequest) -> HistoryResult<DlqPage> {
        let queues = self.queues.read().await;
        let Some(queue) = queues.get(&(request.shard_id, request.category)) else {
            return Ok(DlqPage::default());
        };
        let after = request.page_token.unwrap_or(0);
        let mut matching = queue
            .range(after.saturating_add(1)..)
            .map(|(_, entry)| entry)
            .filter(|entry| {
                request
                    .up_to_task_id
                    .map_or(true, |max| entry.task.task_id <= max)
            });
        let entries: Vec<DlqEntry> = matching.by_ref().take(request.page_size).cloned().collect();
        let next_page_token = match matching.next() {
            Some(_) => entries.last().map(|e| e.message_id),
            None => None,
        };
        Ok(DlqPage {
            entries,
            next_page_token,
        })
    }

    async fn range_delete_messages_from_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        inclusive_max_task_id: i64,
    ) -> HistoryResult<u64> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(&(shard_id, category)) else {
            return Ok(0);
        };
        let before = queue.len();
        queue.retain(|_, entry| entry.task.task_id > inclusive_max_task_id);
        Ok((before - queue.len()) as u64)
    }

    async fn delete_messages_from_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        message_ids: &[i64],
    ) -> HistoryResult<u64> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(&(shard_id, category)) else {
            return Ok(0);
        };
        Ok(message_ids
            .iter()
            .filter(|id| queue.remove(id).is_some())
            .count() as u64)
    }

    async fn dlq_size(&self, shard_id: i32, category: TaskCategory) -> HistoryResult<u64> {
        Ok(self
            .queues
            .read()
            .await
            .get(&(shard_id, category))
            .map(|q| q.len() as u64)
            .unwrap_or(0))
    }
}
