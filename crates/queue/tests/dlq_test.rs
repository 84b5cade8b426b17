use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use history_core::RetryPolicy;
use history_domain::{HistoryError, HistoryResult, Task, TaskCategory};
use history_infrastructure::InMemoryDlqStore;
use history_queue::{DlqManager, DlqReplayTarget};
use history_testing_utils::TaskBuilder;

fn manager(page_size: usize) -> (Arc<InMemoryDlqStore>, DlqManager) {
    let store = Arc::new(InMemoryDlqStore::new());
    let manager = DlqManager::new(store.clone(), RetryPolicy::no_retry(), page_size);
    (store, manager)
}

async fn read_all(manager: &DlqManager, page_size: usize) -> Vec<i64> {
    let mut task_ids = Vec::new();
    let mut page_token = None;
    loop {
        let page = manager
            .read(1, TaskCategory::Transfer, page_token, Some(page_size))
            .await
            .unwrap();
        task_ids.extend(page.entries.iter().map(|e| e.task.task_id));
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => return task_ids,
        }
    }
}

/// 记录回放的任务ID, 批次中含指定任务时失败
struct RecordingTarget {
    replayed: Mutex<Vec<i64>>,
    fail_on_task: Option<i64>,
}

#[async_trait]
impl DlqReplayTarget for RecordingTarget {
    async fn replay(&self, tasks: Vec<Task>) -> HistoryResult<usize> {
        if tasks.iter().any(|t| Some(t.task_id) == self.fail_on_task) {
            return Err(HistoryError::task_execution("回放失败"));
        }
        self.replayed
            .lock()
            .unwrap()
            .extend(tasks.iter().map(|t| t.task_id));
        Ok(tasks.len())
    }
}

#[tokio::test]
async fn test_read_dedups_across_pages() {
    let (_, manager) = manager(1);
    for task_id in [9, 9, 10, 9] {
        manager
            .enqueue(&TaskBuilder::transfer(task_id).build(), "失败")
            .await
            .unwrap();
    }

    assert_eq!(read_all(&manager, 1).await, vec![9, 10]);
    assert_eq!(read_all(&manager, 2).await, vec![9, 10]);
    assert_eq!(read_all(&manager, 10).await, vec![9, 10]);
}

#[tokio::test]
async fn test_merge_deletes_only_replayed_messages() {
    let (store, manager) = manager(2);
    for task_id in [1, 2, 3] {
        manager
            .enqueue(&TaskBuilder::transfer(task_id).build(), "失败")
            .await
            .unwrap();
    }

    let target = RecordingTarget {
        replayed: Mutex::new(Vec::new()),
        fail_on_task: Some(3),
    };
    let result = manager
        .merge(1, TaskCategory::Transfer, None, &target)
        .await;
    assert!(result.is_err());

    // 第一批已回放并删除, 失败的一批保留
    assert_eq!(*target.replayed.lock().unwrap(), vec![1, 2]);
    let remaining: Vec<i64> = store
        .entries(1, TaskCategory::Transfer)
        .await
        .iter()
        .map(|e| e.task.task_id)
        .collect();
    assert_eq!(remaining, vec![3]);
}

#[tokio::test]
async fn test_merge_respects_task_id_bound() {
    let (store, manager) = manager(10);
    for task_id in [1, 5, 8] {
        manager
            .enqueue(&TaskBuilder::transfer(task_id).build(), "失败")
            .await
            .unwrap();
    }
    let target = RecordingTarget {
        replayed: Mutex::new(Vec::new()),
        fail_on_task: None,
    };

    let replayed = manager
        .merge(1, TaskCategory::Transfer, Some(5), &target)
        .await
        .unwrap();
    assert_eq!(replayed, 2);
    assert_eq!(*target.replayed.lock().unwrap(), vec![1, 5]);
    assert_eq!(store.entries(1, TaskCategory::Transfer).await.len(), 1);
}
