use std::time::Duration;

use metrics::{counter, gauge, histogram, Label};

use crate::scopes::Scope;

pub mod metric_names {
    // 任务
    pub const TASK_REQUESTS: &str = "task_requests";
    pub const TASK_LATENCY: &str = "task_latency";
    pub const TASK_QUEUE_LATENCY: &str = "task_latency_queue";
    pub const TASK_PROCESSING_LATENCY: &str = "task_latency_processing";
    pub const TASK_ATTEMPT: &str = "task_attempt";
    pub const TASK_ERRORS: &str = "task_errors";
    pub const TASK_ERRORS_DISCARDED: &str = "task_errors_discarded";
    pub const TASK_ERRORS_STANDBY_RETRY: &str = "task_errors_standby_retry_counter";
    pub const TASK_ERRORS_NOT_ACTIVE: &str = "task_errors_not_active_counter";
    pub const TASK_BATCH_COMPLETE: &str = "task_batch_complete_counter";
    pub const TASK_BATCH_COMPLETE_FAILURE: &str = "task_batch_complete_error";
    pub const TASK_REDISPATCH_PENDING: &str = "task_redispatch_queue_pending_tasks";
    pub const TASK_DLQ_ENQUEUED: &str = "task_dlq_enqueued";
    pub const TASK_DLQ_ENQUEUE_FAILED: &str = "task_dlq_enqueue_failed";
    pub const DLQ_SIZE: &str = "dlq_size";

    // 调度器
    pub const PRIORITY_TASK_SUBMIT_REQUEST: &str = "prioritytask_submit_request";
    pub const PRIORITY_TASK_SUBMIT_LATENCY: &str = "prioritytask_submit_latency";
    pub const TASK_SCHEDULER_REJECTED: &str = "task_scheduler_rejected";
    pub const TASK_SCHEDULER_PANIC: &str = "task_scheduler_panic";
    pub const TASK_SCHEDULER_STARVATION_PROMOTED: &str = "task_scheduler_starvation_promoted";

    // 处理队列
    pub const PROCESSING_QUEUE_NUM: &str = "processing_queue_num";
    pub const PROCESSING_QUEUE_MAX_LEVEL: &str = "processing_queue_max_level";
    pub const PROCESSING_QUEUE_PENDING_TASK_SPLIT: &str = "processing_queue_pending_task_split_counter";
    pub const PROCESSING_QUEUE_STUCK_TASK_SPLIT: &str = "processing_queue_stuck_task_split_counter";
    pub const PROCESSING_QUEUE_SELECTED_DOMAIN_SPLIT: &str =
        "processing_queue_selected_domain_split_counter";
    pub const PROCESSING_QUEUE_RANDOM_SPLIT: &str = "processing_queue_random_split_counter";
    pub const PROCESSING_QUEUE_MERGE: &str = "processing_queue_merge_counter";
    pub const PROCESSING_QUEUE_THROTTLED: &str = "processing_queue_throttled_counter";
    pub const ACK_LEVEL_UPDATE: &str = "ack_level_update";
    pub const ACK_LEVEL_UPDATE_FAILED: &str = "ack_level_update_failed";

    // 跨集群
    pub const CROSS_CLUSTER_FETCH_LATENCY: &str = "cross_cluster_fetch_latency";
    pub const CROSS_CLUSTER_FETCH_REQUESTS: &str = "cross_cluster_fetch_requests";
    pub const CROSS_CLUSTER_FETCH_ERRORS: &str = "cross_cluster_fetch_errors";
    pub const CROSS_CLUSTER_FETCH_ERRORS_SERVICE_BUSY: &str = "cross_cluster_fetch_errors_service_busy";
    pub const CROSS_CLUSTER_RESPOND_LATENCY: &str = "cross_cluster_respond_latency";
    pub const CROSS_CLUSTER_RESPOND_REQUESTS: &str = "cross_cluster_respond_requests";
    pub const CROSS_CLUSTER_TASK_FETCHED: &str = "cross_cluster_task_fetched";
    pub const CROSS_CLUSTER_TASK_PENDING: &str = "cross_cluster_task_pending";

    // 复制
    pub const REPLICATION_TASKS_APPLIED: &str = "replication_tasks_applied";
    pub const REPLICATION_TASKS_FAILED: &str = "replication_tasks_failed";
    pub const REPLICATION_TASKS_FETCHED: &str = "replication_tasks_fetched";
    pub const REPLICATION_TASKS_RETURNED: &str = "replication_tasks_returned";
    pub const REPLICATION_TASKS_BUFFERED: &str = "replication_tasks_buffered";
    pub const REPLICATION_RESYNC_REQUESTS: &str = "replication_resync_requests";
    pub const REPLICATION_DLQ_FAILED: &str = "replication_dlq_enqueue_failed";

    // 分片
    pub const ACQUIRE_SHARDS_COUNT: &str = "acquire_shards_count";
    pub const ACQUIRE_SHARDS_LATENCY: &str = "acquire_shards_latency";
    pub const SHARD_CLOSED_COUNT: &str = "shard_closed_count";
    pub const SHARD_ITEM_CREATED: &str = "sharditem_created_count";
    pub const SHARD_ITEM_REMOVED: &str = "sharditem_removed_count";
    pub const SHARD_OWNERSHIP_LOST: &str = "shard_ownership_lost";

    // 管理接口
    pub const ADMIN_REQUESTS: &str = "admin_requests";
}

/// 绑定作用域和附加标签的指标客户端
#[derive(Debug, Clone)]
pub struct ScopedMetrics {
    scope: Scope,
    tags: Vec<(&'static str, String)>,
}

impl ScopedMetrics {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            tags: Vec::new(),
        }
    }

    pub fn tagged(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.tags.push((key, value.into()));
        self
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    fn labels(&self) -> Vec<Label> {
        let mut labels = Vec::with_capacity(self.tags.len() + 1);
        labels.push(Label::new("operation", self.scope.operation()));
        labels.extend(
            self.tags
                .iter()
                .map(|(k, v)| Label::new(*k, v.clone())),
        );
        labels
    }

    pub fn inc(&self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &'static str, value: u64) {
        counter!(name, self.labels()).increment(value);
    }

    /// 带一个临时标签的计数, 例如错误类型
    pub fn inc_with(&self, name: &'static str, key: &'static str, value: &str) {
        let mut labels = self.labels();
        labels.push(Label::new(key, value.to_string()));
        counter!(name, labels).increment(1);
    }

    pub fn record_latency(&self, name: &'static str, latency: Duration) {
        histogram!(name, self.labels()).record(latency.as_secs_f64());
    }

    pub fn record_value(&self, name: &'static str, value: f64) {
        histogram!(name, self.labels()).record(value);
    }

    pub fn set_gauge(&self, name: &'static str, value: f64) {
        gauge!(name, self.labels()).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_metrics_without_recorder() {
        // 未安装全局recorder时所有调用都是空操作
        let metrics = ScopedMetrics::new(Scope::TaskScheduler).tagged("cluster", "east");
        metrics.inc(metric_names::TASK_REQUESTS);
        metrics.inc_with(metric_names::TASK_ERRORS, "error", "timeout");
        metrics.record_latency(metric_names::TASK_LATENCY, Duration::from_millis(5));
        metrics.set_gauge(metric_names::PROCESSING_QUEUE_NUM, 2.0);
        assert_eq!(metrics.scope(), Scope::TaskScheduler);
        assert_eq!(metrics.labels().len(), 2);
    }
}
