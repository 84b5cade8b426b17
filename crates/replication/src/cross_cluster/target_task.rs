use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use history_domain::{
    ClusterRole, CrossClusterTaskOutcome, HistoryError, ShardContext, Task, TaskExecutor, TaskType,
};
use history_observability::{metric_names, ScopedMetrics};
use history_scheduler::SchedulableTask;
use tokio::sync::mpsc;
use tracing::debug;

/// 目标侧执行完一个跨集群任务后回传给拉取循环
#[derive(Debug)]
pub(crate) struct TargetCompletion {
    pub shard_id: i32,
    pub range_id: i64,
    pub task_id: i64,
    pub task_type: TaskType,
    /// None 表示分片已不属于本机, 不回报
    pub outcome: Option<CrossClusterTaskOutcome>,
}

/// 从源集群拉取的任务, 在本集群执行
pub(crate) struct CrossClusterTargetTask {
    pub task: Task,
    pub priority: u8,
    pub attempt: u32,
    pub shard: Arc<dyn ShardContext>,
    pub range_id: i64,
    pub executor: Arc<dyn TaskExecutor>,
    pub completions: mpsc::UnboundedSender<TargetCompletion>,
    pub metrics: ScopedMetrics,
    pub created_at: Instant,
}

impl CrossClusterTargetTask {
    fn complete(self: Box<Self>, outcome: Option<CrossClusterTaskOutcome>) {
        let completion = TargetCompletion {
            shard_id: self.task.shard_id,
            range_id: self.range_id,
            task_id: self.task.task_id,
            task_type: self.task.task_type,
            outcome,
        };
        if self.completions.send(completion).is_err() {
            debug!(task_id = self.task.task_id, "拉取循环已退出, 丢弃跨集群任务结果");
        }
    }
}

#[async_trait]
impl SchedulableTask for CrossClusterTargetTask {
    fn priority(&self) -> u8 {
        self.priority
    }

    fn ordering_key(&self) -> String {
        self.task.workflow_key()
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn increment_attempt(&mut self) {
        self.attempt += 1;
    }

    fn is_cancelled(&self) -> bool {
        !self.shard.is_valid() || self.shard.range_id() != self.range_id
    }

    async fn execute(&self) -> Result<(), HistoryError> {
        let tagged = self.metrics.clone().tagged("task_type", self.task.task_type.as_str());
        tagged.inc(metric_names::TASK_REQUESTS);
        let ctx = self.shard.execution_context(ClusterRole::Active, self.attempt);
        let started = Instant::now();
        let result = self.executor.execute(&self.task, &ctx).await;
        tagged.record_latency(metric_names::TASK_PROCESSING_LATENCY, started.elapsed());
        if let Err(e) = &result {
            tagged.inc_with(metric_names::TASK_ERRORS, "error", e.metric_tag());
        }
        result
    }

    fn on_success(self: Box<Self>) {
        self.metrics
            .record_latency(metric_names::TASK_LATENCY, self.created_at.elapsed());
        self.complete(Some(CrossClusterTaskOutcome::Applied));
    }

    fn on_failure(self: Box<Self>, error: HistoryError) {
        let outcome = if error.is_ownership_error()
            || matches!(error, HistoryError::Cancelled(_))
            || !self.shard.is_valid()
        {
            None
        } else if error.is_obsolete() {
            Some(CrossClusterTaskOutcome::NotApplicable)
        } else {
            Some(CrossClusterTaskOutcome::Failed {
                reason: error.to_string(),
            })
        };
        self.complete(outcome);
    }
}
