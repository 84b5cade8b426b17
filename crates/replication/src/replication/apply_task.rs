use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use history_domain::{
    HistoryError, ReplicationApplier, ReplicationTask, ResendRequest, Resyncer, ShardContext,
};
use history_observability::{metric_names, ScopedMetrics};
use history_scheduler::SchedulableTask;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug)]
pub(crate) struct ApplyCompletion {
    pub task: ReplicationTask,
    pub result: Result<(), HistoryError>,
}

/// 在本集群应用一个复制任务; 同一运行的任务按顺序执行
pub(crate) struct ReplicationApplyTask {
    pub task: ReplicationTask,
    pub priority: u8,
    pub attempt: u32,
    pub applier: Arc<dyn ReplicationApplier>,
    pub resyncer: Option<Arc<dyn Resyncer>>,
    pub shard: Arc<dyn ShardContext>,
    pub completions: mpsc::UnboundedSender<ApplyCompletion>,
    pub metrics: ScopedMetrics,
}

impl ReplicationApplyTask {
    fn complete(self: Box<Self>, result: Result<(), HistoryError>) {
        let completion = ApplyCompletion {
            task: self.task,
            result,
        };
        if self.completions.send(completion).is_err() {
            debug!("复制处理循环已退出, 丢弃应用结果");
        }
    }
}

#[async_trait]
impl SchedulableTask for ReplicationApplyTask {
    fn priority(&self) -> u8 {
        self.priority
    }

    fn ordering_key(&self) -> String {
        self.task.run_key()
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn increment_attempt(&mut self) {
        self.attempt += 1;
    }

    fn is_cancelled(&self) -> bool {
        !self.shard.is_valid()
    }

    async fn execute(&self) -> Result<(), HistoryError> {
        let started = Instant::now();
        let mut result = self.applier.apply(&self.task).await;
        // 缺少历史事件: 补发后再应用一次
        if let (
            Err(HistoryError::ResyncRequired {
                domain_id,
                workflow_id,
                run_id,
                start_event_id,
                end_event_id,
            }),
            Some(resyncer),
        ) = (&result, &self.resyncer)
        {
            let request = ResendRequest {
                domain_id: domain_id.clone(),
                workflow_id: workflow_id.clone(),
                run_id: run_id.clone(),
                start_event_id: *start_event_id,
                end_event_id: *end_event_id,
            };
            self.metrics.inc(metric_names::REPLICATION_RESYNC_REQUESTS);
            info!(
                message_id = self.task.message_id,
                workflow = %self.task.run_key(),
                "应用复制任务前请求补发事件 [{}, {})",
                request.start_event_id,
                request.end_event_id
            );
            resyncer.resend(&request).await?;
            result = self.applier.apply(&self.task).await;
        }
        self.metrics
            .record_latency(metric_names::TASK_PROCESSING_LATENCY, started.elapsed());
        result
    }

    fn on_success(self: Box<Self>) {
        self.complete(Ok(()));
    }

    fn on_failure(self: Box<Self>, error: HistoryError) {
        self.complete(Err(error));
    }
}
