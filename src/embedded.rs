//! 嵌入式运行时的工作流侧协作方
//!
//! 工作流语义由外部系统提供; 嵌入式进程只记录并确认任务。

use async_trait::async_trait;
use history_domain::{
    ExecutionContext, HistoryResult, ReplicationApplier, ReplicationTask, ResendRequest,
    Resyncer, Task, TaskExecutor,
};
use tracing::{debug, info};

/// 确认所有任务的执行器
#[derive(Debug, Default)]
pub struct AcknowledgingTaskExecutor;

#[async_trait]
impl TaskExecutor for AcknowledgingTaskExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> HistoryResult<()> {
        debug!(
            shard_id = ctx.shard_id,
            range_id = ctx.range_id,
            role = %ctx.role,
            task_id = task.task_id,
            task_type = task.task_type.as_str(),
            workflow_id = %task.workflow_id,
            "确认任务"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct AcknowledgingReplicationApplier;

#[async_trait]
impl ReplicationApplier for AcknowledgingReplicationApplier {
    async fn apply(&self, task: &ReplicationTask) -> HistoryResult<()> {
        debug!(
            source_cluster = %task.source_cluster,
            message_id = task.message_id,
            workflow_id = %task.task.workflow_id,
            first_event_id = task.first_event_id,
            next_event_id = task.next_event_id,
            "应用复制任务"
        );
        Ok(())
    }
}

/// 只记录重新同步请求
#[derive(Debug, Default)]
pub struct LoggingResyncer;

#[async_trait]
impl Resyncer for LoggingResyncer {
    async fn resend(&self, request: &ResendRequest) -> HistoryResult<()> {
        info!(
            domain_id = %request.domain_id,
            workflow_id = %request.workflow_id,
            run_id = %request.run_id,
            start_event_id = request.start_event_id,
            end_event_id = request.end_event_id,
            "请求重新同步事件"
        );
        Ok(())
    }
}
