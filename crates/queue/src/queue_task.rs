use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use history_config::{OrderingKeyMode, StandbyVerificationPolicy};
use history_domain::{
    ClusterRole, DomainRegistry, HistoryError, ResendRequest, Resyncer, ShardContext, Task,
    TaskExecutor, TaskKey,
};
use history_observability::{metric_names, ScopedMetrics};
use history_scheduler::SchedulableTask;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::priority::PriorityAssigner;

/// 执行结束后回传给处理循环的结果
#[derive(Debug)]
pub struct TaskCompletion {
    pub task: Task,
    pub key: TaskKey,
    pub attempt: Arc<AtomicU32>,
    pub replay: bool,
    /// 死信合并等待的回放确认, true 表示任务已处理结束
    pub replay_ack: Option<oneshot::Sender<bool>>,
    pub result: Result<(), HistoryError>,
}

/// 备用侧长期无法校验通过时的处理
#[derive(Clone)]
pub struct StandbyEscalation {
    pub policy: StandbyVerificationPolicy,
    pub after_attempts: u32,
    pub resyncer: Option<Arc<dyn Resyncer>>,
}

impl StandbyEscalation {
    fn should_escalate(&self, attempt: u32) -> bool {
        self.after_attempts > 0 && (attempt + 1) % self.after_attempts == 0
    }

    async fn escalate(&self, task: &Task, error: &HistoryError, metrics: &ScopedMetrics) {
        match (self.policy, &self.resyncer, error) {
            (
                StandbyVerificationPolicy::Resync,
                Some(resyncer),
                HistoryError::ResyncRequired {
                    domain_id,
                    workflow_id,
                    run_id,
                    start_event_id,
                    end_event_id,
                },
            ) => {
                let request = ResendRequest {
                    domain_id: domain_id.clone(),
                    workflow_id: workflow_id.clone(),
                    run_id: run_id.clone(),
                    start_event_id: *start_event_id,
                    end_event_id: *end_event_id,
                };
                metrics.inc(metric_names::REPLICATION_RESYNC_REQUESTS);
                match resyncer.resend(&request).await {
                    Ok(()) => debug!(task_id = task.task_id, "已请求重新同步 {}", task.workflow_key()),
                    Err(e) => warn!(task_id = task.task_id, "重新同步请求失败: {}", e),
                }
            }
            _ => {
                warn!(
                    shard_id = task.shard_id,
                    task_id = task.task_id,
                    workflow = %task.workflow_key(),
                    "备用任务长时间无法校验通过: {}",
                    error
                );
            }
        }
    }
}

/// 处理队列中读出的任务, 交给调度器执行
pub struct QueueTask {
    task: Task,
    key: TaskKey,
    role: ClusterRole,
    ordering_key: String,
    replay: bool,
    replay_ack: Option<oneshot::Sender<bool>>,
    attempt: Arc<AtomicU32>,
    created_at: Instant,
    priority: Arc<PriorityAssigner>,
    shard: Arc<dyn ShardContext>,
    executor: Arc<dyn TaskExecutor>,
    domains: Arc<dyn DomainRegistry>,
    standby: StandbyEscalation,
    token: CancellationToken,
    completions: mpsc::UnboundedSender<TaskCompletion>,
    metrics: ScopedMetrics,
}

/// 构造 `QueueTask` 所需的共享部分, 由处理器持有
#[derive(Clone)]
pub struct QueueTaskFactory {
    pub role: ClusterRole,
    pub ordering: OrderingKeyMode,
    pub priority: Arc<PriorityAssigner>,
    pub shard: Arc<dyn ShardContext>,
    pub executor: Arc<dyn TaskExecutor>,
    pub domains: Arc<dyn DomainRegistry>,
    pub standby: StandbyEscalation,
    pub token: CancellationToken,
    pub completions: mpsc::UnboundedSender<TaskCompletion>,
    pub metrics: ScopedMetrics,
}

impl QueueTaskFactory {
    pub fn create(&self, task: Task, attempt: Arc<AtomicU32>, replay: bool) -> QueueTask {
        let ordering_key = match self.ordering {
            OrderingKeyMode::PerWorkflow => task.workflow_key(),
            OrderingKeyMode::PerDomain => task.domain_id.clone(),
        };
        QueueTask {
            key: task.key(),
            task,
            role: self.role,
            ordering_key,
            replay,
            replay_ack: None,
            attempt,
            created_at: Instant::now(),
            priority: Arc::clone(&self.priority),
            shard: Arc::clone(&self.shard),
            executor: Arc::clone(&self.executor),
            domains: Arc::clone(&self.domains),
            standby: self.standby.clone(),
            token: self.token.clone(),
            completions: self.completions.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl QueueTask {
    /// 执行结束后在处理循环中回报回放结果; 任务被丢弃时接收方会看到通道关闭
    pub fn with_replay_ack(mut self, ack: oneshot::Sender<bool>) -> Self {
        self.replay_ack = Some(ack);
        self
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// 域的活跃集群决定该任务是否属于本角色
    async fn belongs_to_role(&self) -> Result<bool, HistoryError> {
        let active_cluster = self.domains.active_cluster(&self.task.domain_id).await?;
        let is_local = active_cluster == self.shard.current_cluster();
        Ok(match self.role {
            ClusterRole::Active => is_local,
            ClusterRole::Standby => !is_local,
        })
    }

    fn complete(self: Box<Self>, result: Result<(), HistoryError>) {
        let this = *self;
        let completion = TaskCompletion {
            task: this.task,
            key: this.key,
            attempt: this.attempt,
            replay: this.replay,
            replay_ack: this.replay_ack,
            result,
        };
        if this.completions.send(completion).is_err() {
            debug!("处理循环已退出, 丢弃任务完成通知");
        }
    }
}

#[async_trait]
impl SchedulableTask for QueueTask {
    fn priority(&self) -> u8 {
        self.priority
            .assign(self.task.category, self.role, self.attempt())
    }

    fn ordering_key(&self) -> String {
        self.ordering_key.clone()
    }

    fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    fn increment_attempt(&mut self) {
        self.attempt.fetch_add(1, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || !self.shard.is_valid()
    }

    async fn execute(&self) -> Result<(), HistoryError> {
        let attempt = self.attempt();
        let tagged = self.metrics.clone().tagged("task_type", self.task.task_type.as_str());
        tagged.inc(metric_names::TASK_REQUESTS);
        tagged.record_value(metric_names::TASK_ATTEMPT, attempt as f64);

        match self.belongs_to_role().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    task_id = self.task.task_id,
                    role = %self.role,
                    "任务所属域不由本角色处理, 直接确认"
                );
                return Ok(());
            }
            Err(e) if e.is_obsolete() => {
                tagged.inc(metric_names::TASK_ERRORS_DISCARDED);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let ctx = self.shard.execution_context(self.role, attempt);
        let started = Instant::now();
        let result = self.executor.execute(&self.task, &ctx).await;
        tagged.record_latency(metric_names::TASK_PROCESSING_LATENCY, started.elapsed());

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_obsolete() && !matches!(e, HistoryError::Cancelled(_)) => {
                debug!(task_id = self.task.task_id, "任务已过时, 直接确认: {}", e);
                tagged.inc(metric_names::TASK_ERRORS_DISCARDED);
                Ok(())
            }
            Err(e) => {
                tagged.inc_with(metric_names::TASK_ERRORS, "error", e.metric_tag());
                match &e {
                    HistoryError::DomainNotActive { .. } => {
                        tagged.inc(metric_names::TASK_ERRORS_NOT_ACTIVE)
                    }
                    HistoryError::StandbyTaskPending(_) | HistoryError::ResyncRequired { .. } => {
                        tagged.inc(metric_names::TASK_ERRORS_STANDBY_RETRY);
                        if self.role == ClusterRole::Standby
                            && self.standby.should_escalate(attempt)
                        {
                            self.standby.escalate(&self.task, &e, &tagged).await;
                        }
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }

    fn on_success(self: Box<Self>) {
        self.metrics
            .record_latency(metric_names::TASK_LATENCY, self.created_at.elapsed());
        self.complete(Ok(()));
    }

    fn on_failure(self: Box<Self>, error: HistoryError) {
        self.complete(Err(error));
    }
}
