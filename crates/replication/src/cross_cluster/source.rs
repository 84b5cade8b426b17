//! 跨集群任务的源侧
//!
//! 源集群执行跨集群任务 = 投递到分片发件箱并等待目标集群的响应。
//! 目标集群通过拉取协议取走任务, 执行后回报结果; 只有正向结果才完成任务。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use history_domain::{
    CrossClusterTaskOutcome, CrossClusterTaskResponse, ExecutionContext, HistoryError,
    HistoryResult, RespondCrossClusterTasksCompletedResponse, Task, TaskExecutor,
};
use history_observability::{metric_names, Scope, ScopedMetrics};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

const LATE_OUTCOME_CAPACITY: usize = 1024;

struct OutboxEntry {
    task: Task,
    delivered: bool,
    responder: oneshot::Sender<CrossClusterTaskOutcome>,
}

/// 等待方已超时后才到达的正向结果, 重新投递时直接使用
#[derive(Default)]
struct LateOutcomes {
    order: VecDeque<i64>,
    outcomes: HashMap<i64, CrossClusterTaskOutcome>,
}

impl LateOutcomes {
    fn insert(&mut self, task_id: i64, outcome: CrossClusterTaskOutcome) {
        if self.outcomes.insert(task_id, outcome).is_none() {
            self.order.push_back(task_id);
        }
        while self.order.len() > LATE_OUTCOME_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }
    }

    fn take(&mut self, task_id: i64) -> Option<CrossClusterTaskOutcome> {
        let outcome = self.outcomes.remove(&task_id)?;
        self.order.retain(|id| *id != task_id);
        Some(outcome)
    }
}

/// 单个分片的跨集群发件箱
pub struct CrossClusterOutbox {
    shard_id: i32,
    pending: Mutex<BTreeMap<i64, OutboxEntry>>,
    late: Mutex<LateOutcomes>,
    metrics: ScopedMetrics,
}

impl CrossClusterOutbox {
    pub fn new(shard_id: i32) -> Self {
        Self {
            shard_id,
            pending: Mutex::new(BTreeMap::new()),
            late: Mutex::new(LateOutcomes::default()),
            metrics: ScopedMetrics::new(Scope::CrossClusterSourceTask)
                .tagged("shard_id", shard_id.to_string()),
        }
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// 投递任务; 同一任务重复投递时替换旧的等待方
    pub async fn publish(&self, task: Task) -> oneshot::Receiver<CrossClusterTaskOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        pending.insert(
            task.task_id,
            OutboxEntry {
                task,
                delivered: false,
                responder: tx,
            },
        );
        self.metrics
            .set_gauge(metric_names::CROSS_CLUSTER_TASK_PENDING, pending.len() as f64);
        rx
    }

    pub async fn withdraw(&self, task_id: i64) {
        let mut pending = self.pending.lock().await;
        pending.remove(&task_id);
        self.metrics
            .set_gauge(metric_names::CROSS_CLUSTER_TASK_PENDING, pending.len() as f64);
    }

    async fn take_late_outcome(&self, task_id: i64) -> Option<CrossClusterTaskOutcome> {
        self.late.lock().await.take(task_id)
    }

    /// 取出发往 `target_cluster` 的任务
    ///
    /// 未投递过的任务总会返回; 已投递但ID大于目标侧水位的任务说明目标没有收到, 重新投递。
    pub async fn poll_tasks(&self, target_cluster: &str, watermark: i64, batch_size: usize) -> Vec<Task> {
        let mut pending = self.pending.lock().await;
        let mut tasks = Vec::new();
        for (task_id, entry) in pending.iter_mut() {
            if tasks.len() >= batch_size {
                break;
            }
            if entry.task.target_cluster.as_deref() != Some(target_cluster) {
                continue;
            }
            if entry.delivered && *task_id <= watermark {
                continue;
            }
            entry.delivered = true;
            tasks.push(entry.task.clone());
        }
        tasks
    }

    /// 处理目标集群的回报
    pub async fn respond(
        &self,
        target_cluster: &str,
        responses: Vec<CrossClusterTaskResponse>,
    ) -> RespondCrossClusterTasksCompletedResponse {
        let mut result = RespondCrossClusterTasksCompletedResponse::default();
        let mut pending = self.pending.lock().await;
        for response in responses {
            let matches = pending.get(&response.task_id).map(|entry| {
                entry.task.target_cluster.as_deref() == Some(target_cluster)
                    && entry.task.task_type == response.task_type
            });
            match matches {
                Some(true) => {
                    if let Some(entry) = pending.remove(&response.task_id) {
                        if entry.responder.send(response.outcome).is_err() {
                            debug!(shard_id = self.shard_id, task_id = response.task_id, "等待方已退出");
                        }
                        result.acknowledged += 1;
                    }
                }
                Some(false) => {
                    warn!(
                        shard_id = self.shard_id,
                        task_id = response.task_id,
                        target_cluster = target_cluster,
                        "跨集群任务回报与投递的任务不一致, 忽略"
                    );
                    result.ignored += 1;
                }
                None => {
                    if response.outcome.is_positive() {
                        self.late.lock().await.insert(response.task_id, response.outcome);
                    }
                    result.ignored += 1;
                }
            }
        }
        self.metrics
            .set_gauge(metric_names::CROSS_CLUSTER_TASK_PENDING, pending.len() as f64);
        result
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// 分片关闭时丢弃所有等待方
    pub async fn close(&self) {
        self.pending.lock().await.clear();
    }
}

/// 源集群跨集群队列的任务执行器
///
/// 等待响应期间一直占用调度器工作者, 只应交给跨集群专用的调度器执行。
pub struct CrossClusterSourceExecutor {
    outbox: Arc<CrossClusterOutbox>,
    response_timeout: Duration,
}

impl CrossClusterSourceExecutor {
    pub fn new(outbox: Arc<CrossClusterOutbox>, response_timeout: Duration) -> Self {
        Self {
            outbox,
            response_timeout,
        }
    }

    fn outcome_to_result(task: &Task, outcome: CrossClusterTaskOutcome) -> HistoryResult<()> {
        match outcome {
            CrossClusterTaskOutcome::Applied => Ok(()),
            CrossClusterTaskOutcome::NotApplicable => {
                debug!(task_id = task.task_id, "目标集群判定任务无需执行");
                Ok(())
            }
            CrossClusterTaskOutcome::Failed { reason } => Err(HistoryError::task_execution(format!(
                "目标集群执行跨集群任务 {} 失败: {}",
                task.task_id, reason
            ))),
        }
    }
}

#[async_trait]
impl TaskExecutor for CrossClusterSourceExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> HistoryResult<()> {
        let Some(target) = task.target_cluster.as_deref() else {
            return Err(HistoryError::non_retryable(format!(
                "跨集群任务 {} 缺少目标集群",
                task.task_id
            )));
        };
        if target == ctx.current_cluster {
            return Err(HistoryError::non_retryable(format!(
                "跨集群任务 {} 的目标集群是本集群",
                task.task_id
            )));
        }
        if let Some(outcome) = self.outbox.take_late_outcome(task.task_id).await {
            return Self::outcome_to_result(task, outcome);
        }

        let receiver = self.outbox.publish(task.clone()).await;
        match tokio::time::timeout(self.response_timeout, receiver).await {
            Ok(Ok(outcome)) => Self::outcome_to_result(task, outcome),
            Ok(Err(_)) => Err(HistoryError::Cancelled(format!(
                "分片 {} 的跨集群发件箱已关闭",
                ctx.shard_id
            ))),
            Err(_) => {
                self.outbox.withdraw(task.task_id).await;
                Err(HistoryError::Timeout(format!(
                    "等待 {} 响应跨集群任务 {} 超时",
                    target, task.task_id
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use history_domain::{ClusterRole, TaskType};
    use history_testing_utils::TaskBuilder;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            shard_id: 1,
            range_id: 1,
            role: ClusterRole::Active,
            attempt: 0,
            current_cluster: "cluster-a".into(),
        }
    }

    fn response(task_id: i64, outcome: CrossClusterTaskOutcome) -> CrossClusterTaskResponse {
        CrossClusterTaskResponse {
            shard_id: 1,
            task_id,
            task_type: TaskType::CrossClusterSignalExecution,
            outcome,
        }
    }

    #[tokio::test]
    async fn test_delivered_tasks_are_not_redelivered_below_watermark() {
        let outbox = CrossClusterOutbox::new(1);
        let _a = outbox.publish(TaskBuilder::cross_cluster(5, "cluster-b").build()).await;
        let _b = outbox.publish(TaskBuilder::cross_cluster(6, "cluster-b").build()).await;
        let _c = outbox.publish(TaskBuilder::cross_cluster(7, "cluster-c").build()).await;

        let first = outbox.poll_tasks("cluster-b", 0, 10).await;
        assert_eq!(first.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![5, 6]);

        assert!(outbox.poll_tasks("cluster-b", 6, 10).await.is_empty());
        // 目标重启后水位归零, 已投递的任务重新投递
        assert_eq!(outbox.poll_tasks("cluster-b", 0, 10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_executor_completes_on_positive_response() {
        let outbox = Arc::new(CrossClusterOutbox::new(1));
        let executor = CrossClusterSourceExecutor::new(Arc::clone(&outbox), Duration::from_secs(5));
        let task = TaskBuilder::cross_cluster(9, "cluster-b").build();

        let responder = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move {
                loop {
                    let tasks = outbox.poll_tasks("cluster-b", 0, 10).await;
                    if !tasks.is_empty() {
                        return outbox
                            .respond("cluster-b", vec![response(9, CrossClusterTaskOutcome::NotApplicable)])
                            .await;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        executor.execute(&task, &ctx()).await.unwrap();
        assert_eq!(responder.await.unwrap().acknowledged, 1);
        assert_eq!(outbox.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_withdraws_and_late_outcome_is_reused() {
        let outbox = Arc::new(CrossClusterOutbox::new(1));
        let executor = CrossClusterSourceExecutor::new(Arc::clone(&outbox), Duration::from_millis(20));
        let task = TaskBuilder::cross_cluster(3, "cluster-b").build();

        let err = executor.execute(&task, &ctx()).await.unwrap_err();
        assert!(matches!(err, HistoryError::Timeout(_)));
        assert!(err.is_retryable());
        assert_eq!(outbox.pending_count().await, 0);

        let result = outbox
            .respond("cluster-b", vec![response(3, CrossClusterTaskOutcome::Applied)])
            .await;
        assert_eq!(result.ignored, 1);
        executor.execute(&task, &ctx()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_outcome_is_retryable() {
        let outbox = Arc::new(CrossClusterOutbox::new(1));
        let executor = CrossClusterSourceExecutor::new(Arc::clone(&outbox), Duration::from_secs(5));
        let task = TaskBuilder::cross_cluster(4, "cluster-b").build();

        let pending = tokio::spawn({
            let outbox = Arc::clone(&outbox);
            async move {
                while outbox.pending_count().await == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                outbox
                    .respond(
                        "cluster-b",
                        vec![response(
                            4,
                            CrossClusterTaskOutcome::Failed {
                                reason: "parent missing".into(),
                            },
                        )],
                    )
                    .await
            }
        });

        let err = executor.execute(&task, &ctx()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(pending.await.unwrap().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_task_without_target_is_poison() {
        let outbox = Arc::new(CrossClusterOutbox::new(1));
        let executor = CrossClusterSourceExecutor::new(outbox, Duration::from_secs(1));
        let mut task = TaskBuilder::cross_cluster(1, "cluster-b").build();
        task.target_cluster = None;
        let err = executor.execute(&task, &ctx()).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
