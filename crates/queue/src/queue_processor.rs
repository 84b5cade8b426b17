//! 队列处理器: 每个 (分片, 类别, 角色) 一个处理循环
//!
//! 处理队列状态只在处理循环内修改; 任务完成通过 mpsc 回到循环,
//! 对外的状态通过 watch 快照发布。

use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use history_config::{QueueProcessorConfig, SplitConfig};
use history_core::{Lifecycle, LifecycleState, TimeSource};
use history_domain::{
    ClusterRole, DomainFilter, DomainRegistry, ErrorClass, GetTasksRequest, HistoryError,
    HistoryResult, ProcessingQueueState, Resyncer, ShardContext, Task, TaskCategory,
    TaskExecutor, TaskKey, TaskStore,
};
use history_observability::{metric_names, Scope, ScopedMetrics};
use history_scheduler::{SchedulableTask, SubmitRejection, TaskScheduler};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dlq::{DlqManager, DlqReplayTarget};
use crate::priority::PriorityAssigner;
use crate::processing_queue::ProcessingQueue;
use crate::queue_task::{QueueTaskFactory, StandbyEscalation, TaskCompletion};
use crate::split::{AggregateSplitPolicy, SplitPolicy};

/// 处理器依赖的协作方
#[derive(Clone)]
pub struct QueueProcessorResources {
    pub task_store: Arc<dyn TaskStore>,
    pub scheduler: Arc<TaskScheduler>,
    pub executor: Arc<dyn TaskExecutor>,
    pub domains: Arc<dyn DomainRegistry>,
    pub dlq: Arc<DlqManager>,
    pub resyncer: Option<Arc<dyn Resyncer>>,
    pub time_source: Arc<dyn TimeSource>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueProcessorOptions {
    pub queue: QueueProcessorConfig,
    pub split: SplitConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub state: ProcessingQueueState,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSnapshot {
    pub category: TaskCategory,
    pub role: ClusterRole,
    pub lifecycle: LifecycleState,
    pub queues: Vec<QueueSnapshot>,
    /// 所有处理队列中最小的确认位置
    pub ack_level: TaskKey,
    pub redispatch_pending: usize,
    pub dead_letter_pending: usize,
}

enum ControlMessage {
    NotifyNewTasks(Vec<Task>),
    Reset(oneshot::Sender<HistoryResult<()>>),
    Replay(Vec<Task>, oneshot::Sender<Vec<oneshot::Receiver<bool>>>),
}

struct PendingDeadLetter {
    task: Task,
    key: TaskKey,
    reason: String,
}

pub struct QueueProcessor {
    category: TaskCategory,
    role: ClusterRole,
    shard: Arc<dyn ShardContext>,
    lifecycle: Lifecycle,
    token: CancellationToken,
    control_tx: mpsc::Sender<ControlMessage>,
    snapshot_rx: watch::Receiver<ProcessorSnapshot>,
    processor_loop: Mutex<Option<ProcessorLoop>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl QueueProcessor {
    pub fn new(
        category: TaskCategory,
        role: ClusterRole,
        shard: Arc<dyn ShardContext>,
        resources: QueueProcessorResources,
        options: Option<QueueProcessorOptions>,
    ) -> HistoryResult<Self> {
        let options = options.unwrap_or_default();
        let scope = Scope::for_queue(category, role).ok_or_else(|| {
            HistoryError::invalid_argument(format!("不支持的队列组合: {category}/{role}"))
        })?;
        let metrics = ScopedMetrics::new(scope);
        let token = shard.cancellation_token().child_token();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::channel(64);
        let initial = ProcessorSnapshot {
            category,
            role,
            lifecycle: LifecycleState::Idle,
            queues: Vec::new(),
            ack_level: TaskKey::MIN,
            redispatch_pending: 0,
            dead_letter_pending: 0,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let factory = QueueTaskFactory {
            role,
            ordering: options.queue.ordering,
            priority: Arc::new(PriorityAssigner::new(options.split.stuck_task_attempt_threshold)),
            shard: Arc::clone(&shard),
            executor: Arc::clone(&resources.executor),
            domains: Arc::clone(&resources.domains),
            standby: StandbyEscalation {
                policy: options.queue.standby_verification,
                after_attempts: options.queue.standby_escalation_attempts,
                resyncer: resources.resyncer.clone(),
            },
            token: token.clone(),
            completions: completions_tx,
            metrics: metrics.clone(),
        };

        let processor_loop = ProcessorLoop {
            category,
            role,
            shard: Arc::clone(&shard),
            split_policy: AggregateSplitPolicy::from_config(&options.split),
            protected: DomainFilter::include(options.split.selected_domains.iter().cloned()),
            grace: Duration::from_millis(options.queue.shutdown_grace_ms),
            resources,
            options,
            factory,
            queues: Vec::new(),
            redispatch: VecDeque::new(),
            dead_letters: Vec::new(),
            observed: TaskKey::MIN,
            last_range_deleted: TaskKey::MIN,
            completions: completions_rx,
            control: control_rx,
            snapshot_tx,
            token: token.clone(),
            metrics,
        };

        Ok(Self {
            category,
            role,
            grace: processor_loop.grace,
            shard,
            lifecycle: Lifecycle::new(),
            token,
            control_tx,
            snapshot_rx,
            processor_loop: Mutex::new(Some(processor_loop)),
            handle: Mutex::new(None),
        })
    }

    pub fn category(&self) -> TaskCategory {
        self.category
    }

    pub fn role(&self) -> ClusterRole {
        self.role
    }

    /// 加载持久化的队列状态并启动处理循环
    pub async fn start(&self) -> HistoryResult<()> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }
        let Some(mut processor_loop) = self.processor_loop.lock().await.take() else {
            return Err(HistoryError::internal("队列处理器的处理循环已被取走"));
        };
        let states = self.shard.queue_states(self.category, self.role).await;
        processor_loop.load(states);
        processor_loop.publish_snapshot();

        let handle = tokio::spawn(processor_loop.run());
        *self.handle.lock().await = Some(handle);
        self.lifecycle.finish_start();
        info!(
            shard_id = self.shard.shard_id(),
            category = %self.category,
            role = %self.role,
            "队列处理器已启动"
        );
        Ok(())
    }

    /// 在宽限期内等待处理循环退出, 超时则中止
    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        self.token.cancel();
        if let Some(mut handle) = self.handle.lock().await.take() {
            if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
                warn!(
                    shard_id = self.shard.shard_id(),
                    category = %self.category,
                    role = %self.role,
                    "队列处理器未能在 {:?} 内退出, 强制中止",
                    self.grace
                );
                handle.abort();
            }
        }
        self.lifecycle.finish_stop();
        info!(
            shard_id = self.shard.shard_id(),
            category = %self.category,
            role = %self.role,
            "队列处理器已停止"
        );
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn describe(&self) -> ProcessorSnapshot {
        let mut snapshot = self.snapshot_rx.borrow().clone();
        snapshot.lifecycle = self.lifecycle.state();
        snapshot
    }

    /// 订阅快照变化
    pub fn subscribe(&self) -> watch::Receiver<ProcessorSnapshot> {
        self.snapshot_rx.clone()
    }

    /// 通知有新任务写入; 迟于读取位置的定时任务会让读取位置回退
    pub async fn notify_new_tasks(&self, tasks: Vec<Task>) -> HistoryResult<()> {
        self.send(ControlMessage::NotifyNewTasks(tasks)).await
    }

    /// 折叠成一个覆盖全部域的根队列, 从最小确认位置重新读取
    pub async fn reset(&self) -> HistoryResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlMessage::Reset(tx)).await?;
        rx.await.map_err(|_| self.not_running())?
    }

    async fn send(&self, message: ControlMessage) -> HistoryResult<()> {
        if !self.lifecycle.is_running() {
            return Err(self.not_running());
        }
        self.control_tx
            .send(message)
            .await
            .map_err(|_| self.not_running())
    }

    fn not_running(&self) -> HistoryError {
        HistoryError::non_retryable(format!(
            "分片 {} 的 {}/{} 队列处理器未运行",
            self.shard.shard_id(),
            self.category,
            self.role
        ))
    }
}

#[async_trait]
impl DlqReplayTarget for QueueProcessor {
    /// 回放的任务不参与确认位置跟踪; 等待每个任务执行成功或重新写入死信队列
    async fn replay(&self, tasks: Vec<Task>) -> HistoryResult<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlMessage::Replay(tasks, tx)).await?;
        let acks = rx.await.map_err(|_| self.not_running())?;
        let total = acks.len();
        let mut settled = 0;
        for ack in acks {
            if matches!(ack.await, Ok(true)) {
                settled += 1;
            }
        }
        if settled < total {
            return Err(HistoryError::task_execution(format!(
                "分片 {} 有 {} 个回放任务未能处理结束",
                self.shard.shard_id(),
                total - settled
            )));
        }
        Ok(settled)
    }
}

struct ProcessorLoop {
    category: TaskCategory,
    role: ClusterRole,
    shard: Arc<dyn ShardContext>,
    resources: QueueProcessorResources,
    options: QueueProcessorOptions,
    factory: QueueTaskFactory,
    split_policy: AggregateSplitPolicy,
    protected: DomainFilter,
    grace: Duration,
    queues: Vec<ProcessingQueue>,
    /// 调度器繁忙时暂存的任务, 先于新任务提交
    redispatch: VecDeque<Box<dyn SchedulableTask>>,
    /// 写入死信队列失败, 等待下次确认周期重试
    dead_letters: Vec<PendingDeadLetter>,
    /// 处理器见过的最大任务位置
    observed: TaskKey,
    last_range_deleted: TaskKey,
    completions: mpsc::UnboundedReceiver<TaskCompletion>,
    control: mpsc::Receiver<ControlMessage>,
    snapshot_tx: watch::Sender<ProcessorSnapshot>,
    token: CancellationToken,
    metrics: ScopedMetrics,
}

impl ProcessorLoop {
    fn load(&mut self, states: Vec<ProcessingQueueState>) {
        let states = if states.is_empty() {
            vec![ProcessingQueueState::root(TaskKey::MIN)]
        } else {
            states
        };
        self.observed = states
            .iter()
            .map(|s| s.max_level)
            .max()
            .unwrap_or(TaskKey::MIN);
        self.queues = states.into_iter().map(ProcessingQueue::new).collect();
    }

    async fn run(mut self) {
        let queue_config = self.options.queue.clone();
        let mut poll = tokio::time::interval(Duration::from_millis(queue_config.poll_interval_ms));
        let mut ack = tokio::time::interval(Duration::from_millis(queue_config.update_ack_interval_ms));
        let mut split = tokio::time::interval(Duration::from_millis(queue_config.split_interval_ms));
        for ticker in [&mut poll, &mut ack, &mut split] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            let step = tokio::select! {
                _ = self.token.cancelled() => break,
                Some(completion) = self.completions.recv() => self.handle_completion(completion).await,
                Some(message) = self.control.recv() => self.handle_control(message).await,
                _ = poll.tick() => self.poll().await,
                _ = ack.tick() => self.update_ack_levels().await,
                _ = split.tick() => {
                    self.split_and_merge();
                    Ok(())
                }
            };

            if let Err(e) = step {
                if e.is_ownership_error() {
                    error!(
                        shard_id = self.shard.shard_id(),
                        category = %self.category,
                        role = %self.role,
                        "分片所有权丢失, 队列处理器退出: {}",
                        e
                    );
                    self.shard.mark_ownership_lost(&e);
                    self.token.cancel();
                    break;
                }
                warn!(
                    shard_id = self.shard.shard_id(),
                    category = %self.category,
                    role = %self.role,
                    "队列处理失败: {}",
                    e
                );
            }
            self.publish_snapshot();
        }

        // 正常停止时尽量持久化最后的确认位置
        if self.shard.is_valid() {
            let flush = tokio::time::timeout(self.grace, self.update_ack_levels()).await;
            if !matches!(flush, Ok(Ok(()))) {
                debug!(shard_id = self.shard.shard_id(), "停止前持久化确认位置未完成");
            }
        }
        debug!(
            shard_id = self.shard.shard_id(),
            category = %self.category,
            role = %self.role,
            "处理循环已退出"
        );
    }

    async fn poll(&mut self) -> HistoryResult<()> {
        if !self.drain_redispatch().await {
            return Ok(());
        }

        let max_key = if self.category.is_scheduled() {
            TaskKey::due_before(self.resources.time_source.now().timestamp_millis())
        } else {
            TaskKey::MAX
        };
        let observed = self.observed;
        let max_outstanding = self.options.queue.max_outstanding_per_queue;

        for index in 0..self.queues.len() {
            let queue = &self.queues[index];
            if queue.pending_count() >= max_outstanding {
                self.metrics.inc(metric_names::PROCESSING_QUEUE_THROTTLED);
                continue;
            }
            if queue.read_level() >= max_key {
                continue;
            }

            let request = GetTasksRequest {
                shard_id: self.shard.shard_id(),
                category: self.category,
                min_key: queue.read_level(),
                max_key,
                domain_filter: queue.domain_filter().clone(),
                batch_size: self.options.queue.batch_size,
            };
            let response = match self.resources.task_store.get_tasks(&request).await {
                Ok(response) => response,
                Err(e) if e.is_ownership_error() => return Err(e),
                Err(e) => {
                    warn!(
                        shard_id = self.shard.shard_id(),
                        category = %self.category,
                        "读取任务失败, 下次轮询重试: {}",
                        e
                    );
                    continue;
                }
            };

            if let Some(last) = response.tasks.last() {
                self.observed = self.observed.max(last.key());
            }
            let accepted = self.queues[index].record_read(response.tasks, response.more, observed, max_key);
            for (task, attempt) in accepted {
                let queue_task = self.factory.create(task, attempt, false);
                self.dispatch(Box::new(queue_task)).await;
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, task: Box<dyn SchedulableTask>) {
        if !self.redispatch.is_empty() {
            self.redispatch.push_back(task);
            return;
        }
        if let Err(rejection) = self.resources.scheduler.submit(task).await {
            self.handle_rejection(rejection, false);
        }
    }

    /// 返回 false 表示调度器仍然繁忙
    async fn drain_redispatch(&mut self) -> bool {
        while let Some(task) = self.redispatch.pop_front() {
            if let Err(rejection) = self.resources.scheduler.submit(task).await {
                if !self.handle_rejection(rejection, true) {
                    return false;
                }
            }
        }
        true
    }

    /// 繁忙时任务放回重新分发缓冲区并返回 false
    fn handle_rejection(&mut self, rejection: SubmitRejection, front: bool) -> bool {
        match rejection.error {
            HistoryError::SchedulerBusy => {
                if front {
                    self.redispatch.push_front(rejection.task);
                } else {
                    self.redispatch.push_back(rejection.task);
                }
                self.metrics.set_gauge(
                    metric_names::TASK_REDISPATCH_PENDING,
                    self.redispatch.len() as f64,
                );
                false
            }
            error => {
                debug!(
                    shard_id = self.shard.shard_id(),
                    ordering_key = %rejection.task.ordering_key(),
                    "调度器拒绝任务: {}",
                    error
                );
                true
            }
        }
    }

    async fn handle_completion(&mut self, completion: TaskCompletion) -> HistoryResult<()> {
        if completion.replay {
            return self.handle_replay_completion(completion).await;
        }
        let TaskCompletion {
            task,
            key,
            attempt,
            result,
            ..
        } = completion;

        let error = match result {
            Ok(()) => {
                self.complete(&task.domain_id, key);
                return Ok(());
            }
            // 分片正在关闭, 不确认也不进入死信队列
            Err(HistoryError::Cancelled(_)) => return Ok(()),
            Err(e) => e,
        };

        match error.class() {
            ErrorClass::Ownership => Err(error),
            ErrorClass::StandbyRetry => {
                // 备用任务不进入死信队列, 下次轮询时重新提交
                let retry = self.factory.create(task, attempt, false);
                self.redispatch.push_back(Box::new(retry));
                Ok(())
            }
            _ => {
                self.dead_letter(task, key, error.to_string()).await;
                Ok(())
            }
        }
    }

    async fn handle_replay_completion(&mut self, completion: TaskCompletion) -> HistoryResult<()> {
        let TaskCompletion {
            task,
            key,
            replay_ack,
            result,
            ..
        } = completion;
        let (settled, outcome) = match result {
            Ok(()) => match self
                .resources
                .task_store
                .complete_task(self.shard.shard_id(), self.shard.range_id(), self.category, key)
                .await
            {
                Ok(()) => (true, Ok(())),
                Err(e) if e.is_ownership_error() => (true, Err(e)),
                Err(e) => {
                    debug!(task_id = task.task_id, "删除回放任务失败: {}", e);
                    (true, Ok(()))
                }
            },
            Err(HistoryError::Cancelled(_)) => (false, Ok(())),
            Err(e) if e.is_ownership_error() => (false, Err(e)),
            Err(e) => {
                // 回放失败的任务重新写回死信队列
                match self.resources.dlq.enqueue(&task, &e.to_string()).await {
                    Ok(_) => (true, Ok(())),
                    Err(dlq_err) => {
                        error!(
                            task_id = task.task_id,
                            "回放失败的任务无法写回死信队列: {}",
                            dlq_err
                        );
                        (false, Ok(()))
                    }
                }
            }
        };
        if let Some(ack) = replay_ack {
            let _ = ack.send(settled);
        }
        outcome
    }

    /// 先写入死信队列再确认
    async fn dead_letter(&mut self, task: Task, key: TaskKey, reason: String) {
        match self.resources.dlq.enqueue(&task, &reason).await {
            Ok(_) => self.complete(&task.domain_id, key),
            Err(_) => self.dead_letters.push(PendingDeadLetter { task, key, reason }),
        }
    }

    async fn retry_dead_letters(&mut self) {
        for pending in std::mem::take(&mut self.dead_letters) {
            self.dead_letter(pending.task, pending.key, pending.reason).await;
        }
    }

    fn complete(&mut self, domain_id: &str, key: TaskKey) {
        let completed = self
            .queues
            .iter_mut()
            .find(|q| q.contains(&key) && q.domain_filter().matches(domain_id))
            .map(|q| q.complete(key))
            .unwrap_or(false);
        if !completed {
            debug!(
                shard_id = self.shard.shard_id(),
                key = %key,
                "任务不在任何处理队列中, 忽略完成通知"
            );
        }
    }

    async fn update_ack_levels(&mut self) -> HistoryResult<()> {
        self.retry_dead_letters().await;

        let min_ack = self
            .queues
            .iter_mut()
            .map(|q| q.update_ack_level())
            .min()
            .unwrap_or(TaskKey::MIN);
        let states = self.queues.iter().map(|q| q.state().clone()).collect();

        if let Err(e) = self
            .shard
            .update_queue_states(self.category, self.role, states)
            .await
        {
            if e.is_ownership_error() {
                return Err(e);
            }
            self.metrics.inc(metric_names::ACK_LEVEL_UPDATE_FAILED);
            warn!(
                shard_id = self.shard.shard_id(),
                category = %self.category,
                role = %self.role,
                "持久化确认位置失败: {}",
                e
            );
            return Ok(());
        }
        self.metrics.inc(metric_names::ACK_LEVEL_UPDATE);

        let delete_to = self
            .shard
            .report_ack_level(self.category, self.role, min_ack)
            .await;
        if delete_to == TaskKey::MIN || delete_to <= self.last_range_deleted {
            return Ok(());
        }
        match self
            .resources
            .task_store
            .range_complete_tasks(
                self.shard.shard_id(),
                self.shard.range_id(),
                self.category,
                delete_to,
            )
            .await
        {
            Ok(deleted) => {
                self.last_range_deleted = delete_to;
                self.metrics.add(metric_names::TASK_BATCH_COMPLETE, deleted);
                debug!(
                    shard_id = self.shard.shard_id(),
                    category = %self.category,
                    up_to = %delete_to,
                    "已删除 {} 个已确认任务",
                    deleted
                );
                Ok(())
            }
            Err(e) if e.is_ownership_error() => Err(e),
            Err(e) => {
                self.metrics.inc(metric_names::TASK_BATCH_COMPLETE_FAILURE);
                warn!(shard_id = self.shard.shard_id(), "批量删除已确认任务失败: {}", e);
                Ok(())
            }
        }
    }

    fn split_and_merge(&mut self) {
        if !self.options.split.enabled {
            return;
        }
        let max_level = self.options.split.max_split_level;

        let mut created = Vec::new();
        for queue in self.queues.iter_mut() {
            if queue.level() >= max_level {
                continue;
            }
            let Some(decision) = self.split_policy.evaluate(queue) else {
                continue;
            };
            if let Some(isolated) = queue.split(&decision.domains) {
                self.metrics.inc(decision.reason.metric_name());
                info!(
                    shard_id = self.shard.shard_id(),
                    category = %self.category,
                    role = %self.role,
                    reason = ?decision.reason,
                    domains = ?decision.domains,
                    level = isolated.level(),
                    "拆分处理队列"
                );
                created.push(isolated);
            }
        }
        self.queues.extend(created);

        let mut merged: Vec<ProcessingQueue> = Vec::with_capacity(self.queues.len());
        for queue in self.queues.drain(..) {
            match merged
                .iter_mut()
                .find(|m| m.can_merge(&queue, &self.protected))
            {
                Some(target) => {
                    target.merge(queue);
                    self.metrics.inc(metric_names::PROCESSING_QUEUE_MERGE);
                }
                None => merged.push(queue),
            }
        }
        self.queues = merged;

        self.metrics
            .set_gauge(metric_names::PROCESSING_QUEUE_NUM, self.queues.len() as f64);
        let deepest = self.queues.iter().map(|q| q.level()).max().unwrap_or(0);
        self.metrics
            .set_gauge(metric_names::PROCESSING_QUEUE_MAX_LEVEL, deepest as f64);
    }

    async fn handle_control(&mut self, message: ControlMessage) -> HistoryResult<()> {
        match message {
            ControlMessage::NotifyNewTasks(tasks) => {
                self.notify_new_tasks(tasks).await;
                self.poll().await
            }
            ControlMessage::Reset(reply) => {
                let result = self.reset().await;
                let _ = reply.send(result.clone());
                match result {
                    Err(e) if e.is_ownership_error() => Err(e),
                    _ => Ok(()),
                }
            }
            ControlMessage::Replay(tasks, reply) => {
                let mut acks = Vec::with_capacity(tasks.len());
                for task in tasks {
                    let (tx, rx) = oneshot::channel();
                    acks.push(rx);
                    let replay = self
                        .factory
                        .create(task, Arc::new(AtomicU32::new(0)), true)
                        .with_replay_ack(tx);
                    self.dispatch(Box::new(replay)).await;
                }
                let _ = reply.send(acks);
                Ok(())
            }
        }
    }

    async fn notify_new_tasks(&mut self, tasks: Vec<Task>) {
        let mut late = Vec::new();
        for task in tasks.into_iter().filter(|t| t.category == self.category) {
            let key = task.key();
            let Some(queue) = self
                .queues
                .iter_mut()
                .find(|q| q.domain_filter().matches(&task.domain_id))
            else {
                continue;
            };
            if key <= queue.ack_level() {
                late.push(task);
            } else if key <= queue.read_level() {
                queue.rewind_read_level(key);
            }
        }
        if !late.is_empty() {
            // 已越过确认位置的迟到任务脱离确认跟踪直接执行
            warn!(
                shard_id = self.shard.shard_id(),
                category = %self.category,
                "{} 个新任务落在确认位置之前",
                late.len()
            );
            self.replay(late).await;
        }
    }

    async fn reset(&mut self) -> HistoryResult<()> {
        let min_ack = self
            .queues
            .iter()
            .map(|q| q.ack_level())
            .min()
            .unwrap_or(TaskKey::MIN);
        self.queues = vec![ProcessingQueue::new(ProcessingQueueState::root(min_ack))];
        self.redispatch.clear();
        info!(
            shard_id = self.shard.shard_id(),
            category = %self.category,
            role = %self.role,
            ack_level = %min_ack,
            "处理队列已重置"
        );
        self.shard
            .update_queue_states(self.category, self.role, vec![ProcessingQueueState::root(min_ack)])
            .await
    }

    async fn replay(&mut self, tasks: Vec<Task>) {
        for task in tasks {
            let replay = self
                .factory
                .create(task, Arc::new(AtomicU32::new(0)), true);
            self.dispatch(Box::new(replay)).await;
        }
    }

    fn publish_snapshot(&self) {
        let queues: Vec<QueueSnapshot> = self
            .queues
            .iter()
            .map(|q| QueueSnapshot {
                state: q.state().clone(),
                pending: q.pending_count(),
            })
            .collect();
        let ack_level = queues
            .iter()
            .map(|q| q.state.ack_level)
            .min()
            .unwrap_or(TaskKey::MIN);
        self.snapshot_tx.send_replace(ProcessorSnapshot {
            category: self.category,
            role: self.role,
            lifecycle: LifecycleState::Running,
            queues,
            ack_level,
            redispatch_pending: self.redispatch.len(),
            dead_letter_pending: self.dead_letters.len(),
        });
    }
}
