//! 复制任务处理器: 每个 (分片, 源集群) 一个拉取循环
//!
//! 拉取到的任务经过按运行的重排缓冲后交给调度器应用。`last_processed`
//! 是连续完成的消息ID水位, 随下一次拉取上报给源集群并持久化到分片。

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use history_config::ReplicationConfig;
use history_core::{Lifecycle, LifecycleState, TimeSource};
use history_domain::{
    ClusterRole, GetReplicationMessagesRequest, HistoryError, HistoryResult, RemoteAdminClient,
    ReplicationApplier, ReplicationTask, ResendRequest, Resyncer, ShardContext, TaskCategory,
};
use history_observability::{metric_names, Scope, ScopedMetrics};
use history_queue::{DlqManager, PriorityAssigner};
use history_scheduler::TaskScheduler;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::apply_task::{ApplyCompletion, ReplicationApplyTask};
use super::reorder::{Offer, ReorderBuffer};

#[derive(Clone)]
pub struct ReplicationResources {
    pub scheduler: Arc<TaskScheduler>,
    pub applier: Arc<dyn ReplicationApplier>,
    pub resyncer: Option<Arc<dyn Resyncer>>,
    pub dlq: Arc<DlqManager>,
    pub time_source: Arc<dyn TimeSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSnapshot {
    pub source_cluster: String,
    pub lifecycle: LifecycleState,
    pub last_retrieved: i64,
    pub last_processed: i64,
    pub outstanding: usize,
    pub buffered: usize,
    pub dead_letter_pending: usize,
}

pub struct ReplicationTaskProcessor {
    source_cluster: String,
    shard: Arc<dyn ShardContext>,
    lifecycle: Lifecycle,
    token: CancellationToken,
    processor_loop: Mutex<Option<ReplicationLoop>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    snapshot_rx: watch::Receiver<ReplicationSnapshot>,
}

impl ReplicationTaskProcessor {
    pub fn new(
        shard: Arc<dyn ShardContext>,
        source_cluster: impl Into<String>,
        client: Arc<dyn RemoteAdminClient>,
        resources: ReplicationResources,
        config: Option<ReplicationConfig>,
    ) -> Self {
        let source_cluster = source_cluster.into();
        let config = config.unwrap_or_default();
        let token = shard.cancellation_token().child_token();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ReplicationSnapshot {
            source_cluster: source_cluster.clone(),
            lifecycle: LifecycleState::Idle,
            last_retrieved: 0,
            last_processed: 0,
            outstanding: 0,
            buffered: 0,
            dead_letter_pending: 0,
        });

        let processor_loop = ReplicationLoop {
            source_cluster: source_cluster.clone(),
            shard: Arc::clone(&shard),
            client,
            reorder: ReorderBuffer::new(
                config.max_buffered_per_run,
                Duration::from_millis(config.run_idle_ttl_ms),
            ),
            priority: PriorityAssigner::default()
                .assign(TaskCategory::Replication, ClusterRole::Active, 0),
            resources,
            config,
            last_retrieved: 0,
            last_processed: 0,
            persisted: 0,
            outstanding: BTreeMap::new(),
            redispatch: VecDeque::new(),
            dead_letters: Vec::new(),
            completions_tx,
            completions: completions_rx,
            snapshot_tx,
            token: token.clone(),
            metrics: ScopedMetrics::new(Scope::ReplicationTaskProcessor)
                .tagged("source_cluster", source_cluster.clone()),
        };

        Self {
            source_cluster,
            shard,
            lifecycle: Lifecycle::new(),
            token,
            processor_loop: Mutex::new(Some(processor_loop)),
            handle: Mutex::new(None),
            snapshot_rx,
        }
    }

    pub fn source_cluster(&self) -> &str {
        &self.source_cluster
    }

    /// 从分片加载已处理水位并启动拉取循环
    pub async fn start(&self) -> HistoryResult<()> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }
        let Some(mut processor_loop) = self.processor_loop.lock().await.take() else {
            return Err(HistoryError::internal("复制处理器的处理循环已被取走"));
        };
        let level = self.shard.replication_ack_level(&self.source_cluster).await;
        processor_loop.last_retrieved = level;
        processor_loop.last_processed = level;
        processor_loop.persisted = level;
        processor_loop.publish_snapshot();

        *self.handle.lock().await = Some(tokio::spawn(processor_loop.run()));
        self.lifecycle.finish_start();
        info!(
            shard_id = self.shard.shard_id(),
            source_cluster = %self.source_cluster,
            last_processed = level,
            "复制任务处理器已启动"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        self.token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(shard_id = self.shard.shard_id(), "复制处理循环异常退出: {}", e);
            }
        }
        self.lifecycle.finish_stop();
        info!(
            shard_id = self.shard.shard_id(),
            source_cluster = %self.source_cluster,
            "复制任务处理器已停止"
        );
    }

    pub fn describe(&self) -> ReplicationSnapshot {
        let mut snapshot = self.snapshot_rx.borrow().clone();
        snapshot.lifecycle = self.lifecycle.state();
        snapshot
    }
}

struct ReplicationLoop {
    source_cluster: String,
    shard: Arc<dyn ShardContext>,
    client: Arc<dyn RemoteAdminClient>,
    resources: ReplicationResources,
    config: ReplicationConfig,
    reorder: ReorderBuffer,
    priority: u8,
    last_retrieved: i64,
    last_processed: i64,
    persisted: i64,
    /// 已拉取未越过水位的消息: 消息ID -> 是否完成
    outstanding: BTreeMap<i64, bool>,
    redispatch: VecDeque<ReplicationTask>,
    dead_letters: Vec<(ReplicationTask, String)>,
    completions_tx: mpsc::UnboundedSender<ApplyCompletion>,
    completions: mpsc::UnboundedReceiver<ApplyCompletion>,
    snapshot_tx: watch::Sender<ReplicationSnapshot>,
    token: CancellationToken,
    metrics: ScopedMetrics,
}

impl ReplicationLoop {
    async fn run(mut self) {
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = self.token.cancelled() => break,
                Some(completion) = self.completions.recv() => self.handle_completion(completion).await,
                _ = poll.tick() => match self.poll().await {
                    Ok(true) => {
                        poll.reset_immediately();
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                },
            };
            let step = match step {
                Ok(()) => self.persist_ack_level().await,
                Err(e) => Err(e),
            };

            if let Err(e) = step {
                if e.is_ownership_error() {
                    error!(
                        shard_id = self.shard.shard_id(),
                        source_cluster = %self.source_cluster,
                        "分片所有权丢失, 复制处理器退出: {}",
                        e
                    );
                    self.shard.mark_ownership_lost(&e);
                    self.token.cancel();
                    break;
                }
                warn!(
                    shard_id = self.shard.shard_id(),
                    source_cluster = %self.source_cluster,
                    "复制任务处理失败: {}",
                    e
                );
            }
            self.publish_snapshot();
        }
        debug!(
            shard_id = self.shard.shard_id(),
            source_cluster = %self.source_cluster,
            "复制处理循环已退出"
        );
    }

    /// 返回 true 表示源集群还有更多消息
    async fn poll(&mut self) -> HistoryResult<bool> {
        let now = self.resources.time_source.now();
        let expired = self
            .reorder
            .expire(now, Duration::from_millis(self.config.resync_after_ms));
        self.handle_offer(expired).await;
        self.retry_dead_letters().await;
        if !self.drain_redispatch().await {
            return Ok(false);
        }
        // 积压过多时暂停拉取
        if self.outstanding.len() >= self.config.batch_size.saturating_mul(4).max(1) {
            return Ok(false);
        }

        let request = GetReplicationMessagesRequest {
            shard_id: self.shard.shard_id(),
            cluster_name: self.shard.current_cluster(),
            last_retrieved_message_id: self.last_retrieved,
            last_processed_message_id: self.last_processed,
            batch_size: self.config.batch_size,
        };
        let timeout = Duration::from_millis(self.config.fetch_timeout_ms);
        let messages = match tokio::time::timeout(timeout, self.client.get_replication_messages(request)).await {
            Ok(Ok(messages)) => messages,
            Ok(Err(e)) if e.is_ownership_error() => {
                // 源侧分片迁移不影响本地分片所有权
                warn!(source_cluster = %self.source_cluster, "源集群分片暂不可用: {}", e);
                return Ok(false);
            }
            Ok(Err(e)) => {
                warn!(source_cluster = %self.source_cluster, "拉取复制消息失败: {}", e);
                return Ok(false);
            }
            Err(_) => {
                warn!(source_cluster = %self.source_cluster, "拉取复制消息超时");
                return Ok(false);
            }
        };

        self.metrics
            .add(metric_names::REPLICATION_TASKS_FETCHED, messages.tasks.len() as u64);
        for task in messages.tasks {
            if task.message_id <= self.last_retrieved {
                continue;
            }
            self.last_retrieved = task.message_id;
            self.outstanding.insert(task.message_id, false);
            let offer = self.reorder.offer(task, now);
            self.handle_offer(offer).await;
        }
        self.last_retrieved = self.last_retrieved.max(messages.last_retrieved_message_id);
        self.advance_watermark();
        self.metrics
            .set_gauge(metric_names::REPLICATION_TASKS_BUFFERED, self.reorder.buffered_len() as f64);
        Ok(messages.has_more)
    }

    async fn handle_offer(&mut self, offer: Offer) {
        for message_id in offer.dropped {
            debug!(message_id, "丢弃重复的复制任务");
            self.mark_done(message_id);
        }
        for request in offer.resync {
            self.resync(request).await;
        }
        for task in offer.ready {
            self.dispatch(task).await;
        }
    }

    async fn resync(&self, request: ResendRequest) {
        self.metrics.inc(metric_names::REPLICATION_RESYNC_REQUESTS);
        let Some(resyncer) = &self.resources.resyncer else {
            warn!(
                workflow_id = %request.workflow_id,
                run_id = %request.run_id,
                "复制事件缺口 [{}, {}) 未补齐, 未配置重新同步",
                request.start_event_id,
                request.end_event_id
            );
            return;
        };
        match resyncer.resend(&request).await {
            Ok(()) => info!(
                workflow_id = %request.workflow_id,
                run_id = %request.run_id,
                "已请求补发事件 [{}, {})",
                request.start_event_id,
                request.end_event_id
            ),
            Err(e) => warn!(workflow_id = %request.workflow_id, "补发事件请求失败: {}", e),
        }
    }

    async fn dispatch(&mut self, task: ReplicationTask) {
        if !self.redispatch.is_empty() {
            self.redispatch.push_back(task);
            return;
        }
        if let Err(task) = self.submit(task).await {
            self.redispatch.push_back(task);
        }
    }

    /// 调度器繁忙时把任务交还
    async fn submit(&self, task: ReplicationTask) -> Result<(), ReplicationTask> {
        let retained = task.clone();
        let apply = ReplicationApplyTask {
            task,
            priority: self.priority,
            attempt: 0,
            applier: Arc::clone(&self.resources.applier),
            resyncer: self.resources.resyncer.clone(),
            shard: Arc::clone(&self.shard),
            completions: self.completions_tx.clone(),
            metrics: self.metrics.clone(),
        };
        match self.resources.scheduler.submit(Box::new(apply)).await {
            Ok(()) => Ok(()),
            Err(rejection) => {
                debug!(message_id = retained.message_id, "调度器拒绝复制任务: {}", rejection.error);
                Err(retained)
            }
        }
    }

    async fn drain_redispatch(&mut self) -> bool {
        while let Some(task) = self.redispatch.pop_front() {
            if let Err(task) = self.submit(task).await {
                self.redispatch.push_front(task);
                return false;
            }
        }
        true
    }

    async fn handle_completion(&mut self, completion: ApplyCompletion) -> HistoryResult<()> {
        let ApplyCompletion { task, result } = completion;
        match result {
            Ok(()) => {
                self.metrics.inc(metric_names::REPLICATION_TASKS_APPLIED);
                self.mark_done(task.message_id);
                Ok(())
            }
            Err(e) if e.is_ownership_error() => Err(e),
            Err(HistoryError::Cancelled(_)) => Ok(()),
            Err(e) => {
                self.metrics
                    .inc_with(metric_names::REPLICATION_TASKS_FAILED, "error", e.metric_tag());
                warn!(
                    shard_id = self.shard.shard_id(),
                    message_id = task.message_id,
                    workflow = %task.run_key(),
                    "复制任务应用失败, 写入死信队列: {}",
                    e
                );
                self.dead_letter(task, e.to_string()).await;
                Ok(())
            }
        }
    }

    async fn dead_letter(&mut self, task: ReplicationTask, reason: String) {
        let message_id = task.message_id;
        let mut dlq_task = task.clone().into_task();
        dlq_task.task_id = message_id;
        match self.resources.dlq.enqueue(&dlq_task, &reason).await {
            Ok(_) => self.mark_done(message_id),
            Err(e) => {
                self.metrics.inc(metric_names::REPLICATION_DLQ_FAILED);
                warn!(message_id, "复制任务写入死信队列失败, 稍后重试: {}", e);
                self.dead_letters.push((task, reason));
            }
        }
    }

    async fn retry_dead_letters(&mut self) {
        for (task, reason) in std::mem::take(&mut self.dead_letters) {
            self.dead_letter(task, reason).await;
        }
    }

    fn mark_done(&mut self, message_id: i64) {
        if let Some(done) = self.outstanding.get_mut(&message_id) {
            *done = true;
        }
        self.advance_watermark();
    }

    fn advance_watermark(&mut self) {
        while let Some((&message_id, &done)) = self.outstanding.first_key_value() {
            if !done {
                break;
            }
            self.outstanding.remove(&message_id);
            self.last_processed = self.last_processed.max(message_id);
        }
        if self.outstanding.is_empty() {
            self.last_processed = self.last_processed.max(self.last_retrieved);
        }
    }

    async fn persist_ack_level(&mut self) -> HistoryResult<()> {
        if self.last_processed <= self.persisted {
            return Ok(());
        }
        match self
            .shard
            .update_replication_ack_level(&self.source_cluster, self.last_processed)
            .await
        {
            Ok(()) => {
                self.persisted = self.last_processed;
                Ok(())
            }
            Err(e) if e.is_ownership_error() => Err(e),
            Err(e) => {
                warn!(shard_id = self.shard.shard_id(), "持久化复制水位失败: {}", e);
                Ok(())
            }
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = ReplicationSnapshot {
            source_cluster: self.source_cluster.clone(),
            lifecycle: LifecycleState::Running,
            last_retrieved: self.last_retrieved,
            last_processed: self.last_processed,
            outstanding: self.outstanding.len(),
            buffered: self.reorder.buffered_len(),
            dead_letter_pending: self.dead_letters.len(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}
