//! 跨集群任务的目标侧拉取器
//!
//! 每个源集群一个拉取器, 一次请求覆盖本机拥有的全部分片。
//! 拉取到的任务交给调度器执行, 结果批量回报给源集群。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use history_config::CrossClusterConfig;
use history_core::{CircuitBreaker, Lifecycle, LifecycleState};
use history_domain::{
    ClusterRole, CrossClusterTaskResponse, GetCrossClusterTasksRequest, HistoryError,
    RemoteAdminClient, RespondCrossClusterTasksCompletedRequest, ShardContext, Task,
    TaskCategory, TaskExecutor,
};
use history_observability::{metric_names, Scope, ScopedMetrics};
use history_queue::PriorityAssigner;
use history_scheduler::TaskScheduler;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::target_task::{CrossClusterTargetTask, TargetCompletion};

/// 本机当前拥有的分片, 由分片控制器提供
pub trait OwnedShards: Send + Sync {
    fn owned_shards(&self) -> Vec<Arc<dyn ShardContext>>;
}

#[derive(Clone)]
pub struct CrossClusterFetcherResources {
    pub scheduler: Arc<TaskScheduler>,
    pub executor: Arc<dyn TaskExecutor>,
    pub shards: Arc<dyn OwnedShards>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetcherStats {
    pub lifecycle: Option<LifecycleState>,
    pub in_flight: usize,
    pub fetched: u64,
    pub responded: u64,
    pub consecutive_failures: u32,
}

pub struct CrossClusterTaskFetcher {
    source_cluster: String,
    lifecycle: Lifecycle,
    token: CancellationToken,
    fetch_loop: Mutex<Option<FetchLoop>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stats_rx: watch::Receiver<FetcherStats>,
}

impl CrossClusterTaskFetcher {
    pub fn new(
        source_cluster: impl Into<String>,
        current_cluster: impl Into<String>,
        client: Arc<dyn RemoteAdminClient>,
        resources: CrossClusterFetcherResources,
        config: Option<CrossClusterConfig>,
    ) -> Self {
        let source_cluster = source_cluster.into();
        let config = config.unwrap_or_default();
        let token = CancellationToken::new();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(FetcherStats::default());

        let fetch_loop = FetchLoop {
            breaker: CircuitBreaker::new(
                format!("cross-cluster-fetch-{source_cluster}"),
                Some(config.circuit_breaker.clone()),
            ),
            source_cluster: source_cluster.clone(),
            current_cluster: current_cluster.into(),
            client,
            resources,
            priority: PriorityAssigner::default(),
            config,
            shards: BTreeMap::new(),
            completions_tx,
            completions: completions_rx,
            consecutive_failures: 0,
            fetched: 0,
            responded: 0,
            stats_tx,
            token: token.clone(),
            metrics: ScopedMetrics::new(Scope::CrossClusterTaskFetcher)
                .tagged("source_cluster", source_cluster.clone()),
        };

        Self {
            source_cluster,
            lifecycle: Lifecycle::new(),
            token,
            fetch_loop: Mutex::new(Some(fetch_loop)),
            handle: Mutex::new(None),
            stats_rx,
        }
    }

    pub fn source_cluster(&self) -> &str {
        &self.source_cluster
    }

    pub async fn start(&self) {
        if !self.lifecycle.begin_start() {
            return;
        }
        if let Some(fetch_loop) = self.fetch_loop.lock().await.take() {
            *self.handle.lock().await = Some(tokio::spawn(fetch_loop.run()));
        }
        self.lifecycle.finish_start();
        info!(source_cluster = %self.source_cluster, "跨集群任务拉取器已启动");
    }

    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        self.token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(source_cluster = %self.source_cluster, "拉取循环异常退出: {}", e);
            }
        }
        self.lifecycle.finish_stop();
        info!(source_cluster = %self.source_cluster, "跨集群任务拉取器已停止");
    }

    pub fn stats(&self) -> FetcherStats {
        let mut stats = self.stats_rx.borrow().clone();
        stats.lifecycle = Some(self.lifecycle.state());
        stats
    }
}

/// 单个分片的拉取状态, 分片重新获取后重建
struct ShardFetchState {
    shard: Arc<dyn ShardContext>,
    range_id: i64,
    /// 已提交给调度器尚未完成的任务
    in_flight: HashSet<i64>,
    /// 已收到的最大任务ID, 作为请求水位
    received: i64,
    /// 调度器繁忙时暂存
    unsubmitted: VecDeque<Task>,
    /// 回报失败, 下次再发
    unresponded: Vec<CrossClusterTaskResponse>,
}

impl ShardFetchState {
    fn new(shard: Arc<dyn ShardContext>) -> Self {
        Self {
            range_id: shard.range_id(),
            shard,
            in_flight: HashSet::new(),
            received: 0,
            unsubmitted: VecDeque::new(),
            unresponded: Vec::new(),
        }
    }
}

struct FetchLoop {
    source_cluster: String,
    current_cluster: String,
    client: Arc<dyn RemoteAdminClient>,
    resources: CrossClusterFetcherResources,
    priority: PriorityAssigner,
    config: CrossClusterConfig,
    breaker: CircuitBreaker,
    shards: BTreeMap<i32, ShardFetchState>,
    completions_tx: mpsc::UnboundedSender<TargetCompletion>,
    completions: mpsc::UnboundedReceiver<TargetCompletion>,
    consecutive_failures: u32,
    fetched: u64,
    responded: u64,
    stats_tx: watch::Sender<FetcherStats>,
    token: CancellationToken,
    metrics: ScopedMetrics,
}

impl FetchLoop {
    async fn run(mut self) {
        let mut next_fetch = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(completion) = self.completions.recv() => {
                    let mut batch = vec![completion];
                    while let Ok(more) = self.completions.try_recv() {
                        batch.push(more);
                    }
                    self.handle_completions(batch).await;
                }
                _ = tokio::time::sleep_until(next_fetch) => {
                    let succeeded = self.fetch().await;
                    next_fetch = tokio::time::Instant::now() + self.next_delay(succeeded);
                }
            }
            self.publish_stats();
        }
        debug!(source_cluster = %self.source_cluster, "拉取循环已退出");
    }

    fn next_delay(&mut self, succeeded: bool) -> Duration {
        let interval = Duration::from_millis(self.config.fetch_interval_ms);
        if succeeded {
            self.consecutive_failures = 0;
            return interval;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let factor = 2u32.saturating_pow(self.consecutive_failures.min(16));
        interval
            .saturating_mul(factor)
            .min(Duration::from_millis(self.config.max_fetch_backoff_ms))
    }

    /// 与分片控制器同步: 丢弃不再拥有或已重新获取的分片状态
    fn refresh_shards(&mut self) {
        let owned: HashMap<i32, Arc<dyn ShardContext>> = self
            .resources
            .shards
            .owned_shards()
            .into_iter()
            .filter(|shard| shard.is_valid())
            .map(|shard| (shard.shard_id(), shard))
            .collect();

        self.shards.retain(|shard_id, state| {
            owned
                .get(shard_id)
                .is_some_and(|shard| shard.range_id() == state.range_id)
        });
        for (shard_id, shard) in owned {
            self.shards
                .entry(shard_id)
                .or_insert_with(|| ShardFetchState::new(shard));
        }
    }

    async fn fetch(&mut self) -> bool {
        self.refresh_shards();
        self.retry_pending().await;
        if self.shards.is_empty() {
            return true;
        }

        let request = GetCrossClusterTasksRequest {
            target_cluster: self.current_cluster.clone(),
            shard_watermarks: self
                .shards
                .iter()
                .map(|(shard_id, state)| (*shard_id, state.received))
                .collect(),
            batch_size: self.config.fetch_batch_size,
        };
        let timeout = Duration::from_millis(self.config.fetch_timeout_ms);
        let client = Arc::clone(&self.client);
        let started = Instant::now();
        self.metrics.inc(metric_names::CROSS_CLUSTER_FETCH_REQUESTS);
        let result = self
            .breaker
            .execute(|| async move {
                tokio::time::timeout(timeout, client.get_cross_cluster_tasks(request))
                    .await
                    .map_err(|_| HistoryError::Timeout("拉取跨集群任务超时".to_string()))?
            })
            .await;
        self.metrics
            .record_latency(metric_names::CROSS_CLUSTER_FETCH_LATENCY, started.elapsed());

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.metrics
                    .inc_with(metric_names::CROSS_CLUSTER_FETCH_ERRORS, "error", e.metric_tag());
                if matches!(e, HistoryError::ServiceBusy(_)) {
                    self.metrics
                        .inc(metric_names::CROSS_CLUSTER_FETCH_ERRORS_SERVICE_BUSY);
                }
                warn!(
                    source_cluster = %self.source_cluster,
                    failures = self.consecutive_failures + 1,
                    "拉取跨集群任务失败: {}",
                    e
                );
                return false;
            }
        };

        for (shard_id, reason) in &response.failed_shards {
            warn!(
                source_cluster = %self.source_cluster,
                shard_id = *shard_id,
                "源集群无法提供该分片的跨集群任务: {}",
                reason
            );
        }
        for (shard_id, tasks) in response.tasks_by_shard {
            if !self.shards.contains_key(&shard_id) {
                debug!(shard_id, "收到非本机分片的跨集群任务, 忽略");
                continue;
            }
            self.metrics
                .add(metric_names::CROSS_CLUSTER_TASK_FETCHED, tasks.len() as u64);
            for task in tasks {
                self.accept(shard_id, task).await;
            }
        }
        true
    }

    async fn accept(&mut self, shard_id: i32, task: Task) {
        let Some(state) = self.shards.get_mut(&shard_id) else {
            return;
        };
        state.received = state.received.max(task.task_id);
        if task.category != TaskCategory::CrossCluster {
            warn!(shard_id, task_id = task.task_id, category = %task.category, "拉取到非跨集群任务, 忽略");
            return;
        }
        // 仍在执行中的任务被重复投递时不再提交
        if !state.in_flight.insert(task.task_id) {
            return;
        }
        self.fetched += 1;
        self.submit(shard_id, task).await;
    }

    async fn submit(&mut self, shard_id: i32, task: Task) {
        let Some(state) = self.shards.get_mut(&shard_id) else {
            return;
        };
        let task_id = task.task_id;
        let retained = task.clone();
        let target_task = CrossClusterTargetTask {
            priority: self
                .priority
                .assign(TaskCategory::CrossCluster, ClusterRole::Active, 0),
            attempt: 0,
            shard: Arc::clone(&state.shard),
            range_id: state.range_id,
            executor: Arc::clone(&self.resources.executor),
            completions: self.completions_tx.clone(),
            metrics: ScopedMetrics::new(Scope::CrossClusterTargetTask)
                .tagged("source_cluster", self.source_cluster.clone()),
            created_at: Instant::now(),
            task,
        };
        if let Err(rejection) = self.resources.scheduler.submit(Box::new(target_task)).await {
            debug!(shard_id, task_id, "调度器拒绝跨集群任务, 下次拉取时重新提交: {}", rejection.error);
            state.in_flight.remove(&task_id);
            state.unsubmitted.push_back(retained);
        }
    }

    async fn retry_pending(&mut self) {
        let shard_ids: Vec<i32> = self.shards.keys().copied().collect();
        for shard_id in shard_ids {
            let (tasks, responses) = match self.shards.get_mut(&shard_id) {
                Some(state) => (
                    std::mem::take(&mut state.unsubmitted),
                    std::mem::take(&mut state.unresponded),
                ),
                None => continue,
            };
            for task in tasks {
                if let Some(state) = self.shards.get_mut(&shard_id) {
                    if !state.in_flight.insert(task.task_id) {
                        continue;
                    }
                }
                self.submit(shard_id, task).await;
            }
            if !responses.is_empty() {
                self.respond(shard_id, responses).await;
            }
        }
    }

    async fn handle_completions(&mut self, completions: Vec<TargetCompletion>) {
        let mut by_shard: BTreeMap<i32, Vec<CrossClusterTaskResponse>> = BTreeMap::new();
        for completion in completions {
            let Some(state) = self.shards.get_mut(&completion.shard_id) else {
                continue;
            };
            if state.range_id != completion.range_id {
                continue;
            }
            state.in_flight.remove(&completion.task_id);
            if let Some(outcome) = completion.outcome {
                by_shard
                    .entry(completion.shard_id)
                    .or_default()
                    .push(CrossClusterTaskResponse {
                        shard_id: completion.shard_id,
                        task_id: completion.task_id,
                        task_type: completion.task_type,
                        outcome,
                    });
            }
        }
        for (shard_id, responses) in by_shard {
            self.respond(shard_id, responses).await;
        }
    }

    async fn respond(&mut self, shard_id: i32, responses: Vec<CrossClusterTaskResponse>) {
        let request = RespondCrossClusterTasksCompletedRequest {
            shard_id,
            target_cluster: self.current_cluster.clone(),
            responses: responses.clone(),
        };
        let started = Instant::now();
        self.metrics.inc(metric_names::CROSS_CLUSTER_RESPOND_REQUESTS);
        let result = self.client.respond_cross_cluster_tasks_completed(request).await;
        self.metrics
            .record_latency(metric_names::CROSS_CLUSTER_RESPOND_LATENCY, started.elapsed());
        match result {
            Ok(response) => {
                self.responded += responses.len() as u64;
                debug!(
                    source_cluster = %self.source_cluster,
                    shard_id,
                    acknowledged = response.acknowledged,
                    ignored = response.ignored,
                    "已回报跨集群任务结果"
                );
            }
            Err(e) => {
                warn!(
                    source_cluster = %self.source_cluster,
                    shard_id,
                    "回报跨集群任务结果失败, 稍后重试: {}",
                    e
                );
                if let Some(state) = self.shards.get_mut(&shard_id) {
                    state.unresponded.extend(responses);
                }
            }
        }
    }

    fn publish_stats(&self) {
        let stats = FetcherStats {
            lifecycle: None,
            in_flight: self.shards.values().map(|s| s.in_flight.len()).sum(),
            fetched: self.fetched,
            responded: self.responded,
            consecutive_failures: self.consecutive_failures,
        };
        self.stats_tx.send_replace(stats);
    }
}
