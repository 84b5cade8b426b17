use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use history_config::{SubmitMode, TaskSchedulerConfig};
use history_core::{HistoryError, Lifecycle};
use history_observability::{metric_names, Scope, ScopedMetrics};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::task::SchedulableTask;

/// 被拒绝的提交, 任务原样交还给调用方
pub struct SubmitRejection {
    pub error: HistoryError,
    pub task: Box<dyn SchedulableTask>,
}

impl fmt::Debug for SubmitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitRejection")
            .field("error", &self.error)
            .field("ordering_key", &self.task.ordering_key())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub panicked: u64,
    pub in_flight: u64,
    pub pending: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    panicked: AtomicU64,
    in_flight: AtomicU64,
    pending: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

struct QueuedItem {
    task: Box<dyn SchedulableTask>,
    enqueued_at: Instant,
    /// 任务完成前一直占用的队列容量
    capacity: OwnedSemaphorePermit,
}

/// 同一排序键的待执行任务, `busy` 表示该键有任务在执行或退避中
#[derive(Default)]
struct KeyQueue {
    items: VecDeque<QueuedItem>,
    busy: bool,
    ready: bool,
}

struct ReadyKey {
    key: String,
    since: Instant,
}

/// 排序键队列 + 按优先级分道的就绪键
#[derive(Default)]
struct DispatchState {
    keys: HashMap<String, KeyQueue>,
    lanes: BTreeMap<u8, VecDeque<ReadyKey>>,
}

impl DispatchState {
    fn mark_ready(&mut self, key: &str) {
        let Some(queue) = self.keys.get_mut(key) else {
            return;
        };
        if queue.busy || queue.ready {
            return;
        }
        match queue.items.front() {
            Some(head) => {
                queue.ready = true;
                self.lanes
                    .entry(head.task.priority())
                    .or_default()
                    .push_back(ReadyKey {
                        key: key.to_string(),
                        since: Instant::now(),
                    });
            }
            None => {
                self.keys.remove(key);
            }
        }
    }

    /// 取出下一个可执行任务, 等待超过阈值的就绪键优先于高优先级道
    fn next(&mut self, starvation: Duration) -> Option<(String, QueuedItem, bool)> {
        let top = self.lanes.keys().next().copied()?;
        let starved = self
            .lanes
            .iter()
            .filter_map(|(priority, lane)| lane.front().map(|r| (*priority, r.since)))
            .filter(|(_, since)| since.elapsed() >= starvation)
            .min_by_key(|(_, since)| *since)
            .map(|(priority, _)| priority);
        let priority = starved.unwrap_or(top);

        let lane = self.lanes.get_mut(&priority)?;
        let ready = lane.pop_front()?;
        if lane.is_empty() {
            self.lanes.remove(&priority);
        }

        let queue = self.keys.get_mut(&ready.key)?;
        queue.ready = false;
        let item = queue.items.pop_front()?;
        queue.busy = true;
        Some((ready.key, item, priority != top))
    }

    fn drain(&mut self) -> usize {
        self.lanes.clear();
        let mut dropped = 0;
        self.keys.retain(|_, queue| {
            dropped += queue.items.len();
            queue.items.clear();
            queue.ready = false;
            queue.busy
        });
        dropped
    }
}

struct Inner {
    config: TaskSchedulerConfig,
    state: Mutex<DispatchState>,
    workers: Arc<Semaphore>,
    capacity: Arc<Semaphore>,
    notify: Notify,
    shutdown: CancellationToken,
    lifecycle: Lifecycle,
    counters: Counters,
    metrics: ScopedMetrics,
}

/// 通用并发任务调度器
///
/// - 同一排序键的任务严格按提交顺序执行, 重试的任务插回键队列头部
/// - 不同优先级分道调度, 等待过久的低优先级任务会被提升
/// - 固定大小的工作者池; 队列容量满时按 `submit_mode` 阻塞或返回 Busy
/// - 可重试错误按指数退避重试, 退避期间不占用工作者
pub struct TaskScheduler {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(config: Option<TaskSchedulerConfig>) -> Self {
        let config = config.unwrap_or_default();
        let workers = Arc::new(Semaphore::new(config.worker_count.max(1)));
        let capacity = Arc::new(Semaphore::new(config.queue_size.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(DispatchState::default()),
                workers,
                capacity,
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                lifecycle: Lifecycle::new(),
                counters: Counters::default(),
                metrics: ScopedMetrics::new(Scope::TaskScheduler),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        if !self.inner.lifecycle.begin_start() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.dispatch_loop().await });
        *self.dispatcher.lock().await = Some(handle);
        self.inner.lifecycle.finish_start();
        info!(
            worker_count = self.inner.config.worker_count,
            queue_size = self.inner.config.queue_size,
            "任务调度器已启动"
        );
    }

    /// 丢弃排队中的任务, 等待执行中的任务结束(有超时)
    pub async fn stop(&self) {
        if !self.inner.lifecycle.begin_stop() {
            return;
        }
        info!("任务调度器正在停止");
        self.inner.shutdown.cancel();
        self.inner.capacity.close();

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!("调度循环异常退出: {}", e);
            }
        }

        let dropped = self.inner.state.lock().await.drain();
        self.inner.counters.pending.store(0, Ordering::Relaxed);
        if dropped > 0 {
            info!("丢弃 {} 个排队中的任务", dropped);
        }

        let timeout = Duration::from_millis(self.inner.config.shutdown_timeout_ms);
        let all_workers = self.inner.config.worker_count.max(1) as u32;
        match tokio::time::timeout(timeout, self.inner.workers.acquire_many(all_workers)).await {
            Ok(_) => debug!("所有执行中的任务已结束"),
            Err(_) => warn!(
                "等待执行中的任务超时 ({:?}), 剩余 {} 个",
                timeout,
                self.inner.counters.in_flight.load(Ordering::Relaxed)
            ),
        }
        self.inner.workers.close();
        self.inner.lifecycle.finish_stop();
        info!("任务调度器已停止");
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }

    /// 按配置的 `submit_mode` 提交
    pub async fn submit(&self, task: Box<dyn SchedulableTask>) -> Result<(), SubmitRejection> {
        match self.inner.config.submit_mode {
            SubmitMode::NonBlocking => self.try_submit(task).await,
            SubmitMode::Blocking => {
                if let Some(error) = self.admission_error(task.as_ref()) {
                    return Err(self.reject(task, error));
                }
                let started = Instant::now();
                let capacity = tokio::select! {
                    _ = self.inner.shutdown.cancelled() => {
                        return Err(self.reject(task, HistoryError::SchedulerStopped));
                    }
                    permit = Arc::clone(&self.inner.capacity).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Err(self.reject(task, HistoryError::SchedulerStopped)),
                    },
                };
                self.inner.enqueue(task, capacity).await;
                self.inner
                    .metrics
                    .record_latency(metric_names::PRIORITY_TASK_SUBMIT_LATENCY, started.elapsed());
                Ok(())
            }
        }
    }

    /// 非阻塞提交, 队列满时立即返回 `SchedulerBusy`
    pub async fn try_submit(&self, task: Box<dyn SchedulableTask>) -> Result<(), SubmitRejection> {
        if let Some(error) = self.admission_error(task.as_ref()) {
            return Err(self.reject(task, error));
        }
        let capacity = match Arc::clone(&self.inner.capacity).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(self.reject(task, HistoryError::SchedulerBusy)),
        };
        self.inner.enqueue(task, capacity).await;
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.counters.snapshot()
    }

    fn admission_error(&self, task: &dyn SchedulableTask) -> Option<HistoryError> {
        if !self.inner.lifecycle.is_running() {
            return Some(HistoryError::SchedulerStopped);
        }
        if task.is_cancelled() {
            return Some(HistoryError::Cancelled(format!(
                "任务 {} 已取消, 拒绝提交",
                task.ordering_key()
            )));
        }
        None
    }

    fn reject(&self, task: Box<dyn SchedulableTask>, error: HistoryError) -> SubmitRejection {
        Counters::incr(&self.inner.counters.rejected);
        self.inner
            .metrics
            .inc_with(metric_names::TASK_SCHEDULER_REJECTED, "reason", error.metric_tag());
        SubmitRejection { error, task }
    }
}

impl Inner {
    async fn enqueue(&self, task: Box<dyn SchedulableTask>, capacity: OwnedSemaphorePermit) {
        let key = task.ordering_key();
        {
            let mut state = self.state.lock().await;
            state
                .keys
                .entry(key.clone())
                .or_default()
                .items
                .push_back(QueuedItem {
                    task,
                    enqueued_at: Instant::now(),
                    capacity,
                });
            state.mark_ready(&key);
        }
        Counters::incr(&self.counters.submitted);
        Counters::incr(&self.counters.pending);
        self.metrics.inc(metric_names::PRIORITY_TASK_SUBMIT_REQUEST);
        self.notify.notify_one();
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let starvation = Duration::from_millis(self.config.starvation_threshold_ms);
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = self.state.lock().await.next(starvation);
            match next {
                Some((key, item, promoted)) => {
                    Counters::decr(&self.counters.pending);
                    if promoted {
                        self.metrics
                            .inc(metric_names::TASK_SCHEDULER_STARVATION_PROMOTED);
                        debug!(ordering_key = %key, "低优先级任务等待过久, 提前调度");
                    }
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move { worker.run(key, item, permit).await });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
        debug!("调度循环已退出");
    }

    async fn run(self: Arc<Self>, key: String, item: QueuedItem, permit: OwnedSemaphorePermit) {
        let QueuedItem {
            mut task,
            enqueued_at,
            capacity,
        } = item;

        if task.is_cancelled() {
            drop(permit);
            Counters::incr(&self.counters.cancelled);
            task.on_failure(HistoryError::Cancelled(format!("任务 {key} 已取消")));
            drop(capacity);
            self.release_key(&key).await;
            return;
        }

        self.metrics
            .record_latency(metric_names::TASK_QUEUE_LATENCY, enqueued_at.elapsed());
        Counters::incr(&self.counters.in_flight);
        let result = match AssertUnwindSafe(task.execute()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                Counters::incr(&self.counters.panicked);
                self.metrics.inc(metric_names::TASK_SCHEDULER_PANIC);
                error!(ordering_key = %key, "任务执行发生panic: {}", message);
                Err(HistoryError::TaskPanicked(message))
            }
        };
        Counters::decr(&self.counters.in_flight);
        drop(permit);

        match result {
            Ok(()) => {
                Counters::incr(&self.counters.completed);
                task.on_success();
            }
            Err(e) if self.can_retry(task.as_ref(), &e) => {
                let delay = self.config.retry.backoff(task.attempt());
                task.increment_attempt();
                Counters::incr(&self.counters.retried);
                debug!(
                    ordering_key = %key,
                    attempt = task.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "任务执行失败, 退避后重试: {}",
                    e
                );

                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                if task.is_cancelled() {
                    Counters::incr(&self.counters.cancelled);
                    task.on_failure(HistoryError::Cancelled(format!("任务 {key} 在退避期间被取消")));
                } else {
                    {
                        let mut state = self.state.lock().await;
                        let queue = state.keys.entry(key.clone()).or_default();
                        queue.items.push_front(QueuedItem {
                            task,
                            enqueued_at: Instant::now(),
                            capacity,
                        });
                        queue.busy = false;
                        state.mark_ready(&key);
                    }
                    Counters::incr(&self.counters.pending);
                    self.notify.notify_one();
                    return;
                }
            }
            Err(e) => {
                Counters::incr(&self.counters.failed);
                task.on_failure(e);
            }
        }

        drop(capacity);
        self.release_key(&key).await;
    }

    fn can_retry(&self, task: &dyn SchedulableTask, error: &HistoryError) -> bool {
        !self.shutdown.is_cancelled()
            && !task.is_cancelled()
            && task.should_retry(error)
            && self.config.retry.should_retry(task.attempt())
    }

    async fn release_key(&self, key: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some(queue) = state.keys.get_mut(key) {
                queue.busy = false;
            }
            state.mark_ready(key);
        }
        self.notify.notify_one();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extracts_str_and_string() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "未知panic");
    }
}
