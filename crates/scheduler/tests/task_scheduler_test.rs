use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use history_config::{SubmitMode, TaskSchedulerConfig};
use history_core::{HistoryError, RetryPolicy};
use history_scheduler::{SchedulableTask, TaskScheduler};
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Success(String),
    Failure(String, String),
}

/// 可编程的测试任务: 前 `fail_times` 次执行返回 `error`, 可选地第一次执行panic
struct TestTask {
    name: String,
    key: String,
    priority: u8,
    attempt: u32,
    fail_times: u32,
    error: HistoryError,
    panic_first: bool,
    executions: Arc<AtomicU32>,
    started: Option<mpsc::UnboundedSender<String>>,
    gate: Option<Arc<Notify>>,
    cancelled: Arc<AtomicBool>,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl TestTask {
    fn new(name: &str, key: &str, outcomes: &mpsc::UnboundedSender<Outcome>) -> Self {
        Self {
            name: name.to_string(),
            key: key.to_string(),
            priority: 0,
            attempt: 0,
            fail_times: 0,
            error: HistoryError::Timeout("模拟超时".into()),
            panic_first: false,
            executions: Arc::new(AtomicU32::new(0)),
            started: None,
            gate: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            outcomes: outcomes.clone(),
        }
    }

    fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    fn failing(mut self, times: u32, error: HistoryError) -> Self {
        self.fail_times = times;
        self.error = error;
        self
    }

    fn gated(mut self, gate: Arc<Notify>, started: mpsc::UnboundedSender<String>) -> Self {
        self.gate = Some(gate);
        self.started = Some(started);
        self
    }

    fn boxed(self) -> Box<dyn SchedulableTask> {
        Box::new(self)
    }
}

#[async_trait]
impl SchedulableTask for TestTask {
    fn priority(&self) -> u8 {
        self.priority
    }

    fn ordering_key(&self) -> String {
        self.key.clone()
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn increment_attempt(&mut self) {
        self.attempt += 1;
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn execute(&self) -> Result<(), HistoryError> {
        let n = self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(started) = &self.started {
            let _ = started.send(self.name.clone());
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.panic_first && n == 0 {
            panic!("第一次执行panic");
        }
        if n < self.fail_times {
            return Err(self.error.clone());
        }
        Ok(())
    }

    fn on_success(self: Box<Self>) {
        let _ = self.outcomes.send(Outcome::Success(self.name.clone()));
    }

    fn on_failure(self: Box<Self>, error: HistoryError) {
        let _ = self
            .outcomes
            .send(Outcome::Failure(self.name.clone(), error.metric_tag().to_string()));
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_interval_ms: 1,
        max_interval_ms: 10,
        backoff_coefficient: 2.0,
        jitter_factor: 0.0,
        max_attempts,
    }
}

fn config(worker_count: usize, queue_size: usize) -> TaskSchedulerConfig {
    TaskSchedulerConfig {
        worker_count,
        queue_size,
        submit_mode: SubmitMode::NonBlocking,
        starvation_threshold_ms: 60_000,
        retry: fast_retry(3),
        shutdown_timeout_ms: 1_000,
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("等待任务结果超时")
        .expect("结果通道已关闭")
}

#[tokio::test]
async fn test_same_key_tasks_complete_in_submission_order() {
    let scheduler = TaskScheduler::new(Some(config(8, 100)));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for i in 0..20 {
        let task = TestTask::new(&format!("t{i}"), "wf-1", &tx);
        scheduler.submit(task.boxed()).await.unwrap();
    }

    for i in 0..20 {
        assert_eq!(recv(&mut rx).await, Outcome::Success(format!("t{i}")));
    }
    let stats = scheduler.stats();
    assert_eq!(stats.submitted, 20);
    assert_eq!(stats.completed, 20);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_higher_priority_dispatched_first() {
    let scheduler = TaskScheduler::new(Some(config(1, 100)));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Notify::new());

    let blocker = TestTask::new("blocker", "k0", &tx).gated(gate.clone(), started_tx);
    scheduler.submit(blocker.boxed()).await.unwrap();
    assert_eq!(started_rx.recv().await.unwrap(), "blocker");

    let low = TestTask::new("low", "k1", &tx).priority(5);
    let high = TestTask::new("high", "k2", &tx).priority(0);
    scheduler.submit(low.boxed()).await.unwrap();
    scheduler.submit(high.boxed()).await.unwrap();
    gate.notify_one();

    assert_eq!(recv(&mut rx).await, Outcome::Success("blocker".into()));
    assert_eq!(recv(&mut rx).await, Outcome::Success("high".into()));
    assert_eq!(recv(&mut rx).await, Outcome::Success("low".into()));
    scheduler.stop().await;
}

#[tokio::test]
async fn test_starved_low_priority_task_is_promoted() {
    let mut cfg = config(1, 100);
    cfg.starvation_threshold_ms = 20;
    let scheduler = TaskScheduler::new(Some(cfg));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Notify::new());

    let blocker = TestTask::new("blocker", "k0", &tx).gated(gate.clone(), started_tx);
    scheduler.submit(blocker.boxed()).await.unwrap();
    started_rx.recv().await.unwrap();

    scheduler
        .submit(TestTask::new("low", "k1", &tx).priority(9).boxed())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    for i in 0..3 {
        let high = TestTask::new(&format!("high{i}"), &format!("h{i}"), &tx).priority(0);
        scheduler.submit(high.boxed()).await.unwrap();
    }
    gate.notify_one();

    assert_eq!(recv(&mut rx).await, Outcome::Success("blocker".into()));
    assert_eq!(recv(&mut rx).await, Outcome::Success("low".into()));
    scheduler.stop().await;
}

#[tokio::test]
async fn test_non_blocking_submit_returns_busy_with_task() {
    let scheduler = TaskScheduler::new(Some(config(1, 1)));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Notify::new());

    let blocker = TestTask::new("blocker", "k0", &tx).gated(gate.clone(), started_tx);
    scheduler.submit(blocker.boxed()).await.unwrap();
    started_rx.recv().await.unwrap();

    let rejection = scheduler
        .try_submit(TestTask::new("second", "k1", &tx).boxed())
        .await
        .unwrap_err();
    assert!(matches!(rejection.error, HistoryError::SchedulerBusy));
    assert_eq!(rejection.task.ordering_key(), "k1");
    assert_eq!(scheduler.stats().rejected, 1);

    gate.notify_one();
    assert_eq!(recv(&mut rx).await, Outcome::Success("blocker".into()));
    // 容量释放后可以重新提交
    scheduler.try_submit(rejection.task).await.unwrap();
    assert_eq!(recv(&mut rx).await, Outcome::Success("second".into()));
    scheduler.stop().await;
}

#[tokio::test]
async fn test_blocking_submit_waits_for_capacity() {
    let mut cfg = config(1, 1);
    cfg.submit_mode = SubmitMode::Blocking;
    let scheduler = Arc::new(TaskScheduler::new(Some(cfg)));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Notify::new());

    let blocker = TestTask::new("blocker", "k0", &tx).gated(gate.clone(), started_tx);
    scheduler.submit(blocker.boxed()).await.unwrap();
    started_rx.recv().await.unwrap();

    let submitter = {
        let scheduler = scheduler.clone();
        let task = TestTask::new("waiting", "k1", &tx);
        tokio::spawn(async move { scheduler.submit(task.boxed()).await.is_ok() })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!submitter.is_finished());

    gate.notify_one();
    assert!(submitter.await.unwrap());
    assert_eq!(recv(&mut rx).await, Outcome::Success("blocker".into()));
    assert_eq!(recv(&mut rx).await, Outcome::Success("waiting".into()));
    scheduler.stop().await;
}

#[tokio::test]
async fn test_retryable_failure_retried_until_success() {
    let scheduler = TaskScheduler::new(Some(config(2, 10)));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = TestTask::new("flaky", "k", &tx).failing(2, HistoryError::Timeout("超时".into()));
    let executions = task.executions.clone();
    scheduler.submit(task.boxed()).await.unwrap();

    assert_eq!(recv(&mut rx).await, Outcome::Success("flaky".into()));
    assert_eq!(executions.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.stats().retried, 2);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_attempt_ceiling_bounds_executions() {
    let scheduler = TaskScheduler::new(Some(config(2, 10)));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = TestTask::new("poison", "k", &tx)
        .failing(u32::MAX, HistoryError::persistence("存储不可用"));
    let executions = task.executions.clone();
    scheduler.submit(task.boxed()).await.unwrap();

    assert_eq!(
        recv(&mut rx).await,
        Outcome::Failure("poison".into(), "persistence".into())
    );
    // 首次执行 + max_attempts 次重试
    assert_eq!(executions.load(Ordering::SeqCst), 4);
    assert_eq!(scheduler.stats().failed, 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_non_retryable_failure_reported_once() {
    let scheduler = TaskScheduler::new(Some(config(2, 10)));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = TestTask::new("bad", "k", &tx).failing(1, HistoryError::non_retryable("坏数据"));
    let executions = task.executions.clone();
    scheduler.submit(task.boxed()).await.unwrap();

    assert_eq!(
        recv(&mut rx).await,
        Outcome::Failure("bad".into(), "non_retryable".into())
    );
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_panic_is_caught_and_retried() {
    let scheduler = TaskScheduler::new(Some(config(2, 10)));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut task = TestTask::new("panicky", "k", &tx);
    task.panic_first = true;
    scheduler.submit(task.boxed()).await.unwrap();

    assert_eq!(recv(&mut rx).await, Outcome::Success("panicky".into()));
    let stats = scheduler.stats();
    assert_eq!(stats.panicked, 1);
    assert_eq!(stats.retried, 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_retrying_task_is_not_overtaken_by_same_key() {
    let scheduler = TaskScheduler::new(Some(config(4, 10)));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = TestTask::new("first", "wf", &tx).failing(2, HistoryError::Timeout("超时".into()));
    let second = TestTask::new("second", "wf", &tx);
    scheduler.submit(first.boxed()).await.unwrap();
    scheduler.submit(second.boxed()).await.unwrap();

    assert_eq!(recv(&mut rx).await, Outcome::Success("first".into()));
    assert_eq!(recv(&mut rx).await, Outcome::Success("second".into()));
    scheduler.stop().await;
}

#[tokio::test]
async fn test_cancelled_task_rejected_and_never_executed() {
    let scheduler = TaskScheduler::new(Some(config(2, 10)));
    scheduler.start().await;
    let (tx, _rx) = mpsc::unbounded_channel();

    let task = TestTask::new("gone", "k", &tx);
    task.cancelled.store(true, Ordering::SeqCst);
    let executions = task.executions.clone();
    let rejection = scheduler.submit(task.boxed()).await.unwrap_err();
    assert!(matches!(rejection.error, HistoryError::Cancelled(_)));
    assert_eq!(executions.load(Ordering::SeqCst), 0);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_cancelled_during_backoff_is_not_retried() {
    let mut cfg = config(2, 10);
    cfg.retry.initial_interval_ms = 50;
    cfg.retry.max_interval_ms = 50;
    let scheduler = TaskScheduler::new(Some(cfg));
    scheduler.start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = TestTask::new("orphan", "k", &tx).failing(u32::MAX, HistoryError::Timeout("超时".into()));
    let cancelled = task.cancelled.clone();
    let executions = task.executions.clone();
    scheduler.submit(task.boxed()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    cancelled.store(true, Ordering::SeqCst);

    assert_eq!(
        recv(&mut rx).await,
        Outcome::Failure("orphan".into(), "cancelled".into())
    );
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_submit_after_stop_is_rejected() {
    let scheduler = TaskScheduler::new(Some(config(2, 10)));
    scheduler.start().await;
    scheduler.stop().await;
    // 重复停止是幂等的
    scheduler.stop().await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let rejection = scheduler
        .submit(TestTask::new("late", "k", &tx).boxed())
        .await
        .unwrap_err();
    assert!(matches!(rejection.error, HistoryError::SchedulerStopped));
    assert!(!scheduler.is_running());
}
