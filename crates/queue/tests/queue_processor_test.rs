use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use history_config::{QueueProcessorConfig, SplitConfig, StandbyVerificationPolicy, TaskSchedulerConfig};
use history_core::{LifecycleState, ManualTimeSource, RealTimeSource, RetryPolicy, TimeSource};
use history_domain::{
    ClusterRole, DlqStore, DomainFilter, HistoryError, ProcessingQueueState, ShardContext, Task,
    TaskCategory, TaskKey, TaskStore,
};
use history_infrastructure::{InMemoryDlqStore, InMemoryTaskStore};
use history_queue::{
    DlqManager, QueueProcessor, QueueProcessorOptions, QueueProcessorResources,
};
use history_scheduler::TaskScheduler;
use history_testing_utils::{
    wait_until, FaultyDlqStore, RecordingResyncer, ScriptedTaskExecutor, StaticDomainRegistry,
    TaskBuilder, TestShardContext,
};

const LOCAL: &str = "cluster-a";
const REMOTE: &str = "cluster-b";
const WAIT: Duration = Duration::from_secs(5);

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_interval_ms: 5,
        max_interval_ms: 20,
        backoff_coefficient: 2.0,
        jitter_factor: 0.0,
        max_attempts,
    }
}

fn options() -> QueueProcessorOptions {
    QueueProcessorOptions {
        queue: QueueProcessorConfig {
            batch_size: 100,
            poll_interval_ms: 10,
            update_ack_interval_ms: 20,
            split_interval_ms: 3_600_000,
            shutdown_grace_ms: 500,
            ..Default::default()
        },
        split: SplitConfig {
            enabled: false,
            ..Default::default()
        },
    }
}

struct Harness {
    shard: Arc<TestShardContext>,
    store: Arc<InMemoryTaskStore>,
    dlq_store: Arc<FaultyDlqStore>,
    dlq: Arc<DlqManager>,
    executor: Arc<ScriptedTaskExecutor>,
    domains: Arc<StaticDomainRegistry>,
    resyncer: Arc<RecordingResyncer>,
    scheduler: Arc<TaskScheduler>,
    time: Arc<dyn TimeSource>,
}

impl Harness {
    async fn new(scheduler_config: TaskSchedulerConfig) -> Self {
        Self::with_shard(TestShardContext::new(1, LOCAL), scheduler_config, Arc::new(RealTimeSource)).await
    }

    async fn with_shard(
        shard: TestShardContext,
        scheduler_config: TaskSchedulerConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let scheduler = Arc::new(TaskScheduler::new(Some(scheduler_config)));
        scheduler.start().await;
        let dlq_store = Arc::new(FaultyDlqStore::new(Arc::new(InMemoryDlqStore::new())));
        Self {
            shard: Arc::new(shard),
            store: Arc::new(InMemoryTaskStore::new()),
            dlq: Arc::new(DlqManager::new(dlq_store.clone(), RetryPolicy::no_retry(), 10)),
            dlq_store,
            executor: Arc::new(ScriptedTaskExecutor::new()),
            domains: Arc::new(
                StaticDomainRegistry::new()
                    .with_domain("local", LOCAL)
                    .with_domain("vip", LOCAL)
                    .with_domain("remote", REMOTE),
            ),
            resyncer: Arc::new(RecordingResyncer::new()),
            scheduler,
            time,
        }
    }

    fn processor(
        &self,
        category: TaskCategory,
        role: ClusterRole,
        options: QueueProcessorOptions,
    ) -> QueueProcessor {
        let resources = QueueProcessorResources {
            task_store: self.store.clone(),
            scheduler: self.scheduler.clone(),
            executor: self.executor.clone(),
            domains: self.domains.clone(),
            dlq: self.dlq.clone(),
            resyncer: Some(self.resyncer.clone()),
            time_source: self.time.clone(),
        };
        QueueProcessor::new(category, role, self.shard.clone(), resources, Some(options)).unwrap()
    }

    async fn put(&self, tasks: Vec<Task>) {
        self.store.put_tasks(1, 1, &tasks).await.unwrap();
    }
}

fn scheduler_config() -> TaskSchedulerConfig {
    TaskSchedulerConfig {
        worker_count: 4,
        queue_size: 1_000,
        retry: fast_retry(2),
        ..Default::default()
    }
}

fn transfer(task_id: i64, domain: &str) -> Task {
    TaskBuilder::transfer(task_id)
        .with_domain(domain)
        .with_workflow(&format!("wf-{task_id}"), "run")
        .build()
}

async fn wait_for_ack(processor: &QueueProcessor, key: TaskKey) -> bool {
    wait_until(WAIT, || processor.describe().ack_level >= key).await
}

#[tokio::test]
async fn test_out_of_order_completion_holds_ack_level() {
    let shard = TestShardContext::new(1, LOCAL).with_queue_states(
        TaskCategory::Transfer,
        ClusterRole::Active,
        vec![ProcessingQueueState::root(TaskKey::immediate(4))],
    );
    let mut config = scheduler_config();
    config.retry = RetryPolicy {
        initial_interval_ms: 300,
        max_interval_ms: 300,
        ..fast_retry(2)
    };
    let harness = Harness::with_shard(shard, config, Arc::new(RealTimeSource)).await;
    harness
        .executor
        .script(5, vec![Err(HistoryError::persistence("timeout"))]);
    harness.put(vec![transfer(5, "local"), transfer(6, "local")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();

    assert!(wait_until(WAIT, || harness.executor.execution_count(6) == 1).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    // 6 已完成但 5 仍在退避, 确认位置停在 4
    assert_eq!(processor.describe().ack_level, TaskKey::immediate(4));

    assert!(wait_for_ack(&processor, TaskKey::immediate(6)).await);
    assert_eq!(harness.executor.execution_count(5), 2);
    processor.stop().await;
}

#[tokio::test]
async fn test_timer_tasks_ack_and_range_delete_as_time_advances() {
    let start = 1_700_000_000_000;
    let clock = Arc::new(ManualTimeSource::new(
        Utc.timestamp_millis_opt(start).single().unwrap(),
    ));
    let harness = Harness::with_shard(
        TestShardContext::new(1, LOCAL),
        scheduler_config(),
        clock.clone(),
    )
    .await;
    harness
        .put(vec![
            TaskBuilder::timer(100, start).with_domain("local").build(),
            TaskBuilder::timer(101, start).with_domain("local").build(),
            TaskBuilder::timer(102, start + 10_000).with_domain("local").build(),
        ])
        .await;

    let processor = harness.processor(TaskCategory::Timer, ClusterRole::Active, options());
    processor.start().await.unwrap();

    assert!(wait_for_ack(&processor, TaskKey::new(start, 101)).await);
    assert!(
        wait_until(WAIT, || harness
            .shard
            .reported_ack_level(TaskCategory::Timer, ClusterRole::Active)
            .is_some_and(|level| level >= TaskKey::new(start, 101)))
        .await
    );
    assert_eq!(harness.executor.execution_count(102), 0);
    let store = harness.store.clone();
    let mut remaining = Vec::new();
    for _ in 0..100 {
        remaining = store.tasks(1, TaskCategory::Timer).await;
        if remaining.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remaining.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![102]);

    clock.advance(chrono::Duration::seconds(10));
    assert!(wait_for_ack(&processor, TaskKey::new(start + 10_000, 102)).await);
    for _ in 0..100 {
        if store.task_count(1, TaskCategory::Timer).await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.task_count(1, TaskCategory::Timer).await, 0);
    processor.stop().await;
}

#[tokio::test]
async fn test_poison_task_is_dead_lettered_once_and_acked() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .executor
        .always_fail(3, HistoryError::non_retryable("corrupted"));
    harness
        .put((1..=5).map(|id| transfer(id, "local")).collect())
        .await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();

    assert!(wait_for_ack(&processor, TaskKey::immediate(5)).await);
    assert_eq!(harness.executor.execution_count(3), 1);
    let page = harness.dlq.read(1, TaskCategory::Transfer, None, None).await.unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].task.task_id, 3);
    processor.stop().await;
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries_then_dead_letter() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .executor
        .always_fail(2, HistoryError::persistence("unavailable"));
    harness.put(vec![transfer(1, "local"), transfer(2, "local")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();

    assert!(wait_for_ack(&processor, TaskKey::immediate(2)).await);
    // 首次执行加两次重试
    assert_eq!(harness.executor.execution_count(2), 3);
    assert_eq!(harness.dlq.size(1, TaskCategory::Transfer).await.unwrap(), 1);
    processor.stop().await;
}

#[tokio::test]
async fn test_failed_dead_letter_write_holds_ack_until_retried() {
    let harness = Harness::new(scheduler_config()).await;
    harness.dlq_store.fail_next(5);
    harness
        .executor
        .always_fail(1, HistoryError::non_retryable("bad"));
    harness.put(vec![transfer(1, "local"), transfer(2, "local")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();

    assert!(wait_until(WAIT, || processor.describe().dead_letter_pending == 1).await);
    assert!(processor.describe().ack_level < TaskKey::immediate(1));

    assert!(wait_for_ack(&processor, TaskKey::immediate(2)).await);
    assert_eq!(processor.describe().dead_letter_pending, 0);
    assert_eq!(harness.dlq_store.dlq_size(1, TaskCategory::Transfer).await.unwrap(), 1);
    processor.stop().await;
}

#[tokio::test]
async fn test_tasks_of_other_role_are_skipped_and_acked() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .put(vec![transfer(1, "local"), transfer(2, "remote"), transfer(3, "local")])
        .await;

    let active = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    let standby = harness.processor(TaskCategory::Transfer, ClusterRole::Standby, options());
    active.start().await.unwrap();
    standby.start().await.unwrap();

    assert!(wait_for_ack(&active, TaskKey::immediate(3)).await);
    assert!(wait_for_ack(&standby, TaskKey::immediate(3)).await);

    let executions = harness.executor.executions();
    let active_ids: Vec<i64> = executions
        .iter()
        .filter(|e| e.role == ClusterRole::Active)
        .map(|e| e.task_id)
        .collect();
    let standby_ids: Vec<i64> = executions
        .iter()
        .filter(|e| e.role == ClusterRole::Standby)
        .map(|e| e.task_id)
        .collect();
    assert_eq!(active_ids.len(), 2);
    assert!(!active_ids.contains(&2));
    assert_eq!(standby_ids, vec![2]);

    active.stop().await;
    standby.stop().await;
}

#[tokio::test]
async fn test_unknown_domain_is_treated_as_obsolete() {
    let harness = Harness::new(scheduler_config()).await;
    harness.put(vec![transfer(1, "deleted-domain")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();

    assert!(wait_for_ack(&processor, TaskKey::immediate(1)).await);
    assert_eq!(harness.executor.execution_count(1), 0);
    assert_eq!(harness.dlq.size(1, TaskCategory::Transfer).await.unwrap(), 0);
    processor.stop().await;
}

#[tokio::test]
async fn test_standby_task_escalates_to_resync_and_never_dead_letters() {
    let harness = Harness::new(scheduler_config()).await;
    harness.executor.always_fail(
        7,
        HistoryError::ResyncRequired {
            domain_id: "remote".into(),
            workflow_id: "wf-7".into(),
            run_id: "run".into(),
            start_event_id: 10,
            end_event_id: 20,
        },
    );
    harness.put(vec![transfer(7, "remote")]).await;

    let mut opts = options();
    opts.queue.standby_verification = StandbyVerificationPolicy::Resync;
    opts.queue.standby_escalation_attempts = 1;
    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Standby, opts);
    processor.start().await.unwrap();

    assert!(wait_until(WAIT, || !harness.resyncer.requests().is_empty()).await);
    let request = &harness.resyncer.requests()[0];
    assert_eq!(request.workflow_id, "wf-7");
    assert_eq!(request.start_event_id, 10);

    // 超过调度器重试上限后仍然重新分发
    assert!(wait_until(WAIT, || harness.executor.execution_count(7) > 4).await);
    assert_eq!(harness.dlq.size(1, TaskCategory::Transfer).await.unwrap(), 0);
    assert!(processor.describe().ack_level < TaskKey::immediate(7));

    harness.executor.clear_failure(7);
    assert!(wait_for_ack(&processor, TaskKey::immediate(7)).await);
    processor.stop().await;
}

#[tokio::test]
async fn test_alert_only_policy_does_not_resync() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .executor
        .script(8, vec![Err(HistoryError::StandbyTaskPending("lagging".into()))]);
    harness.put(vec![transfer(8, "remote")]).await;

    let mut opts = options();
    opts.queue.standby_verification = StandbyVerificationPolicy::AlertOnly;
    opts.queue.standby_escalation_attempts = 1;
    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Standby, opts);
    processor.start().await.unwrap();

    assert!(wait_for_ack(&processor, TaskKey::immediate(8)).await);
    assert!(harness.resyncer.requests().is_empty());
    processor.stop().await;
}

#[tokio::test]
async fn test_fencing_failure_marks_ownership_lost_and_stops_loop() {
    let harness = Harness::new(scheduler_config()).await;
    harness.put(vec![transfer(1, "local")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();
    assert!(wait_for_ack(&processor, TaskKey::immediate(1)).await);

    harness
        .shard
        .fail_updates_with(HistoryError::ownership_lost(1, "host-b"));
    assert!(wait_until(WAIT, || harness.shard.is_ownership_lost()).await);
    assert!(!harness.shard.is_valid());

    harness.put(vec![transfer(2, "local")]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.executor.execution_count(2), 0);
    processor.stop().await;
    assert_eq!(processor.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_non_fencing_persistence_failure_keeps_processing() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .shard
        .fail_updates_with(HistoryError::persistence("write timeout"));
    harness.put(vec![transfer(1, "local")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();

    assert!(wait_for_ack(&processor, TaskKey::immediate(1)).await);
    assert!(!harness.shard.is_ownership_lost());
    assert_eq!(harness.shard.state_updates(), 0);
    processor.stop().await;
}

#[tokio::test]
async fn test_late_timer_below_ack_level_is_replayed() {
    let start = 1_700_000_000_000;
    let clock = Arc::new(ManualTimeSource::new(
        Utc.timestamp_millis_opt(start).single().unwrap(),
    ));
    let harness = Harness::with_shard(
        TestShardContext::new(1, LOCAL),
        scheduler_config(),
        clock.clone(),
    )
    .await;
    harness
        .put(vec![TaskBuilder::timer(100, start).with_domain("local").build()])
        .await;

    let processor = harness.processor(TaskCategory::Timer, ClusterRole::Active, options());
    processor.start().await.unwrap();
    assert!(wait_for_ack(&processor, TaskKey::new(start, 100)).await);

    let late = TaskBuilder::timer(99, start - 5_000)
        .with_domain("local")
        .build();
    harness.put(vec![late.clone()]).await;
    processor.notify_new_tasks(vec![late]).await.unwrap();

    assert!(wait_until(WAIT, || harness.executor.execution_count(99) == 1).await);
    processor.stop().await;
}

#[tokio::test]
async fn test_selected_domain_is_split_into_its_own_queue() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .put(vec![transfer(1, "local"), transfer(2, "vip"), transfer(3, "local")])
        .await;

    let mut opts = options();
    opts.queue.split_interval_ms = 20;
    opts.split = SplitConfig {
        enabled: true,
        selected_domains: vec!["vip".to_string()],
        ..Default::default()
    };
    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, opts);
    processor.start().await.unwrap();

    assert!(wait_until(WAIT, || processor.describe().queues.len() == 2).await);
    assert!(wait_for_ack(&processor, TaskKey::immediate(3)).await);

    let snapshot = processor.describe();
    let vip = DomainFilter::include(["vip"]);
    assert!(snapshot
        .queues
        .iter()
        .any(|q| q.state.domain_filter == vip && q.state.level == 1));
    // 受保护的域不会被合并回去
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.describe().queues.len(), 2);
    assert_eq!(
        harness
            .shard
            .stored_states(TaskCategory::Transfer, ClusterRole::Active)
            .len(),
        2
    );
    processor.stop().await;
}

#[tokio::test]
async fn test_reset_collapses_to_single_root_queue() {
    let shard = TestShardContext::new(1, LOCAL).with_queue_states(
        TaskCategory::Transfer,
        ClusterRole::Active,
        vec![
            ProcessingQueueState::new(0, TaskKey::immediate(3), TaskKey::immediate(3), DomainFilter::exclude(["vip"])),
            ProcessingQueueState::new(1, TaskKey::immediate(1), TaskKey::immediate(1), DomainFilter::include(["vip"])),
        ],
    );
    let harness = Harness::with_shard(shard, scheduler_config(), Arc::new(RealTimeSource)).await;
    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();
    assert_eq!(processor.describe().queues.len(), 2);

    processor.reset().await.unwrap();

    let snapshot = processor.describe();
    assert_eq!(snapshot.queues.len(), 1);
    assert_eq!(snapshot.queues[0].state.level, 0);
    assert!(snapshot.queues[0].state.domain_filter.is_universal());
    assert_eq!(
        harness
            .shard
            .stored_states(TaskCategory::Transfer, ClusterRole::Active)
            .len(),
        1
    );
    processor.stop().await;
}

#[tokio::test]
async fn test_busy_scheduler_redispatches_in_order() {
    let config = TaskSchedulerConfig {
        worker_count: 1,
        queue_size: 1,
        ..scheduler_config()
    };
    let harness = Harness::new(config).await;
    harness.executor.set_delay(Duration::from_millis(5));
    let tasks: Vec<Task> = (1..=8)
        .map(|id| {
            TaskBuilder::transfer(id)
                .with_domain("local")
                .with_workflow("wf-same", "run")
                .build()
        })
        .collect();
    harness.put(tasks).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();

    assert!(wait_for_ack(&processor, TaskKey::immediate(8)).await);
    assert_eq!(harness.executor.executed_ids(), (1..=8).collect::<Vec<_>>());
    processor.stop().await;
}

#[tokio::test]
async fn test_outstanding_limit_throttles_reads() {
    let harness = Harness::new(scheduler_config()).await;
    harness.executor.set_delay(Duration::from_millis(150));
    harness
        .put((1..=5).map(|id| transfer(id, "local")).collect())
        .await;

    let mut opts = options();
    opts.queue.batch_size = 2;
    opts.queue.max_outstanding_per_queue = 2;
    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, opts);
    processor.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(harness.executor.executions().len(), 2);

    assert!(wait_for_ack(&processor, TaskKey::immediate(5)).await);
    processor.stop().await;
}

#[tokio::test]
async fn test_dlq_merge_replays_through_processor() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .executor
        .always_fail(4, HistoryError::non_retryable("bad payload"));
    harness.put(vec![transfer(4, "local")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();
    assert!(wait_for_ack(&processor, TaskKey::immediate(4)).await);
    assert_eq!(harness.dlq.size(1, TaskCategory::Transfer).await.unwrap(), 1);

    harness.executor.clear_failure(4);
    let replayed = harness
        .dlq
        .merge(1, TaskCategory::Transfer, None, &processor)
        .await
        .unwrap();
    assert_eq!(replayed, 1);
    assert!(wait_until(WAIT, || harness.executor.execution_count(4) == 2).await);
    assert_eq!(harness.dlq.size(1, TaskCategory::Transfer).await.unwrap(), 0);
    processor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_merge_keeps_task_that_fails_again() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .executor
        .always_fail(4, HistoryError::non_retryable("bad payload"));
    harness.put(vec![transfer(4, "local")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();
    assert!(wait_for_ack(&processor, TaskKey::immediate(4)).await);

    let mut previous_message_id = 0;
    for round in 0..10 {
        let replayed = harness
            .dlq
            .merge(1, TaskCategory::Transfer, None, &processor)
            .await
            .unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(harness.executor.execution_count(4), round + 2);

        // 合并返回时任务已经以新的消息ID重新写入
        let page = harness.dlq.read(1, TaskCategory::Transfer, None, None).await.unwrap();
        assert_eq!(page.entries.len(), 1, "第 {round} 轮合并后死信丢失");
        assert_eq!(page.entries[0].task.task_id, 4);
        assert!(page.entries[0].message_id > previous_message_id);
        previous_message_id = page.entries[0].message_id;
    }
    processor.stop().await;
}

#[tokio::test]
async fn test_merge_keeps_entry_when_requeue_fails() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .executor
        .always_fail(4, HistoryError::non_retryable("bad payload"));
    harness.put(vec![transfer(4, "local")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();
    assert!(wait_for_ack(&processor, TaskKey::immediate(4)).await);
    let before = harness.dlq.read(1, TaskCategory::Transfer, None, None).await.unwrap();

    harness.dlq_store.fail_next(1);
    let result = harness
        .dlq
        .merge(1, TaskCategory::Transfer, None, &processor)
        .await;
    assert!(result.is_err());

    let after = harness.dlq.read(1, TaskCategory::Transfer, None, None).await.unwrap();
    assert_eq!(after.entries, before.entries);
    processor.stop().await;
}

#[tokio::test]
async fn test_merge_on_stopped_processor_keeps_entries() {
    let harness = Harness::new(scheduler_config()).await;
    harness
        .executor
        .always_fail(4, HistoryError::non_retryable("bad payload"));
    harness.put(vec![transfer(4, "local")]).await;

    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    processor.start().await.unwrap();
    assert!(wait_for_ack(&processor, TaskKey::immediate(4)).await);
    processor.stop().await;

    let result = harness
        .dlq
        .merge(1, TaskCategory::Transfer, None, &processor)
        .await;
    assert!(result.is_err());
    assert_eq!(harness.dlq.size(1, TaskCategory::Transfer).await.unwrap(), 1);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let harness = Harness::new(scheduler_config()).await;
    let processor = harness.processor(TaskCategory::Transfer, ClusterRole::Active, options());
    assert_eq!(processor.describe().lifecycle, LifecycleState::Idle);

    processor.start().await.unwrap();
    processor.start().await.unwrap();
    assert_eq!(processor.describe().lifecycle, LifecycleState::Running);

    processor.stop().await;
    processor.stop().await;
    assert_eq!(processor.state(), LifecycleState::Stopped);
    assert!(processor.notify_new_tasks(Vec::new()).await.is_err());
}

#[tokio::test]
async fn test_unsupported_category_role_pair_is_rejected() {
    let harness = Harness::new(scheduler_config()).await;
    let resources = QueueProcessorResources {
        task_store: harness.store.clone(),
        scheduler: harness.scheduler.clone(),
        executor: harness.executor.clone(),
        domains: harness.domains.clone(),
        dlq: harness.dlq.clone(),
        resyncer: None,
        time_source: harness.time.clone(),
    };
    let result = QueueProcessor::new(
        TaskCategory::CrossCluster,
        ClusterRole::Standby,
        harness.shard.clone(),
        resources,
        None,
    );
    assert!(matches!(result, Err(HistoryError::InvalidArgument(_))));
}
