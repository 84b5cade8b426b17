//! Test doubles for the collaborator traits
//!
//! Hand-written fakes keep state that tests inspect afterwards; the
//! `mockall` mocks at the bottom are for expectation-style tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use history_domain::{
    ClusterRole, DlqEntry, DlqPage, DlqReadRequest, DlqStore, DomainRegistry, ExecutionContext,
    GetCrossClusterTasksRequest, GetCrossClusterTasksResponse, GetReplicationMessagesRequest,
    HistoryError, HistoryResult, ProcessingQueueState, RemoteAdminClient,
    ReplicationApplier, ReplicationMessages, ReplicationTask, ResendRequest,
    RespondCrossClusterTasksCompletedRequest, RespondCrossClusterTasksCompletedResponse,
    Resyncer, ShardContext, Task, TaskCategory, TaskExecutor, TaskKey,
};
use mockall::mock;
use tokio_util::sync::CancellationToken;

/// One recorded call to [`ScriptedTaskExecutor`]
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub task_id: i64,
    pub role: ClusterRole,
    pub attempt: u32,
    pub range_id: i64,
}

/// Executor whose results are scripted per task id; unscripted tasks succeed
#[derive(Default)]
pub struct ScriptedTaskExecutor {
    scripts: Mutex<HashMap<i64, VecDeque<HistoryResult<()>>>>,
    always: Mutex<HashMap<i64, HistoryError>>,
    executions: Mutex<Vec<Execution>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results returned in order for successive executions of `task_id`
    pub fn script(&self, task_id: i64, results: Vec<HistoryResult<()>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id, results.into_iter().collect());
    }

    pub fn always_fail(&self, task_id: i64, error: HistoryError) {
        self.always.lock().unwrap().insert(task_id, error);
    }

    pub fn clear_failure(&self, task_id: i64) {
        self.always.lock().unwrap().remove(&task_id);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().clone()
    }

    pub fn execution_count(&self, task_id: i64) -> usize {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.task_id == task_id)
            .count()
    }

    pub fn executed_ids(&self) -> Vec<i64> {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.task_id)
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedTaskExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> HistoryResult<()> {
        self.executions.lock().unwrap().push(Execution {
            task_id: task.task_id,
            role: ctx.role,
            attempt: ctx.attempt,
            range_id: ctx.range_id,
        });
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.always.lock().unwrap().get(&task.task_id) {
            return Err(error.clone());
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&task.task_id)
            .and_then(|results| results.pop_front())
            .unwrap_or(Ok(()))
    }
}

/// Domain registry backed by a fixed map
#[derive(Default)]
pub struct StaticDomainRegistry {
    domains: Mutex<HashMap<String, String>>,
}

impl StaticDomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(self, domain_id: &str, active_cluster: &str) -> Self {
        self.set_active(domain_id, active_cluster);
        self
    }

    /// Simulates a failover
    pub fn set_active(&self, domain_id: &str, active_cluster: &str) {
        self.domains
            .lock()
            .unwrap()
            .insert(domain_id.to_string(), active_cluster.to_string());
    }
}

#[async_trait]
impl DomainRegistry for StaticDomainRegistry {
    async fn active_cluster(&self, domain_id: &str) -> HistoryResult<String> {
        self.domains
            .lock()
            .unwrap()
            .get(domain_id)
            .cloned()
            .ok_or_else(|| HistoryError::DomainNotFound(domain_id.to_string()))
    }
}

#[derive(Default)]
pub struct RecordingResyncer {
    requests: Mutex<Vec<ResendRequest>>,
}

impl RecordingResyncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ResendRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Resyncer for RecordingResyncer {
    async fn resend(&self, request: &ResendRequest) -> HistoryResult<()> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// In-memory shard context for exercising processors without a controller
pub struct TestShardContext {
    shard_id: i32,
    range_id: AtomicI64,
    owner: String,
    cluster: String,
    token: CancellationToken,
    queue_states: Mutex<HashMap<(TaskCategory, ClusterRole), Vec<ProcessingQueueState>>>,
    ack_levels: Mutex<HashMap<(TaskCategory, ClusterRole), TaskKey>>,
    replication_acks: Mutex<HashMap<String, i64>>,
    update_error: Mutex<Option<HistoryError>>,
    ownership_lost: AtomicBool,
    state_updates: AtomicUsize,
}

impl TestShardContext {
    pub fn new(shard_id: i32, cluster: &str) -> Self {
        Self {
            shard_id,
            range_id: AtomicI64::new(1),
            owner: "test-host".to_string(),
            cluster: cluster.to_string(),
            token: CancellationToken::new(),
            queue_states: Mutex::new(HashMap::new()),
            ack_levels: Mutex::new(HashMap::new()),
            replication_acks: Mutex::new(HashMap::new()),
            update_error: Mutex::new(None),
            ownership_lost: AtomicBool::new(false),
            state_updates: AtomicUsize::new(0),
        }
    }

    pub fn with_queue_states(
        self,
        category: TaskCategory,
        role: ClusterRole,
        states: Vec<ProcessingQueueState>,
    ) -> Self {
        self.queue_states
            .lock()
            .unwrap()
            .insert((category, role), states);
        self
    }

    /// Subsequent persistence calls fail with `error`
    pub fn fail_updates_with(&self, error: HistoryError) {
        *self.update_error.lock().unwrap() = Some(error);
    }

    pub fn stored_states(&self, category: TaskCategory, role: ClusterRole) -> Vec<ProcessingQueueState> {
        self.queue_states
            .lock()
            .unwrap()
            .get(&(category, role))
            .cloned()
            .unwrap_or_default()
    }

    pub fn reported_ack_level(&self, category: TaskCategory, role: ClusterRole) -> Option<TaskKey> {
        self.ack_levels.lock().unwrap().get(&(category, role)).copied()
    }

    pub fn state_updates(&self) -> usize {
        self.state_updates.load(Ordering::SeqCst)
    }

    pub fn is_ownership_lost(&self) -> bool {
        self.ownership_lost.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    fn check_update(&self) -> HistoryResult<()> {
        match self.update_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ShardContext for TestShardContext {
    fn shard_id(&self) -> i32 {
        self.shard_id
    }

    fn range_id(&self) -> i64 {
        self.range_id.load(Ordering::SeqCst)
    }

    fn owner(&self) -> String {
        self.owner.clone()
    }

    fn current_cluster(&self) -> String {
        self.cluster.clone()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn queue_states(&self, category: TaskCategory, role: ClusterRole) -> Vec<ProcessingQueueState> {
        self.stored_states(category, role)
    }

    async fn update_queue_states(
        &self,
        category: TaskCategory,
        role: ClusterRole,
        states: Vec<ProcessingQueueState>,
    ) -> HistoryResult<()> {
        self.check_update()?;
        self.queue_states
            .lock()
            .unwrap()
            .insert((category, role), states);
        self.state_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn report_ack_level(&self, category: TaskCategory, role: ClusterRole, level: TaskKey) -> TaskKey {
        let mut levels = self.ack_levels.lock().unwrap();
        levels.insert((category, role), level);
        levels
            .iter()
            .filter(|((c, _), _)| *c == category)
            .map(|(_, level)| *level)
            .min()
            .unwrap_or(TaskKey::MIN)
    }

    async fn replication_ack_level(&self, cluster: &str) -> i64 {
        self.replication_acks
            .lock()
            .unwrap()
            .get(cluster)
            .copied()
            .unwrap_or(0)
    }

    async fn update_replication_ack_level(&self, cluster: &str, message_id: i64) -> HistoryResult<()> {
        self.check_update()?;
        self.replication_acks
            .lock()
            .unwrap()
            .insert(cluster.to_string(), message_id);
        Ok(())
    }

    fn mark_ownership_lost(&self, _error: &HistoryError) {
        self.ownership_lost.store(true, Ordering::SeqCst);
        self.token.cancel();
    }
}

/// Wraps a DLQ store and fails the next N enqueues
pub struct FaultyDlqStore {
    inner: Arc<dyn DlqStore>,
    failures_left: AtomicUsize,
}

impl FaultyDlqStore {
    pub fn new(inner: Arc<dyn DlqStore>) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl DlqStore for FaultyDlqStore {
    async fn enqueue_message_to_dlq(&self, entry: &DlqEntry) -> HistoryResult<i64> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(HistoryError::persistence("injected dlq failure"));
        }
        self.inner.enqueue_message_to_dlq(entry).await
    }

    async fn read_messages_from_dlq(&self, request: &DlqReadRequest) -> HistoryResult<DlqPage> {
        self.inner.read_messages_from_dlq(request).await
    }

    async fn range_delete_messages_from_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        inclusive_max_task_id: i64,
    ) -> HistoryResult<u64> {
        self.inner
            .range_delete_messages_from_dlq(shard_id, category, inclusive_max_task_id)
            .await
    }

    async fn delete_messages_from_dlq(
        &self,
        shard_id: i32,
        category: TaskCategory,
        message_ids: &[i64],
    ) -> HistoryResult<u64> {
        self.inner
            .delete_messages_from_dlq(shard_id, category, message_ids)
            .await
    }

    async fn dlq_size(&self, shard_id: i32, category: TaskCategory) -> HistoryResult<u64> {
        self.inner.dlq_size(shard_id, category).await
    }
}

/// Remote admin client that replays queued responses and records requests
#[derive(Default)]
pub struct ScriptedRemoteAdminClient {
    fetch_responses: Mutex<VecDeque<HistoryResult<GetCrossClusterTasksResponse>>>,
    fetch_requests: Mutex<Vec<GetCrossClusterTasksRequest>>,
    responds: Mutex<Vec<RespondCrossClusterTasksCompletedRequest>>,
    replication_pages: Mutex<VecDeque<HistoryResult<ReplicationMessages>>>,
    replication_requests: Mutex<Vec<GetReplicationMessagesRequest>>,
}

impl ScriptedRemoteAdminClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fetch_response(&self, response: HistoryResult<GetCrossClusterTasksResponse>) {
        self.fetch_responses.lock().unwrap().push_back(response);
    }

    pub fn push_tasks(&self, shard_id: i32, tasks: Vec<Task>) {
        let mut response = GetCrossClusterTasksResponse::default();
        response.tasks_by_shard.insert(shard_id, tasks);
        self.push_fetch_response(Ok(response));
    }

    pub fn push_replication_page(&self, page: HistoryResult<ReplicationMessages>) {
        self.replication_pages.lock().unwrap().push_back(page);
    }

    pub fn fetch_requests(&self) -> Vec<GetCrossClusterTasksRequest> {
        self.fetch_requests.lock().unwrap().clone()
    }

    pub fn responds(&self) -> Vec<RespondCrossClusterTasksCompletedRequest> {
        self.responds.lock().unwrap().clone()
    }

    pub fn replication_requests(&self) -> Vec<GetReplicationMessagesRequest> {
        self.replication_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteAdminClient for ScriptedRemoteAdminClient {
    async fn get_cross_cluster_tasks(
        &self,
        request: GetCrossClusterTasksRequest,
    ) -> HistoryResult<GetCrossClusterTasksResponse> {
        self.fetch_requests.lock().unwrap().push(request);
        self.fetch_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(GetCrossClusterTasksResponse::default()))
    }

    async fn respond_cross_cluster_tasks_completed(
        &self,
        request: RespondCrossClusterTasksCompletedRequest,
    ) -> HistoryResult<RespondCrossClusterTasksCompletedResponse> {
        let acknowledged = request.responses.len();
        self.responds.lock().unwrap().push(request);
        Ok(RespondCrossClusterTasksCompletedResponse {
            acknowledged,
            ignored: 0,
        })
    }

    async fn get_replication_messages(
        &self,
        request: GetReplicationMessagesRequest,
    ) -> HistoryResult<ReplicationMessages> {
        let last_retrieved = request.last_retrieved_message_id;
        self.replication_requests.lock().unwrap().push(request);
        self.replication_pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(ReplicationMessages {
                tasks: Vec::new(),
                last_retrieved_message_id: last_retrieved,
                has_more: false,
            }))
    }
}

mock! {
    pub ReplicationApplier {}

    #[async_trait]
    impl ReplicationApplier for ReplicationApplier {
        async fn apply(&self, task: &ReplicationTask) -> HistoryResult<()>;
    }
}

mock! {
    pub DomainRegistry {}

    #[async_trait]
    impl DomainRegistry for DomainRegistry {
        async fn active_cluster(&self, domain_id: &str) -> HistoryResult<String>;
    }
}
