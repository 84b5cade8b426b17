//! 分片上下文: 持有围栏令牌和分片元数据, 所有分片级写入都带 range_id 条件

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use history_core::{retry_with_policy, RetryPolicy};
use history_domain::{
    ClusterRole, HistoryError, HistoryResult, ProcessingQueueState, ShardContext, ShardInfo,
    ShardStore, TaskCategory, TaskKey,
};
use history_observability::{metric_names, Scope, ScopedMetrics};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 分片上下文向控制器报告的事件
#[derive(Debug, Clone)]
pub struct OwnershipLost {
    pub shard_id: i32,
    pub range_id: i64,
    pub reason: String,
}

pub struct ShardContextImpl {
    shard_id: i32,
    owner: String,
    current_cluster: String,
    store: Arc<dyn ShardStore>,
    info: Mutex<ShardInfo>,
    range_id: i64,
    token: CancellationToken,
    /// 每个类别参与确认位置计算的角色
    expected_roles: HashMap<TaskCategory, Vec<ClusterRole>>,
    reported: StdMutex<HashMap<(TaskCategory, ClusterRole), TaskKey>>,
    events: mpsc::UnboundedSender<OwnershipLost>,
    metrics: ScopedMetrics,
}

impl ShardContextImpl {
    /// 获取分片: 读取元数据, range_id 加一后条件写回
    ///
    /// 并发获取时只有一方的条件写成功, 另一方得到 `StaleRangeId`。
    pub async fn acquire(
        shard_id: i32,
        owner: &str,
        current_cluster: &str,
        standby_enabled: bool,
        store: Arc<dyn ShardStore>,
        retry: &RetryPolicy,
        events: mpsc::UnboundedSender<OwnershipLost>,
    ) -> HistoryResult<Arc<Self>> {
        let info = retry_with_policy(retry, "获取分片", || {
            let store = Arc::clone(&store);
            async move {
                let mut info = store.get_or_create_shard(shard_id, owner).await?;
                let previous = info.range_id;
                info.range_id = previous + 1;
                info.owner = owner.to_string();
                store.update_shard(&info, previous).await?;
                Ok(info)
            }
        })
        .await?;

        let mut expected_roles = HashMap::new();
        let queue_roles = if standby_enabled {
            vec![ClusterRole::Active, ClusterRole::Standby]
        } else {
            vec![ClusterRole::Active]
        };
        expected_roles.insert(TaskCategory::Transfer, queue_roles.clone());
        expected_roles.insert(TaskCategory::Timer, queue_roles);
        expected_roles.insert(TaskCategory::CrossCluster, vec![ClusterRole::Active]);

        info!(shard_id, owner, range_id = info.range_id, "分片获取成功");
        Ok(Arc::new(Self {
            shard_id,
            owner: owner.to_string(),
            current_cluster: current_cluster.to_string(),
            store,
            range_id: info.range_id,
            info: Mutex::new(info),
            token: CancellationToken::new(),
            expected_roles,
            reported: StdMutex::new(HashMap::new()),
            events,
            metrics: ScopedMetrics::new(Scope::ShardInfo).tagged("shard_id", shard_id.to_string()),
        }))
    }

    /// 关闭分片, 不上报所有权丢失
    pub fn close(&self) {
        self.token.cancel();
    }

    pub async fn snapshot(&self) -> ShardInfo {
        self.info.lock().await.clone()
    }

    /// 类别内所有参与角色的最小确认位置, 尚未上报的角色按最小值计算
    fn overall_ack_level(&self, category: TaskCategory, role: ClusterRole) -> TaskKey {
        let reported = self
            .reported
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let own = [role];
        let roles = self
            .expected_roles
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&own);
        roles
            .iter()
            .map(|r| reported.get(&(category, *r)).copied().unwrap_or(TaskKey::MIN))
            .min()
            .unwrap_or(TaskKey::MIN)
    }

    /// 带围栏写入分片元数据, 成功后替换内存副本
    async fn persist<F>(&self, mutate: F) -> HistoryResult<()>
    where
        F: FnOnce(&mut ShardInfo),
    {
        let mut info = self.info.lock().await;
        let mut updated = info.clone();
        mutate(&mut updated);
        match self.store.update_shard(&updated, self.range_id()).await {
            Ok(()) => {
                *info = updated;
                Ok(())
            }
            Err(e) => {
                if e.is_ownership_error() {
                    self.mark_ownership_lost(&e);
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ShardContext for ShardContextImpl {
    fn shard_id(&self) -> i32 {
        self.shard_id
    }

    fn range_id(&self) -> i64 {
        self.range_id
    }

    fn owner(&self) -> String {
        self.owner.clone()
    }

    fn current_cluster(&self) -> String {
        self.current_cluster.clone()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn queue_states(&self, category: TaskCategory, role: ClusterRole) -> Vec<ProcessingQueueState> {
        let info = self.info.lock().await;
        match info.queue_states.get(&ShardInfo::queue_state_key(category, role)) {
            Some(states) if !states.is_empty() => states.clone(),
            _ => {
                let ack_level = info.ack_levels.get(&category).copied().unwrap_or(TaskKey::MIN);
                vec![ProcessingQueueState::root(ack_level)]
            }
        }
    }

    async fn update_queue_states(
        &self,
        category: TaskCategory,
        role: ClusterRole,
        states: Vec<ProcessingQueueState>,
    ) -> HistoryResult<()> {
        let overall = self.overall_ack_level(category, role);
        self.persist(|info| {
            info.queue_states
                .insert(ShardInfo::queue_state_key(category, role), states);
            if overall != TaskKey::MIN {
                let level = info.ack_levels.entry(category).or_insert(overall);
                *level = (*level).max(overall);
            }
        })
        .await?;
        debug!(shard_id = self.shard_id, category = %category, role = %role, "队列状态已持久化");
        Ok(())
    }

    async fn report_ack_level(&self, category: TaskCategory, role: ClusterRole, level: TaskKey) -> TaskKey {
        self.reported
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((category, role), level);
        self.overall_ack_level(category, role)
    }

    async fn replication_ack_level(&self, cluster: &str) -> i64 {
        self.info
            .lock()
            .await
            .replication_ack_levels
            .get(cluster)
            .copied()
            .unwrap_or(0)
    }

    async fn update_replication_ack_level(&self, cluster: &str, message_id: i64) -> HistoryResult<()> {
        self.persist(|info| {
            let level = info
                .replication_ack_levels
                .entry(cluster.to_string())
                .or_insert(message_id);
            *level = (*level).max(message_id);
        })
        .await
    }

    fn mark_ownership_lost(&self, error: &HistoryError) {
        if self.token.is_cancelled() {
            return;
        }
        warn!(
            shard_id = self.shard_id,
            range_id = self.range_id(),
            "分片所有权丢失: {}",
            error
        );
        self.metrics.inc(metric_names::SHARD_OWNERSHIP_LOST);
        self.token.cancel();
        let event = OwnershipLost {
            shard_id: self.shard_id,
            range_id: self.range_id(),
            reason: error.to_string(),
        };
        if self.events.send(event).is_err() {
            debug!(shard_id = self.shard_id, "分片控制器已退出, 不再上报所有权丢失");
        }
    }
}
