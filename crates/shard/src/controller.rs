//! 分片控制器: 按成员关系获取和释放分片, 管理每个分片的引擎

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use history_config::ShardControllerConfig;
use history_core::{Lifecycle, LifecycleState};
use history_domain::{HistoryError, HistoryResult, MembershipResolver, ShardContext, ShardStore};
use history_observability::{metric_names, Scope, ScopedMetrics};
use history_replication::OwnedShards;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{OwnershipLost, ShardContextImpl};
use crate::engine::{Engine, EngineFactory};

/// 分片健康状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardHealth {
    Acquiring,
    Active,
    Unhealthy { error: String },
    Stopped,
}

impl fmt::Display for ShardHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardHealth::Acquiring => write!(f, "acquiring"),
            ShardHealth::Active => write!(f, "active"),
            ShardHealth::Unhealthy { error } => write!(f, "unhealthy: {error}"),
            ShardHealth::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStatus {
    pub health: ShardHealth,
    pub range_id: Option<i64>,
}

struct ShardItem {
    context: Arc<ShardContextImpl>,
    engine: Arc<dyn Engine>,
}

pub struct ShardController {
    host: String,
    current_cluster: String,
    num_shards: u32,
    config: ShardControllerConfig,
    shard_store: Arc<dyn ShardStore>,
    membership: Arc<dyn MembershipResolver>,
    factory: Arc<dyn EngineFactory>,
    shards: StdRwLock<HashMap<i32, ShardItem>>,
    status: StdRwLock<BTreeMap<i32, ShardStatus>>,
    /// 串行化获取和释放
    transitions: Mutex<()>,
    events_tx: mpsc::UnboundedSender<OwnershipLost>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<OwnershipLost>>>,
    lifecycle: Lifecycle,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    metrics: ScopedMetrics,
}

impl ShardController {
    pub fn new(
        host: impl Into<String>,
        current_cluster: impl Into<String>,
        num_shards: u32,
        shard_store: Arc<dyn ShardStore>,
        membership: Arc<dyn MembershipResolver>,
        factory: Arc<dyn EngineFactory>,
        config: Option<ShardControllerConfig>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            host: host.into(),
            current_cluster: current_cluster.into(),
            num_shards,
            config: config.unwrap_or_default(),
            shard_store,
            membership,
            factory,
            shards: StdRwLock::new(HashMap::new()),
            status: StdRwLock::new(BTreeMap::new()),
            transitions: Mutex::new(()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            lifecycle: Lifecycle::new(),
            token: CancellationToken::new(),
            handle: Mutex::new(None),
            metrics: ScopedMetrics::new(Scope::ShardController),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn current_cluster(&self) -> &str {
        &self.current_cluster
    }

    /// 获取本机应拥有的分片并启动成员关系监听
    pub async fn start(self: &Arc<Self>) {
        if !self.lifecycle.begin_start() {
            return;
        }
        let Some(events) = self.events_rx.lock().await.take() else {
            warn!(host = %self.host, "分片控制器不支持重新启动");
            return;
        };
        self.reconcile().await;
        let controller = Arc::clone(self);
        *self.handle.lock().await = Some(tokio::spawn(controller.listen(events)));
        self.lifecycle.finish_start();
        info!(
            host = %self.host,
            cluster = %self.current_cluster,
            owned = self.owned_shard_ids().len(),
            "分片控制器已启动"
        );
    }

    /// 停止监听并释放所有分片
    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        self.token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(host = %self.host, "成员关系监听循环异常退出: {}", e);
            }
        }
        for shard_id in self.owned_shard_ids() {
            self.release_shard(shard_id).await;
        }
        self.lifecycle.finish_stop();
        info!(host = %self.host, "分片控制器已停止");
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// 获取分片: 递增围栏令牌, 创建并启动引擎
    ///
    /// 并发获取冲突不是致命错误, 分片保持未获取状态。
    pub async fn acquire_shard(&self, shard_id: i32) -> HistoryResult<Arc<dyn Engine>> {
        let _guard = self.transitions.lock().await;
        if let Some(engine) = self.owned_engine(shard_id) {
            return Ok(engine);
        }
        // 残留的失效分片先清理
        self.remove_item(shard_id).await;

        self.set_status(shard_id, ShardHealth::Acquiring, None);
        let started = Instant::now();
        let context = match ShardContextImpl::acquire(
            shard_id,
            &self.host,
            &self.current_cluster,
            self.factory.standby_enabled(),
            Arc::clone(&self.shard_store),
            &self.config.acquire_retry,
            self.events_tx.clone(),
        )
        .await
        {
            Ok(context) => context,
            Err(e) => {
                if e.is_ownership_error() {
                    info!(shard_id, host = %self.host, "分片已被其他主机获取: {}", e);
                } else {
                    error!(shard_id, host = %self.host, "获取分片失败: {}", e);
                }
                self.set_status(shard_id, ShardHealth::Unhealthy { error: e.to_string() }, None);
                return Err(e);
            }
        };

        let engine = match self.start_engine(&context).await {
            Ok(engine) => engine,
            Err(e) => {
                error!(shard_id, "启动分片引擎失败: {}", e);
                context.close();
                self.set_status(shard_id, ShardHealth::Unhealthy { error: e.to_string() }, None);
                return Err(e);
            }
        };

        let range_id = context.range_id();
        self.shards
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                shard_id,
                ShardItem {
                    context,
                    engine: Arc::clone(&engine),
                },
            );
        self.set_status(shard_id, ShardHealth::Active, Some(range_id));
        self.metrics.inc(metric_names::SHARD_ITEM_CREATED);
        self.metrics
            .record_latency(metric_names::ACQUIRE_SHARDS_LATENCY, started.elapsed());
        Ok(engine)
    }

    async fn start_engine(&self, context: &Arc<ShardContextImpl>) -> HistoryResult<Arc<dyn Engine>> {
        let engine = self.factory.create_engine(Arc::clone(context))?;
        if let Err(e) = engine.start().await {
            engine.stop().await;
            return Err(e);
        }
        Ok(engine)
    }

    /// 释放分片: 停止引擎并取消分片上下文
    pub async fn release_shard(&self, shard_id: i32) {
        let _guard = self.transitions.lock().await;
        if self.remove_item(shard_id).await {
            self.set_status(shard_id, ShardHealth::Stopped, None);
        }
    }

    async fn remove_item(&self, shard_id: i32) -> bool {
        let item = self
            .shards
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&shard_id);
        let Some(item) = item else {
            return false;
        };
        let timeout = Duration::from_millis(self.config.close_timeout_ms);
        if tokio::time::timeout(timeout, item.engine.stop()).await.is_err() {
            warn!(shard_id, "关闭分片引擎超时");
        }
        item.context.close();
        self.metrics.inc(metric_names::SHARD_ITEM_REMOVED);
        self.metrics.inc(metric_names::SHARD_CLOSED_COUNT);
        info!(shard_id, range_id = item.context.range_id(), "分片已释放");
        true
    }

    /// 返回本机拥有的分片引擎; 未拥有时按成员关系决定是否获取
    pub async fn get_engine(&self, shard_id: i32) -> HistoryResult<Arc<dyn Engine>> {
        if let Some(engine) = self.owned_engine(shard_id) {
            return Ok(engine);
        }
        let owner = self.membership.lookup(shard_id).await?;
        if owner != self.host {
            return Err(HistoryError::ownership_lost(shard_id, owner));
        }
        self.acquire_shard(shard_id).await
    }

    /// 只返回已拥有且有效的分片引擎
    pub fn owned_engine(&self, shard_id: i32) -> Option<Arc<dyn Engine>> {
        self.shards
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&shard_id)
            .filter(|item| item.context.is_valid())
            .map(|item| Arc::clone(&item.engine))
    }

    pub fn owned_shard_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .shards
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn shard_status(&self) -> BTreeMap<i32, ShardStatus> {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_status(&self, shard_id: i32, health: ShardHealth, range_id: Option<i64>) {
        debug!(shard_id, health = %health, "分片状态变化");
        self.status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(shard_id, ShardStatus { health, range_id });
    }

    /// 按成员关系获取应拥有的分片, 释放不再属于本机的分片
    pub async fn reconcile(&self) {
        let started = Instant::now();
        let mut acquired = 0u64;
        for shard_id in 0..self.num_shards as i32 {
            if self.token.is_cancelled() {
                return;
            }
            let owner = match self.membership.lookup(shard_id).await {
                Ok(owner) => owner,
                Err(e) => {
                    debug!(shard_id, "查询分片归属失败: {}", e);
                    continue;
                }
            };
            let owned = self.owned_engine(shard_id).is_some();
            if owner == self.host && !owned {
                if self.acquire_shard(shard_id).await.is_ok() {
                    acquired += 1;
                }
            } else if owner != self.host && owned {
                info!(shard_id, new_owner = %owner, "分片已分配给其他主机, 释放");
                self.release_shard(shard_id).await;
            }
        }
        self.metrics.add(metric_names::ACQUIRE_SHARDS_COUNT, acquired);
        self.metrics
            .record_latency(metric_names::ACQUIRE_SHARDS_LATENCY, started.elapsed());
    }

    async fn handle_ownership_lost(&self, event: OwnershipLost) {
        let current = self
            .shards
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&event.shard_id)
            .map(|item| item.context.range_id());
        if current != Some(event.range_id) {
            debug!(shard_id = event.shard_id, "过期的所有权丢失事件, 忽略");
            return;
        }
        warn!(
            shard_id = event.shard_id,
            range_id = event.range_id,
            "分片所有权丢失, 关闭分片: {}",
            event.reason
        );
        let _guard = self.transitions.lock().await;
        self.remove_item(event.shard_id).await;
        self.set_status(
            event.shard_id,
            ShardHealth::Unhealthy { error: event.reason },
            Some(event.range_id),
        );
    }

    async fn listen(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<OwnershipLost>) {
        let mut membership = self.membership.subscribe();
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.membership_poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;
        let mut membership_open = true;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(event) = events.recv() => self.handle_ownership_lost(event).await,
                changed = membership.changed(), if membership_open => {
                    if changed.is_err() {
                        warn!(host = %self.host, "成员关系通知已关闭, 只按间隔轮询");
                        membership_open = false;
                        continue;
                    }
                    self.reconcile().await;
                }
                _ = poll.tick() => self.reconcile().await,
            }
        }
        debug!(host = %self.host, "成员关系监听循环已退出");
    }
}

impl OwnedShards for ShardController {
    fn owned_shards(&self) -> Vec<Arc<dyn ShardContext>> {
        self.shards
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|item| item.context.is_valid())
            .map(|item| Arc::clone(&item.context) as Arc<dyn ShardContext>)
            .collect()
    }
}
