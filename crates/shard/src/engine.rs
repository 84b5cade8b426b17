//! 单个分片的处理引擎: 组装该分片的全部队列处理器和复制组件

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use history_config::{CrossClusterConfig, ReplicationConfig};
use history_core::{Lifecycle, TimeSource};
use history_domain::{
    ClusterRole, CrossClusterTaskResponse, DlqPage, DomainRegistry, GetReplicationMessagesRequest,
    HistoryError, HistoryResult, RemoteClusterClients, ReplicationApplier, ReplicationMessages,
    ReplicationTask, RespondCrossClusterTasksCompletedResponse, Resyncer, ShardContext, Task,
    TaskCategory, TaskExecutor, TaskStore,
};
use history_queue::{
    DlqManager, ProcessorSnapshot, QueueProcessor, QueueProcessorOptions, QueueProcessorResources,
};
use history_replication::{
    CrossClusterOutbox, CrossClusterSourceExecutor, ReplicationDlqReplayer, ReplicationResources,
    ReplicationSnapshot, ReplicationTaskProcessor, ReplicationTaskSource,
};
use history_scheduler::TaskScheduler;
use tracing::{info, warn};

use crate::context::ShardContextImpl;

/// 分片对外提供的操作
#[async_trait]
pub trait Engine: Send + Sync {
    fn shard_id(&self) -> i32;

    fn range_id(&self) -> i64;

    async fn start(&self) -> HistoryResult<()>;

    async fn stop(&self);

    /// 带围栏写入新任务并通知对应类别的处理器
    async fn add_tasks(&self, tasks: Vec<Task>) -> HistoryResult<()>;

    async fn add_replication_tasks(&self, tasks: Vec<ReplicationTask>) -> HistoryResult<()>;

    fn describe_queue(&self, category: TaskCategory, role: ClusterRole) -> HistoryResult<ProcessorSnapshot>;

    async fn reset_queue(&self, category: TaskCategory, role: ClusterRole) -> HistoryResult<()>;

    fn describe_replication(&self) -> Vec<ReplicationSnapshot>;

    async fn read_dlq(
        &self,
        category: TaskCategory,
        page_token: Option<i64>,
        page_size: Option<usize>,
    ) -> HistoryResult<DlqPage>;

    async fn purge_dlq(&self, category: TaskCategory, up_to_task_id: i64) -> HistoryResult<u64>;

    async fn merge_dlq(&self, category: TaskCategory, up_to_task_id: Option<i64>) -> HistoryResult<usize>;

    /// 源集群侧: 取出发往 `target_cluster` 的跨集群任务
    async fn get_cross_cluster_tasks(
        &self,
        target_cluster: &str,
        watermark: i64,
        batch_size: usize,
    ) -> HistoryResult<Vec<Task>>;

    async fn respond_cross_cluster_tasks_completed(
        &self,
        target_cluster: &str,
        responses: Vec<CrossClusterTaskResponse>,
    ) -> HistoryResult<RespondCrossClusterTasksCompletedResponse>;

    async fn get_replication_messages(
        &self,
        request: &GetReplicationMessagesRequest,
    ) -> HistoryResult<ReplicationMessages>;
}

/// 所有分片共享的依赖
#[derive(Clone)]
pub struct EngineResources {
    pub task_store: Arc<dyn TaskStore>,
    pub dlq: Arc<DlqManager>,
    pub scheduler: Arc<TaskScheduler>,
    /// 源侧跨集群任务专用, 等待目标集群响应期间不占用共享调度器的工作者
    pub cross_cluster_scheduler: Arc<TaskScheduler>,
    pub executor: Arc<dyn TaskExecutor>,
    pub domains: Arc<dyn DomainRegistry>,
    pub resyncer: Option<Arc<dyn Resyncer>>,
    pub applier: Arc<dyn ReplicationApplier>,
    pub remote_clients: Arc<dyn RemoteClusterClients>,
    pub time_source: Arc<dyn TimeSource>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub queue: QueueProcessorOptions,
    pub cross_cluster: CrossClusterConfig,
    pub replication: ReplicationConfig,
    pub remote_clusters: Vec<String>,
}

/// 控制器通过工厂为新获取的分片创建引擎
pub trait EngineFactory: Send + Sync {
    fn create_engine(&self, shard: Arc<ShardContextImpl>) -> HistoryResult<Arc<dyn Engine>>;

    /// 是否为转移和定时队列创建备用处理器
    fn standby_enabled(&self) -> bool;
}

pub struct HistoryEngineFactory {
    resources: EngineResources,
    options: EngineOptions,
}

impl HistoryEngineFactory {
    pub fn new(resources: EngineResources, options: EngineOptions) -> Self {
        Self { resources, options }
    }
}

impl EngineFactory for HistoryEngineFactory {
    fn create_engine(&self, shard: Arc<ShardContextImpl>) -> HistoryResult<Arc<dyn Engine>> {
        let engine = HistoryEngine::new(shard, self.resources.clone(), self.options.clone())?;
        Ok(Arc::new(engine))
    }

    fn standby_enabled(&self) -> bool {
        !self.options.remote_clusters.is_empty()
    }
}

pub struct HistoryEngine {
    shard: Arc<ShardContextImpl>,
    resources: EngineResources,
    processors: Vec<Arc<QueueProcessor>>,
    outbox: Arc<CrossClusterOutbox>,
    replication_processors: Vec<ReplicationTaskProcessor>,
    replication_source: ReplicationTaskSource,
    lifecycle: Lifecycle,
}

impl HistoryEngine {
    pub fn new(
        shard: Arc<ShardContextImpl>,
        resources: EngineResources,
        options: EngineOptions,
    ) -> HistoryResult<Self> {
        let shard_ctx: Arc<dyn ShardContext> = shard.clone();
        let outbox = Arc::new(CrossClusterOutbox::new(shard.shard_id()));
        let queue_resources = |scheduler: &Arc<TaskScheduler>, executor: Arc<dyn TaskExecutor>| QueueProcessorResources {
            task_store: Arc::clone(&resources.task_store),
            scheduler: Arc::clone(scheduler),
            executor,
            domains: Arc::clone(&resources.domains),
            dlq: Arc::clone(&resources.dlq),
            resyncer: resources.resyncer.clone(),
            time_source: Arc::clone(&resources.time_source),
        };

        let mut roles = vec![ClusterRole::Active];
        if !options.remote_clusters.is_empty() {
            roles.push(ClusterRole::Standby);
        }
        let mut processors = Vec::new();
        for category in [TaskCategory::Transfer, TaskCategory::Timer] {
            for role in &roles {
                processors.push(Arc::new(QueueProcessor::new(
                    category,
                    *role,
                    Arc::clone(&shard_ctx),
                    queue_resources(&resources.scheduler, Arc::clone(&resources.executor)),
                    Some(options.queue.clone()),
                )?));
            }
        }
        if options.cross_cluster.enabled {
            let executor = Arc::new(CrossClusterSourceExecutor::new(
                Arc::clone(&outbox),
                Duration::from_millis(options.cross_cluster.source_task_timeout_ms),
            ));
            processors.push(Arc::new(QueueProcessor::new(
                TaskCategory::CrossCluster,
                ClusterRole::Active,
                Arc::clone(&shard_ctx),
                queue_resources(&resources.cross_cluster_scheduler, executor),
                Some(options.queue.clone()),
            )?));
        }

        let mut replication_processors = Vec::new();
        if options.replication.enabled {
            for cluster in &options.remote_clusters {
                let client = match resources.remote_clients.admin_client(cluster) {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(shard_id = shard.shard_id(), cluster = %cluster, "远端集群没有可用客户端, 跳过复制: {}", e);
                        continue;
                    }
                };
                replication_processors.push(ReplicationTaskProcessor::new(
                    Arc::clone(&shard_ctx),
                    cluster.clone(),
                    client,
                    ReplicationResources {
                        scheduler: Arc::clone(&resources.scheduler),
                        applier: Arc::clone(&resources.applier),
                        resyncer: resources.resyncer.clone(),
                        dlq: Arc::clone(&resources.dlq),
                        time_source: Arc::clone(&resources.time_source),
                    },
                    Some(options.replication.clone()),
                ));
            }
        }

        let replication_source = ReplicationTaskSource::new(
            Arc::clone(&shard_ctx),
            Arc::clone(&resources.task_store),
            options.remote_clusters.clone(),
        );

        Ok(Self {
            shard,
            resources,
            processors,
            outbox,
            replication_processors,
            replication_source,
            lifecycle: Lifecycle::new(),
        })
    }

    fn processor(&self, category: TaskCategory, role: ClusterRole) -> HistoryResult<&Arc<QueueProcessor>> {
        self.processors
            .iter()
            .find(|p| p.category() == category && p.role() == role)
            .ok_or_else(|| {
                HistoryError::invalid_argument(format!(
                    "分片 {} 没有 {}/{} 队列处理器",
                    self.shard.shard_id(),
                    category,
                    role
                ))
            })
    }

    fn ensure_valid(&self) -> HistoryResult<()> {
        if self.shard.is_valid() {
            Ok(())
        } else {
            Err(HistoryError::ShardNotOwned {
                shard_id: self.shard.shard_id(),
            })
        }
    }
}

#[async_trait]
impl Engine for HistoryEngine {
    fn shard_id(&self) -> i32 {
        self.shard.shard_id()
    }

    fn range_id(&self) -> i64 {
        self.shard.range_id()
    }

    async fn start(&self) -> HistoryResult<()> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }
        for processor in &self.processors {
            processor.start().await?;
        }
        for processor in &self.replication_processors {
            processor.start().await?;
        }
        self.lifecycle.finish_start();
        info!(
            shard_id = self.shard.shard_id(),
            range_id = self.shard.range_id(),
            queue_processors = self.processors.len(),
            replication_processors = self.replication_processors.len(),
            "分片引擎已启动"
        );
        Ok(())
    }

    async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        futures::future::join_all(self.processors.iter().map(|p| p.stop())).await;
        futures::future::join_all(self.replication_processors.iter().map(|p| p.stop())).await;
        self.outbox.close().await;
        self.lifecycle.finish_stop();
        info!(shard_id = self.shard.shard_id(), "分片引擎已停止");
    }

    async fn add_tasks(&self, tasks: Vec<Task>) -> HistoryResult<()> {
        self.ensure_valid()?;
        if tasks.is_empty() {
            return Ok(());
        }
        if let Some(task) = tasks.iter().find(|t| t.category == TaskCategory::Replication) {
            return Err(HistoryError::invalid_argument(format!(
                "复制任务 {} 需要通过 add_replication_tasks 写入",
                task.task_id
            )));
        }
        let result = self
            .resources
            .task_store
            .put_tasks(self.shard.shard_id(), self.shard.range_id(), &tasks)
            .await;
        if let Err(e) = result {
            if e.is_ownership_error() {
                self.shard.mark_ownership_lost(&e);
            }
            return Err(e);
        }

        for processor in &self.processors {
            let matching: Vec<Task> = tasks
                .iter()
                .filter(|t| t.category == processor.category())
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }
            if let Err(e) = processor.notify_new_tasks(matching).await {
                warn!(
                    shard_id = self.shard.shard_id(),
                    category = %processor.category(),
                    role = %processor.role(),
                    "通知新任务失败: {}",
                    e
                );
            }
        }
        Ok(())
    }

    async fn add_replication_tasks(&self, tasks: Vec<ReplicationTask>) -> HistoryResult<()> {
        self.ensure_valid()?;
        self.replication_source.append(tasks).await
    }

    fn describe_queue(&self, category: TaskCategory, role: ClusterRole) -> HistoryResult<ProcessorSnapshot> {
        Ok(self.processor(category, role)?.describe())
    }

    async fn reset_queue(&self, category: TaskCategory, role: ClusterRole) -> HistoryResult<()> {
        self.processor(category, role)?.reset().await
    }

    fn describe_replication(&self) -> Vec<ReplicationSnapshot> {
        self.replication_processors
            .iter()
            .map(|p| p.describe())
            .collect()
    }

    async fn read_dlq(
        &self,
        category: TaskCategory,
        page_token: Option<i64>,
        page_size: Option<usize>,
    ) -> HistoryResult<DlqPage> {
        self.resources
            .dlq
            .read(self.shard.shard_id(), category, page_token, page_size)
            .await
    }

    async fn purge_dlq(&self, category: TaskCategory, up_to_task_id: i64) -> HistoryResult<u64> {
        self.resources
            .dlq
            .purge(self.shard.shard_id(), category, up_to_task_id)
            .await
    }

    async fn merge_dlq(&self, category: TaskCategory, up_to_task_id: Option<i64>) -> HistoryResult<usize> {
        self.ensure_valid()?;
        let shard_id = self.shard.shard_id();
        if category == TaskCategory::Replication {
            let replayer = ReplicationDlqReplayer::new(Arc::clone(&self.resources.applier));
            return self
                .resources
                .dlq
                .merge(shard_id, category, up_to_task_id, &replayer)
                .await;
        }
        let processor = self.processor(category, ClusterRole::Active)?;
        self.resources
            .dlq
            .merge(shard_id, category, up_to_task_id, processor.as_ref())
            .await
    }

    async fn get_cross_cluster_tasks(
        &self,
        target_cluster: &str,
        watermark: i64,
        batch_size: usize,
    ) -> HistoryResult<Vec<Task>> {
        self.ensure_valid()?;
        Ok(self
            .outbox
            .poll_tasks(target_cluster, watermark, batch_size)
            .await)
    }

    async fn respond_cross_cluster_tasks_completed(
        &self,
        target_cluster: &str,
        responses: Vec<CrossClusterTaskResponse>,
    ) -> HistoryResult<RespondCrossClusterTasksCompletedResponse> {
        self.ensure_valid()?;
        Ok(self.outbox.respond(target_cluster, responses).await)
    }

    async fn get_replication_messages(
        &self,
        request: &GetReplicationMessagesRequest,
    ) -> HistoryResult<ReplicationMessages> {
        self.replication_source.get_replication_messages(request).await
    }
}
