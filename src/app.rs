use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use history_config::{AppConfig, TaskSchedulerConfig};
use history_core::{RealTimeSource, RetryPolicy};
use history_domain::{RemoteAdminClient, RemoteClusterClients, ShardStore};
use history_infrastructure::{
    ClusterClientRegistry, InMemoryDlqStore, InMemoryDomainRegistry, InMemoryShardStore,
    InMemoryTaskStore, RetryableDlqStore, RetryableRemoteAdminClient, RetryableShardStore,
    RetryableTaskStore, StaticMembershipResolver,
};
use history_queue::{DlqManager, QueueProcessorOptions};
use history_replication::{CrossClusterFetcherResources, CrossClusterTaskFetcher, OwnedShards};
use history_scheduler::TaskScheduler;
use history_shard::{
    AdminHandler, EngineOptions, EngineResources, HistoryEngineFactory, ShardController,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::embedded::{AcknowledgingReplicationApplier, AcknowledgingTaskExecutor, LoggingResyncer};

/// 进程内的一个集群: 单主机持有该集群的全部分片
pub struct ClusterNode {
    name: String,
    scheduler: Arc<TaskScheduler>,
    cross_cluster_scheduler: Arc<TaskScheduler>,
    controller: Arc<ShardController>,
    admin: Arc<AdminHandler>,
    clients: Arc<ClusterClientRegistry>,
    fetchers: Vec<CrossClusterTaskFetcher>,
}

impl ClusterNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller(&self) -> &Arc<ShardController> {
        &self.controller
    }

    pub fn admin(&self) -> &Arc<AdminHandler> {
        &self.admin
    }

    async fn start(&self) {
        self.scheduler.start().await;
        self.cross_cluster_scheduler.start().await;
        self.controller.start().await;
        for fetcher in &self.fetchers {
            fetcher.start().await;
        }
    }

    async fn stop(&self) {
        for fetcher in &self.fetchers {
            fetcher.stop().await;
        }
        self.controller.stop().await;
        self.cross_cluster_scheduler.stop().await;
        self.scheduler.stop().await;
    }
}

/// 主应用程序
///
/// 没有跨进程的远端客户端, 配置中的每个集群都在本进程内运行,
/// 集群之间通过各自的 [`AdminHandler`] 互相拉取。
pub struct Application {
    config: AppConfig,
    host: String,
    domains: Arc<InMemoryDomainRegistry>,
    nodes: BTreeMap<String, ClusterNode>,
}

impl Application {
    pub fn new(config: AppConfig) -> Result<Self> {
        let host = if config.cluster.host_identity.is_empty() {
            hostname::get()
                .context("获取主机名失败")?
                .to_string_lossy()
                .into_owned()
        } else {
            config.cluster.host_identity.clone()
        };
        info!(
            host = %host,
            current_cluster = %config.cluster.current_cluster_name,
            clusters = ?config.cluster.cluster_names,
            num_shards = config.cluster.num_shards,
            "初始化应用程序"
        );

        let domains = Arc::new(InMemoryDomainRegistry::new());
        let mut nodes = BTreeMap::new();
        for name in &config.cluster.cluster_names {
            let node = build_node(&config, name, &host, Arc::clone(&domains));
            nodes.insert(name.clone(), node);
        }

        // 节点全部创建后再互相注册, 引擎在分片获取时才读取客户端
        let admins: Vec<(String, Arc<AdminHandler>)> = nodes
            .values()
            .map(|node| (node.name.clone(), Arc::clone(&node.admin)))
            .collect();
        for node in nodes.values_mut() {
            for (remote, admin) in &admins {
                if *remote == node.name {
                    continue;
                }
                let client: Arc<dyn RemoteAdminClient> = Arc::new(RetryableRemoteAdminClient::new(
                    Arc::clone(admin) as Arc<dyn RemoteAdminClient>,
                    config.persistence_retry.clone(),
                ));
                node.clients.register(remote.clone(), client);
            }
            if config.cross_cluster.enabled {
                node.fetchers = build_fetchers(&config, node)?;
            }
        }

        Ok(Self {
            config,
            host,
            domains,
            nodes,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn domains(&self) -> &Arc<InMemoryDomainRegistry> {
        &self.domains
    }

    pub fn node(&self, cluster: &str) -> Option<&ClusterNode> {
        self.nodes.get(cluster)
    }

    /// 当前集群
    pub fn current(&self) -> Option<&ClusterNode> {
        self.node(&self.config.cluster.current_cluster_name)
    }

    pub async fn start(&self) {
        for node in self.nodes.values() {
            node.start().await;
        }
        info!(host = %self.host, clusters = self.nodes.len(), "应用程序已启动");
    }

    pub async fn stop(&self) {
        for node in self.nodes.values().rev() {
            node.stop().await;
        }
        info!(host = %self.host, "应用程序已停止");
    }

    /// 启动并运行到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.start().await;
        if let Err(e) = shutdown_rx.recv().await {
            warn!("关闭信号通道异常: {}", e);
        }
        info!("收到关闭信号, 停止所有集群");
        self.stop().await;
        Ok(())
    }
}

fn build_node(
    config: &AppConfig,
    name: &str,
    host: &str,
    domains: Arc<InMemoryDomainRegistry>,
) -> ClusterNode {
    let retry: RetryPolicy = config.persistence_retry.clone();
    let shard_store = Arc::new(InMemoryShardStore::new());
    let task_store = Arc::new(InMemoryTaskStore::with_fencing(Arc::clone(&shard_store)));
    let dlq_store = Arc::new(RetryableDlqStore::new(
        Arc::new(InMemoryDlqStore::new()),
        retry.clone(),
    ));
    let fenced_shard_store: Arc<dyn ShardStore> =
        Arc::new(RetryableShardStore::new(shard_store, retry.clone()));

    let scheduler = Arc::new(TaskScheduler::new(Some(config.scheduler.clone())));
    let cross_cluster_scheduler = Arc::new(TaskScheduler::new(Some(TaskSchedulerConfig {
        worker_count: config.cross_cluster.source_worker_count,
        ..config.scheduler.clone()
    })));
    let clients = Arc::new(ClusterClientRegistry::new());
    let remote_clusters: Vec<String> = config
        .cluster
        .cluster_names
        .iter()
        .filter(|cluster| cluster.as_str() != name)
        .cloned()
        .collect();

    let resources = EngineResources {
        task_store: Arc::new(RetryableTaskStore::new(task_store, retry.clone())),
        dlq: Arc::new(DlqManager::new(dlq_store, retry, config.dlq.page_size)),
        scheduler: Arc::clone(&scheduler),
        cross_cluster_scheduler: Arc::clone(&cross_cluster_scheduler),
        executor: Arc::new(AcknowledgingTaskExecutor),
        domains,
        resyncer: Some(Arc::new(LoggingResyncer)),
        applier: Arc::new(AcknowledgingReplicationApplier),
        remote_clients: Arc::clone(&clients) as Arc<dyn RemoteClusterClients>,
        time_source: Arc::new(RealTimeSource),
    };
    let options = EngineOptions {
        queue: QueueProcessorOptions {
            queue: config.queue.clone(),
            split: config.split.clone(),
        },
        cross_cluster: config.cross_cluster.clone(),
        replication: config.replication.clone(),
        remote_clusters,
    };

    let controller = ShardController::new(
        host,
        name,
        config.cluster.num_shards,
        fenced_shard_store,
        Arc::new(StaticMembershipResolver::single_host(host)),
        Arc::new(HistoryEngineFactory::new(resources, options)),
        Some(config.shard.clone()),
    );
    let admin = Arc::new(AdminHandler::new(Arc::clone(&controller)));

    ClusterNode {
        name: name.to_string(),
        scheduler,
        cross_cluster_scheduler,
        controller,
        admin,
        clients,
        fetchers: Vec::new(),
    }
}

/// 为每个远端集群创建一个跨集群任务拉取器
fn build_fetchers(config: &AppConfig, node: &ClusterNode) -> Result<Vec<CrossClusterTaskFetcher>> {
    let mut fetchers = Vec::new();
    for remote in node.clients.remote_clusters() {
        let client = node
            .clients
            .admin_client(&remote)
            .with_context(|| format!("远端集群 {remote} 没有管理客户端"))?;
        fetchers.push(CrossClusterTaskFetcher::new(
            remote,
            node.name.clone(),
            client,
            CrossClusterFetcherResources {
                scheduler: Arc::clone(&node.scheduler),
                executor: Arc::new(AcknowledgingTaskExecutor),
                shards: Arc::clone(&node.controller) as Arc<dyn OwnedShards>,
            },
            Some(config.cross_cluster.clone()),
        ));
    }
    Ok(fetchers)
}
