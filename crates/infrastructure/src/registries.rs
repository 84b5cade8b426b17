//! 进程内的域注册表与远端集群客户端注册表

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use history_domain::{
    DomainRegistry, HistoryError, HistoryResult, RemoteAdminClient, RemoteClusterClients,
};
use tracing::info;

#[derive(Default)]
pub struct InMemoryDomainRegistry {
    domains: tokio::sync::RwLock<HashMap<String, String>>,
}

impl InMemoryDomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, domain_id: impl Into<String>, active_cluster: impl Into<String>) {
        self.domains
            .write()
            .await
            .insert(domain_id.into(), active_cluster.into());
    }

    pub async fn failover(&self, domain_id: &str, active_cluster: &str) -> HistoryResult<()> {
        let mut domains = self.domains.write().await;
        let current = domains
            .get_mut(domain_id)
            .ok_or_else(|| HistoryError::DomainNotFound(domain_id.to_string()))?;
        info!(domain_id, from = %current, to = active_cluster, "域故障转移");
        *current = active_cluster.to_string();
        Ok(())
    }
}

#[async_trait]
impl DomainRegistry for InMemoryDomainRegistry {
    async fn active_cluster(&self, domain_id: &str) -> HistoryResult<String> {
        self.domains
            .read()
            .await
            .get(domain_id)
            .cloned()
            .ok_or_else(|| HistoryError::DomainNotFound(domain_id.to_string()))
    }
}

/// 集群名到管理客户端的映射, 可在运行时注册
#[derive(Default)]
pub struct ClusterClientRegistry {
    clients: RwLock<BTreeMap<String, Arc<dyn RemoteAdminClient>>>,
}

impl ClusterClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cluster: impl Into<String>, client: Arc<dyn RemoteAdminClient>) {
        self.clients
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(cluster.into(), client);
    }
}

impl RemoteClusterClients for ClusterClientRegistry {
    fn admin_client(&self, cluster: &str) -> HistoryResult<Arc<dyn RemoteAdminClient>> {
        self.clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(cluster)
            .cloned()
            .ok_or_else(|| HistoryError::entity_not_found(format!("远端集群 {cluster}")))
    }

    fn remote_clusters(&self) -> Vec<String> {
        self.clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
