use std::collections::HashMap;

use async_trait::async_trait;
use history_domain::{HistoryError, HistoryResult, MembershipResolver};
use tokio::sync::{watch, RwLock};
use tracing::info;

/// 静态成员关系: 显式分配的分片, 其余落到默认主机
pub struct StaticMembershipResolver {
    default_host: Option<String>,
    assignments: RwLock<HashMap<i32, String>>,
    version: watch::Sender<u64>,
}

impl StaticMembershipResolver {
    pub fn new(default_host: Option<String>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            default_host,
            assignments: RwLock::new(HashMap::new()),
            version,
        }
    }

    /// 所有分片都归属同一主机
    pub fn single_host(host: impl Into<String>) -> Self {
        Self::new(Some(host.into()))
    }

    /// 重新分配分片并通知订阅者
    pub async fn assign(&self, shard_id: i32, host: impl Into<String>) {
        let host = host.into();
        info!(shard_id, host = %host, "分片成员关系变化");
        self.assignments.write().await.insert(shard_id, host);
        self.version.send_modify(|v| *v += 1);
    }

    pub async fn unassign(&self, shard_id: i32) {
        self.assignments.write().await.remove(&shard_id);
        self.version.send_modify(|v| *v += 1);
    }
}

#[async_trait]
impl MembershipResolver for StaticMembershipResolver {
    async fn lookup(&self, shard_id: i32) -> HistoryResult<String> {
        if let Some(host) = self.assignments.read().await.get(&shard_id) {
            return Ok(host.clone());
        }
        self.default_host
            .clone()
            .ok_or_else(|| HistoryError::entity_not_found(format!("分片 {shard_id} 没有归属主机")))
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}
