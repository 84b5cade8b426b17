use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use history_domain::{HistoryError, HistoryResult, ShardInfo, ShardStore};
use tokio::sync::RwLock;
use tracing::debug;

/// 内存分片元数据存储, `update_shard` 是按 range_id 的条件写
#[derive(Default)]
pub struct InMemoryShardStore {
    shards: RwLock<HashMap<i32, ShardInfo>>,
}

impl InMemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn range_id(&self, shard_id: i32) -> Option<i64> {
        self.shards.read().await.get(&shard_id).map(|s| s.range_id)
    }

    pub async fn shard(&self, shard_id: i32) -> Option<ShardInfo> {
        self.shards.read().await.get(&shard_id).cloned()
    }
}

#[async_trait]
impl ShardStore for InMemoryShardStore {
    async fn get_or_create_shard(&self, shard_id: i32, owner: &str) -> HistoryResult<ShardInfo> {
        let mut shards = self.shards.write().await;
        let shard = shards.entry(shard_id).or_insert_with(|| {
            debug!(shard_id, owner, "创建分片元数据");
            ShardInfo::new(shard_id, owner)
        });
        Ok(shard.clone())
    }

    async fn update_shard(&self, shard: &ShardInfo, expected_range_id: i64) -> HistoryResult<()> {
        let mut shards = self.shards.write().await;
        let actual = shards
            .get(&shard.shard_id)
            .map(|s| s.range_id)
            .ok_or_else(|| HistoryError::entity_not_found(format!("分片 {}", shard.shard_id)))?;
        if actual != expected_range_id {
            return Err(HistoryError::StaleRangeId {
                shard_id: shard.shard_id,
                expected: expected_range_id,
                actual,
            });
        }
        let mut stored = shard.clone();
        stored.updated_at = Utc::now();
        shards.insert(shard.shard_id, stored);
        Ok(())
    }
}
