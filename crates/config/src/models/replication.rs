use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{CircuitBreakerConfig, ConfigResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossClusterConfig {
    pub enabled: bool,
    pub fetch_interval_ms: u64,
    pub fetch_batch_size: usize,
    pub fetch_timeout_ms: u64,
    /// 拉取连续失败时的最大退避
    pub max_fetch_backoff_ms: u64,
    /// 源侧等待目标响应的时长, 超时后任务重新可拉取
    pub source_task_timeout_ms: u64,
    /// 源侧跨集群任务独占的调度工作者数, 等待目标响应不占用共享调度器
    pub source_worker_count: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for CrossClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_interval_ms: 500,
            fetch_batch_size: 100,
            fetch_timeout_ms: 2_000,
            max_fetch_backoff_ms: 10_000,
            source_task_timeout_ms: 30_000,
            source_worker_count: 8,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ConfigValidator for CrossClusterConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_interval_ms(self.fetch_interval_ms, "cross_cluster.fetch_interval_ms")?;
        ValidationUtils::validate_count(self.fetch_batch_size, "cross_cluster.fetch_batch_size", 10_000)?;
        ValidationUtils::validate_interval_ms(self.fetch_timeout_ms, "cross_cluster.fetch_timeout_ms")?;
        ValidationUtils::validate_interval_ms(self.max_fetch_backoff_ms, "cross_cluster.max_fetch_backoff_ms")?;
        ValidationUtils::validate_interval_ms(self.source_task_timeout_ms, "cross_cluster.source_task_timeout_ms")?;
        ValidationUtils::validate_count(self.source_worker_count, "cross_cluster.source_worker_count", 4_096)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub fetch_timeout_ms: u64,
    /// 每个工作流运行最多缓存的乱序任务数
    pub max_buffered_per_run: usize,
    /// 事件缺口存在超过该时长后触发重新同步
    pub resync_after_ms: u64,
    /// 重排缓存为空且超过该时长没有新任务的运行不再跟踪
    pub run_idle_ttl_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 500,
            batch_size: 100,
            fetch_timeout_ms: 2_000,
            max_buffered_per_run: 100,
            resync_after_ms: 5_000,
            run_idle_ttl_ms: 60_000,
        }
    }
}

impl ConfigValidator for ReplicationConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_interval_ms(self.poll_interval_ms, "replication.poll_interval_ms")?;
        ValidationUtils::validate_count(self.batch_size, "replication.batch_size", 10_000)?;
        ValidationUtils::validate_interval_ms(self.fetch_timeout_ms, "replication.fetch_timeout_ms")?;
        ValidationUtils::validate_count(self.max_buffered_per_run, "replication.max_buffered_per_run", 100_000)?;
        ValidationUtils::validate_interval_ms(self.resync_after_ms, "replication.resync_after_ms")?;
        ValidationUtils::validate_interval_ms(self.run_idle_ttl_ms, "replication.run_idle_ttl_ms")?;
        Ok(())
    }
}
