use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigResult, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardControllerConfig {
    /// 获取分片时持久化不可用的重试策略
    pub acquire_retry: RetryPolicy,
    /// 成员关系的兜底轮询间隔
    pub membership_poll_interval_ms: u64,
    /// 关闭单个分片的超时
    pub close_timeout_ms: u64,
}

impl Default for ShardControllerConfig {
    fn default() -> Self {
        Self {
            acquire_retry: RetryPolicy {
                initial_interval_ms: 100,
                max_interval_ms: 5_000,
                backoff_coefficient: 2.0,
                jitter_factor: 0.2,
                max_attempts: 5,
            },
            membership_poll_interval_ms: 5_000,
            close_timeout_ms: 5_000,
        }
    }
}

impl ConfigValidator for ShardControllerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_retry_policy(&self.acquire_retry, "shard.acquire_retry")?;
        ValidationUtils::validate_interval_ms(self.membership_poll_interval_ms, "shard.membership_poll_interval_ms")?;
        ValidationUtils::validate_interval_ms(self.close_timeout_ms, "shard.close_timeout_ms")?;
        Ok(())
    }
}
