use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::HistoryResult;
#[cfg(test)]
use crate::HistoryError;

/// 重试策略
///
/// 第 n 次失败后的等待时间为 `initial_interval_ms × backoff_coefficient^n`,
/// 先叠加抖动再按 `max_interval_ms` 截断, 因此相邻两次等待时间单调不减。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 基础重试间隔（毫秒）
    pub initial_interval_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_interval_ms: u64,
    /// 指数退避倍数
    pub backoff_coefficient: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 最大重试次数, 0 表示不重试
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 50,  // 50毫秒
            max_interval_ms: 10_000,  // 10秒
            backoff_coefficient: 2.0, // 指数退避倍数
            jitter_factor: 0.2,       // 20%的随机抖动
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// `attempt` 为已失败的次数减一, 即首次重试传 0
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(62) as i32;
        let base = self.initial_interval_ms as f64 * self.backoff_coefficient.powi(exponent);
        let jitter = if self.jitter_factor > 0.0 {
            rand::rng().random_range(0.0..=self.jitter_factor)
        } else {
            0.0
        };
        let delay = (base * (1.0 + jitter)).min(self.max_interval_ms as f64);
        Duration::from_millis(delay.max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_interval_ms == 0 {
            return Err("initial_interval_ms 必须大于0".to_string());
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err("max_interval_ms 不能小于 initial_interval_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor 必须在 0.0 到 1.0 之间".to_string());
        }
        if self.backoff_coefficient < 1.0 + self.jitter_factor {
            return Err("backoff_coefficient 必须不小于 1 + jitter_factor".to_string());
        }
        Ok(())
    }
}

/// 按策略重试一个操作, 只重试 `is_retryable` 的错误
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> HistoryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HistoryResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} 在第 {} 次重试后成功", operation, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "操作失败, 准备重试: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    debug!("{} 重试 {} 次后放弃: {}", operation, attempt, e);
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_is_nondecreasing_and_capped() {
        let policy = RetryPolicy {
            initial_interval_ms: 10,
            max_interval_ms: 500,
            backoff_coefficient: 2.0,
            jitter_factor: 0.5,
            max_attempts: 20,
        };
        for _ in 0..50 {
            let mut previous = Duration::ZERO;
            for attempt in 0..20 {
                let delay = policy.backoff(attempt);
                assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
                assert!(delay <= Duration::from_millis(500));
                previous = delay;
            }
        }
    }

    #[test]
    fn test_backoff_without_jitter() {
        let policy = RetryPolicy {
            initial_interval_ms: 100,
            max_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            jitter_factor: 0.0,
            max_attempts: 3,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            backoff_coefficient: 1.1,
            jitter_factor: 0.5,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let policy = RetryPolicy {
            initial_interval_ms: 1,
            max_interval_ms: 5,
            ..RetryPolicy::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_with_policy(&policy, "flaky", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HistoryError::persistence("unavailable"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_returned_immediately() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: HistoryResult<()> = retry_with_policy(&policy, "fenced", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HistoryError::ShardNotOwned { shard_id: 1 })
            }
        })
        .await;
        assert!(result.unwrap_err().is_ownership_error());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
