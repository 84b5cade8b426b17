use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{HistoryError, HistoryResult};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: usize,
    /// 打开后多久进入半开（毫秒）
    pub recovery_timeout_ms: u64,
    /// 半开状态下连续成功多少次后关闭
    pub success_threshold: usize,
    /// 半开失败后恢复时间的放大倍数
    pub backoff_multiplier: f64,
    /// 最大恢复时间（毫秒）
    pub max_recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 10_000,      // 10秒
            success_threshold: 2,
            backoff_multiplier: 2.0,
            max_recovery_timeout_ms: 300_000, // 5分钟
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerStats {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    last_state_change: Instant,
    current_recovery_timeout: Duration,
}

/// 按远端对象熔断: 持续失败时快速失败, 不阻塞其他调用方
///
/// 只有可重试错误计入失败, 业务错误不影响熔断状态。
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    stats: Arc<RwLock<BreakerStats>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: Option<CircuitBreakerConfig>) -> Self {
        let config = config.unwrap_or_default();
        let stats = BreakerStats {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_state_change: Instant::now(),
            current_recovery_timeout: Duration::from_millis(config.recovery_timeout_ms),
        };
        Self {
            name: name.into(),
            config,
            stats: Arc::new(RwLock::new(stats)),
        }
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> HistoryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = HistoryResult<T>>,
    {
        if !self.should_allow_call().await {
            return Err(HistoryError::ServiceBusy(format!(
                "熔断器 {} 已打开, 调用被拒绝",
                self.name
            )));
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(e) if e.is_retryable() => self.record_failure().await,
            Err(_) => {}
        }
        result
    }

    async fn should_allow_call(&self) -> bool {
        let mut stats = self.stats.write().await;
        match stats.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if stats.last_state_change.elapsed() > stats.current_recovery_timeout {
                    stats.state = CircuitState::HalfOpen;
                    stats.last_state_change = Instant::now();
                    stats.consecutive_successes = 0;
                    info!("熔断器 {} 进入半开状态", self.name);
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut stats = self.stats.write().await;
        stats.consecutive_successes += 1;
        stats.consecutive_failures = 0;

        if stats.state == CircuitState::HalfOpen
            && stats.consecutive_successes >= self.config.success_threshold
        {
            stats.state = CircuitState::Closed;
            stats.last_state_change = Instant::now();
            stats.current_recovery_timeout = Duration::from_millis(self.config.recovery_timeout_ms);
            info!("熔断器 {} 已关闭", self.name);
        }
    }

    async fn record_failure(&self) {
        let mut stats = self.stats.write().await;
        stats.consecutive_failures += 1;
        stats.consecutive_successes = 0;

        match stats.state {
            CircuitState::Closed if stats.consecutive_failures >= self.config.failure_threshold => {
                stats.state = CircuitState::Open;
                stats.last_state_change = Instant::now();
                warn!(
                    "熔断器 {} 连续失败 {} 次, 已打开",
                    self.name, stats.consecutive_failures
                );
            }
            CircuitState::HalfOpen => {
                stats.state = CircuitState::Open;
                stats.last_state_change = Instant::now();
                let next = Duration::from_millis(
                    (stats.current_recovery_timeout.as_millis() as f64
                        * self.config.backoff_multiplier) as u64,
                );
                stats.current_recovery_timeout =
                    next.min(Duration::from_millis(self.config.max_recovery_timeout_ms));
                warn!("熔断器 {} 半开探测失败, 重新打开", self.name);
            }
            _ => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.stats.read().await.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
