use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigResult, RetryPolicy};

/// 调度器队列满时的提交行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// 等待空位
    Blocking,
    /// 立即返回 Busy
    #[default]
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSchedulerConfig {
    pub worker_count: usize,
    /// 排队中(未完成)的最大任务数
    pub queue_size: usize,
    pub submit_mode: SubmitMode,
    /// 低优先级任务等待超过该时长后提升
    pub starvation_threshold_ms: u64,
    /// 任务级重试, `retry.max_attempts` 为最大重试次数
    pub retry: RetryPolicy,
    pub shutdown_timeout_ms: u64,
}

impl Default for TaskSchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 32,
            queue_size: 10_000,
            submit_mode: SubmitMode::NonBlocking,
            starvation_threshold_ms: 2_000, // 2秒
            retry: RetryPolicy {
                initial_interval_ms: 50,
                max_interval_ms: 30_000,
                backoff_coefficient: 2.0,
                jitter_factor: 0.2,
                max_attempts: 10,
            },
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ConfigValidator for TaskSchedulerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_count(self.worker_count, "scheduler.worker_count", 4_096)?;
        ValidationUtils::validate_count(self.queue_size, "scheduler.queue_size", 1_000_000)?;
        ValidationUtils::validate_interval_ms(self.starvation_threshold_ms, "scheduler.starvation_threshold_ms")?;
        ValidationUtils::validate_interval_ms(self.shutdown_timeout_ms, "scheduler.shutdown_timeout_ms")?;
        ValidationUtils::validate_retry_policy(&self.retry, "scheduler.retry")?;
        Ok(())
    }
}
