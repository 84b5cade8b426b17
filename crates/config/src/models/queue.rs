use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

/// 调度器中的排序键粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderingKeyMode {
    #[default]
    PerWorkflow,
    PerDomain,
}

/// 备用侧校验长期无法通过时的升级方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StandbyVerificationPolicy {
    /// 只记录告警, 继续等待复制追平
    AlertOnly,
    /// 触发带外重新同步
    #[default]
    Resync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueProcessorConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub update_ack_interval_ms: u64,
    pub split_interval_ms: u64,
    /// 单个处理队列允许的在途任务数, 超过后暂停读取
    pub max_outstanding_per_queue: usize,
    pub ordering: OrderingKeyMode,
    pub standby_verification: StandbyVerificationPolicy,
    /// 备用任务重试多少次后触发升级
    pub standby_escalation_attempts: u32,
    /// 停止时等待处理循环退出的时间
    pub shutdown_grace_ms: u64,
}

impl Default for QueueProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 200,
            update_ack_interval_ms: 1_000,
            split_interval_ms: 5_000,
            max_outstanding_per_queue: 1_000,
            ordering: OrderingKeyMode::PerWorkflow,
            standby_verification: StandbyVerificationPolicy::Resync,
            standby_escalation_attempts: 3,
            shutdown_grace_ms: 3_000,
        }
    }
}

impl ConfigValidator for QueueProcessorConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_count(self.batch_size, "queue.batch_size", 10_000)?;
        ValidationUtils::validate_interval_ms(self.poll_interval_ms, "queue.poll_interval_ms")?;
        ValidationUtils::validate_interval_ms(self.update_ack_interval_ms, "queue.update_ack_interval_ms")?;
        ValidationUtils::validate_interval_ms(self.split_interval_ms, "queue.split_interval_ms")?;
        ValidationUtils::validate_interval_ms(self.shutdown_grace_ms, "queue.shutdown_grace_ms")?;
        ValidationUtils::validate_count(
            self.max_outstanding_per_queue,
            "queue.max_outstanding_per_queue",
            1_000_000,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub enabled: bool,
    pub max_split_level: u32,
    /// 单个域的在途任务数超过该值时拆分出去
    pub pending_task_threshold: usize,
    /// 阻塞确认位置的任务重试次数超过该值时拆分出去
    pub stuck_task_attempt_threshold: u32,
    /// 确认位置停滞超过该时长时拆分出阻塞的域
    pub stuck_ack_duration_ms: u64,
    /// 运维指定需要隔离的域
    pub selected_domains: Vec<String>,
    pub random_split_probability: f64,
    /// 在途任务少于该值的队列不参与随机拆分
    pub random_split_min_pending: usize,
    pub max_domains_per_split: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_split_level: 2,
            pending_task_threshold: 500,
            stuck_task_attempt_threshold: 5,
            stuck_ack_duration_ms: 60_000, // 1分钟
            selected_domains: Vec::new(),
            random_split_probability: 0.0,
            random_split_min_pending: 100,
            max_domains_per_split: 3,
        }
    }
}

impl ConfigValidator for SplitConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_probability(self.random_split_probability, "split.random_split_probability")?;
        ValidationUtils::validate_count(self.max_domains_per_split, "split.max_domains_per_split", 1_000)?;
        if self.enabled && self.max_split_level == 0 {
            return Err(ConfigError::Validation(
                "启用拆分时 split.max_split_level 必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub page_size: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

impl ConfigValidator for DlqConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_count(self.page_size, "dlq.page_size", 10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(QueueProcessorConfig::default().validate().is_ok());
        assert!(SplitConfig::default().validate().is_ok());
        assert!(DlqConfig::default().validate().is_ok());
    }

    #[test]
    fn test_split_level_required_when_enabled() {
        let config = SplitConfig {
            max_split_level: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
