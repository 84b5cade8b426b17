use crate::{ConfigError, ConfigResult, RetryPolicy};

pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{field_name} 不能为空")));
        }
        Ok(())
    }

    pub fn validate_interval_ms(value: u64, field_name: &str) -> ConfigResult<()> {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{field_name} 必须大于0")));
        }
        if value > 3_600_000 {
            return Err(ConfigError::Validation(format!(
                "{field_name} 不能超过1小时"
            )));
        }
        Ok(())
    }

    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(ConfigError::Validation(format!("{field_name} 必须大于0")));
        }
        if count > max {
            return Err(ConfigError::Validation(format!(
                "{field_name} 不能超过 {max}"
            )));
        }
        Ok(())
    }

    pub fn validate_probability(value: f64, field_name: &str) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "{field_name} 必须在 0.0 到 1.0 之间"
            )));
        }
        Ok(())
    }

    pub fn validate_retry_policy(policy: &RetryPolicy, field_name: &str) -> ConfigResult<()> {
        policy
            .validate()
            .map_err(|e| ConfigError::Validation(format!("{field_name}: {e}")))
    }
}
