pub mod models;
pub mod validation;

pub use models::{
    AppConfig, ClusterConfig, CrossClusterConfig, DlqConfig, LogFormat, LogLevel,
    ObservabilityConfig, OrderingKeyMode, QueueProcessorConfig, ReplicationConfig,
    ShardControllerConfig, SplitConfig, StandbyVerificationPolicy, SubmitMode,
    TaskSchedulerConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};

pub use history_core::{CircuitBreakerConfig, RetryPolicy};

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("配置校验失败: {0}")]
    Validation(String),
}
