use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    cluster::ClusterConfig,
    observability::ObservabilityConfig,
    queue::{DlqConfig, QueueProcessorConfig, SplitConfig},
    replication::{CrossClusterConfig, ReplicationConfig},
    scheduler::TaskSchedulerConfig,
    shard::ShardControllerConfig,
};
use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigResult, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub scheduler: TaskSchedulerConfig,
    pub queue: QueueProcessorConfig,
    pub split: SplitConfig,
    pub shard: ShardControllerConfig,
    pub cross_cluster: CrossClusterConfig,
    pub replication: ReplicationConfig,
    pub dlq: DlqConfig,
    /// 持久化与远端调用的重试策略
    pub persistence_retry: RetryPolicy,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载顺序: 默认值 → TOML 文件 → `HISTORY__` 前缀的环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/history.toml", "history.toml", "/etc/history/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("HISTORY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.cluster.validate()?;
        self.scheduler.validate()?;
        self.queue.validate()?;
        self.split.validate()?;
        self.shard.validate()?;
        self.cross_cluster.validate()?;
        self.replication.validate()?;
        self.dlq.validate()?;
        ValidationUtils::validate_retry_policy(&self.persistence_retry, "persistence_retry")?;
        self.observability.validate()?;
        Ok(())
    }
}
