use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub current_cluster_name: String,
    /// 所有集群(含本集群)
    pub cluster_names: Vec<String>,
    /// 为空时使用主机名
    pub host_identity: String,
    pub num_shards: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            current_cluster_name: "primary".to_string(),
            cluster_names: vec!["primary".to_string()],
            host_identity: String::new(),
            num_shards: 16,
        }
    }
}

impl ClusterConfig {
    pub fn remote_clusters(&self) -> Vec<String> {
        self.cluster_names
            .iter()
            .filter(|name| **name != self.current_cluster_name)
            .cloned()
            .collect()
    }
}

impl ConfigValidator for ClusterConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.current_cluster_name, "cluster.current_cluster_name")?;
        ValidationUtils::validate_count(self.num_shards as usize, "cluster.num_shards", 16_384)?;
        if !self.cluster_names.contains(&self.current_cluster_name) {
            return Err(ConfigError::Validation(format!(
                "cluster.cluster_names 必须包含当前集群 {}",
                self.current_cluster_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_clusters_excludes_current() {
        let config = ClusterConfig {
            current_cluster_name: "east".into(),
            cluster_names: vec!["east".into(), "west".into()],
            ..Default::default()
        };
        assert_eq!(config.remote_clusters(), vec!["west".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_current_cluster_must_be_listed() {
        let config = ClusterConfig {
            current_cluster_name: "east".into(),
            cluster_names: vec!["west".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
