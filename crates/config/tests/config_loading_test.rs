use std::io::Write;

use history_config::{AppConfig, OrderingKeyMode};
use tempfile::Builder;

#[test]
fn test_load_from_file() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[cluster]
current_cluster_name = "west"
cluster_names = ["east", "west"]

[queue]
batch_size = 25
ordering = "per_domain"

[split]
selected_domains = ["noisy-domain"]
"#
    )
    .unwrap();

    let path = file.path().to_str().unwrap().to_string();
    let config = AppConfig::load(Some(&path)).unwrap();

    assert_eq!(config.cluster.current_cluster_name, "west");
    assert_eq!(config.cluster.remote_clusters(), vec!["east".to_string()]);
    assert_eq!(config.queue.batch_size, 25);
    assert_eq!(config.queue.ordering, OrderingKeyMode::PerDomain);
    assert_eq!(config.split.selected_domains, vec!["noisy-domain".to_string()]);
    assert_eq!(config.replication.batch_size, 100);
}

#[test]
fn test_load_missing_file_fails() {
    let result = AppConfig::load(Some("/nonexistent/history.toml"));
    assert!(result.is_err());
}

#[test]
fn test_load_rejects_invalid_values() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[split]
random_split_probability = 2.0
"#
    )
    .unwrap();

    let path = file.path().to_str().unwrap().to_string();
    assert!(AppConfig::load(Some(&path)).is_err());
}
