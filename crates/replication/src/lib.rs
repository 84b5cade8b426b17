//! 跨集群任务拉取与复制流水线

pub mod cross_cluster;
pub mod replication;

pub use cross_cluster::{
    CrossClusterFetcherResources, CrossClusterOutbox, CrossClusterSourceExecutor,
    CrossClusterTaskFetcher, FetcherStats, OwnedShards,
};
pub use replication::{
    ReplicationDlqReplayer, ReplicationResources, ReplicationSnapshot, ReplicationTaskProcessor,
    ReplicationTaskSource,
};
