pub mod membership;
pub mod registries;
pub mod retryable;
pub mod storage;

pub use membership::StaticMembershipResolver;
pub use registries::{ClusterClientRegistry, InMemoryDomainRegistry};
pub use retryable::{
    RetryableDlqStore, RetryableRemoteAdminClient, RetryableShardStore, RetryableTaskStore,
};
pub use storage::*;
