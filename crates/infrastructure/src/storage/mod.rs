//! 进程内存储实现, 用于单机部署和测试

pub mod dlq_store;
pub mod shard_store;
pub mod task_store;

pub use dlq_store::InMemoryDlqStore;
pub use shard_store::InMemoryShardStore;
pub use task_store::InMemoryTaskStore;
