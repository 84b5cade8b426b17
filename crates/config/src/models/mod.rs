pub mod app_config;
pub mod cluster;
pub mod observability;
pub mod queue;
pub mod replication;
pub mod scheduler;
pub mod shard;

pub use app_config::*;
pub use cluster::*;
pub use observability::*;
pub use queue::*;
pub use replication::*;
pub use scheduler::*;
pub use shard::*;
