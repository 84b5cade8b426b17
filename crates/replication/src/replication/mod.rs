mod apply_task;
pub mod dlq_replay;
mod reorder;
pub mod source;
pub mod task_processor;

pub use dlq_replay::ReplicationDlqReplayer;
pub use source::ReplicationTaskSource;
pub use task_processor::{ReplicationResources, ReplicationSnapshot, ReplicationTaskProcessor};
