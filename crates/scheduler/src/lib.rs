pub mod scheduler;
pub mod task;

pub use scheduler::{SchedulerStats, SubmitRejection, TaskScheduler};
pub use task::SchedulableTask;
