pub mod dlq;
pub mod priority;
pub mod processing_queue;
pub mod queue_processor;
pub mod queue_task;
pub mod split;

pub use dlq::{DlqManager, DlqReplayTarget};
pub use priority::PriorityAssigner;
pub use processing_queue::ProcessingQueue;
pub use queue_processor::{
    ProcessorSnapshot, QueueProcessor, QueueProcessorOptions, QueueProcessorResources,
    QueueSnapshot,
};
pub use queue_task::{QueueTask, QueueTaskFactory, StandbyEscalation, TaskCompletion};
pub use split::{AggregateSplitPolicy, SplitDecision, SplitPolicy, SplitReason};
