//! Test data builders with sensible defaults

use chrono::{TimeZone, Utc};
use history_domain::{ReplicationTask, Task, TaskCategory, TaskType};

/// Builder for history tasks
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task {
                shard_id: 1,
                category: TaskCategory::Transfer,
                task_type: TaskType::TransferActivity,
                task_id: 1,
                domain_id: "test-domain".to_string(),
                workflow_id: "test-workflow".to_string(),
                run_id: "test-run".to_string(),
                visibility_timestamp: Utc::now(),
                version: 0,
                attempt: 0,
                target_cluster: None,
                payload: serde_json::json!({}),
            },
        }
    }

    pub fn transfer(task_id: i64) -> Self {
        Self::new().with_task_id(task_id)
    }

    pub fn timer(task_id: i64, visibility_ms: i64) -> Self {
        Self::new()
            .with_task_type(TaskType::UserTimer)
            .with_task_id(task_id)
            .visible_at_ms(visibility_ms)
    }

    pub fn cross_cluster(task_id: i64, target_cluster: &str) -> Self {
        Self::new()
            .with_task_type(TaskType::CrossClusterSignalExecution)
            .with_task_id(task_id)
            .with_target_cluster(target_cluster)
    }

    pub fn with_shard(mut self, shard_id: i32) -> Self {
        self.task.shard_id = shard_id;
        self
    }

    /// Also sets the category implied by the task type
    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task.task_type = task_type;
        self.task.category = task_type.category();
        self
    }

    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task.task_id = task_id;
        self
    }

    pub fn with_domain(mut self, domain_id: &str) -> Self {
        self.task.domain_id = domain_id.to_string();
        self
    }

    pub fn with_workflow(mut self, workflow_id: &str, run_id: &str) -> Self {
        self.task.workflow_id = workflow_id.to_string();
        self.task.run_id = run_id.to_string();
        self
    }

    pub fn visible_at_ms(mut self, visibility_ms: i64) -> Self {
        if let Some(at) = Utc.timestamp_millis_opt(visibility_ms).single() {
            self.task.visibility_timestamp = at;
        }
        self
    }

    pub fn with_target_cluster(mut self, cluster: &str) -> Self {
        self.task.target_cluster = Some(cluster.to_string());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for replication tasks carrying an event range
pub struct ReplicationTaskBuilder {
    task: ReplicationTask,
}

impl ReplicationTaskBuilder {
    pub fn new(message_id: i64) -> Self {
        Self {
            task: ReplicationTask {
                message_id,
                source_cluster: "cluster-a".to_string(),
                first_event_id: 1,
                next_event_id: 2,
                task: TaskBuilder::new()
                    .with_task_type(TaskType::ReplicationHistory)
                    .with_task_id(message_id)
                    .build(),
            },
        }
    }

    pub fn with_workflow(mut self, workflow_id: &str, run_id: &str) -> Self {
        self.task.task.workflow_id = workflow_id.to_string();
        self.task.task.run_id = run_id.to_string();
        self
    }

    pub fn with_domain(mut self, domain_id: &str) -> Self {
        self.task.task.domain_id = domain_id.to_string();
        self
    }

    pub fn with_shard(mut self, shard_id: i32) -> Self {
        self.task.task.shard_id = shard_id;
        self
    }

    pub fn events(mut self, first_event_id: i64, next_event_id: i64) -> Self {
        self.task.first_event_id = first_event_id;
        self.task.next_event_id = next_event_id;
        self
    }

    pub fn build(self) -> ReplicationTask {
        self.task
    }
}
