use std::sync::Arc;

use async_trait::async_trait;
use history_domain::{HistoryResult, ReplicationApplier, ReplicationTask, Task};
use history_queue::DlqReplayTarget;
use tracing::{debug, warn};

/// 把复制死信重新交给应用器
pub struct ReplicationDlqReplayer {
    applier: Arc<dyn ReplicationApplier>,
}

impl ReplicationDlqReplayer {
    pub fn new(applier: Arc<dyn ReplicationApplier>) -> Self {
        Self { applier }
    }
}

#[async_trait]
impl DlqReplayTarget for ReplicationDlqReplayer {
    /// 任一任务应用失败即中止, 死信保留
    async fn replay(&self, tasks: Vec<Task>) -> HistoryResult<usize> {
        let mut applied = 0;
        for task in &tasks {
            let replication = ReplicationTask::from_task(task)?;
            match self.applier.apply(&replication).await {
                Ok(()) => applied += 1,
                Err(e) if e.is_obsolete() => {
                    debug!(message_id = replication.message_id, "复制死信已过期, 跳过: {}", e);
                }
                Err(e) => {
                    warn!(message_id = replication.message_id, "回放复制死信失败: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(applied)
    }
}
