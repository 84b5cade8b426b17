use history_domain::{ClusterRole, TaskCategory};

pub const HIGH_PRIORITY: u8 = 0;
pub const MEDIUM_PRIORITY: u8 = 1;
pub const LOW_PRIORITY: u8 = 2;
/// 多次重试仍失败的任务降级的偏移量
const DEMOTION_OFFSET: u8 = 3;

/// 任务优先级分配: 主动 < 跨集群/复制 < 备用, 反复失败的任务降级
#[derive(Debug, Clone)]
pub struct PriorityAssigner {
    demote_after_attempts: u32,
}

impl PriorityAssigner {
    pub fn new(demote_after_attempts: u32) -> Self {
        Self {
            demote_after_attempts,
        }
    }

    pub fn assign(&self, category: TaskCategory, role: ClusterRole, attempt: u32) -> u8 {
        let base = match (category, role) {
            (_, ClusterRole::Standby) => LOW_PRIORITY,
            (TaskCategory::CrossCluster | TaskCategory::Replication, ClusterRole::Active) => {
                MEDIUM_PRIORITY
            }
            (TaskCategory::Transfer | TaskCategory::Timer, ClusterRole::Active) => HIGH_PRIORITY,
        };
        if self.demote_after_attempts > 0 && attempt >= self.demote_after_attempts {
            base + DEMOTION_OFFSET
        } else {
            base
        }
    }
}

impl Default for PriorityAssigner {
    fn default() -> Self {
        Self::new(5)
    }
}
