//! 处理队列拆分策略

use std::collections::BTreeSet;
use std::time::Duration;

use history_config::SplitConfig;
use history_observability::metric_names;
use rand::seq::IndexedRandom;
use rand::Rng;

use crate::processing_queue::ProcessingQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitReason {
    PendingTask,
    StuckTask,
    SelectedDomain,
    Random,
}

impl SplitReason {
    pub fn metric_name(&self) -> &'static str {
        match self {
            SplitReason::PendingTask => metric_names::PROCESSING_QUEUE_PENDING_TASK_SPLIT,
            SplitReason::StuckTask => metric_names::PROCESSING_QUEUE_STUCK_TASK_SPLIT,
            SplitReason::SelectedDomain => metric_names::PROCESSING_QUEUE_SELECTED_DOMAIN_SPLIT,
            SplitReason::Random => metric_names::PROCESSING_QUEUE_RANDOM_SPLIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitDecision {
    pub reason: SplitReason,
    pub domains: BTreeSet<String>,
}

pub trait SplitPolicy: Send + Sync {
    fn evaluate(&self, queue: &ProcessingQueue) -> Option<SplitDecision>;
}

/// 在途任务过多: 拆出积压最多的几个域
pub struct PendingTaskSplitPolicy {
    threshold: usize,
    max_domains: usize,
}

impl PendingTaskSplitPolicy {
    pub fn new(threshold: usize, max_domains: usize) -> Self {
        Self {
            threshold,
            max_domains: max_domains.max(1),
        }
    }
}

impl SplitPolicy for PendingTaskSplitPolicy {
    fn evaluate(&self, queue: &ProcessingQueue) -> Option<SplitDecision> {
        if queue.pending_count() <= self.threshold {
            return None;
        }
        let mut by_domain: Vec<(&str, usize)> = queue.pending_by_domain().into_iter().collect();
        by_domain.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let domains: BTreeSet<String> = by_domain
            .into_iter()
            .take(self.max_domains)
            .map(|(d, _)| d.to_string())
            .collect();
        Some(SplitDecision {
            reason: SplitReason::PendingTask,
            domains,
        })
    }
}

/// 任务重试过多或确认位置长时间停滞: 拆出阻塞的域
pub struct StuckTaskSplitPolicy {
    attempt_threshold: u32,
    stuck_duration: Duration,
    max_domains: usize,
}

impl StuckTaskSplitPolicy {
    pub fn new(attempt_threshold: u32, stuck_duration: Duration, max_domains: usize) -> Self {
        Self {
            attempt_threshold,
            stuck_duration,
            max_domains: max_domains.max(1),
        }
    }
}

impl SplitPolicy for StuckTaskSplitPolicy {
    fn evaluate(&self, queue: &ProcessingQueue) -> Option<SplitDecision> {
        let mut domains: BTreeSet<String> = queue
            .outstanding()
            .values()
            .filter(|t| !t.completed && t.attempt() >= self.attempt_threshold)
            .map(|t| t.domain_id.clone())
            .take(self.max_domains)
            .collect();

        if domains.is_empty() && queue.last_ack_change().elapsed() >= self.stuck_duration {
            if let Some((_, blocking)) = queue.first_pending() {
                domains.insert(blocking.domain_id.clone());
            }
        }

        if domains.is_empty() {
            return None;
        }
        Some(SplitDecision {
            reason: SplitReason::StuckTask,
            domains,
        })
    }
}

/// 运维指定的域始终隔离在独立队列中
pub struct SelectedDomainSplitPolicy {
    domains: BTreeSet<String>,
}

impl SelectedDomainSplitPolicy {
    pub fn new<I: IntoIterator<Item = String>>(domains: I) -> Self {
        Self {
            domains: domains.into_iter().collect(),
        }
    }
}

impl SplitPolicy for SelectedDomainSplitPolicy {
    fn evaluate(&self, queue: &ProcessingQueue) -> Option<SplitDecision> {
        if self.domains.is_empty() {
            return None;
        }
        let filter = queue.domain_filter();
        let selected: BTreeSet<String> = self
            .domains
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        // 已经只包含选定域的队列不再拆分
        let already_isolated = !filter.reverse_match
            && filter.domain_ids.iter().all(|d| self.domains.contains(d));
        if selected.is_empty() || already_isolated {
            return None;
        }
        Some(SplitDecision {
            reason: SplitReason::SelectedDomain,
            domains: selected,
        })
    }
}

/// 按概率随机拆出一个有积压的域
pub struct RandomSplitPolicy {
    probability: f64,
    min_pending: usize,
}

impl RandomSplitPolicy {
    pub fn new(probability: f64, min_pending: usize) -> Self {
        Self {
            probability,
            min_pending,
        }
    }
}

impl SplitPolicy for RandomSplitPolicy {
    fn evaluate(&self, queue: &ProcessingQueue) -> Option<SplitDecision> {
        if self.probability <= 0.0 || queue.pending_count() < self.min_pending {
            return None;
        }
        let mut rng = rand::rng();
        if !rng.random_bool(self.probability.min(1.0)) {
            return None;
        }
        let domains: Vec<&str> = queue.pending_by_domain().into_keys().collect();
        let chosen = domains.choose(&mut rng)?;
        Some(SplitDecision {
            reason: SplitReason::Random,
            domains: [chosen.to_string()].into_iter().collect(),
        })
    }
}

/// 按顺序评估, 返回第一个命中的拆分决定
pub struct AggregateSplitPolicy {
    policies: Vec<Box<dyn SplitPolicy>>,
}

impl AggregateSplitPolicy {
    pub fn new(policies: Vec<Box<dyn SplitPolicy>>) -> Self {
        Self { policies }
    }

    pub fn from_config(config: &SplitConfig) -> Self {
        Self::new(vec![
            Box::new(SelectedDomainSplitPolicy::new(
                config.selected_domains.iter().cloned(),
            )),
            Box::new(StuckTaskSplitPolicy::new(
                config.stuck_task_attempt_threshold,
                Duration::from_millis(config.stuck_ack_duration_ms),
                config.max_domains_per_split,
            )),
            Box::new(PendingTaskSplitPolicy::new(
                config.pending_task_threshold,
                config.max_domains_per_split,
            )),
            Box::new(RandomSplitPolicy::new(
                config.random_split_probability,
                config.random_split_min_pending,
            )),
        ])
    }
}

impl SplitPolicy for AggregateSplitPolicy {
    fn evaluate(&self, queue: &ProcessingQueue) -> Option<SplitDecision> {
        self.policies.iter().find_map(|p| p.evaluate(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use history_domain::{ProcessingQueueState, Task, TaskCategory, TaskKey, TaskType};
    use std::sync::atomic::Ordering;

    fn task(task_id: i64, domain: &str) -> Task {
        Task {
            shard_id: 1,
            category: TaskCategory::Transfer,
            task_type: TaskType::TransferActivity,
            task_id,
            domain_id: domain.into(),
            workflow_id: "wf".into(),
            run_id: "run".into(),
            visibility_timestamp: Utc::now(),
            version: 0,
            attempt: 0,
            target_cluster: None,
            payload: serde_json::Value::Null,
        }
    }

    fn queue_with(domains: &[&str]) -> ProcessingQueue {
        let mut queue = ProcessingQueue::new(ProcessingQueueState::root(TaskKey::immediate(0)));
        let tasks = domains
            .iter()
            .enumerate()
            .map(|(i, d)| task(i as i64 + 1, d))
            .collect();
        queue.record_read(tasks, false, TaskKey::MIN, TaskKey::MAX);
        queue
    }

    #[test]
    fn test_pending_policy_picks_busiest_domains() {
        let queue = queue_with(&["hot", "hot", "hot", "warm", "warm", "cold"]);
        let policy = PendingTaskSplitPolicy::new(4, 2);
        let decision = policy.evaluate(&queue).unwrap();
        assert_eq!(decision.reason, SplitReason::PendingTask);
        assert_eq!(
            decision.domains,
            ["hot".to_string(), "warm".to_string()].into_iter().collect()
        );
        assert!(PendingTaskSplitPolicy::new(10, 2).evaluate(&queue).is_none());
    }

    #[test]
    fn test_stuck_policy_uses_attempt_threshold() {
        let queue = queue_with(&["a", "b"]);
        let policy = StuckTaskSplitPolicy::new(3, Duration::from_secs(3600), 3);
        assert!(policy.evaluate(&queue).is_none());

        let (_, stuck) = queue.outstanding().iter().next().unwrap();
        stuck.attempt.store(3, Ordering::Relaxed);
        let decision = policy.evaluate(&queue).unwrap();
        assert_eq!(decision.domains, ["a".to_string()].into_iter().collect());
    }

    #[test]
    fn test_stuck_policy_detects_stalled_ack_level() {
        let queue = queue_with(&["blocking", "other"]);
        let policy = StuckTaskSplitPolicy::new(100, Duration::ZERO, 3);
        let decision = policy.evaluate(&queue).unwrap();
        assert_eq!(decision.domains, ["blocking".to_string()].into_iter().collect());
    }

    #[test]
    fn test_selected_domain_policy_isolates_once() {
        let policy = SelectedDomainSplitPolicy::new(vec!["vip".to_string()]);
        let mut queue = queue_with(&[]);
        let decision = policy.evaluate(&queue).unwrap();
        assert_eq!(decision.reason, SplitReason::SelectedDomain);

        let isolated = queue.split(&decision.domains).unwrap();
        assert!(policy.evaluate(&isolated).is_none());
        assert!(policy.evaluate(&queue).is_none());
    }

    #[test]
    fn test_random_policy_respects_probability_and_minimum() {
        let queue = queue_with(&["a", "b", "c"]);
        assert!(RandomSplitPolicy::new(0.0, 1).evaluate(&queue).is_none());
        assert!(RandomSplitPolicy::new(1.0, 10).evaluate(&queue).is_none());
        let decision = RandomSplitPolicy::new(1.0, 1).evaluate(&queue).unwrap();
        assert_eq!(decision.domains.len(), 1);
    }

    #[test]
    fn test_aggregate_returns_first_match() {
        let queue = queue_with(&["a", "a", "b"]);
        let policy = AggregateSplitPolicy::new(vec![
            Box::new(SelectedDomainSplitPolicy::new(Vec::new())),
            Box::new(PendingTaskSplitPolicy::new(1, 1)),
            Box::new(RandomSplitPolicy::new(1.0, 1)),
        ]);
        assert_eq!(policy.evaluate(&queue).unwrap().reason, SplitReason::PendingTask);
    }
}
