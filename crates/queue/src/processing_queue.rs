//! 处理队列: 一个域过滤器在 (ack_level, max_level] 区间上的读取与确认状态

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use history_domain::{DomainFilter, ProcessingQueueState, Task, TaskKey};

/// 已读取但未确认的任务
#[derive(Debug, Clone)]
pub struct OutstandingTask {
    pub domain_id: String,
    pub completed: bool,
    /// 与调度中的任务共享的重试计数
    pub attempt: Arc<AtomicU32>,
}

impl OutstandingTask {
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ProcessingQueue {
    state: ProcessingQueueState,
    outstanding: BTreeMap<TaskKey, OutstandingTask>,
    last_ack_change: Instant,
}

impl ProcessingQueue {
    pub fn new(state: ProcessingQueueState) -> Self {
        Self {
            state,
            outstanding: BTreeMap::new(),
            last_ack_change: Instant::now(),
        }
    }

    pub fn state(&self) -> &ProcessingQueueState {
        &self.state
    }

    pub fn level(&self) -> u32 {
        self.state.level
    }

    pub fn ack_level(&self) -> TaskKey {
        self.state.ack_level
    }

    pub fn read_level(&self) -> TaskKey {
        self.state.max_level
    }

    pub fn domain_filter(&self) -> &DomainFilter {
        &self.state.domain_filter
    }

    pub fn outstanding(&self) -> &BTreeMap<TaskKey, OutstandingTask> {
        &self.outstanding
    }

    /// 未完成的在途任务数
    pub fn pending_count(&self) -> usize {
        self.outstanding.values().filter(|t| !t.completed).count()
    }

    /// 各域的未完成任务数
    pub fn pending_by_domain(&self) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for task in self.outstanding.values().filter(|t| !t.completed) {
            *counts.entry(task.domain_id.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// 阻塞确认位置的第一个未完成任务
    pub fn first_pending(&self) -> Option<(&TaskKey, &OutstandingTask)> {
        self.outstanding.iter().find(|(_, t)| !t.completed)
    }

    pub fn last_ack_change(&self) -> Instant {
        self.last_ack_change
    }

    /// 记录一次读取结果, 返回需要调度的新任务
    ///
    /// 读取未耗尽(`more`)时读取位置推进到最后返回的任务; 耗尽时还会推进到
    /// `observed`, 即本轮读取开始前整个处理器见过的最大位置, 让没有匹配任务的
    /// 队列也能前进。`observed` 不会越过本次读取的上界 `max_key`。
    pub fn record_read(
        &mut self,
        tasks: Vec<Task>,
        more: bool,
        observed: TaskKey,
        max_key: TaskKey,
    ) -> Vec<(Task, Arc<AtomicU32>)> {
        let read_level = self.state.max_level;
        let mut last_key = read_level;
        let mut accepted = Vec::with_capacity(tasks.len());

        for task in tasks {
            let key = task.key();
            if key <= read_level || key > max_key || !self.state.domain_filter.matches(&task.domain_id) {
                continue;
            }
            last_key = last_key.max(key);
            let attempt = Arc::new(AtomicU32::new(task.attempt));
            self.outstanding.insert(
                key,
                OutstandingTask {
                    domain_id: task.domain_id.clone(),
                    completed: false,
                    attempt: Arc::clone(&attempt),
                },
            );
            accepted.push((task, attempt));
        }

        self.state.max_level = if more {
            last_key
        } else {
            last_key.max(observed.min(max_key))
        };
        accepted
    }

    /// 标记任务完成, 返回该任务是否属于本队列
    pub fn complete(&mut self, key: TaskKey) -> bool {
        match self.outstanding.get_mut(&key) {
            Some(task) => {
                task.completed = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.outstanding.contains_key(key)
    }

    /// 推进确认位置到连续完成的前缀, 返回新的确认位置
    ///
    /// 没有在途任务时确认位置等于读取位置。
    pub fn update_ack_level(&mut self) -> TaskKey {
        let mut new_ack = self.state.ack_level;
        while let Some(entry) = self.outstanding.first_entry() {
            if !entry.get().completed {
                break;
            }
            let (key, _) = entry.remove_entry();
            new_ack = new_ack.max(key);
        }
        if self.outstanding.is_empty() {
            new_ack = new_ack.max(self.state.max_level);
        }
        if new_ack > self.state.ack_level {
            self.state.ack_level = new_ack;
            self.last_ack_change = Instant::now();
        }
        self.state.ack_level
    }

    /// 读取位置回退到 `key` 之前, 不会低于确认位置
    pub fn rewind_read_level(&mut self, key: TaskKey) {
        let before = TaskKey::new(key.visibility_ms, key.task_id.saturating_sub(1));
        let target = before.max(self.state.ack_level);
        if target < self.state.max_level {
            self.state.max_level = target;
            self.outstanding.retain(|k, _| *k <= target);
        }
    }

    /// 把 `domains` 拆分到下一层的新队列, 在途任务按域迁移
    ///
    /// 交集或差集为空时拆分没有意义, 返回 None。
    pub fn split(&mut self, domains: &BTreeSet<String>) -> Option<ProcessingQueue> {
        let isolated_filter = self.state.domain_filter.intersect(domains);
        let remaining_filter = self.state.domain_filter.subtract(domains);
        if isolated_filter.is_empty() || remaining_filter.is_empty() {
            return None;
        }

        let (moved, kept): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.outstanding)
            .into_iter()
            .partition(|(_, task)| isolated_filter.matches(&task.domain_id));
        self.outstanding = kept;
        self.state.domain_filter = remaining_filter;

        Some(ProcessingQueue {
            state: ProcessingQueueState::new(
                self.state.level + 1,
                self.state.ack_level,
                self.state.max_level,
                isolated_filter,
            ),
            outstanding: moved,
            last_ack_change: self.last_ack_change,
        })
    }

    /// 合并条件: 确认位置和读取位置都相同, 都没有在途任务, 且都不包含受保护的域
    pub fn can_merge(&self, other: &ProcessingQueue, protected: &DomainFilter) -> bool {
        self.state.ack_level == other.state.ack_level
            && self.state.max_level == other.state.max_level
            && self.outstanding.is_empty()
            && other.outstanding.is_empty()
            && !self.state.domain_filter.overlaps(protected)
            && !other.state.domain_filter.overlaps(protected)
    }

    pub fn merge(&mut self, other: ProcessingQueue) {
        self.state.domain_filter = self.state.domain_filter.union(&other.state.domain_filter);
        self.state.level = self.state.level.min(other.state.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use history_domain::{TaskCategory, TaskType};

    fn task(task_id: i64, domain: &str) -> Task {
        Task {
            shard_id: 1,
            category: TaskCategory::Transfer,
            task_type: TaskType::TransferActivity,
            task_id,
            domain_id: domain.into(),
            workflow_id: format!("wf-{task_id}"),
            run_id: "run".into(),
            visibility_timestamp: Utc.timestamp_millis_opt(0).unwrap(),
            version: 0,
            attempt: 0,
            target_cluster: None,
            payload: serde_json::Value::Null,
        }
    }

    fn root_at(task_id: i64) -> ProcessingQueue {
        ProcessingQueue::new(ProcessingQueueState::root(TaskKey::immediate(task_id)))
    }

    #[test]
    fn test_ack_level_stops_at_first_gap() {
        let mut queue = root_at(4);
        let accepted = queue.record_read(vec![task(5, "a"), task(6, "a")], false, TaskKey::MIN, TaskKey::MAX);
        assert_eq!(accepted.len(), 2);
        assert_eq!(queue.read_level(), TaskKey::immediate(6));

        assert!(queue.complete(TaskKey::immediate(6)));
        assert_eq!(queue.update_ack_level(), TaskKey::immediate(4));

        assert!(queue.complete(TaskKey::immediate(5)));
        assert_eq!(queue.update_ack_level(), TaskKey::immediate(6));
        assert!(queue.outstanding().is_empty());
    }

    #[test]
    fn test_duplicate_and_filtered_tasks_are_ignored() {
        let mut queue = root_at(4);
        queue.record_read(vec![task(5, "a")], true, TaskKey::MIN, TaskKey::MAX);
        let accepted = queue.record_read(vec![task(5, "a"), task(7, "b")], true, TaskKey::MIN, TaskKey::MAX);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].0.task_id, 7);

        let mut only_a = ProcessingQueue::new(ProcessingQueueState::new(
            1,
            TaskKey::immediate(4),
            TaskKey::immediate(4),
            DomainFilter::include(["a"]),
        ));
        let accepted = only_a.record_read(vec![task(5, "b")], false, TaskKey::MIN, TaskKey::MAX);
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_exhausted_read_advances_to_observed_level() {
        let mut queue = root_at(0);
        queue.record_read(Vec::new(), false, TaskKey::immediate(40), TaskKey::MAX);
        assert_eq!(queue.read_level(), TaskKey::immediate(40));
        assert_eq!(queue.update_ack_level(), TaskKey::immediate(40));

        // 未耗尽的读取不使用观测位置
        let mut partial = root_at(0);
        partial.record_read(vec![task(3, "a")], true, TaskKey::immediate(40), TaskKey::MAX);
        assert_eq!(partial.read_level(), TaskKey::immediate(3));
    }

    #[test]
    fn test_split_moves_outstanding_tasks_by_domain() {
        let mut queue = root_at(0);
        queue.record_read(
            vec![task(1, "a"), task(2, "b"), task(3, "a")],
            false,
            TaskKey::MIN,
            TaskKey::MAX,
        );
        let domains: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let isolated = queue.split(&domains).unwrap();

        assert_eq!(isolated.level(), 1);
        assert_eq!(isolated.outstanding().len(), 2);
        assert_eq!(queue.outstanding().len(), 1);
        assert!(isolated.domain_filter().matches("a"));
        assert!(!isolated.domain_filter().matches("b"));
        assert!(!queue.domain_filter().matches("a"));
        assert!(queue.domain_filter().matches("zzz"));
        assert_eq!(isolated.read_level(), queue.read_level());
    }

    #[test]
    fn test_split_is_noop_when_nothing_to_isolate() {
        let mut queue = ProcessingQueue::new(ProcessingQueueState::new(
            1,
            TaskKey::MIN,
            TaskKey::MIN,
            DomainFilter::include(["a"]),
        ));
        let same: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let other: BTreeSet<String> = ["b".to_string()].into_iter().collect();
        assert!(queue.split(&same).is_none());
        assert!(queue.split(&other).is_none());
    }

    #[test]
    fn test_merge_reverses_split() {
        let mut queue = root_at(10);
        let domains: BTreeSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
        let isolated = queue.split(&domains).unwrap();
        let protected = DomainFilter::include(Vec::<String>::new());

        assert!(queue.can_merge(&isolated, &protected));
        queue.merge(isolated);
        assert_eq!(queue.level(), 0);
        assert!(queue.domain_filter().is_universal());
    }

    #[test]
    fn test_merge_refused_with_outstanding_or_protected_domains() {
        let mut queue = root_at(0);
        let domains: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let mut isolated = queue.split(&domains).unwrap();
        let none = DomainFilter::include(Vec::<String>::new());

        isolated.record_read(vec![task(1, "a")], false, TaskKey::MIN, TaskKey::MAX);
        queue.record_read(Vec::new(), false, TaskKey::immediate(1), TaskKey::MAX);
        assert!(!queue.can_merge(&isolated, &none));

        isolated.complete(TaskKey::immediate(1));
        isolated.update_ack_level();
        queue.update_ack_level();
        assert!(queue.can_merge(&isolated, &none));
        assert!(!queue.can_merge(&isolated, &DomainFilter::include(["a"])));
    }

    #[test]
    fn test_rewind_never_goes_below_ack_level() {
        let mut queue = root_at(10);
        queue.record_read(vec![task(11, "a"), task(15, "a")], false, TaskKey::MIN, TaskKey::MAX);
        queue.rewind_read_level(TaskKey::immediate(13));
        assert_eq!(queue.read_level(), TaskKey::immediate(12));
        assert!(queue.contains(&TaskKey::immediate(11)));
        assert!(!queue.contains(&TaskKey::immediate(15)));

        queue.rewind_read_level(TaskKey::immediate(3));
        assert_eq!(queue.read_level(), TaskKey::immediate(10));
    }
}
