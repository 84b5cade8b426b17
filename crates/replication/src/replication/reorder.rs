//! 按工作流运行重排复制任务
//!
//! 每个运行记录期望的下一个事件ID。首个到达的任务直接放行; 之后
//! `first_event_id` 小于期望值的是重复任务, 大于期望值的缓存等待缺口补齐。
//! 缓存为空且空闲超过 `run_idle_ttl` 的运行在过期检查时移除。

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use history_domain::{ResendRequest, ReplicationTask};

struct Buffered {
    task: ReplicationTask,
    since: DateTime<Utc>,
}

struct RunState {
    next_event_id: Option<i64>,
    buffered: BTreeMap<i64, Buffered>,
    last_seen: DateTime<Utc>,
}

impl RunState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            next_event_id: None,
            buffered: BTreeMap::new(),
            last_seen: now,
        }
    }

    /// 放行所有与期望位置衔接的缓存任务, 丢弃已被覆盖的
    fn drain(&mut self, offer: &mut Offer) {
        while let Some(next) = self.next_event_id {
            let Some(first) = self.buffered.first_key_value().map(|(k, _)| *k) else {
                break;
            };
            if first > next {
                break;
            }
            if let Some(entry) = self.buffered.remove(&first) {
                if first == next {
                    self.next_event_id = Some(entry.task.next_event_id);
                    offer.ready.push(entry.task);
                } else {
                    offer.dropped.push(entry.task.message_id);
                }
            }
        }
    }

    /// 跳过缺口: 请求补发 [期望位置, 最早缓存位置) 后从最早缓存位置继续
    fn skip_gap(&mut self, offer: &mut Offer) {
        let Some((first, entry)) = self.buffered.first_key_value() else {
            return;
        };
        let start = self.next_event_id.unwrap_or(*first);
        let task = &entry.task.task;
        offer.resync.push(ResendRequest {
            domain_id: task.domain_id.clone(),
            workflow_id: task.workflow_id.clone(),
            run_id: task.run_id.clone(),
            start_event_id: start,
            end_event_id: *first,
        });
        self.next_event_id = Some(*first);
        self.drain(offer);
    }
}

/// 一次入队或过期检查的结果
#[derive(Debug, Default)]
pub(crate) struct Offer {
    /// 可按顺序应用的任务
    pub ready: Vec<ReplicationTask>,
    /// 重复而被丢弃的任务的消息ID
    pub dropped: Vec<i64>,
    pub resync: Vec<ResendRequest>,
}

impl Offer {
    fn merge(&mut self, other: Offer) {
        self.ready.extend(other.ready);
        self.dropped.extend(other.dropped);
        self.resync.extend(other.resync);
    }
}

pub(crate) struct ReorderBuffer {
    runs: HashMap<String, RunState>,
    max_buffered_per_run: usize,
    run_idle_ttl: chrono::Duration,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl ReorderBuffer {
    pub fn new(max_buffered_per_run: usize, run_idle_ttl: Duration) -> Self {
        Self {
            runs: HashMap::new(),
            max_buffered_per_run: max_buffered_per_run.max(1),
            run_idle_ttl: to_chrono(run_idle_ttl),
        }
    }

    pub fn offer(&mut self, task: ReplicationTask, now: DateTime<Utc>) -> Offer {
        let mut offer = Offer::default();
        let run = self
            .runs
            .entry(task.run_key())
            .or_insert_with(|| RunState::new(now));
        run.last_seen = run.last_seen.max(now);
        match run.next_event_id {
            Some(next) if task.first_event_id < next => offer.dropped.push(task.message_id),
            Some(next) if task.first_event_id > next => {
                if run.buffered.contains_key(&task.first_event_id) {
                    offer.dropped.push(task.message_id);
                } else {
                    run.buffered
                        .insert(task.first_event_id, Buffered { task, since: now });
                    if run.buffered.len() > self.max_buffered_per_run {
                        run.skip_gap(&mut offer);
                    }
                }
            }
            _ => {
                run.next_event_id = Some(task.next_event_id);
                offer.ready.push(task);
                run.drain(&mut offer);
            }
        }
        offer
    }

    /// 缺口存在超过 `older_than` 的运行请求补发并跳过缺口, 随后移除空闲的运行
    ///
    /// 被移除的运行再收到任务时按首个任务放行, 重复由应用侧幂等处理。
    pub fn expire(&mut self, now: DateTime<Utc>, older_than: Duration) -> Offer {
        let mut offer = Offer::default();
        let threshold = to_chrono(older_than);
        for run in self.runs.values_mut() {
            let stale = run
                .buffered
                .values()
                .map(|b| b.since)
                .min()
                .is_some_and(|since| now - since >= threshold);
            if stale {
                let mut skipped = Offer::default();
                run.skip_gap(&mut skipped);
                offer.merge(skipped);
            }
        }
        let idle = self.run_idle_ttl;
        self.runs
            .retain(|_, run| !run.buffered.is_empty() || now - run.last_seen < idle);
        offer
    }

    pub fn buffered_len(&self) -> usize {
        self.runs.values().map(|r| r.buffered.len()).sum()
    }

    /// 仍在跟踪期望位置的运行数
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use history_testing_utils::ReplicationTaskBuilder;

    const IDLE: Duration = Duration::from_secs(60);

    fn task(message_id: i64, first: i64, next: i64) -> ReplicationTask {
        ReplicationTaskBuilder::new(message_id)
            .with_workflow("wf", "run")
            .events(first, next)
            .build()
    }

    fn ids(tasks: &[ReplicationTask]) -> Vec<i64> {
        tasks.iter().map(|t| t.message_id).collect()
    }

    #[test]
    fn test_in_order_tasks_are_ready_immediately() {
        let mut buffer = ReorderBuffer::new(10, IDLE);
        let now = Utc::now();
        assert_eq!(ids(&buffer.offer(task(1, 1, 5), now).ready), vec![1]);
        assert_eq!(ids(&buffer.offer(task(2, 5, 8), now).ready), vec![2]);
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[test]
    fn test_gap_is_buffered_until_filled() {
        let mut buffer = ReorderBuffer::new(10, IDLE);
        let now = Utc::now();
        buffer.offer(task(1, 1, 5), now);
        let offer = buffer.offer(task(3, 8, 10), now);
        assert!(offer.ready.is_empty());
        assert_eq!(buffer.buffered_len(), 1);

        let offer = buffer.offer(task(2, 5, 8), now);
        assert_eq!(ids(&offer.ready), vec![2, 3]);
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut buffer = ReorderBuffer::new(10, IDLE);
        let now = Utc::now();
        buffer.offer(task(1, 1, 5), now);
        buffer.offer(task(2, 5, 8), now);
        let offer = buffer.offer(task(7, 1, 5), now);
        assert_eq!(offer.dropped, vec![7]);

        buffer.offer(task(4, 10, 12), now);
        let offer = buffer.offer(task(5, 10, 12), now);
        assert_eq!(offer.dropped, vec![5]);
    }

    #[test]
    fn test_stale_gap_requests_resync_and_skips() {
        let mut buffer = ReorderBuffer::new(10, IDLE);
        let start = Utc::now();
        buffer.offer(task(1, 1, 5), start);
        buffer.offer(task(3, 8, 10), start);

        let offer = buffer.expire(start + chrono::Duration::seconds(1), Duration::from_secs(5));
        assert!(offer.resync.is_empty());

        let offer = buffer.expire(start + chrono::Duration::seconds(6), Duration::from_secs(5));
        assert_eq!(offer.resync.len(), 1);
        assert_eq!(offer.resync[0].start_event_id, 5);
        assert_eq!(offer.resync[0].end_event_id, 8);
        assert_eq!(ids(&offer.ready), vec![3]);
    }

    #[test]
    fn test_overflow_skips_gap() {
        let mut buffer = ReorderBuffer::new(2, IDLE);
        let now = Utc::now();
        buffer.offer(task(1, 1, 5), now);
        buffer.offer(task(3, 8, 10), now);
        buffer.offer(task(4, 10, 12), now);
        let offer = buffer.offer(task(5, 12, 15), now);
        assert_eq!(offer.resync.len(), 1);
        assert_eq!(ids(&offer.ready), vec![3, 4, 5]);
    }

    #[test]
    fn test_runs_are_independent() {
        let mut buffer = ReorderBuffer::new(10, IDLE);
        let now = Utc::now();
        buffer.offer(task(1, 1, 5), now);
        let other = ReplicationTaskBuilder::new(2)
            .with_workflow("wf-2", "run")
            .events(20, 22)
            .build();
        assert_eq!(ids(&buffer.offer(other, now).ready), vec![2]);
    }

    #[test]
    fn test_idle_runs_are_evicted() {
        let mut buffer = ReorderBuffer::new(10, Duration::from_secs(30));
        let start = Utc::now();
        for i in 0..100 {
            let finished = ReplicationTaskBuilder::new(i)
                .with_workflow(&format!("wf-{i}"), "run")
                .events(1, 5)
                .build();
            buffer.offer(finished, start);
        }
        buffer.offer(task(200, 1, 5), start);
        buffer.offer(task(201, 8, 10), start);
        assert_eq!(buffer.run_count(), 101);

        buffer.expire(start + chrono::Duration::seconds(10), Duration::from_secs(3600));
        assert_eq!(buffer.run_count(), 101);

        // 有缓存的运行即使空闲也保留
        buffer.expire(start + chrono::Duration::seconds(31), Duration::from_secs(3600));
        assert_eq!(buffer.run_count(), 1);
        assert_eq!(buffer.buffered_len(), 1);
    }

    #[test]
    fn test_recently_seen_run_is_kept() {
        let mut buffer = ReorderBuffer::new(10, Duration::from_secs(30));
        let start = Utc::now();
        buffer.offer(task(1, 1, 5), start);
        buffer.offer(task(2, 5, 8), start + chrono::Duration::seconds(20));

        buffer.expire(start + chrono::Duration::seconds(40), Duration::from_secs(3600));
        assert_eq!(buffer.run_count(), 1);
        // 仍按期望位置判定重复
        assert_eq!(
            buffer.offer(task(3, 1, 5), start + chrono::Duration::seconds(40)).dropped,
            vec![3]
        );

        buffer.expire(start + chrono::Duration::seconds(71), Duration::from_secs(3600));
        assert_eq!(buffer.run_count(), 0);
    }
}
