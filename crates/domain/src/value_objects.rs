use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entities::TaskKey;

/// 域过滤器: 包含集合或排除集合
///
/// `reverse_match = false` 时只匹配 `domain_ids` 中的域;
/// `reverse_match = true` 时匹配除 `domain_ids` 之外的所有域。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainFilter {
    pub domain_ids: BTreeSet<String>,
    pub reverse_match: bool,
}

impl DomainFilter {
    /// 匹配所有域
    pub fn all() -> Self {
        Self {
            domain_ids: BTreeSet::new(),
            reverse_match: true,
        }
    }

    pub fn include<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain_ids: domains.into_iter().map(Into::into).collect(),
            reverse_match: false,
        }
    }

    pub fn exclude<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain_ids: domains.into_iter().map(Into::into).collect(),
            reverse_match: true,
        }
    }

    pub fn matches(&self, domain_id: &str) -> bool {
        self.domain_ids.contains(domain_id) != self.reverse_match
    }

    pub fn is_empty(&self) -> bool {
        !self.reverse_match && self.domain_ids.is_empty()
    }

    pub fn is_universal(&self) -> bool {
        self.reverse_match && self.domain_ids.is_empty()
    }

    /// F ∩ D
    pub fn intersect(&self, domains: &BTreeSet<String>) -> Self {
        let domain_ids = if self.reverse_match {
            domains.difference(&self.domain_ids).cloned().collect()
        } else {
            self.domain_ids.intersection(domains).cloned().collect()
        };
        Self {
            domain_ids,
            reverse_match: false,
        }
    }

    /// F − D
    pub fn subtract(&self, domains: &BTreeSet<String>) -> Self {
        if self.reverse_match {
            Self {
                domain_ids: self.domain_ids.union(domains).cloned().collect(),
                reverse_match: true,
            }
        } else {
            Self {
                domain_ids: self.domain_ids.difference(domains).cloned().collect(),
                reverse_match: false,
            }
        }
    }

    /// F ∪ G
    pub fn union(&self, other: &DomainFilter) -> Self {
        match (self.reverse_match, other.reverse_match) {
            (false, false) => Self {
                domain_ids: self.domain_ids.union(&other.domain_ids).cloned().collect(),
                reverse_match: false,
            },
            (true, false) => Self {
                domain_ids: self
                    .domain_ids
                    .difference(&other.domain_ids)
                    .cloned()
                    .collect(),
                reverse_match: true,
            },
            (false, true) => other.union(self),
            (true, true) => Self {
                domain_ids: self
                    .domain_ids
                    .intersection(&other.domain_ids)
                    .cloned()
                    .collect(),
                reverse_match: true,
            },
        }
    }

    /// 两个过滤器是否有共同匹配的域
    pub fn overlaps(&self, other: &DomainFilter) -> bool {
        match (self.reverse_match, other.reverse_match) {
            // 两个排除集合的补集在无限域空间中必然相交
            (true, true) => true,
            (false, false) => !self.domain_ids.is_disjoint(&other.domain_ids),
            (false, true) => self
                .domain_ids
                .iter()
                .any(|d| !other.domain_ids.contains(d)),
            (true, false) => other.overlaps(self),
        }
    }
}

impl Default for DomainFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// 处理队列的持久化状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingQueueState {
    /// 拆分深度, 根队列为 0
    pub level: u32,
    /// 已连续确认的位置
    pub ack_level: TaskKey,
    /// 已读取到的最远位置
    pub max_level: TaskKey,
    pub domain_filter: DomainFilter,
}

impl ProcessingQueueState {
    pub fn new(level: u32, ack_level: TaskKey, max_level: TaskKey, domain_filter: DomainFilter) -> Self {
        Self {
            level,
            ack_level,
            max_level,
            domain_filter,
        }
    }

    /// 覆盖全部域的根队列状态
    pub fn root(ack_level: TaskKey) -> Self {
        Self::new(0, ack_level, ack_level, DomainFilter::all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIVERSE: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

    fn set(domains: &[&str]) -> BTreeSet<String> {
        domains.iter().map(|d| d.to_string()).collect()
    }

    fn matched(filter: &DomainFilter) -> BTreeSet<&'static str> {
        UNIVERSE
            .iter()
            .copied()
            .filter(|d| filter.matches(d))
            .collect()
    }

    #[test]
    fn test_split_partitions_include_filter() {
        let filter = DomainFilter::include(["a", "b", "c"]);
        let moved = set(&["b", "d"]);
        let inside = filter.intersect(&moved);
        let rest = filter.subtract(&moved);

        assert_eq!(matched(&inside), ["b"].into_iter().collect());
        assert_eq!(matched(&rest), ["a", "c"].into_iter().collect());
        assert!(!inside.overlaps(&rest));
        assert_eq!(matched(&inside.union(&rest)), matched(&filter));
    }

    #[test]
    fn test_split_partitions_exclude_filter() {
        let filter = DomainFilter::exclude(["a"]);
        let moved = set(&["a", "b", "c"]);
        let inside = filter.intersect(&moved);
        let rest = filter.subtract(&moved);

        assert_eq!(matched(&inside), ["b", "c"].into_iter().collect());
        assert_eq!(matched(&rest), ["d", "e", "f"].into_iter().collect());
        assert!(!inside.overlaps(&rest));
        assert!(!rest.matches("a"));
        assert!(rest.matches("zzz"));
        assert_eq!(inside.union(&rest), filter);
    }

    #[test]
    fn test_universal_and_empty() {
        assert!(DomainFilter::all().is_universal());
        assert!(DomainFilter::include(Vec::<String>::new()).is_empty());
        let filter = DomainFilter::all().subtract(&set(&["x"]));
        assert!(!filter.matches("x"));
        assert!(filter.union(&DomainFilter::include(["x"])).is_universal());
    }

    #[test]
    fn test_overlaps() {
        assert!(DomainFilter::include(["a"]).overlaps(&DomainFilter::all()));
        assert!(!DomainFilter::include(["a"]).overlaps(&DomainFilter::exclude(["a"])));
        assert!(DomainFilter::exclude(["a"]).overlaps(&DomainFilter::exclude(["b"])));
    }
}
