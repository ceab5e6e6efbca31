//! Consumer groups and topic-list parsing

use serde::Serialize;
use std::sync::OnceLock;

/// Splits a comma separated topic string, trimming whitespace and dropping empties
pub fn parse_topics(source: &str) -> Vec<String> {
    source
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Topic string together with its lazily parsed topic set
///
/// The parsed set is computed on first access and recomputed only after the
/// source string changes.
#[derive(Debug, Default)]
pub struct TopicList {
    source: String,
    parsed: OnceLock<Vec<String>>,
}

impl TopicList {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            parsed: OnceLock::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn topics(&self) -> &[String] {
        self.parsed.get_or_init(|| parse_topics(&self.source))
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        let source = source.into();
        if source != self.source {
            self.source = source;
            self.parsed = OnceLock::new();
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics().iter().any(|t| t == topic)
    }
}

impl Clone for TopicList {
    fn clone(&self) -> Self {
        Self::new(self.source.clone())
    }
}

/// A named consumer group and its live member count
#[derive(Debug, Clone)]
pub struct ConsumerGroup {
    id: String,
    topics: TopicList,
    members: usize,
    /// Created implicitly for a single independent consumer
    automatic: bool,
}

impl ConsumerGroup {
    pub fn new(id: impl Into<String>, topics: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topics: TopicList::new(topics),
            members: 0,
            automatic: false,
        }
    }

    pub(crate) fn automatic(id: impl Into<String>, topics: impl Into<String>) -> Self {
        Self {
            automatic: true,
            ..Self::new(id, topics)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic_list(&self) -> &TopicList {
        &self.topics
    }

    pub fn topics(&self) -> &[String] {
        self.topics.topics()
    }

    pub fn member_count(&self) -> usize {
        self.members
    }

    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    pub(crate) fn join(&mut self) {
        self.members += 1;
    }

    pub(crate) fn leave(&mut self) {
        self.members = self.members.saturating_sub(1);
    }

    pub(crate) fn clear_members(&mut self) {
        self.members = 0;
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            id: self.id.clone(),
            topics: self.topics().to_vec(),
            members: self.members,
            automatic: self.automatic,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub id: String,
    pub topics: Vec<String>,
    pub members: usize,
    pub automatic: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topics() {
        assert_eq!(parse_topics("t1, t2"), vec!["t1", "t2"]);
        assert_eq!(parse_topics(" a ,, b ,"), vec!["a", "b"]);
        assert!(parse_topics(" , ,").is_empty());
        assert!(parse_topics("").is_empty());
    }

    #[test]
    fn test_topic_list_invalidates_on_change() {
        let mut list = TopicList::new("a,b");
        assert_eq!(list.topics(), ["a", "b"]);
        list.set_source("c");
        assert_eq!(list.topics(), ["c"]);
        assert!(list.contains("c"));
        assert!(!list.contains("a"));
    }

    #[test]
    fn test_member_count_never_underflows() {
        let mut group = ConsumerGroup::new("G1", "t1");
        group.join();
        group.leave();
        group.leave();
        assert_eq!(group.member_count(), 0);
        assert!(!group.is_automatic());
        assert!(ConsumerGroup::automatic("Auto-1", "t").is_automatic());
    }
}
