//! What the source reads: topics, a topic pattern, or explicit partitions

use crate::consumer::error::{SourceError, SourceResult};
use crate::consumer::message::{TopicPartition, TopicPartitionOffset};
use regex::Regex;

/// Subscription mode of the source stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Group-managed subscription to a list of topics
    Topics(Vec<String>),
    /// Group-managed subscription to every topic matching a regex
    TopicPattern(String),
    /// Manual assignment of partitions, starting at the committed offsets
    Assignment(Vec<TopicPartition>),
    /// Manual assignment of partitions, starting at the given offsets
    AssignmentWithOffset(Vec<TopicPartitionOffset>),
}

impl Subscription {
    /// Subscribe to the given topics
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscription::Topics(topics.into_iter().map(Into::into).collect())
    }

    /// Subscribe to topics matching `pattern`
    pub fn topic_pattern(pattern: impl Into<String>) -> Self {
        Subscription::TopicPattern(pattern.into())
    }

    /// Assign explicit partitions
    pub fn assignment(partitions: Vec<TopicPartition>) -> Self {
        Subscription::Assignment(partitions)
    }

    /// Assign explicit partitions with starting offsets
    pub fn assignment_with_offset(partitions: Vec<TopicPartitionOffset>) -> Self {
        Subscription::AssignmentWithOffset(partitions)
    }

    /// Whether partitions are managed by the consumer group
    pub fn is_group_managed(&self) -> bool {
        matches!(self, Subscription::Topics(_) | Subscription::TopicPattern(_))
    }

    /// Partitions owned from the start, for manual assignment
    pub fn initial_partitions(&self) -> Vec<TopicPartition> {
        match self {
            Subscription::Assignment(partitions) => partitions.clone(),
            Subscription::AssignmentWithOffset(partitions) => partitions
                .iter()
                .map(|p| p.topic_partition.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Validate the subscription
    pub fn validate(&self) -> SourceResult<()> {
        match self {
            Subscription::Topics(topics) => {
                if topics.is_empty() || topics.iter().any(|t| t.trim().is_empty()) {
                    return Err(SourceError::Subscription(
                        "Topics cannot be empty".to_string(),
                    ));
                }
            }
            Subscription::TopicPattern(pattern) => {
                Regex::new(pattern.trim_start_matches('^')).map_err(|e| {
                    SourceError::Subscription(format!("Invalid topic pattern '{}': {}", pattern, e))
                })?;
            }
            Subscription::Assignment(partitions) => {
                if partitions.is_empty() {
                    return Err(SourceError::Subscription(
                        "Assignment cannot be empty".to_string(),
                    ));
                }
            }
            Subscription::AssignmentWithOffset(partitions) => {
                if partitions.is_empty() {
                    return Err(SourceError::Subscription(
                        "Assignment cannot be empty".to_string(),
                    ));
                }
                if let Some(p) = partitions.iter().find(|p| p.offset < 0) {
                    return Err(SourceError::Subscription(format!(
                        "Negative starting offset {} for {}",
                        p.offset, p.topic_partition
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Pattern in the form librdkafka recognises as a regex subscription
pub(crate) fn client_pattern(pattern: &str) -> String {
    if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        format!("^{}", pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_validation() {
        assert!(Subscription::topics(["alerts"]).validate().is_ok());
        assert!(Subscription::topics(Vec::<String>::new()).validate().is_err());
        assert!(Subscription::topics([""]).validate().is_err());
    }

    #[test]
    fn test_pattern_validation() {
        assert!(Subscription::topic_pattern("logs-.*").validate().is_ok());
        assert!(Subscription::topic_pattern("logs-(").validate().is_err());
        assert_eq!(client_pattern("logs-.*"), "^logs-.*");
        assert_eq!(client_pattern("^logs-.*"), "^logs-.*");
    }

    #[test]
    fn test_initial_partitions() {
        let sub = Subscription::assignment_with_offset(vec![
            TopicPartitionOffset::new("a", 0, 10),
            TopicPartitionOffset::new("a", 1, 0),
        ]);
        assert!(!sub.is_group_managed());
        assert_eq!(
            sub.initial_partitions(),
            vec![TopicPartition::new("a", 0), TopicPartition::new("a", 1)]
        );
        assert!(Subscription::topics(["a"]).initial_partitions().is_empty());

        let negative = Subscription::assignment_with_offset(vec![TopicPartitionOffset::new("a", 0, -5)]);
        assert!(negative.validate().is_err());
    }
}
