//! Partition group identity

use serde::{Deserialize, Serialize};

/// Internal topic holding group coordinator state, never replicated
pub const GROUP_COORDINATORS_TOPIC: &str = "__group_coordinators";

/// Unique partition group identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartitionGroup {
    pub topic: String,
    pub partition_group: u32,
}

impl TopicPartitionGroup {
    pub fn new(topic: impl Into<String>, partition_group: u32) -> Self {
        Self {
            topic: topic.into(),
            partition_group,
        }
    }

    /// Internal coordinator topics are exempt from replication
    pub fn is_replicated(&self) -> bool {
        !self.topic.eq_ignore_ascii_case(GROUP_COORDINATORS_TOPIC)
    }
}

impl std::fmt::Display for TopicPartitionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(TopicPartitionGroup::new("orders", 4).to_string(), "orders/4");
    }

    #[test]
    fn test_coordinator_topic_not_replicated() {
        assert!(TopicPartitionGroup::new("orders", 0).is_replicated());
        assert!(!TopicPartitionGroup::new("__group_coordinators", 0).is_replicated());
        assert!(!TopicPartitionGroup::new("__GROUP_COORDINATORS", 1).is_replicated());
    }
}
