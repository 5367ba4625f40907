//! Consume position seam
//!
//! Consumer offsets are owned by the consume layer. Leaders piggy-back a
//! serialized snapshot of a partition group's positions to followers so a
//! new leader starts close to where consumers left off.

use crate::error::Result;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Consume position provider of the broker
pub trait ConsumePositionProvider: Send + Sync {
    /// Serialized consume positions of every app on a partition group, all
    /// apps when `app` is `None`. `None` when there is nothing to sync.
    fn consume_info_by_group(
        &self,
        topic: &str,
        app: Option<&str>,
        partition_group: u32,
    ) -> Result<Option<String>>;

    /// Apply a snapshot pushed by the leader
    fn set_consume_info(&self, positions: &str) -> Result<bool>;
}

/// Consume positions kept in memory, keyed by topic and partition group.
///
/// Snapshots applied through `set_consume_info` are recorded in order.
#[derive(Debug, Default)]
pub struct MemoryConsumePositions {
    positions: DashMap<(String, u32), String>,
    applied: Mutex<Vec<String>>,
}

impl MemoryConsumePositions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the snapshot served for a partition group
    pub fn set_positions(&self, topic: &str, partition_group: u32, positions: impl Into<String>) {
        self.positions
            .insert((topic.to_string(), partition_group), positions.into());
    }

    /// Snapshots received from a leader, oldest first
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }
}

impl ConsumePositionProvider for MemoryConsumePositions {
    fn consume_info_by_group(
        &self,
        topic: &str,
        _app: Option<&str>,
        partition_group: u32,
    ) -> Result<Option<String>> {
        Ok(self
            .positions
            .get(&(topic.to_string(), partition_group))
            .map(|entry| entry.value().clone()))
    }

    fn set_consume_info(&self, positions: &str) -> Result<bool> {
        self.applied.lock().push(positions.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_consume_positions() {
        let consume = MemoryConsumePositions::new();
        assert_eq!(consume.consume_info_by_group("orders", None, 1).unwrap(), None);

        consume.set_positions("orders", 1, r#"{"app":{"0":42}}"#);
        assert_eq!(
            consume.consume_info_by_group("orders", Some("app"), 1).unwrap().as_deref(),
            Some(r#"{"app":{"0":42}}"#)
        );
        assert_eq!(consume.consume_info_by_group("orders", None, 2).unwrap(), None);

        assert!(consume.set_consume_info("snapshot-1").unwrap());
        assert_eq!(consume.applied(), vec!["snapshot-1".to_string()]);
    }
}
