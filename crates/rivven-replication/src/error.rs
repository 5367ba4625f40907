//! Replication error types

use crate::node::NodeId;
use thiserror::Error;

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Replication errors
#[derive(Debug, Error)]
pub enum ReplicationError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Group/Membership Errors ====================
    #[error("replicable store not found: {topic}/{partition_group}")]
    StoreNotFound { topic: String, partition_group: u32 },

    #[error("replica not found: {0}")]
    ReplicaNotFound(NodeId),

    #[error("replica already exists: {0}")]
    ReplicaExists(NodeId),

    #[error("replica group already started")]
    AlreadyStarted,

    #[error("replica group stopped")]
    GroupStopped,

    // ==================== Role Errors ====================
    #[error("not leader: current leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    // ==================== Storage Errors ====================
    #[error("storage operation timed out")]
    StorageTimeout,

    #[error("position {position} out of range [{left}, {right}]")]
    PositionOutOfRange { position: u64, left: u64, right: u64 },

    #[error("corrupt data: {0}")]
    CorruptData(String),

    // ==================== Protocol Errors ====================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // ==================== Network Errors ====================
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("replicate executor saturated: {capacity} commands in flight")]
    ExecutorSaturated { capacity: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Internal Errors ====================
    #[error("internal error: {0}")]
    Internal(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ReplicationError {
    /// Check if the failed operation may succeed when retried later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ReplicationError::Timeout
                | ReplicationError::StorageTimeout
                | ReplicationError::ConnectionFailed(_)
                | ReplicationError::ConnectionClosed
                | ReplicationError::ExecutorSaturated { .. }
                | ReplicationError::NotLeader { .. }
        )
    }

    /// Check if this is a storage timeout.
    ///
    /// A follower that times out while appending keeps the leader's start
    /// position, every other append failure forces a resync.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ReplicationError::Timeout | ReplicationError::StorageTimeout
        )
    }

    /// Check if this is a fatal error requiring operator attention
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplicationError::CorruptData(_))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ReplicationError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ReplicationError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ReplicationError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ReplicationError::ChannelClosed
    }
}

impl From<tokio::time::error::Elapsed> for ReplicationError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ReplicationError::Timeout
    }
}

impl From<postcard::Error> for ReplicationError {
    fn from(e: postcard::Error) -> Self {
        ReplicationError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(ReplicationError::Timeout.is_retriable());
        assert!(ReplicationError::ConnectionClosed.is_retriable());
        assert!(ReplicationError::ExecutorSaturated { capacity: 1 }.is_retriable());
        assert!(!ReplicationError::ReplicaNotFound(3).is_retriable());
        assert!(!ReplicationError::CorruptData("bad".into()).is_retriable());
    }

    #[test]
    fn test_timeout_classification() {
        assert!(ReplicationError::StorageTimeout.is_timeout());
        assert!(ReplicationError::Timeout.is_timeout());
        assert!(!ReplicationError::CorruptData("bad crc".into()).is_timeout());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ReplicationError::CorruptData("bad crc".into()).is_fatal());
        assert!(!ReplicationError::Timeout.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = ReplicationError::PositionOutOfRange {
            position: 10,
            left: 20,
            right: 30,
        };
        assert_eq!(err.to_string(), "position 10 out of range [20, 30]");

        let err = ReplicationError::StoreNotFound {
            topic: "orders".into(),
            partition_group: 2,
        };
        assert_eq!(err.to_string(), "replicable store not found: orders/2");
    }
}
