//! Per-replica replication progress tracked by a leader

use crate::node::{NodeId, ReplicaNode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Replication progress of one remote node for one partition group.
///
/// Shared through immutable membership snapshots, so every field is atomic.
/// Writers are the owning group's pacing task and `become_leader`.
#[derive(Debug)]
pub struct Replica {
    replica_id: NodeId,
    address: String,

    /// Next log position to push to the replica
    next_position: AtomicU64,

    /// Last position the replica acknowledged as written
    write_position: AtomicU64,

    /// Whether log matching holds since the current push sequence began
    matched: AtomicBool,

    /// Wall clock millis of the last append-entries response
    last_append_success_time: AtomicU64,

    /// Wall clock millis of the last consume position sync
    last_replicate_consume_pos_time: AtomicU64,
}

impl Replica {
    pub fn new(replica_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            replica_id,
            address: address.into(),
            next_position: AtomicU64::new(0),
            write_position: AtomicU64::new(0),
            matched: AtomicBool::new(false),
            last_append_success_time: AtomicU64::new(0),
            last_replicate_consume_pos_time: AtomicU64::new(0),
        }
    }

    pub fn replica_id(&self) -> NodeId {
        self.replica_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn next_position(&self) -> u64 {
        self.next_position.load(Ordering::SeqCst)
    }

    pub fn set_next_position(&self, position: u64) {
        self.next_position.store(position, Ordering::SeqCst);
    }

    pub fn write_position(&self) -> u64 {
        self.write_position.load(Ordering::SeqCst)
    }

    pub fn set_write_position(&self, position: u64) {
        self.write_position.store(position, Ordering::SeqCst);
    }

    pub fn is_matched(&self) -> bool {
        self.matched.load(Ordering::SeqCst)
    }

    pub fn set_matched(&self, matched: bool) {
        self.matched.store(matched, Ordering::SeqCst);
    }

    pub fn last_append_success_time(&self) -> u64 {
        self.last_append_success_time.load(Ordering::SeqCst)
    }

    pub fn set_last_append_success_time(&self, millis: u64) {
        self.last_append_success_time.store(millis, Ordering::SeqCst);
    }

    pub fn last_replicate_consume_pos_time(&self) -> u64 {
        self.last_replicate_consume_pos_time.load(Ordering::SeqCst)
    }

    /// Claim the consume position sync slot if `interval_ms` has elapsed.
    ///
    /// Returns false when the previous sync is too recent.
    pub fn try_claim_consume_pos_sync(&self, now_ms: u64, interval_ms: u64) -> bool {
        let last = self.last_replicate_consume_pos_time();
        if now_ms.saturating_sub(last) < interval_ms {
            return false;
        }
        self.last_replicate_consume_pos_time
            .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Point-in-time copy of the progress counters
    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            replica_id: self.replica_id,
            address: self.address.clone(),
            next_position: self.next_position(),
            write_position: self.write_position(),
            matched: self.is_matched(),
            last_append_success_time: self.last_append_success_time(),
        }
    }
}

impl From<&ReplicaNode> for Replica {
    fn from(node: &ReplicaNode) -> Self {
        Replica::new(node.id, node.address.clone())
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replica {} ({}): next {}, write {}, matched {}",
            self.replica_id,
            self.address,
            self.next_position(),
            self.write_position(),
            self.is_matched()
        )
    }
}

/// Snapshot of a replica's progress, for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub replica_id: NodeId,
    pub address: String,
    pub next_position: u64,
    pub write_position: u64,
    pub matched: bool,
    pub last_append_success_time: u64,
}

/// Milliseconds since the unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_replica_is_unmatched() {
        let replica = Replica::new(2, "127.0.0.1:50092");
        assert_eq!(replica.replica_id(), 2);
        assert_eq!(replica.address(), "127.0.0.1:50092");
        assert_eq!(replica.next_position(), 0);
        assert_eq!(replica.write_position(), 0);
        assert!(!replica.is_matched());
    }

    #[test]
    fn test_consume_pos_sync_is_throttled() {
        let replica = Replica::new(2, "127.0.0.1:50092");

        assert!(replica.try_claim_consume_pos_sync(10_000, 5_000));
        assert!(!replica.try_claim_consume_pos_sync(12_000, 5_000));
        assert!(!replica.try_claim_consume_pos_sync(14_999, 5_000));
        assert!(replica.try_claim_consume_pos_sync(15_000, 5_000));
        assert_eq!(replica.last_replicate_consume_pos_time(), 15_000);
    }

    #[test]
    fn test_status_snapshot() {
        let replica = Replica::from(&ReplicaNode::new(4, "10.0.0.4:50091"));
        replica.set_next_position(120);
        replica.set_write_position(100);
        replica.set_matched(true);

        let status = replica.status();
        assert_eq!(status.replica_id, 4);
        assert_eq!(status.next_position, 120);
        assert_eq!(status.write_position, 100);
        assert!(status.matched);
    }
}
