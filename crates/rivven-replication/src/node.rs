//! Node identity types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker-wide node identifier, also used as the replica id inside a group
pub type NodeId = u32;

/// A member of a partition group as seen by the election layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaNode {
    /// Node identifier
    pub id: NodeId,

    /// Replication address, `host:port`
    pub address: String,
}

impl ReplicaNode {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

impl fmt::Display for ReplicaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Replication role of the local node within one partition group.
///
/// The election layer's candidate state is never held here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    /// Accepts append-entries from the leader
    Follower,
    /// Drives replication to every other replica
    Leader,
    /// Leader that is handing leadership to a caught-up follower
    Transferring,
}

impl ReplicaRole {
    /// Check if this role drives replication
    pub fn is_leading(&self) -> bool {
        matches!(self, ReplicaRole::Leader | ReplicaRole::Transferring)
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaRole::Follower => "follower",
            ReplicaRole::Leader => "leader",
            ReplicaRole::Transferring => "transferring",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_is_leading() {
        assert!(ReplicaRole::Leader.is_leading());
        assert!(ReplicaRole::Transferring.is_leading());
        assert!(!ReplicaRole::Follower.is_leading());
    }

    #[test]
    fn test_replica_node_display() {
        let node = ReplicaNode::new(3, "10.0.0.3:50091");
        assert_eq!(node.to_string(), "3@10.0.0.3:50091");
    }
}
