//! # Rivven Replication
//!
//! Log replication core for partitioned Rivven brokers:
//! - **Append-Entries**: leaders push framed log ranges to every follower
//! - **Quorum Commit**: commit advances once a majority of voters acknowledged
//! - **Leadership Transfer**: timeout-now hands leadership to a caught-up replica
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ReplicationManager                        │
//! ├──────────────┬───────────────────────┬───────────────────────┤
//! │   Registry   │   Replicate Executor  │   Connection Pool     │
//! │ topic/group  │  bounded, shared by   │  one multiplexed TCP  │
//! │  → group     │  every group          │  session per address  │
//! ├──────────────┴───────────────────────┴───────────────────────┤
//! │  ReplicaGroup (one per partition group)                      │
//! │  • role / term          • pacing task (token per replica)    │
//! │  • membership snapshot  • follower append path               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Election, storage and consumer offsets stay outside this crate and plug
//! in through [`LeaderElection`], [`ReplicableStore`] / [`StoreProvider`]
//! and [`ConsumePositionProvider`].
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use rivven_replication::{GroupAssignment, ReplicaNode, ReplicationConfig, ReplicationManager};
//!
//! let manager = ReplicationManager::new(1, ReplicationConfig::default(), stores, consume)?;
//! manager.start();
//! manager.serve(TcpListener::bind("0.0.0.0:50091").await?);
//!
//! let nodes = vec![
//!     ReplicaNode::new(1, "10.0.0.1:50091"),
//!     ReplicaNode::new(2, "10.0.0.2:50091"),
//!     ReplicaNode::new(3, "10.0.0.3:50091"),
//! ];
//! let group = manager
//!     .create_replica_group("orders", 0, GroupAssignment::new(nodes, 1).with_leader(1))
//!     .await?;
//! group.become_leader(1, 1);
//! ```

pub mod config;
pub mod consume;
pub mod election;
pub mod error;
pub mod executor;
pub mod group;
pub mod manager;
pub mod node;
pub mod observability;
pub mod partition;
pub mod protocol;
pub mod replica;
pub mod store;
pub mod transport;

// Re-export main types
pub use config::ReplicationConfig;
pub use consume::{ConsumePositionProvider, MemoryConsumePositions};
pub use election::{LeaderElection, TimeoutNowOutcome};
pub use error::{ReplicationError, Result};
pub use executor::{Dispatcher, ReplicateExecutor};
pub use group::{quorum_commit_position, GroupAssignment, GroupStatus, ReplicaGroup};
pub use manager::ReplicationManager;
pub use node::{NodeId, ReplicaNode, ReplicaRole};
pub use observability::{AppendMetrics, ReplicationMetrics};
pub use partition::{TopicPartitionGroup, GROUP_COORDINATORS_TOPIC};
pub use protocol::{
    AppendEntriesRequest, AppendEntriesResponse, Command, ReplicationRequest, ReplicationResponse,
    TimeoutNowRequest, TimeoutNowResponse,
};
pub use replica::{Replica, ReplicaStatus};
pub use store::{MemoryStore, MemoryStoreProvider, ReplicableStore, StoreProvider};
pub use transport::{ReplicationClient, TcpTransport, TransportConfig};
