//! Leader election seam
//!
//! Election (voting, candidate state, timers) lives outside this crate. The
//! replication core reports term-fencing violations through `step_down`, and
//! the election layer drives `ReplicaGroup::become_leader`,
//! `ReplicaGroup::become_follower` and transfer completion.

/// Outcome of a timeout-now command handled by the transferee's election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutNowOutcome {
    /// Whether the transferee started a campaign
    pub success: bool,
    /// The transferee's current term
    pub term: u64,
}

/// Election collaborator of one partition group
pub trait LeaderElection: Send + Sync {
    /// A higher term was observed; stop acting as leader
    fn step_down(&self, term: u64);

    /// Start campaigning immediately at the request of the current leader
    fn handle_timeout_now(&self, term: u64) -> TimeoutNowOutcome;
}
