//! Replica group: replication state machine of one partition group
//!
//! A group is either a follower, accepting append-entries from its leader,
//! or a leader pushing its log to every other replica. Leaders run one
//! pacing task per group that decides when each replica gets its next push:
//!
//! ```text
//!              ┌──────────────────────── pacing task ───────────────────────┐
//!  tokens ───► │ min-heap (deadline, seq, replica) ──► fire ──► executor     │
//!              │        ▲                                          │        │
//!              │        └──── re-arm ◄── PacerEvent (mpsc) ◄───────┘        │
//!              └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every replica owns exactly one token, so at most one append-entries
//! request is in flight per replica. Responses come back to the pacing task
//! as [`PacerEvent`]s, which keeps replica progress single-writer.

use crate::config::ReplicationConfig;
use crate::consume::ConsumePositionProvider;
use crate::election::{LeaderElection, TimeoutNowOutcome};
use crate::error::{ReplicationError, Result};
use crate::executor::Dispatcher;
use crate::node::{NodeId, ReplicaNode, ReplicaRole};
use crate::observability::{AppendMetrics, ReplicationMetrics};
use crate::partition::TopicPartitionGroup;
use crate::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, Command, ReplicateConsumePosRequest,
    ReplicationResponse, TimeoutNowRequest, TimeoutNowResponse,
};
use crate::replica::{now_millis, Replica, ReplicaStatus};
use crate::store::ReplicableStore;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Re-arm delay of the local token when a single voter has nothing to commit
const SINGLE_REPLICA_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Re-arm delay of a replica added while the group is running
const NEW_REPLICA_DELAY: Duration = Duration::from_secs(1);

/// Commit position agreed by a strict majority of `write_positions`.
///
/// Positions are sorted ascending and the entry at index `⌊N/2⌋` wins.
/// `None` for an empty slice.
pub fn quorum_commit_position(write_positions: &[u64]) -> Option<u64> {
    if write_positions.is_empty() {
        return None;
    }
    let mut sorted = write_positions.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}

// ============================================================================
// Assignment & Status
// ============================================================================

/// Membership and leadership of a partition group, as assigned by the
/// election layer
#[derive(Debug, Clone)]
pub struct GroupAssignment {
    /// Every replica, the local node included
    pub nodes: Vec<ReplicaNode>,
    /// Replicas that receive the log but do not vote on commit
    pub learners: HashSet<NodeId>,
    pub local_replica_id: NodeId,
    pub leader_id: Option<NodeId>,
}

impl GroupAssignment {
    pub fn new(nodes: Vec<ReplicaNode>, local_replica_id: NodeId) -> Self {
        Self {
            nodes,
            learners: HashSet::new(),
            local_replica_id,
            leader_id: None,
        }
    }

    pub fn with_leader(mut self, leader_id: NodeId) -> Self {
        self.leader_id = Some(leader_id);
        self
    }

    pub fn with_learners(mut self, learners: impl IntoIterator<Item = NodeId>) -> Self {
        self.learners = learners.into_iter().collect();
        self
    }
}

/// Point-in-time view of a group, for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatus {
    pub partition_group: TopicPartitionGroup,
    pub role: ReplicaRole,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub left_position: u64,
    pub right_position: u64,
    pub commit_position: u64,
    pub replicas: Vec<ReplicaStatus>,
}

// ============================================================================
// Internal State
// ============================================================================

/// Immutable membership snapshot
#[derive(Debug, Default)]
struct Membership {
    replicas: Vec<Arc<Replica>>,
    voters: Vec<Arc<Replica>>,
}

impl Membership {
    fn get(&self, replica_id: NodeId) -> Option<&Arc<Replica>> {
        self.replicas.iter().find(|r| r.replica_id() == replica_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct Transfer {
    transferee: NodeId,
    timeout_now_position: u64,
    timeout_now_sent: bool,
}

#[derive(Debug)]
struct RoleState {
    role: ReplicaRole,
    current_term: u64,
    leader_id: Option<NodeId>,
    transfer: Option<Transfer>,
}

#[derive(Default)]
struct PacerHandle {
    events: Option<mpsc::UnboundedReceiver<PacerEvent>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Completion results delivered to the pacing task
enum PacerEvent {
    Arm {
        replica_id: NodeId,
        delay: Duration,
    },
    AppendEntriesCompleted {
        replica: Arc<Replica>,
        request_term: u64,
        entries_len: usize,
        started: Instant,
        result: Result<AppendEntriesResponse>,
    },
    TimeoutNowCompleted {
        transferee: NodeId,
        result: Result<TimeoutNowResponse>,
    },
}

/// Deadline-ordered tokens, at most one per replica
#[derive(Default)]
struct Tokens {
    heap: BinaryHeap<Reverse<(Instant, u64, NodeId)>>,
    armed: HashMap<NodeId, (Instant, u64)>,
    seq: u64,
}

impl Tokens {
    fn arm(&mut self, replica_id: NodeId, delay: Duration) {
        let deadline = Instant::now() + delay;
        if let Some((armed_at, _)) = self.armed.get(&replica_id) {
            if *armed_at <= deadline {
                return;
            }
        }
        self.seq += 1;
        self.armed.insert(replica_id, (deadline, self.seq));
        self.heap.push(Reverse((deadline, self.seq, replica_id)));
    }

    fn is_current(&self, seq: u64, replica_id: NodeId) -> bool {
        matches!(self.armed.get(&replica_id), Some((_, armed_seq)) if *armed_seq == seq)
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq, replica_id))) = self.heap.peek().copied() {
            if self.is_current(seq, replica_id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every token due at `now`
    fn take_ready(&mut self, now: Instant) -> Vec<NodeId> {
        let mut ready = Vec::new();
        while let Some(Reverse((deadline, seq, replica_id))) = self.heap.peek().copied() {
            if !self.is_current(seq, replica_id) {
                self.heap.pop();
                continue;
            }
            if deadline > now {
                break;
            }
            self.heap.pop();
            self.armed.remove(&replica_id);
            ready.push(replica_id);
        }
        ready
    }

    fn len(&self) -> usize {
        self.armed.len()
    }
}

// ============================================================================
// Replica Group
// ============================================================================

/// Replication state machine of one partition group
pub struct ReplicaGroup {
    tpg: TopicPartitionGroup,
    local_replica_id: NodeId,
    config: Arc<ReplicationConfig>,
    store: Arc<dyn ReplicableStore>,
    consume: Arc<dyn ConsumePositionProvider>,
    dispatcher: Arc<Dispatcher>,
    election: RwLock<Option<Arc<dyn LeaderElection>>>,

    membership: RwLock<Arc<Membership>>,
    state: Mutex<RoleState>,

    /// Serializes commit computation
    commit_lock: Mutex<()>,

    events: mpsc::UnboundedSender<PacerEvent>,
    pacer: Mutex<PacerHandle>,
    role_changed: Arc<Notify>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl fmt::Debug for ReplicaGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReplicaGroup")
            .field("tpg", &self.tpg)
            .field("local_replica_id", &self.local_replica_id)
            .field("role", &state.role)
            .field("term", &state.current_term)
            .field("leader_id", &state.leader_id)
            .finish_non_exhaustive()
    }
}

impl ReplicaGroup {
    /// Create a group in the role its assignment implies: leader when the
    /// assigned leader is the local node, follower otherwise.
    pub fn new(
        tpg: TopicPartitionGroup,
        assignment: GroupAssignment,
        config: Arc<ReplicationConfig>,
        store: Arc<dyn ReplicableStore>,
        consume: Arc<dyn ConsumePositionProvider>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<Self>> {
        let GroupAssignment {
            nodes,
            learners,
            local_replica_id,
            leader_id,
        } = assignment;

        if !nodes.iter().any(|n| n.id == local_replica_id) {
            return Err(ReplicationError::InvalidConfig(format!(
                "local replica {} is not a member of {}",
                local_replica_id, tpg
            )));
        }

        let right = store.right_position();
        let mut replicas: Vec<Arc<Replica>> = Vec::with_capacity(nodes.len());
        for node in &nodes {
            if replicas.iter().any(|r| r.replica_id() == node.id) {
                return Err(ReplicationError::ReplicaExists(node.id));
            }
            let replica = Replica::from(node);
            replica.set_next_position(right);
            replicas.push(Arc::new(replica));
        }
        let voters = replicas
            .iter()
            .filter(|r| !learners.contains(&r.replica_id()))
            .cloned()
            .collect();

        let role = if leader_id == Some(local_replica_id) {
            ReplicaRole::Leader
        } else {
            ReplicaRole::Follower
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            partition_group = %tpg,
            node = local_replica_id,
            role = %role,
            leader = ?leader_id,
            replicas = nodes.len(),
            learners = learners.len(),
            "Created replica group"
        );

        Ok(Arc::new(Self {
            tpg,
            local_replica_id,
            config,
            store,
            consume,
            dispatcher,
            election: RwLock::new(None),
            membership: RwLock::new(Arc::new(Membership { replicas, voters })),
            state: Mutex::new(RoleState {
                role,
                current_term: 0,
                leader_id,
                transfer: None,
            }),
            commit_lock: Mutex::new(()),
            events: events_tx,
            pacer: Mutex::new(PacerHandle {
                events: Some(events_rx),
                ..Default::default()
            }),
            role_changed: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    // ---- Accessors ----

    pub fn topic_partition_group(&self) -> &TopicPartitionGroup {
        &self.tpg
    }

    pub fn local_replica_id(&self) -> NodeId {
        self.local_replica_id
    }

    pub fn store(&self) -> &Arc<dyn ReplicableStore> {
        &self.store
    }

    pub fn role(&self) -> ReplicaRole {
        self.state.lock().role
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.role().is_leading()
    }

    /// Replica currently receiving leadership, if any
    pub fn transferee(&self) -> Option<NodeId> {
        self.state.lock().transfer.map(|t| t.transferee)
    }

    /// Position the transferee must reach before timeout-now is sent
    pub fn timeout_now_position(&self) -> Option<u64> {
        self.state.lock().transfer.map(|t| t.timeout_now_position)
    }

    pub fn replica(&self, replica_id: NodeId) -> Option<Arc<Replica>> {
        self.membership().get(replica_id).cloned()
    }

    /// Every replica, learners included
    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        self.membership().replicas.clone()
    }

    /// Voting replicas
    pub fn voters(&self) -> Vec<Arc<Replica>> {
        self.membership().voters.clone()
    }

    pub fn set_leader_election(&self, election: Arc<dyn LeaderElection>) {
        *self.election.write() = Some(election);
    }

    pub fn status(&self) -> GroupStatus {
        let (role, term, leader_id) = {
            let state = self.state.lock();
            (state.role, state.current_term, state.leader_id)
        };
        GroupStatus {
            partition_group: self.tpg.clone(),
            role,
            term,
            leader_id,
            left_position: self.store.left_position(),
            right_position: self.store.right_position(),
            commit_position: self.store.commit_position(),
            replicas: self.membership().replicas.iter().map(|r| r.status()).collect(),
        }
    }

    fn membership(&self) -> Arc<Membership> {
        self.membership.read().clone()
    }

    /// Whether the pacing task should push to replicas
    fn is_replicating(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.tpg.is_replicated()
            && self.role().is_leading()
    }

    // ---- Lifecycle ----

    /// Spawn the pacing task
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ReplicationError::GroupStopped);
        }

        let mut pacer = self.pacer.lock();
        let events = pacer.events.take().ok_or(ReplicationError::AlreadyStarted)?;

        let mut tokens = Tokens::default();
        for replica in &self.membership().replicas {
            tokens.arm(replica.replica_id(), Duration::ZERO);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.running.store(true, Ordering::SeqCst);
        pacer.shutdown = Some(shutdown_tx);
        pacer.task = Some(tokio::spawn(run_pacer(
            Arc::downgrade(self),
            tokens,
            events,
            shutdown_rx,
            self.role_changed.clone(),
        )));

        info!(partition_group = %self.tpg, node = self.local_replica_id, "Replica group started");
        Ok(())
    }

    /// Signal the pacing task and wait for it to exit
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        let (shutdown, task) = {
            let mut pacer = self.pacer.lock();
            pacer.events.take();
            (pacer.shutdown.take(), pacer.task.take())
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(partition_group = %self.tpg, error = %e, "Pacing task ended abnormally");
            }
        }

        info!(partition_group = %self.tpg, node = self.local_replica_id, "Replica group stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ---- Role transitions ----

    /// Take leadership: every replica restarts from the local right position
    /// and must prove log matching again.
    pub fn become_leader(&self, term: u64, leader_id: NodeId) {
        let right = self.store.right_position();
        for replica in &self.membership().replicas {
            replica.set_next_position(right);
            replica.set_matched(false);
        }

        {
            let mut state = self.state.lock();
            state.role = ReplicaRole::Leader;
            state.current_term = term;
            state.leader_id = Some(leader_id);
            state.transfer = None;
        }
        self.role_changed.notify_one();

        info!(
            partition_group = %self.tpg,
            node = self.local_replica_id,
            term,
            right_position = right,
            "Became leader"
        );
    }

    pub fn become_follower(&self, term: u64, leader_id: NodeId) {
        {
            let mut state = self.state.lock();
            state.role = ReplicaRole::Follower;
            state.current_term = term;
            state.leader_id = Some(leader_id);
            state.transfer = None;
        }
        self.role_changed.notify_one();

        info!(
            partition_group = %self.tpg,
            node = self.local_replica_id,
            term,
            leader = leader_id,
            "Became follower"
        );
    }

    fn step_down(&self, term: u64) {
        ReplicationMetrics::increment_step_downs();
        let election = self.election.read().clone();
        match election {
            Some(election) => election.step_down(term),
            None => warn!(
                partition_group = %self.tpg,
                term,
                "Observed higher term but no leader election is attached"
            ),
        }
    }

    // ---- Membership ----

    /// Add a replica while the group runs. It starts from the local right
    /// position and gets its first push after a short delay.
    pub fn add_node(&self, node: &ReplicaNode, learner: bool) -> Result<()> {
        let replica = Arc::new(Replica::from(node));
        replica.set_next_position(self.store.right_position());

        {
            let mut membership = self.membership.write();
            if membership.get(node.id).is_some() {
                return Err(ReplicationError::ReplicaExists(node.id));
            }
            let mut replicas = membership.replicas.clone();
            let mut voters = membership.voters.clone();
            replicas.push(replica.clone());
            if !learner {
                voters.push(replica);
            }
            *membership = Arc::new(Membership { replicas, voters });
        }

        self.post(PacerEvent::Arm {
            replica_id: node.id,
            delay: NEW_REPLICA_DELAY,
        });
        info!(partition_group = %self.tpg, replica = %node, learner, "Added replica");
        Ok(())
    }

    /// Remove a replica; its token is dropped the next time it fires
    pub fn remove_node(&self, replica_id: NodeId) -> Result<()> {
        {
            let mut membership = self.membership.write();
            if membership.get(replica_id).is_none() {
                return Err(ReplicationError::ReplicaNotFound(replica_id));
            }
            let keep = |r: &&Arc<Replica>| r.replica_id() != replica_id;
            let replicas = membership.replicas.iter().filter(keep).cloned().collect();
            let voters = membership.voters.iter().filter(keep).cloned().collect();
            *membership = Arc::new(Membership { replicas, voters });
        }

        info!(partition_group = %self.tpg, replica = replica_id, "Removed replica");
        Ok(())
    }

    /// Replica other than `leader_id` that is furthest ahead
    pub fn find_the_next_candidate(&self, leader_id: NodeId) -> Option<NodeId> {
        let mut candidate: Option<(NodeId, u64)> = None;
        for replica in &self.membership().replicas {
            if replica.replica_id() == leader_id {
                continue;
            }
            let next = replica.next_position();
            if candidate.map_or(true, |(_, best)| next > best) {
                candidate = Some((replica.replica_id(), next));
            }
        }
        candidate.map(|(id, _)| id)
    }

    /// Bytes the replica still has to acknowledge
    pub fn lag_length(&self, replica_id: NodeId) -> Result<u64> {
        let replica = self
            .replica(replica_id)
            .ok_or(ReplicationError::ReplicaNotFound(replica_id))?;
        Ok(self
            .store
            .right_position()
            .saturating_sub(replica.write_position()))
    }

    // ---- Leadership transfer ----

    /// Hand leadership to `transferee` once it has replicated up to
    /// `log_position`.
    ///
    /// Allowed while leading, or while transferring after the previous
    /// handoff ended without a new leader.
    pub fn transfer_leadership_to(self: &Arc<Self>, transferee: NodeId, log_position: u64) -> Result<()> {
        let replica = self
            .replica(transferee)
            .ok_or(ReplicationError::ReplicaNotFound(transferee))?;

        let send_now = {
            let mut state = self.state.lock();
            // a finished handoff that produced no election result may be reissued
            let idle_transfer = state.role == ReplicaRole::Transferring && state.transfer.is_none();
            if state.role != ReplicaRole::Leader && !idle_transfer {
                return Err(ReplicationError::NotLeader {
                    leader: state.leader_id,
                });
            }
            let ready = replica.next_position() >= log_position;
            state.role = ReplicaRole::Transferring;
            state.transfer = Some(Transfer {
                transferee,
                timeout_now_position: log_position,
                timeout_now_sent: ready,
            });
            ready
        };

        info!(
            partition_group = %self.tpg,
            transferee,
            log_position,
            next_position = replica.next_position(),
            "Transferring leadership"
        );

        if send_now {
            self.send_timeout_now(&replica)?;
        }
        Ok(())
    }

    /// Abandon a pending transfer and keep leading
    pub fn stop_transfer_leadership(&self) {
        let mut state = self.state.lock();
        if let Some(transfer) = state.transfer.take() {
            info!(
                partition_group = %self.tpg,
                transferee = transfer.transferee,
                "Stopped leadership transfer"
            );
        }
        if state.role == ReplicaRole::Transferring {
            state.role = ReplicaRole::Leader;
        }
    }

    fn clear_transfer(&self) {
        self.state.lock().transfer = None;
    }

    fn send_timeout_now(self: &Arc<Self>, replica: &Arc<Replica>) -> Result<()> {
        let request = TimeoutNowRequest {
            partition_group: self.tpg.clone(),
            term: self.current_term(),
        };
        let transferee = replica.replica_id();
        let address = replica.address().to_string();
        let group = self.clone();

        let submitted = self.dispatcher.submit(async move {
            let result = group
                .dispatcher
                .send_command(
                    &address,
                    Command::TimeoutNow(request),
                    group.config.send_command_timeout,
                )
                .await
                .and_then(ReplicationResponse::into_timeout_now);
            group.post(PacerEvent::TimeoutNowCompleted { transferee, result });
        });

        match submitted {
            Ok(()) => {
                ReplicationMetrics::increment_timeout_now_sent();
                info!(partition_group = %self.tpg, transferee, "Sent timeout now");
                Ok(())
            }
            Err(e) => {
                ReplicationMetrics::increment_executor_rejections();
                self.clear_transfer();
                Err(e)
            }
        }
    }

    fn maybe_send_timeout_now(self: &Arc<Self>, replica: &Arc<Replica>) {
        let due = {
            let mut state = self.state.lock();
            match state.transfer.as_mut() {
                Some(transfer)
                    if transfer.transferee == replica.replica_id()
                        && !transfer.timeout_now_sent
                        && replica.next_position() >= transfer.timeout_now_position =>
                {
                    transfer.timeout_now_sent = true;
                    true
                }
                _ => false,
            }
        };

        if due {
            if let Err(e) = self.send_timeout_now(replica) {
                warn!(partition_group = %self.tpg, transferee = replica.replica_id(), error = %e, "Failed to send timeout now");
            }
        }
    }

    fn on_timeout_now_response(&self, transferee: NodeId, result: Result<TimeoutNowResponse>) {
        match result {
            Ok(response) => {
                info!(
                    partition_group = %self.tpg,
                    transferee,
                    success = response.success,
                    term = response.term,
                    "Timeout now response"
                );
                if response.term > self.current_term() {
                    self.step_down(response.term);
                }
            }
            Err(e) => {
                warn!(partition_group = %self.tpg, transferee, error = %e, "Timeout now failed");
            }
        }
        self.clear_transfer();
    }

    /// Inbound timeout-now, forwarded to the election layer
    pub fn handle_timeout_now(&self, request: &TimeoutNowRequest) -> TimeoutNowResponse {
        let election = self.election.read().clone();
        let outcome = match election {
            Some(election) => election.handle_timeout_now(request.term),
            None => TimeoutNowOutcome {
                success: false,
                term: self.current_term(),
            },
        };
        TimeoutNowResponse {
            success: outcome.success,
            term: outcome.term,
        }
    }

    // ---- Leader: pacing ----

    fn post(&self, event: PacerEvent) {
        // a stopped group has dropped its receiver; late events are discarded
        let _ = self.events.send(event);
    }

    fn on_event(self: &Arc<Self>, tokens: &mut Tokens, event: PacerEvent) {
        match event {
            PacerEvent::Arm { replica_id, delay } => tokens.arm(replica_id, delay),
            PacerEvent::AppendEntriesCompleted {
                replica,
                request_term,
                entries_len,
                started,
                result,
            } => {
                let replica_id = replica.replica_id();
                match result {
                    Ok(response) => {
                        let elapsed = started.elapsed();
                        ReplicationMetrics::record_replicate(&self.tpg.topic, entries_len, elapsed);
                        if elapsed > self.config.max_process_time {
                            info!(
                                partition_group = %self.tpg,
                                replica = replica_id,
                                entries_len,
                                elapsed_ms = elapsed.as_millis() as u64,
                                "Slow append entries round trip"
                            );
                        }
                        self.on_append_entries_response(&replica, request_term, &response);
                        tokens.arm(replica_id, Duration::ZERO);
                    }
                    Err(e) => {
                        ReplicationMetrics::increment_replicate_failures(&self.tpg.topic);
                        warn!(
                            partition_group = %self.tpg,
                            replica = replica_id,
                            address = replica.address(),
                            error = %e,
                            "Append entries failed"
                        );
                        tokens.arm(replica_id, self.config.failure_backoff);
                    }
                }
            }
            PacerEvent::TimeoutNowCompleted { transferee, result } => {
                self.on_timeout_now_response(transferee, result)
            }
        }
    }

    fn fire_ready_tokens(self: &Arc<Self>, tokens: &mut Tokens) {
        if !self.is_replicating() {
            return;
        }
        for replica_id in tokens.take_ready(Instant::now()) {
            self.on_token(tokens, replica_id);
        }
    }

    fn on_token(self: &Arc<Self>, tokens: &mut Tokens, replica_id: NodeId) {
        let membership = self.membership();

        if replica_id == self.local_replica_id {
            if membership.voters.len() <= 1 {
                self.commit_single_replica(tokens);
            } else {
                tokens.arm(replica_id, self.config.heartbeat_interval);
            }
            return;
        }

        let Some(replica) = membership.get(replica_id).cloned() else {
            info!(partition_group = %self.tpg, replica = replica_id, "Replica no longer in group, dropping its token");
            return;
        };

        self.replicate(tokens, &replica);
        self.maybe_replicate_consume_pos(&replica);
    }

    /// Single voter: everything written is committed
    fn commit_single_replica(&self, tokens: &mut Tokens) {
        let right = self.store.right_position();
        if self.store.commit_position() < right {
            let _commit = self.commit_lock.lock();
            if let Some(local) = self.membership().get(self.local_replica_id) {
                local.set_write_position(right);
            }
            self.store.commit(right);
            tokens.arm(self.local_replica_id, Duration::ZERO);
        } else {
            tokens.arm(self.local_replica_id, SINGLE_REPLICA_POLL_INTERVAL);
        }
    }

    fn replicate(self: &Arc<Self>, tokens: &mut Tokens, replica: &Arc<Replica>) {
        let group = self.clone();
        let target = replica.clone();
        if let Err(e) = self
            .dispatcher
            .submit(async move { group.send_append_entries(target).await })
        {
            ReplicationMetrics::increment_executor_rejections();
            info!(
                partition_group = %self.tpg,
                replica = replica.replica_id(),
                error = %e,
                "Replicate command rejected"
            );
            tokens.arm(replica.replica_id(), self.config.failure_backoff);
        }
    }

    async fn send_append_entries(self: Arc<Self>, replica: Arc<Replica>) {
        let replica_id = replica.replica_id();
        let request = match self.generate_append_entries_request(&replica) {
            Ok(Some(request)) => request,
            Ok(None) => {
                self.post(PacerEvent::Arm {
                    replica_id,
                    delay: self.config.idle_backoff,
                });
                return;
            }
            Err(e) => {
                warn!(partition_group = %self.tpg, replica = replica_id, error = %e, "Failed to build append entries request");
                self.post(PacerEvent::Arm {
                    replica_id,
                    delay: self.config.failure_backoff,
                });
                return;
            }
        };

        if replica.is_matched() {
            debug!(partition_group = %self.tpg, replica = replica_id, request = %request, "Send append entries");
        } else {
            info!(partition_group = %self.tpg, replica = replica_id, request = %request, "Send append entries to unmatched replica");
        }

        let request_term = request.term;
        let entries_len = request.entries_len();
        let started = Instant::now();
        let result = self
            .dispatcher
            .send_command(
                replica.address(),
                Command::AppendEntries(request),
                self.config.send_command_timeout,
            )
            .await
            .and_then(ReplicationResponse::into_append_entries);

        self.post(PacerEvent::AppendEntriesCompleted {
            replica,
            request_term,
            entries_len,
            started,
            result,
        });
    }

    /// Entry before `position`, or the left position when there is none
    fn previous_position(&self, position: u64) -> u64 {
        self.store
            .position(position, -1)
            .unwrap_or_else(|_| self.store.left_position())
    }

    /// Next request for `replica`, `None` when it has everything
    pub(crate) fn generate_append_entries_request(
        &self,
        replica: &Replica,
    ) -> Result<Option<AppendEntriesRequest>> {
        let term = self.current_term();
        let left = self.store.left_position();
        let right = self.store.right_position();

        let mut start = replica.next_position().max(left);
        if start >= right {
            return Ok(None);
        }

        let max_len = self.config.max_replicate_length;
        let entries = match self.store.read_entry_buffer(start, max_len) {
            Ok(entries) => entries,
            Err(e) => {
                let previous = self.previous_position(start);
                info!(
                    partition_group = %self.tpg,
                    replica = replica.replica_id(),
                    position = start,
                    previous,
                    error = %e,
                    "Read entries failed, stepping back one entry"
                );
                start = previous;
                replica.set_next_position(start);
                self.store.read_entry_buffer(start, max_len)?
            }
        };
        if entries.is_empty() {
            return Ok(None);
        }

        let entries_term = self.store.get_entry_term(start)?;
        let matched = replica.is_matched();
        let (prev_term, prev_position) = if !matched && start > left {
            let prev_position = self.store.position(start, -1)?;
            (self.store.get_entry_term(prev_position)?, prev_position)
        } else {
            (0, 0)
        };

        Ok(Some(AppendEntriesRequest {
            partition_group: self.tpg.clone(),
            term,
            leader_id: self.local_replica_id,
            start_position: start,
            left_position: left,
            matched,
            commit_position: self.store.commit_position(),
            prev_term,
            prev_position,
            entries_term,
            entries,
        }))
    }

    /// Apply a follower's response. Runs on the pacing task.
    pub(crate) fn on_append_entries_response(
        self: &Arc<Self>,
        replica: &Arc<Replica>,
        request_term: u64,
        response: &AppendEntriesResponse,
    ) {
        let current_term = self.current_term();
        if request_term != current_term {
            info!(
                partition_group = %self.tpg,
                replica = replica.replica_id(),
                request_term,
                current_term,
                "Dropping response to a request from an older term"
            );
            return;
        }
        if response.term > current_term {
            info!(
                partition_group = %self.tpg,
                replica = replica.replica_id(),
                response_term = response.term,
                current_term,
                "Replica has a higher term, stepping down"
            );
            self.step_down(response.term);
            return;
        }

        {
            let _commit = self.commit_lock.lock();
            replica.set_last_append_success_time(now_millis());

            if !response.success {
                ReplicationMetrics::increment_rejections();
                let from = response
                    .next_position
                    .unwrap_or_else(|| replica.next_position());
                let next = self.previous_position(from);
                info!(
                    partition_group = %self.tpg,
                    replica = replica.replica_id(),
                    suggested = ?response.next_position,
                    next_position = next,
                    "Append entries rejected, backtracking"
                );
                replica.set_next_position(next);
                return;
            }

            replica.set_write_position(response.write_position);
            if let Some(next) = response.next_position {
                replica.set_next_position(next);
            }
            replica.set_matched(true);
            self.advance_commit_position();
        }

        self.maybe_send_timeout_now(replica);
    }

    /// Quorum commit; caller holds the commit lock
    fn advance_commit_position(&self) {
        let membership = self.membership();
        if let Some(local) = membership.get(self.local_replica_id) {
            local.set_write_position(self.store.right_position());
        }
        let positions: Vec<u64> = membership.voters.iter().map(|r| r.write_position()).collect();
        if let Some(commit) = quorum_commit_position(&positions) {
            self.store.commit(commit);
        }
    }

    // ---- Leader: consume positions ----

    fn maybe_replicate_consume_pos(self: &Arc<Self>, replica: &Arc<Replica>) {
        let interval = self.config.replicate_consume_pos_interval.as_millis() as u64;
        if !replica.try_claim_consume_pos_sync(now_millis(), interval) {
            return;
        }

        let group = self.clone();
        let target = replica.clone();
        if let Err(e) = self
            .dispatcher
            .submit(async move { group.send_consume_positions(target).await })
        {
            debug!(partition_group = %self.tpg, replica = replica.replica_id(), error = %e, "Consume position sync rejected");
        }
    }

    async fn send_consume_positions(self: Arc<Self>, replica: Arc<Replica>) {
        let started = Instant::now();
        let positions = match self.consume.consume_info_by_group(
            &self.tpg.topic,
            None,
            self.tpg.partition_group,
        ) {
            Ok(Some(positions)) => positions,
            Ok(None) => {
                debug!(partition_group = %self.tpg, "No consume positions to sync");
                return;
            }
            Err(e) => {
                warn!(partition_group = %self.tpg, error = %e, "Failed to read consume positions");
                return;
            }
        };

        if self.config.output_consume_pos {
            info!(partition_group = %self.tpg, replica = replica.replica_id(), positions = %positions, "Sync consume positions");
        }

        let request = ReplicateConsumePosRequest {
            positions: Some(positions),
        };
        let result = self
            .dispatcher
            .send_command(
                replica.address(),
                Command::ReplicateConsumePos(request),
                self.config.send_command_timeout,
            )
            .await
            .and_then(ReplicationResponse::into_replicate_consume_pos);

        match result {
            Ok(response) if !response.success => {
                info!(partition_group = %self.tpg, replica = replica.replica_id(), "Replica rejected consume positions");
            }
            Ok(_) => {}
            Err(e) => {
                info!(partition_group = %self.tpg, replica = replica.replica_id(), error = %e, "Consume position sync failed");
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.max_process_time {
            info!(partition_group = %self.tpg, elapsed_ms = elapsed.as_millis() as u64, "Slow consume position sync");
        }
    }

    // ---- Follower ----

    /// Handle an append-entries request from the leader
    pub fn append_entries(&self, request: &AppendEntriesRequest) -> AppendEntriesResponse {
        let started = Instant::now();
        let (success, next_position) = match self.try_append_entries(request) {
            Ok(next) => (true, Some(next)),
            Err(next) => (false, next),
        };

        let elapsed = started.elapsed();
        if success {
            AppendMetrics::record_append(&self.tpg.topic, request.entries_len(), elapsed);
        }
        if elapsed > self.config.max_process_time {
            info!(
                partition_group = %self.tpg,
                entries_len = request.entries_len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow append entries"
            );
        }

        AppendEntriesResponse {
            partition_group: self.tpg.clone(),
            term: self.current_term(),
            replica_id: self.local_replica_id,
            success,
            write_position: self.store.right_position(),
            next_position,
            entries_term: request.entries_term,
        }
    }

    /// `Ok(next)` on success, `Err(suggested next)` on rejection
    fn try_append_entries(&self, request: &AppendEntriesRequest) -> std::result::Result<u64, Option<u64>> {
        let start = request.start_position;

        {
            let state = self.state.lock();
            if state.role != ReplicaRole::Follower {
                info!(
                    partition_group = %self.tpg,
                    role = %state.role,
                    leader = request.leader_id,
                    "Rejecting append entries, not a follower"
                );
                return Err(Some(start));
            }
            if request.term < state.current_term {
                info!(
                    partition_group = %self.tpg,
                    request_term = request.term,
                    current_term = state.current_term,
                    "Rejecting append entries from an older term"
                );
                return Err(None);
            }
        }

        if !self.match_position(
            start,
            request.left_position,
            request.prev_term,
            request.prev_position,
            request.matched,
        ) {
            AppendMetrics::increment_mismatches();
            let right = self.store.right_position();
            if start > right {
                return Err(Some(right.max(request.left_position)));
            }
            return Err(None);
        }

        match self.apply_entries(request) {
            Ok(next) => Ok(next),
            Err(e) if e.is_timeout() => {
                warn!(partition_group = %self.tpg, start, error = %e, "Append entries timed out");
                Err(Some(start))
            }
            Err(e) => {
                warn!(partition_group = %self.tpg, start, error = %e, "Append entries failed");
                Err(None)
            }
        }
    }

    fn apply_entries(&self, request: &AppendEntriesRequest) -> Result<u64> {
        let start = request.start_position;
        let local_left = self.store.left_position();

        if request.left_position == start && request.left_position > local_left {
            info!(partition_group = %self.tpg, position = start, local_left, "Clearing log to the leader's left position");
            self.store.clear(start)?;
        } else if start != self.store.right_position() {
            info!(
                partition_group = %self.tpg,
                position = start,
                right_position = self.store.right_position(),
                "Rewinding log to the leader's start position"
            );
            self.store.set_right_position(start)?;
        }

        let next = self.store.append_entry_buffer(&request.entries)?;
        self.store.commit(request.commit_position);
        Ok(next)
    }

    /// Log matching check of a follower. Reads the store, never writes it.
    pub fn match_position(
        &self,
        start_position: u64,
        leader_left_position: u64,
        prev_term: u64,
        prev_position: u64,
        matched: bool,
    ) -> bool {
        if start_position == leader_left_position {
            debug!(partition_group = %self.tpg, start_position, "Start at the leader's left position");
            return true;
        }

        let right = self.store.right_position();
        if start_position > right {
            info!(
                partition_group = %self.tpg,
                start_position,
                right_position = right,
                "Start position beyond local log"
            );
            return false;
        }

        if matched {
            return true;
        }

        let local_prev_term = if prev_position > self.store.left_position() {
            match self.store.get_entry_term(prev_position) {
                Ok(term) => Some(term),
                Err(e) => {
                    info!(partition_group = %self.tpg, prev_position, error = %e, "No local entry at previous position");
                    None
                }
            }
        } else {
            None
        };

        let result = local_prev_term == Some(prev_term);
        info!(
            partition_group = %self.tpg,
            start_position,
            prev_position,
            prev_term,
            local_prev_term = ?local_prev_term,
            matched = result,
            "Log matching check"
        );
        result
    }
}

/// Pacing task body. Holds the group weakly so a dropped group ends it.
async fn run_pacer(
    group: Weak<ReplicaGroup>,
    mut tokens: Tokens,
    mut events: mpsc::UnboundedReceiver<PacerEvent>,
    mut shutdown: watch::Receiver<bool>,
    role_changed: Arc<Notify>,
) {
    loop {
        let (replicating, deadline) = match group.upgrade() {
            Some(group) => {
                let replicating = group.is_replicating();
                let deadline = if replicating { tokens.next_deadline() } else { None };
                (replicating, deadline)
            }
            None => break,
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let (Some(event), Some(group)) = (event, group.upgrade()) else { break };
                group.on_event(&mut tokens, event);
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let Some(group) = group.upgrade() else { break };
                group.fire_ready_tokens(&mut tokens);
            }
            _ = role_changed.notified(), if !replicating => {}
        }
    }
    debug!(parked_tokens = tokens.len(), "Pacing task exited");
}
