//! Replication manager
//!
//! Node-wide owner of every replica group. It keeps the registry, shares one
//! bounded executor and one connection pool between all groups, and routes
//! inbound replication commands to the right group.

use crate::config::ReplicationConfig;
use crate::consume::ConsumePositionProvider;
use crate::error::{ReplicationError, Result};
use crate::executor::{Dispatcher, ReplicateExecutor};
use crate::group::{GroupAssignment, ReplicaGroup};
use crate::node::NodeId;
use crate::observability::ReplicationMetrics;
use crate::partition::TopicPartitionGroup;
use crate::protocol::{
    error_codes, Command, ReplicateConsumePosResponse, ReplicationRequest, ReplicationResponse,
    ResponseHeader,
};
use crate::store::StoreProvider;
use crate::transport::{error_response, ReplicationClient, RequestHandler, TcpTransport};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registry and shared resources of every replica group on this node
pub struct ReplicationManager {
    local_node: NodeId,
    config: Arc<ReplicationConfig>,
    store_provider: Arc<dyn StoreProvider>,
    consume: Arc<dyn ConsumePositionProvider>,
    dispatcher: Arc<Dispatcher>,

    /// Inbound side
    transport: Arc<TcpTransport>,

    groups: DashMap<TopicPartitionGroup, Arc<ReplicaGroup>>,

    /// Serializes group creation and removal
    lifecycle: Mutex<()>,

    report_shutdown: watch::Sender<bool>,
    report_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationManager {
    /// Create a manager that sends commands over pooled TCP connections
    pub fn new(
        local_node: NodeId,
        config: ReplicationConfig,
        store_provider: Arc<dyn StoreProvider>,
        consume: Arc<dyn ConsumePositionProvider>,
    ) -> Result<Arc<Self>> {
        let transport = Arc::new(TcpTransport::new(local_node, config.transport.clone()));
        Self::build(
            local_node,
            config,
            store_provider,
            consume,
            transport.clone(),
            transport,
        )
    }

    /// Create a manager with a custom outbound client
    pub fn with_client(
        local_node: NodeId,
        config: ReplicationConfig,
        store_provider: Arc<dyn StoreProvider>,
        consume: Arc<dyn ConsumePositionProvider>,
        client: Arc<dyn ReplicationClient>,
    ) -> Result<Arc<Self>> {
        let transport = Arc::new(TcpTransport::new(local_node, config.transport.clone()));
        Self::build(local_node, config, store_provider, consume, client, transport)
    }

    fn build(
        local_node: NodeId,
        config: ReplicationConfig,
        store_provider: Arc<dyn StoreProvider>,
        consume: Arc<dyn ConsumePositionProvider>,
        client: Arc<dyn ReplicationClient>,
        transport: Arc<TcpTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let executor = ReplicateExecutor::new(config.max_in_flight_commands)?;
        let (report_shutdown, _) = watch::channel(false);

        info!(
            node = local_node,
            max_in_flight_commands = config.max_in_flight_commands,
            "Created replication manager"
        );

        Ok(Arc::new(Self {
            local_node,
            config: Arc::new(config),
            store_provider,
            consume,
            dispatcher: Arc::new(Dispatcher::new(executor, client)),
            transport,
            groups: DashMap::new(),
            lifecycle: Mutex::new(()),
            report_shutdown,
            report_task: parking_lot::Mutex::new(None),
        }))
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Start the periodic status report
    pub fn start(self: &Arc<Self>) {
        let mut task = self.report_task.lock();
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(run_report(
            Arc::downgrade(self),
            self.config.report_interval,
            self.report_shutdown.subscribe(),
        )));
    }

    // ---- Registry ----

    /// Create and start the group for `(topic, partition_group)`, replacing
    /// any group already registered under that key.
    pub async fn create_replica_group(
        &self,
        topic: &str,
        partition_group: u32,
        assignment: GroupAssignment,
    ) -> Result<Arc<ReplicaGroup>> {
        let tpg = TopicPartitionGroup::new(topic, partition_group);
        let _lifecycle = self.lifecycle.lock().await;

        if let Some((_, existing)) = self.groups.remove(&tpg) {
            info!(partition_group = %tpg, "Replacing existing replica group");
            existing.stop().await;
        }

        let store = self.store_provider.replicable_store(&tpg).ok_or_else(|| {
            ReplicationError::StoreNotFound {
                topic: tpg.topic.clone(),
                partition_group,
            }
        })?;

        let group = ReplicaGroup::new(
            tpg.clone(),
            assignment,
            self.config.clone(),
            store,
            self.consume.clone(),
            self.dispatcher.clone(),
        )?;
        group.start()?;
        self.groups.insert(tpg, group.clone());
        ReplicationMetrics::set_group_count(self.groups.len());

        Ok(group)
    }

    /// Stop and unregister a group. Returns false when none was registered.
    pub async fn remove_replica_group(&self, topic: &str, partition_group: u32) -> bool {
        let tpg = TopicPartitionGroup::new(topic, partition_group);
        let _lifecycle = self.lifecycle.lock().await;

        match self.groups.remove(&tpg) {
            Some((_, group)) => {
                group.stop().await;
                ReplicationMetrics::set_group_count(self.groups.len());
                info!(partition_group = %tpg, "Removed replica group");
                true
            }
            None => {
                debug!(partition_group = %tpg, "No replica group to remove");
                false
            }
        }
    }

    pub fn get_replica_group(&self, topic: &str, partition_group: u32) -> Option<Arc<ReplicaGroup>> {
        self.replica_group(&TopicPartitionGroup::new(topic, partition_group))
    }

    pub fn replica_group(&self, tpg: &TopicPartitionGroup) -> Option<Arc<ReplicaGroup>> {
        self.groups.get(tpg).map(|entry| entry.value().clone())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn leader_count(&self) -> usize {
        self.groups.iter().filter(|entry| entry.value().is_leader()).count()
    }

    // ---- Outbound ----

    /// Send a command on the shared connection pool
    pub async fn send_command(
        &self,
        address: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<ReplicationResponse> {
        self.dispatcher.send_command(address, command, timeout).await
    }

    /// Commands currently running on the shared executor
    pub fn in_flight_commands(&self) -> usize {
        self.dispatcher.executor().in_flight()
    }

    // ---- Inbound ----

    /// Route an inbound command to its handler
    pub fn handle_request(&self, request: ReplicationRequest) -> ReplicationResponse {
        let correlation_id = request.correlation_id();
        match request {
            ReplicationRequest::AppendEntries { request, .. } => {
                match self.replica_group(&request.partition_group) {
                    Some(group) => ReplicationResponse::AppendEntries {
                        header: ResponseHeader::success(correlation_id),
                        response: group.append_entries(&request),
                    },
                    None => unknown_group(correlation_id, &request.partition_group),
                }
            }
            ReplicationRequest::TimeoutNow { request, .. } => {
                match self.replica_group(&request.partition_group) {
                    Some(group) => ReplicationResponse::TimeoutNow {
                        header: ResponseHeader::success(correlation_id),
                        response: group.handle_timeout_now(&request),
                    },
                    None => unknown_group(correlation_id, &request.partition_group),
                }
            }
            ReplicationRequest::ReplicateConsumePos { request, .. } => {
                ReplicationResponse::ReplicateConsumePos {
                    header: ResponseHeader::success(correlation_id),
                    response: ReplicateConsumePosResponse {
                        success: self.apply_consume_positions(request.positions.as_deref()),
                    },
                }
            }
        }
    }

    fn apply_consume_positions(&self, positions: Option<&str>) -> bool {
        let positions = match positions {
            Some(positions) if !positions.is_empty() => positions,
            _ => {
                warn!(node = self.local_node, "Received empty consume positions");
                return false;
            }
        };

        if self.config.output_consume_pos {
            info!(node = self.local_node, positions, "Received consume positions");
        }

        match self.consume.set_consume_info(positions) {
            Ok(applied) => applied,
            Err(e) => {
                warn!(node = self.local_node, error = %e, "Failed to apply consume positions");
                false
            }
        }
    }

    /// Accept replication connections on `listener`
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let handler: RequestHandler = Arc::new(move |request: ReplicationRequest| {
            match manager.upgrade() {
                Some(manager) => manager.handle_request(request),
                None => error_response(
                    request.correlation_id(),
                    error_codes::INTERNAL,
                    "replication manager shut down",
                ),
            }
        });
        self.transport.serve(listener, handler)
    }

    // ---- Lifecycle ----

    /// Stop every group, the report task and the transport
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let _ = self.report_shutdown.send(true);
        let report = self.report_task.lock().take();
        if let Some(report) = report {
            let _ = report.await;
        }

        let keys: Vec<TopicPartitionGroup> = self.groups.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, group)) = self.groups.remove(&key) {
                group.stop().await;
            }
        }
        ReplicationMetrics::set_group_count(0);

        self.dispatcher.shutdown();
        self.transport.shutdown();
        info!(node = self.local_node, "Replication manager shut down");
    }

    fn report(&self) {
        let groups = self.group_count();
        let leaders = self.leader_count();
        let in_flight = self.in_flight_commands();

        ReplicationMetrics::set_group_count(groups);
        ReplicationMetrics::set_leader_count(leaders);
        ReplicationMetrics::set_in_flight_commands(in_flight);

        info!(
            node = self.local_node,
            groups,
            leaders,
            in_flight,
            capacity = self.dispatcher.executor().capacity(),
            "Replication status"
        );
    }
}

fn unknown_group(correlation_id: u64, tpg: &TopicPartitionGroup) -> ReplicationResponse {
    error_response(
        correlation_id,
        error_codes::UNKNOWN_PARTITION_GROUP,
        format!("unknown partition group {}", tpg),
    )
}

async fn run_report(
    manager: Weak<ReplicationManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.report();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consume::MemoryConsumePositions;
    use crate::node::ReplicaNode;
    use crate::protocol::{ReplicateConsumePosRequest, RequestHeader, TimeoutNowRequest};
    use crate::store::{MemoryStore, MemoryStoreProvider};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl ReplicationClient for Unreachable {
        async fn send_command(&self, address: &str, _: Command, _: Duration) -> Result<ReplicationResponse> {
            Err(ReplicationError::ConnectionFailed(address.to_string()))
        }
    }

    fn manager_with(
        stores: Arc<MemoryStoreProvider>,
        consume: Arc<MemoryConsumePositions>,
    ) -> Arc<ReplicationManager> {
        ReplicationManager::with_client(
            2,
            ReplicationConfig::default(),
            stores,
            consume,
            Arc::new(Unreachable),
        )
        .unwrap()
    }

    fn assignment() -> GroupAssignment {
        GroupAssignment::new(
            vec![
                ReplicaNode::new(1, "127.0.0.1:50091"),
                ReplicaNode::new(2, "127.0.0.1:50092"),
            ],
            2,
        )
        .with_leader(1)
    }

    #[tokio::test]
    async fn test_create_requires_store() {
        let manager = manager_with(
            Arc::new(MemoryStoreProvider::new()),
            Arc::new(MemoryConsumePositions::new()),
        );
        let err = manager
            .create_replica_group("orders", 1, assignment())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::StoreNotFound { partition_group: 1, .. }));
        assert_eq!(manager.group_count(), 0);
    }

    #[tokio::test]
    async fn test_create_replaces_existing_group() {
        let stores = Arc::new(MemoryStoreProvider::new());
        stores.register(TopicPartitionGroup::new("orders", 1), Arc::new(MemoryStore::new()));
        let manager = manager_with(stores, Arc::new(MemoryConsumePositions::new()));

        let first = manager.create_replica_group("orders", 1, assignment()).await.unwrap();
        let second = manager.create_replica_group("orders", 1, assignment()).await.unwrap();

        assert!(first.is_stopped());
        assert!(!second.is_stopped());
        assert_eq!(manager.group_count(), 1);
        assert!(Arc::ptr_eq(&manager.get_replica_group("orders", 1).unwrap(), &second));
        assert_eq!(manager.leader_count(), 0);

        assert!(manager.remove_replica_group("orders", 1).await);
        assert!(second.is_stopped());
        assert!(!manager.remove_replica_group("orders", 1).await);
        assert!(manager.get_replica_group("orders", 1).is_none());
    }

    #[tokio::test]
    async fn test_unknown_group_is_an_error_response() {
        let manager = manager_with(
            Arc::new(MemoryStoreProvider::new()),
            Arc::new(MemoryConsumePositions::new()),
        );
        let request = ReplicationRequest::TimeoutNow {
            header: RequestHeader::new(7, 1),
            request: TimeoutNowRequest {
                partition_group: TopicPartitionGroup::new("orders", 9),
                term: 3,
            },
        };

        let response = manager.handle_request(request);
        assert_eq!(response.correlation_id(), 7);
        assert_eq!(
            response.header().error_code,
            error_codes::UNKNOWN_PARTITION_GROUP
        );
    }

    #[tokio::test]
    async fn test_consume_positions_are_applied() {
        let consume = Arc::new(MemoryConsumePositions::new());
        let manager = manager_with(Arc::new(MemoryStoreProvider::new()), consume.clone());

        let request = |positions: Option<&str>| ReplicationRequest::ReplicateConsumePos {
            header: RequestHeader::new(1, 1),
            request: ReplicateConsumePosRequest {
                positions: positions.map(str::to_string),
            },
        };

        let ok = manager
            .handle_request(request(Some("snapshot")))
            .into_replicate_consume_pos()
            .unwrap();
        assert!(ok.success);

        let empty = manager
            .handle_request(request(None))
            .into_replicate_consume_pos()
            .unwrap();
        assert!(!empty.success);

        let blank = manager
            .handle_request(request(Some("")))
            .into_replicate_consume_pos()
            .unwrap();
        assert!(!blank.success);

        assert_eq!(consume.applied(), vec!["snapshot".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ReplicationConfig {
            max_replicate_length: 0,
            ..Default::default()
        };
        let result = ReplicationManager::with_client(
            1,
            config,
            Arc::new(MemoryStoreProvider::new()),
            Arc::new(MemoryConsumePositions::new()),
            Arc::new(Unreachable),
        );
        assert!(matches!(result, Err(ReplicationError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_groups() {
        let stores = Arc::new(MemoryStoreProvider::new());
        stores.register(TopicPartitionGroup::new("orders", 1), Arc::new(MemoryStore::new()));
        stores.register(TopicPartitionGroup::new("orders", 2), Arc::new(MemoryStore::new()));
        let manager = manager_with(stores, Arc::new(MemoryConsumePositions::new()));
        manager.start();

        let a = manager.create_replica_group("orders", 1, assignment()).await.unwrap();
        let b = manager.create_replica_group("orders", 2, assignment()).await.unwrap();
        assert_eq!(manager.group_count(), 2);

        manager.shutdown().await;
        assert!(a.is_stopped() && b.is_stopped());
        assert_eq!(manager.group_count(), 0);
    }
}
