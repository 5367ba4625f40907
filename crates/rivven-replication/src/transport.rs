//! Network transport for replication commands
//!
//! Provides TCP-based transport for:
//! - Append-entries pushes from leaders to followers
//! - Timeout-now during leadership transfer
//! - Consume position syncs
//!
//! Features:
//! - One multiplexed connection per peer address, created lazily
//! - Connections evict themselves from the pool when they close or fail
//! - Per-command deadlines covering connect, enqueue and response

use crate::error::{ReplicationError, Result};
use crate::node::NodeId;
use crate::protocol::{
    decode_request, decode_response, encode_request, encode_response, frame_length, frame_message,
    Command, ReplicationRequest, ReplicationResponse, RequestHeader, ResponseHeader,
    MAX_MESSAGE_SIZE,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Idle read timeout of inbound connections
    pub read_timeout: Duration,
    /// Write timeout
    pub write_timeout: Duration,
    /// Enable TCP nodelay
    pub tcp_nodelay: bool,
    /// Frames queued per outbound connection before senders wait
    pub outbound_queue_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(30),
            tcp_nodelay: true,
            outbound_queue_size: 1024,
        }
    }
}

/// Inbound request handler callback type
pub type RequestHandler = Arc<dyn Fn(ReplicationRequest) -> ReplicationResponse + Send + Sync>;

/// Client side of the replication transport.
///
/// Replica groups only see this trait, so tests can route commands
/// in-process without sockets.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Send one command to `address` and wait for the matching response
    async fn send_command(
        &self,
        address: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<ReplicationResponse>;

    /// Drop every pooled connection
    fn close(&self) {}
}

type PendingMap = DashMap<u64, oneshot::Sender<ReplicationResponse>>;
type Sessions = DashMap<String, Arc<Connection>>;

/// Multiplexed TCP transport
pub struct TcpTransport {
    /// Our node ID
    local_node: NodeId,

    /// Configuration
    config: TransportConfig,

    /// One connection per peer address
    sessions: Arc<Sessions>,

    /// Serializes connection creation per peer address
    connect_locks: DashMap<String, Arc<Mutex<()>>>,

    /// Correlation ID generator
    correlation_id: AtomicU64,

    /// Connection ID generator
    connection_id: AtomicU64,

    /// Shutdown signal of accept loops
    shutdown_tx: broadcast::Sender<()>,
}

impl TcpTransport {
    /// Create new transport
    pub fn new(local_node: NodeId, config: TransportConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            local_node,
            config,
            sessions: Arc::new(DashMap::new()),
            connect_locks: DashMap::new(),
            correlation_id: AtomicU64::new(1),
            connection_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Number of pooled connections
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Accept inbound connections on `listener` until shutdown
    pub fn serve(&self, listener: TcpListener, handler: RequestHandler) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let config = self.config.clone();

        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Replication transport listening");
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!(peer = %addr, "Accepted connection");

                                let handler = handler.clone();
                                let config = config.clone();
                                let mut conn_shutdown = shutdown_rx.resubscribe();

                                tokio::spawn(async move {
                                    tokio::select! {
                                        result = Self::handle_connection(stream, handler, config) => {
                                            if let Err(e) = result {
                                                debug!(peer = %addr, error = %e, "Connection error");
                                            }
                                        }
                                        _ = conn_shutdown.recv() => {}
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Accept error");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Replication transport shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Handle an inbound connection, one request at a time
    async fn handle_connection(
        mut stream: TcpStream,
        handler: RequestHandler,
        config: TransportConfig,
    ) -> Result<()> {
        if config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        loop {
            let body = match timeout(config.read_timeout, read_frame(&mut stream)).await {
                Ok(Ok(Some(body))) => body,
                Ok(Ok(None)) => return Ok(()), // clean close
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ReplicationError::Timeout),
            };

            let request = decode_request(&body)?;
            let correlation_id = request.correlation_id();
            let response = match request.header().validate_version() {
                Ok(()) => handler(request),
                Err(header) => {
                    warn!(correlation_id, "Rejecting request with unsupported version");
                    ReplicationResponse::Error { header }
                }
            };

            let framed = frame_message(&encode_response(&response)?);
            timeout(config.write_timeout, stream.write_all(&framed))
                .await
                .map_err(|_| ReplicationError::Timeout)?
                .map_err(ReplicationError::Io)?;
        }
    }

    /// Get the pooled connection for `address` or open a new one
    async fn connection(&self, address: &str) -> Result<Arc<Connection>> {
        if let Some(conn) = self.live_session(address) {
            return Ok(conn);
        }

        let lock = self
            .connect_locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if let Some(conn) = self.live_session(address) {
            return Ok(conn);
        }

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ReplicationError::Timeout)?
            .map_err(|e| ReplicationError::ConnectionFailed(format!("{}: {}", address, e)))?;

        if self.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        let id = self.connection_id.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(Connection::open(
            id,
            address.to_string(),
            stream,
            self.sessions.clone(),
            &self.config,
        ));
        self.sessions.insert(address.to_string(), conn.clone());

        info!(address, connection = id, "Opened replication connection");
        Ok(conn)
    }

    fn live_session(&self, address: &str) -> Option<Arc<Connection>> {
        self.sessions
            .get(address)
            .map(|entry| entry.value().clone())
            .filter(|conn| !conn.is_closed())
    }

    /// Get next correlation ID
    fn next_correlation_id(&self) -> u64 {
        self.correlation_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Stop accept loops and drop pooled connections
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.sessions.clear();
    }
}

#[async_trait]
impl ReplicationClient for TcpTransport {
    async fn send_command(
        &self,
        address: &str,
        command: Command,
        deadline: Duration,
    ) -> Result<ReplicationResponse> {
        let expires = Instant::now() + deadline;
        let conn = timeout_at(expires, self.connection(address))
            .await
            .map_err(|_| ReplicationError::Timeout)??;

        let correlation_id = self.next_correlation_id();
        let header = RequestHeader::new(correlation_id, self.local_node).with_timeout(deadline);
        let framed = frame_message(&encode_request(&command.into_request(header))?);

        let (tx, rx) = oneshot::channel();
        conn.pending.insert(correlation_id, tx);

        match timeout_at(expires, conn.outbound.send(framed)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                conn.pending.remove(&correlation_id);
                conn.evict();
                return Err(ReplicationError::ConnectionClosed);
            }
            Err(_) => {
                conn.pending.remove(&correlation_id);
                return Err(ReplicationError::Timeout);
            }
        }

        match timeout_at(expires, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ReplicationError::ConnectionClosed),
            Err(_) => {
                conn.pending.remove(&correlation_id);
                Err(ReplicationError::Timeout)
            }
        }
    }

    fn close(&self) {
        self.sessions.clear();
    }
}

/// One outbound connection shared by every command to a peer
struct Connection {
    id: u64,
    address: String,
    outbound: mpsc::Sender<Vec<u8>>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    sessions: Arc<Sessions>,
    tasks: [JoinHandle<()>; 2],
}

impl Connection {
    fn open(
        id: u64,
        address: String,
        stream: TcpStream,
        sessions: Arc<Sessions>,
        config: &TransportConfig,
    ) -> Self {
        let (mut reader, mut writer) = stream.into_split();
        let (outbound, mut queue) = mpsc::channel::<Vec<u8>>(config.outbound_queue_size.max(1));
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let write_timeout = config.write_timeout;
        let writer_closed = closed.clone();
        let writer_sessions = sessions.clone();
        let writer_address = address.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                let result = timeout(write_timeout, writer.write_all(&frame)).await;
                if !matches!(result, Ok(Ok(()))) {
                    warn!(address = %writer_address, connection = id, "Write failed, closing connection");
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            writer_sessions.remove_if(&writer_address, |_, conn| conn.id == id);
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_sessions = sessions.clone();
        let reader_address = address.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(body)) => match decode_response(&body) {
                        Ok(response) => {
                            if let Some((_, sender)) =
                                reader_pending.remove(&response.correlation_id())
                            {
                                let _ = sender.send(response);
                            }
                        }
                        Err(e) => {
                            warn!(address = %reader_address, error = %e, "Failed to decode response");
                        }
                    },
                    Ok(None) => {
                        info!(address = %reader_address, connection = id, "Connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(address = %reader_address, connection = id, error = %e, "Connection failed");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            reader_sessions.remove_if(&reader_address, |_, conn| conn.id == id);
            // waiting callers observe ConnectionClosed
            reader_pending.clear();
        });

        Self {
            id,
            address,
            outbound,
            pending,
            closed,
            sessions,
            tasks: [writer_task, reader_task],
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn evict(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sessions.remove_if(&self.address, |_, conn| conn.id == self.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Read one length-prefixed frame; `None` on clean end of stream
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut length_buf = [0u8; 4];
    match reader.read_exact(&mut length_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ReplicationError::Io(e)),
    }

    let length = frame_length(&length_buf);
    if length > MAX_MESSAGE_SIZE {
        return Err(ReplicationError::MessageTooLarge {
            size: length,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(ReplicationError::Io)?;
    Ok(Some(body))
}

/// Build an error response for a request that could not be served
pub fn error_response(correlation_id: u64, code: u16, message: impl Into<String>) -> ReplicationResponse {
    ReplicationResponse::Error {
        header: ResponseHeader::error(correlation_id, code, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::TopicPartitionGroup;
    use crate::protocol::{TimeoutNowRequest, TimeoutNowResponse};

    fn echo_handler() -> RequestHandler {
        Arc::new(|request: ReplicationRequest| match request {
            ReplicationRequest::TimeoutNow { header, request } => ReplicationResponse::TimeoutNow {
                header: ResponseHeader::success(header.correlation_id),
                response: TimeoutNowResponse {
                    success: true,
                    term: request.term + 1,
                },
            },
            other => error_response(other.correlation_id(), 3, "unsupported"),
        })
    }

    fn timeout_now(term: u64) -> Command {
        Command::TimeoutNow(TimeoutNowRequest {
            partition_group: TopicPartitionGroup::new("orders", 1),
            term,
        })
    }

    #[tokio::test]
    async fn test_command_round_trip_reuses_connection() {
        let server = TcpTransport::new(1, TransportConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _accept = server.serve(listener, echo_handler());

        let client = TcpTransport::new(2, TransportConfig::default());
        for term in 1..=3 {
            let response = client
                .send_command(&address, timeout_now(term), Duration::from_secs(2))
                .await
                .unwrap()
                .into_timeout_now()
                .unwrap();
            assert!(response.success);
            assert_eq!(response.term, term + 1);
        }
        assert_eq!(client.connection_count(), 1);

        client.close();
        assert_eq!(client.connection_count(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_commands_are_multiplexed() {
        let server = TcpTransport::new(1, TransportConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _accept = server.serve(listener, echo_handler());

        let client = Arc::new(TcpTransport::new(2, TransportConfig::default()));
        let mut handles = Vec::new();
        for term in 0..16u64 {
            let client = client.clone();
            let address = address.clone();
            handles.push(tokio::spawn(async move {
                client
                    .send_command(&address, timeout_now(term), Duration::from_secs(2))
                    .await
                    .and_then(|r| r.into_timeout_now())
                    .map(|r| (term, r.term))
            }));
        }

        for handle in handles {
            let (sent, received) = handle.await.unwrap().unwrap();
            assert_eq!(received, sent + 1);
        }
        assert_eq!(client.connection_count(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_error_response_surfaces_as_protocol_error() {
        let server = TcpTransport::new(1, TransportConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _accept = server.serve(listener, echo_handler());

        let client = TcpTransport::new(2, TransportConfig::default());
        let command = Command::ReplicateConsumePos(crate::protocol::ReplicateConsumePosRequest {
            positions: None,
        });
        let err = client
            .send_command(&address, command, Duration::from_secs(2))
            .await
            .unwrap()
            .into_replicate_consume_pos()
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol(_)));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_pending_connect_does_not_block_other_peers() {
        let server = TcpTransport::new(1, TransportConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _accept = server.serve(listener, echo_handler());

        let client = TcpTransport::new(2, TransportConfig::default());
        // a connect to another peer still in progress
        let stuck = client
            .connect_locks
            .entry("10.0.0.9:50091".to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = stuck.lock().await;

        let response = client
            .send_command(&address, timeout_now(1), Duration::from_secs(2))
            .await
            .unwrap()
            .into_timeout_now()
            .unwrap();
        assert_eq!(response.term, 2);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_deadline_bounds_connection_setup() {
        let client = TcpTransport::new(2, TransportConfig::default());
        let address = "10.0.0.9:50091";
        let stuck = client
            .connect_locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = stuck.lock().await;

        let result = client
            .send_command(address, timeout_now(1), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ReplicationError::Timeout)));
        assert_eq!(client.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = TcpTransport::new(2, TransportConfig::default());
        let result = client
            .send_command(&address, timeout_now(1), Duration::from_secs(1))
            .await;
        assert!(result.is_err());
        assert_eq!(client.connection_count(), 0);
    }
}
