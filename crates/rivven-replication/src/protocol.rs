//! Wire protocol for replication commands

use crate::error::{ReplicationError, Result};
use crate::node::NodeId;
use crate::partition::TopicPartitionGroup;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum protocol version we can interoperate with
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Error codes for protocol-level errors
pub mod error_codes {
    /// Unsupported protocol version
    pub const UNSUPPORTED_VERSION: u16 = 1;
    /// No replica group for the requested partition group
    pub const UNKNOWN_PARTITION_GROUP: u16 = 2;
    /// Request could not be served
    pub const INTERNAL: u16 = 3;
}

/// Request header included in all requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Protocol version
    pub version: u16,
    /// Correlation ID for matching responses
    pub correlation_id: u64,
    /// Source node ID
    pub source: NodeId,
    /// Request timeout
    pub timeout_ms: u32,
}

impl RequestHeader {
    pub fn new(correlation_id: u64, source: NodeId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            source,
            timeout_ms: 30000,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u32;
        self
    }

    /// Validate that the protocol version is supported.
    /// Returns an error ResponseHeader if the version is out of range.
    pub fn validate_version(&self) -> std::result::Result<(), ResponseHeader> {
        if self.version < MIN_PROTOCOL_VERSION || self.version > PROTOCOL_VERSION {
            Err(ResponseHeader::error(
                self.correlation_id,
                error_codes::UNSUPPORTED_VERSION,
                format!(
                    "unsupported protocol version {}: supported range [{}, {}]",
                    self.version, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION
                ),
            ))
        } else {
            Ok(())
        }
    }
}

/// Response header included in all responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Correlation ID matching the request
    pub correlation_id: u64,
    /// Error code (0 = success)
    pub error_code: u16,
    /// Error message (if any)
    pub error_message: Option<String>,
}

impl ResponseHeader {
    pub fn success(correlation_id: u64) -> Self {
        Self {
            correlation_id,
            error_code: 0,
            error_message: None,
        }
    }

    pub fn error(correlation_id: u64, code: u16, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            error_code: code,
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

// ==================== Append Entries ====================

/// Log range pushed from a leader to one follower
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub partition_group: TopicPartitionGroup,
    pub term: u64,
    pub leader_id: NodeId,
    /// Position of the first entry in `entries`
    pub start_position: u64,
    /// Leader's left position
    pub left_position: u64,
    /// Leader already verified log matching for this follower
    pub matched: bool,
    /// Leader's commit position
    pub commit_position: u64,
    /// Term of the entry preceding `start_position`, when attached
    pub prev_term: u64,
    /// Position of the entry preceding `start_position`, when attached
    pub prev_position: u64,
    /// Term of the first entry
    pub entries_term: u64,
    /// Framed entries
    pub entries: Bytes,
}

impl AppendEntriesRequest {
    pub fn entries_len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for AppendEntriesRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AppendEntries {{ group: {}, term: {}, leader: {}, start: {}, left: {}, matched: {}, \
             commit: {}, prev: {}@{}, entries_term: {}, entries: {} bytes }}",
            self.partition_group,
            self.term,
            self.leader_id,
            self.start_position,
            self.left_position,
            self.matched,
            self.commit_position,
            self.prev_position,
            self.prev_term,
            self.entries_term,
            self.entries.len()
        )
    }
}

/// Follower's answer to an append-entries request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub partition_group: TopicPartitionGroup,
    pub term: u64,
    pub replica_id: NodeId,
    pub success: bool,
    /// Follower's right position after handling the request
    pub write_position: u64,
    /// Where the leader should continue; `None` means no valid position is
    /// known and the leader must step back one entry
    pub next_position: Option<u64>,
    pub entries_term: u64,
}

// ==================== Timeout Now ====================

/// Asks a caught-up transferee to campaign immediately
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub partition_group: TopicPartitionGroup,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    pub success: bool,
    pub term: u64,
}

// ==================== Consume Positions ====================

/// Serialized consume positions pushed to a follower
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateConsumePosRequest {
    pub positions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateConsumePosResponse {
    pub success: bool,
}

// ==================== Envelopes ====================

/// Replication command sent to a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationRequest {
    AppendEntries {
        header: RequestHeader,
        request: AppendEntriesRequest,
    },
    TimeoutNow {
        header: RequestHeader,
        request: TimeoutNowRequest,
    },
    ReplicateConsumePos {
        header: RequestHeader,
        request: ReplicateConsumePosRequest,
    },
}

/// Command payload without a header, as built by replica groups
#[derive(Debug, Clone)]
pub enum Command {
    AppendEntries(AppendEntriesRequest),
    TimeoutNow(TimeoutNowRequest),
    ReplicateConsumePos(ReplicateConsumePosRequest),
}

impl Command {
    /// Wrap the payload in a request envelope
    pub fn into_request(self, header: RequestHeader) -> ReplicationRequest {
        match self {
            Command::AppendEntries(request) => ReplicationRequest::AppendEntries { header, request },
            Command::TimeoutNow(request) => ReplicationRequest::TimeoutNow { header, request },
            Command::ReplicateConsumePos(request) => {
                ReplicationRequest::ReplicateConsumePos { header, request }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::AppendEntries(_) => "append_entries",
            Command::TimeoutNow(_) => "timeout_now",
            Command::ReplicateConsumePos(_) => "replicate_consume_pos",
        }
    }
}

impl ReplicationRequest {
    pub fn header(&self) -> &RequestHeader {
        match self {
            ReplicationRequest::AppendEntries { header, .. }
            | ReplicationRequest::TimeoutNow { header, .. }
            | ReplicationRequest::ReplicateConsumePos { header, .. } => header,
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.header().correlation_id
    }
}

/// Reply to a replication command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationResponse {
    AppendEntries {
        header: ResponseHeader,
        response: AppendEntriesResponse,
    },
    TimeoutNow {
        header: ResponseHeader,
        response: TimeoutNowResponse,
    },
    ReplicateConsumePos {
        header: ResponseHeader,
        response: ReplicateConsumePosResponse,
    },
    /// Generic error response
    Error { header: ResponseHeader },
}

impl ReplicationResponse {
    pub fn header(&self) -> &ResponseHeader {
        match self {
            ReplicationResponse::AppendEntries { header, .. }
            | ReplicationResponse::TimeoutNow { header, .. }
            | ReplicationResponse::ReplicateConsumePos { header, .. }
            | ReplicationResponse::Error { header } => header,
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.header().correlation_id
    }

    /// Extract the append-entries payload
    pub fn into_append_entries(self) -> Result<AppendEntriesResponse> {
        match self {
            ReplicationResponse::AppendEntries { response, .. } => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    /// Extract the timeout-now payload
    pub fn into_timeout_now(self) -> Result<TimeoutNowResponse> {
        match self {
            ReplicationResponse::TimeoutNow { response, .. } => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    /// Extract the consume position payload
    pub fn into_replicate_consume_pos(self) -> Result<ReplicateConsumePosResponse> {
        match self {
            ReplicationResponse::ReplicateConsumePos { response, .. } => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: ReplicationResponse) -> ReplicationError {
    match response {
        ReplicationResponse::Error { header } => ReplicationError::Protocol(
            header
                .error_message
                .unwrap_or_else(|| format!("error code {}", header.error_code)),
        ),
        other => ReplicationError::UnexpectedResponse(format!("{:?}", other.header())),
    }
}

/// Encode a request to bytes
pub fn encode_request(request: &ReplicationRequest) -> Result<Vec<u8>> {
    postcard::to_allocvec(request).map_err(|e| ReplicationError::Serialization(e.to_string()))
}

/// Decode a request from bytes
pub fn decode_request(bytes: &[u8]) -> Result<ReplicationRequest> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ReplicationError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    postcard::from_bytes(bytes).map_err(|e| ReplicationError::Deserialization(e.to_string()))
}

/// Encode a response to bytes
pub fn encode_response(response: &ReplicationResponse) -> Result<Vec<u8>> {
    postcard::to_allocvec(response).map_err(|e| ReplicationError::Serialization(e.to_string()))
}

/// Decode a response from bytes
pub fn decode_response(bytes: &[u8]) -> Result<ReplicationResponse> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ReplicationError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    postcard::from_bytes(bytes).map_err(|e| ReplicationError::Deserialization(e.to_string()))
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(data: &[u8]) -> Vec<u8> {
    let len = data.len() as u32;
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(data);
    framed
}

/// Extract message length from frame header
pub fn frame_length(header: &[u8; 4]) -> usize {
    u32::from_be_bytes(*header) as usize
}
