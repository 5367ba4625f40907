//! Replication configuration

use crate::error::{ReplicationError, Result};
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replication configuration shared by every replica group on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Timeout applied to every outbound replication command
    pub send_command_timeout: Duration,

    /// Maximum bytes of log entries carried by one append-entries request
    pub max_replicate_length: usize,

    /// Minimum interval between two consume position syncs to one replica
    pub replicate_consume_pos_interval: Duration,

    /// Capacity of the shared replicate executor (commands in flight)
    pub max_in_flight_commands: usize,

    /// Log every consume position snapshot that is sent or received
    pub output_consume_pos: bool,

    /// Interval of the manager's status report
    pub report_interval: Duration,

    /// Operations slower than this are logged at info level
    pub max_process_time: Duration,

    /// Re-arm delay after a failed or rejected replication attempt
    pub failure_backoff: Duration,

    /// Re-arm delay when a replica has nothing left to receive
    pub idle_backoff: Duration,

    /// Re-arm delay of the local token in a multi-replica group
    pub heartbeat_interval: Duration,

    /// Network transport settings
    pub transport: TransportConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            send_command_timeout: Duration::from_secs(2),
            max_replicate_length: 1024 * 1024, // 1 MB
            replicate_consume_pos_interval: Duration::from_secs(5),
            max_in_flight_commands: 10_000,
            output_consume_pos: false,
            report_interval: Duration::from_secs(30),
            max_process_time: Duration::from_millis(300),
            failure_backoff: Duration::from_secs(1),
            idle_backoff: Duration::from_millis(1),
            heartbeat_interval: Duration::from_secs(1),
            transport: TransportConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Check that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.send_command_timeout.is_zero() {
            return Err(ReplicationError::InvalidConfig(
                "send_command_timeout must be positive".into(),
            ));
        }
        if self.max_replicate_length == 0 {
            return Err(ReplicationError::InvalidConfig(
                "max_replicate_length must be positive".into(),
            ));
        }
        if self.max_replicate_length > crate::protocol::MAX_MESSAGE_SIZE / 2 {
            return Err(ReplicationError::InvalidConfig(format!(
                "max_replicate_length {} exceeds half of the {} byte frame limit",
                self.max_replicate_length,
                crate::protocol::MAX_MESSAGE_SIZE
            )));
        }
        if self.max_in_flight_commands == 0 {
            return Err(ReplicationError::InvalidConfig(
                "max_in_flight_commands must be positive".into(),
            ));
        }
        if self.report_interval.is_zero() {
            return Err(ReplicationError::InvalidConfig(
                "report_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReplicationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.send_command_timeout, Duration::from_secs(2));
        assert_eq!(config.failure_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_config() {
        let config = ReplicationConfig {
            max_replicate_length: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReplicationError::InvalidConfig(_))
        ));

        let config = ReplicationConfig {
            max_replicate_length: crate::protocol::MAX_MESSAGE_SIZE,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ReplicationConfig {
            send_command_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrips_through_postcard() {
        let config = ReplicationConfig {
            output_consume_pos: true,
            ..Default::default()
        };
        let bytes = postcard::to_allocvec(&config).unwrap();
        let decoded: ReplicationConfig = postcard::from_bytes(&bytes).unwrap();
        assert!(decoded.output_consume_pos);
        assert_eq!(decoded.max_replicate_length, config.max_replicate_length);
    }
}
