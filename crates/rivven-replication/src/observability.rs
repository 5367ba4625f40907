//! Replication metrics
//!
//! Lightweight metrics through the `metrics` crate. Every call compiles to a
//! no-op unless the `metrics-prometheus` feature is enabled; installing a
//! recorder/exporter is left to the embedding binary.
//!
//! ```rust,ignore
//! use rivven_replication::observability::ReplicationMetrics;
//!
//! ReplicationMetrics::record_replicate("orders", 4096, Duration::from_micros(350));
//! ReplicationMetrics::increment_step_downs();
//! ```

use std::time::Duration;

// ============================================================================
// Leader-side Metrics
// ============================================================================

/// Metrics of the leader push path and group lifecycle
pub struct ReplicationMetrics;

impl ReplicationMetrics {
    // ---- Counters ----

    /// One append-entries round trip completed
    pub fn record_replicate(topic: &str, bytes: usize, duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        {
            metrics::counter!("rivven_replication_replicate_total", "topic" => topic.to_string())
                .increment(1);
            metrics::counter!("rivven_replication_replicate_bytes_total", "topic" => topic.to_string())
                .increment(bytes as u64);
            metrics::histogram!("rivven_replication_replicate_latency_seconds")
                .record(duration.as_secs_f64());
        }
    }

    /// An append-entries command failed in transport
    pub fn increment_replicate_failures(topic: &str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_replication_replicate_failures_total", "topic" => topic.to_string())
            .increment(1);
    }

    /// A follower rejected an append-entries request
    pub fn increment_rejections() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_replication_rejections_total").increment(1);
    }

    /// The shared executor refused a command
    pub fn increment_executor_rejections() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_replication_executor_rejections_total").increment(1);
    }

    /// A leader observed a higher term
    pub fn increment_step_downs() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_replication_step_downs_total").increment(1);
    }

    /// A timeout-now command was sent to a transferee
    pub fn increment_timeout_now_sent() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_replication_timeout_now_sent_total").increment(1);
    }

    // ---- Gauges ----

    /// Replica groups hosted on this node
    pub fn set_group_count(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("rivven_replication_groups").set(count as f64);
    }

    /// Replica groups this node leads
    pub fn set_leader_count(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("rivven_replication_leaders").set(count as f64);
    }

    /// Commands running on the shared executor
    pub fn set_in_flight_commands(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("rivven_replication_in_flight_commands").set(count as f64);
    }
}

// ============================================================================
// Follower-side Metrics
// ============================================================================

/// Metrics of the follower append path
pub struct AppendMetrics;

impl AppendMetrics {
    /// One append-entries request applied to the local store
    pub fn record_append(topic: &str, bytes: usize, duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        {
            metrics::counter!("rivven_replication_append_total", "topic" => topic.to_string())
                .increment(1);
            metrics::counter!("rivven_replication_append_bytes_total", "topic" => topic.to_string())
                .increment(bytes as u64);
            metrics::histogram!("rivven_replication_append_latency_seconds")
                .record(duration.as_secs_f64());
        }
    }

    /// An append-entries request failed log matching
    pub fn increment_mismatches() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_replication_append_mismatches_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_metrics_compile() {
        ReplicationMetrics::record_replicate("orders", 1024, Duration::from_micros(200));
        ReplicationMetrics::increment_replicate_failures("orders");
        ReplicationMetrics::increment_step_downs();
        ReplicationMetrics::set_group_count(12);
        ReplicationMetrics::set_leader_count(4);
    }

    #[test]
    fn test_append_metrics_compile() {
        AppendMetrics::record_append("orders", 2048, Duration::from_micros(80));
        AppendMetrics::increment_mismatches();
    }
}
