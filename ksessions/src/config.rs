//! Runtime configuration for the session harness
//!
//! Everything here is supplied by the orchestration layer; sessions and
//! trackers never compute their own connection settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bootstrap address used when none is given
pub const DEFAULT_BOOTSTRAP: &str = "localhost:9092";

/// Capacity of each log buffer before the oldest entries are dropped
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Grace period granted to a stopping session before its connection is closed anyway
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Broker acknowledgment mode requested on produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Leader-only acknowledgment (`acks=1`)
    Leader,
    /// Full in-sync-replica acknowledgment (`acks=-1`)
    All,
}

impl Acks {
    /// Wire value of the `acks` field in a Produce request
    pub fn wire_value(self) -> i16 {
        match self {
            Acks::Leader => 1,
            Acks::All => -1,
        }
    }
}

/// Where a consumer starts when its group has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    /// ListOffsets timestamp sentinel for this policy
    pub fn list_offsets_timestamp(self) -> i64 {
        match self {
            OffsetReset::Earliest => -2,
            OffsetReset::Latest => -1,
        }
    }
}

/// Connection settings for one producer session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    pub bootstrap: Vec<String>,
    pub client_id: String,
    /// Upper bound on delivering one message
    pub message_timeout: Duration,
    /// Broker-side request timeout carried in the Produce request
    pub request_timeout: Duration,
    /// Bound on any single socket exchange
    pub socket_timeout: Duration,
    /// How long cached partition metadata stays valid
    pub metadata_max_age: Duration,
    pub acks: Acks,
}

impl ProducerConfig {
    /// Builds a producer config whose four timeouts share one value and which
    /// requires full ISR acknowledgment
    pub fn with_send_timeout(bootstrap: Vec<String>, client_id: String, timeout: Duration) -> Self {
        Self {
            bootstrap,
            client_id,
            message_timeout: timeout,
            request_timeout: timeout,
            socket_timeout: timeout,
            metadata_max_age: timeout,
            acks: Acks::All,
        }
    }
}

/// Connection settings for one consumer session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub bootstrap: Vec<String>,
    pub client_id: String,
    pub group_id: String,
    pub offset_reset: OffsetReset,
    /// Always false: offsets are committed only after processing
    pub enable_auto_commit: bool,
    /// Always false: offsets are stored only by explicit commit
    pub enable_auto_offset_store: bool,
    /// Bound on any single socket exchange
    pub socket_timeout: Duration,
}

impl ConsumerConfig {
    pub fn manual_commit(
        bootstrap: Vec<String>,
        client_id: String,
        group_id: String,
        offset_reset: OffsetReset,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            bootstrap,
            client_id,
            group_id,
            offset_reset,
            enable_auto_commit: false,
            enable_auto_offset_store: false,
            socket_timeout,
        }
    }
}

/// Consumer poll-loop tuning
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Bound on each poll, which is also the cancellation observation latency
    pub poll_timeout: Duration,
    /// How long `stop()` waits for the poll task before closing the connection
    pub stop_grace: Duration,
    /// Lower bound of the simulated processing latency
    pub processing_min: Duration,
    /// Upper bound (exclusive) of the simulated processing latency
    pub processing_max: Duration,
    pub offset_reset: OffsetReset,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            stop_grace: DEFAULT_STOP_GRACE,
            processing_min: Duration::from_millis(500),
            processing_max: Duration::from_millis(1000),
            offset_reset: OffsetReset::Earliest,
        }
    }
}

/// Progress tracker tuning
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Period of the watermark refresh
    pub refresh_interval: Duration,
    /// Bound on each metadata or watermark query
    pub query_timeout: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(1),
            query_timeout: Duration::from_secs(5),
        }
    }
}

/// All tunables of a registry, assembled from command-line arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub bootstrap: Vec<String>,
    /// Shared value for the producer's message/request/socket/metadata-age timeouts
    pub send_timeout: Duration,
    /// Grace period for a stopping producer to flush
    pub flush_timeout: Duration,
    pub consumer: ConsumerSettings,
    pub tracker: TrackerSettings,
    pub log_capacity: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            bootstrap: vec![DEFAULT_BOOTSTRAP.to_string()],
            send_timeout: Duration::from_secs(5),
            flush_timeout: DEFAULT_STOP_GRACE,
            consumer: ConsumerSettings::default(),
            tracker: TrackerSettings::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl HarnessConfig {
    pub fn producer_config(&self, client_id: String) -> ProducerConfig {
        ProducerConfig::with_send_timeout(self.bootstrap.clone(), client_id, self.send_timeout)
    }

    pub fn consumer_config(&self, client_id: String, group_id: String) -> ConsumerConfig {
        ConsumerConfig::manual_commit(
            self.bootstrap.clone(),
            client_id,
            group_id,
            self.consumer.offset_reset,
            self.send_timeout,
        )
    }
}

/// Splits a comma separated bootstrap list, trimming blanks
pub fn parse_bootstrap(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_timeouts_are_identical() {
        let config = ProducerConfig::with_send_timeout(
            vec!["b:9092".into()],
            "p-1".into(),
            Duration::from_millis(5000),
        );
        assert_eq!(config.message_timeout, config.request_timeout);
        assert_eq!(config.request_timeout, config.socket_timeout);
        assert_eq!(config.socket_timeout, config.metadata_max_age);
        assert_eq!(config.acks, Acks::All);
        assert_eq!(config.acks.wire_value(), -1);
    }

    #[test]
    fn test_consumer_config_is_manual_commit() {
        let harness = HarnessConfig::default();
        let config = harness.consumer_config("c-1".into(), "G1".into());
        assert!(!config.enable_auto_commit);
        assert!(!config.enable_auto_offset_store);
        assert_eq!(config.offset_reset, OffsetReset::Earliest);
        assert_eq!(config.group_id, "G1");
    }

    #[test]
    fn test_parse_bootstrap() {
        assert_eq!(
            parse_bootstrap(" a:9092, b:9094 ,,c:9095"),
            vec!["a:9092", "b:9094", "c:9095"]
        );
        assert!(parse_bootstrap(" , ").is_empty());
    }
}
