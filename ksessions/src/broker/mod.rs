//! Broker capability seam
//!
//! Sessions and trackers talk to the message broker only through the traits in
//! this module. [`kafka::KafkaConnector`] speaks the Kafka wire protocol;
//! [`memory::MemoryBroker`] is an in-process stand-in used for demos and tests.

pub mod kafka;
pub mod kafka_client;
pub mod kafka_cluster;
pub mod kafka_group;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::{ConsumerConfig, ProducerConfig};

pub use kafka::KafkaConnector;
pub use memory::MemoryBroker;

/// Terminal state of a delivered message as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryStatus {
    /// Acknowledged by all required replicas
    Persisted,
    /// Written, but acknowledgment did not cover the full replica set
    PossiblyPersisted,
    NotPersisted,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Persisted => "Persisted",
            DeliveryStatus::PossiblyPersisted => "PossiblyPersisted",
            DeliveryStatus::NotPersisted => "NotPersisted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub partition: i32,
    pub offset: i64,
    pub status: DeliveryStatus,
}

/// One record handed out by a consumer poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub value: Option<Bytes>,
}

impl ConsumedRecord {
    /// Record value decoded as UTF-8, lossily
    pub fn value_str(&self) -> String {
        self.value
            .as_ref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: i64,
    pub high: i64,
}

/// Failure of a single consumer poll
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Fetch or decode failure; the next poll may succeed
    #[error("fetch failed: {0:#}")]
    Transient(anyhow::Error),
    /// The connection can no longer be polled
    #[error("consumer unusable: {0:#}")]
    Fatal(anyhow::Error),
}

/// Opens broker connections for sessions and trackers
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect_producer(&self, config: &ProducerConfig) -> Result<Box<dyn ProducerConnection>>;

    async fn connect_consumer(&self, config: &ConsumerConfig) -> Result<Box<dyn ConsumerConnection>>;

    /// Opens a metadata/admin connection; `client_id` identifies the caller
    async fn connect_metadata(&self, client_id: &str) -> Result<Box<dyn MetadataClient>>;
}

/// Outbound connection owned by one producer session
#[async_trait]
pub trait ProducerConnection: Send + Sync {
    async fn send(&self, topic: &str, message: Bytes) -> Result<DeliveryReport>;

    /// Waits up to `timeout` for outstanding sends to complete
    async fn flush(&self, timeout: Duration) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Inbound connection owned by one consumer session
#[async_trait]
pub trait ConsumerConnection: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Returns the next record, or `None` when nothing arrived within `timeout`
    async fn poll(&self, timeout: Duration) -> std::result::Result<Option<ConsumedRecord>, PollError>;

    /// Commits the position just past `record` for the consumer's group
    async fn commit(&self, record: &ConsumedRecord) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Topic metadata and watermark queries
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Partition ids of `topic`; empty when the topic is unknown
    async fn topic_partitions(&self, topic: &str, timeout: Duration) -> Result<Vec<i32>>;

    async fn watermarks(&self, topic: &str, partition: i32, timeout: Duration) -> Result<Watermarks>;
}
