//! ksessions - Kafka producer/consumer session harness
//!
//! This library holds the session core: producer and consumer sessions, the
//! per-(group, topic) progress trackers, and the registry that creates and
//! destroys them. Broker access goes through the traits in [`broker`].

pub mod broker;
pub mod config;
pub mod consumer;
pub mod group;
pub mod log_sink;
pub mod producer;
pub mod registry;
pub mod session;
pub mod tracker;
pub mod utils;

// Re-export commonly used types
pub use broker::{BrokerConnector, KafkaConnector, MemoryBroker};
pub use config::HarnessConfig;
pub use registry::{ConsumerMode, NewProducer, RegistryError, RegistryEvent, SessionRegistry};
pub use session::SessionState;
