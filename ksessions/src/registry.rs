//! Session registry
//!
//! Owns every producer, consumer, consumer group and progress tracker, and is
//! the only place they are created or destroyed. Validation happens here,
//! before any state changes; sessions themselves never see invalid requests.

use futures::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::broker::BrokerConnector;
use crate::config::HarnessConfig;
use crate::consumer::{ConsumerSession, ConsumerSnapshot};
use crate::group::{parse_topics, ConsumerGroup, GroupSnapshot, TopicList};
use crate::log_sink::{LogBuffer, SessionLogger};
use crate::producer::{ProducerSession, ProducerSnapshot, ProducerSpec, UniformSchedule};
use crate::tracker::{tracker_key, ProgressRouter, TopicProgressTracker, TrackerSnapshot};

const EVENT_CAPACITY: usize = 256;

/// Operator-visible rejection; raised before any state is touched
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Consumer group ID existed")]
    DuplicateGroup(String),
    #[error("Consumer group ID must not be empty")]
    EmptyGroupId,
    #[error("Must choose at least one topic")]
    EmptyTopics,
    #[error("Must choose a consumer group")]
    MissingGroup,
    #[error("Unknown consumer group '{0}'")]
    UnknownGroup(String),
    #[error("Cannot delete consumer group: {members} consumer(s) alive")]
    GroupInUse { group: String, members: usize },
    #[error("Unknown producer {0}")]
    UnknownProducer(u64),
    #[error("Unknown consumer {0}")]
    UnknownConsumer(u64),
    #[error("Producer topic must not be empty")]
    EmptyProducerTopic,
    #[error("Invalid send interval [{min}, {max}] seconds")]
    InvalidInterval { min: f64, max: f64 },
}

/// Change notification for observers of the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RegistryEvent {
    ProducerAdded { id: u64 },
    ProducerRemoved { id: u64 },
    ConsumerAdded { id: u64 },
    ConsumerRemoved { id: u64 },
    GroupAdded { id: String },
    GroupRemoved { id: String },
    /// Member count changed
    GroupUpdated { id: String, members: usize },
    TrackerAdded { key: String },
    TrackerRemoved { key: String },
    /// A tracker finished a refresh
    TrackerUpdated { key: String },
}

/// How a new consumer finds its group
#[derive(Debug, Clone)]
pub enum ConsumerMode {
    /// Gets a dedicated `Auto-<id>` group over these topics
    Independent { topics: String },
    /// Joins an existing group and inherits its topics
    Grouped { group: String },
}

/// Request for a new producer, in operator units
#[derive(Debug, Clone)]
pub struct NewProducer {
    pub topic: String,
    pub interval_min_secs: f64,
    pub interval_max_secs: f64,
    pub template: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub producers: Vec<ProducerSnapshot>,
    pub groups: Vec<GroupSnapshot>,
    pub consumers: Vec<ConsumerSnapshot>,
    pub trackers: Vec<TrackerSnapshot>,
}

pub struct SessionRegistry {
    config: HarnessConfig,
    connector: Arc<dyn BrokerConnector>,
    producers: IndexMap<u64, ProducerSession>,
    consumers: IndexMap<u64, ConsumerSession>,
    groups: IndexMap<String, ConsumerGroup>,
    router: ProgressRouter,
    producer_logs: LogBuffer,
    consumer_logs: LogBuffer,
    events: broadcast::Sender<RegistryEvent>,
    /// Last id handed out; shared by producers and consumers
    last_id: u64,
}

impl SessionRegistry {
    pub fn new(config: HarnessConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            producer_logs: LogBuffer::with_capacity(config.log_capacity),
            consumer_logs: LogBuffer::with_capacity(config.log_capacity),
            config,
            connector,
            producers: IndexMap::new(),
            consumers: IndexMap::new(),
            groups: IndexMap::new(),
            router: ProgressRouter::new(),
            events,
            last_id: 0,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn producer_logs(&self) -> &LogBuffer {
        &self.producer_logs
    }

    pub fn consumer_logs(&self) -> &LogBuffer {
        &self.consumer_logs
    }

    pub fn router(&self) -> &ProgressRouter {
        &self.router
    }

    pub fn producer(&self, id: u64) -> Option<&ProducerSession> {
        self.producers.get(&id)
    }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerSession> {
        self.producers.values()
    }

    pub fn consumer(&self, id: u64) -> Option<&ConsumerSession> {
        self.consumers.get(&id)
    }

    pub fn consumers(&self) -> impl Iterator<Item = &ConsumerSession> {
        self.consumers.values()
    }

    pub fn group(&self, id: &str) -> Option<&ConsumerGroup> {
        self.groups.get(id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &ConsumerGroup> {
        self.groups.values()
    }

    pub fn tracker(&self, key: &str) -> Option<Arc<TopicProgressTracker>> {
        self.router.get(key)
    }

    pub fn tracker_keys(&self) -> Vec<String> {
        self.router.keys()
    }

    /// Forwards a processed message to its tracker; unknown pairs are dropped
    pub fn message_processed(&self, group: &str, topic: &str) -> bool {
        self.router.message_processed(group, topic)
    }

    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn emit(&self, event: RegistryEvent) {
        debug!(?event, "registry event");
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Validates, creates and starts a producer; returns its id
    pub async fn add_producer(&mut self, request: NewProducer) -> Result<u64, RegistryError> {
        let topic = request.topic.trim();
        if topic.is_empty() {
            return Err(RegistryError::EmptyProducerTopic);
        }
        let schedule = UniformSchedule::from_secs(request.interval_min_secs, request.interval_max_secs)
            .ok_or(RegistryError::InvalidInterval {
                min: request.interval_min_secs,
                max: request.interval_max_secs,
            })?;

        let id = self.next_id();
        let spec = ProducerSpec {
            topic: topic.to_string(),
            interval_min: schedule.min(),
            interval_max: schedule.max(),
            template: request.template.filter(|t| !t.trim().is_empty()),
        };
        let logger = SessionLogger::new(
            ProducerSession::source_id(topic, id),
            Arc::new(self.producer_logs.clone()),
        );
        let mut session = ProducerSession::new(
            id,
            spec,
            self.config.producer_config(format!("producer-{}", id)),
            self.config.flush_timeout,
            Arc::new(schedule),
            logger,
        );
        session.start(self.connector.as_ref()).await;

        info!(id, topic, state = %session.state(), "producer added");
        self.producers.insert(id, session);
        self.emit(RegistryEvent::ProducerAdded { id });
        Ok(id)
    }

    /// Stops and removes a producer
    pub async fn remove_producer(&mut self, id: u64) -> Result<(), RegistryError> {
        let mut session = self
            .producers
            .shift_remove(&id)
            .ok_or(RegistryError::UnknownProducer(id))?;
        session.stop().await;
        info!(id, "producer removed");
        self.emit(RegistryEvent::ProducerRemoved { id });
        Ok(())
    }

    /// Creates an explicit consumer group over a comma separated topic list
    pub fn add_group(&mut self, id: &str, topics: &str) -> Result<(), RegistryError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(RegistryError::EmptyGroupId);
        }
        if self.groups.contains_key(id) {
            return Err(RegistryError::DuplicateGroup(id.to_string()));
        }
        if parse_topics(topics).is_empty() {
            return Err(RegistryError::EmptyTopics);
        }

        self.groups.insert(id.to_string(), ConsumerGroup::new(id, topics));
        info!(group = id, topics, "consumer group added");
        self.emit(RegistryEvent::GroupAdded { id: id.to_string() });
        Ok(())
    }

    /// Removes a group that has no live members
    pub fn remove_group(&mut self, id: &str) -> Result<(), RegistryError> {
        let group = self
            .groups
            .get(id)
            .ok_or_else(|| RegistryError::UnknownGroup(id.to_string()))?;
        if group.member_count() > 0 {
            return Err(RegistryError::GroupInUse {
                group: id.to_string(),
                members: group.member_count(),
            });
        }

        self.groups.shift_remove(id);
        info!(group = id, "consumer group removed");
        self.emit(RegistryEvent::GroupRemoved { id: id.to_string() });
        Ok(())
    }

    /// Creates and starts a consumer, creating any trackers its (group, topic) pairs lack
    pub async fn add_consumer(&mut self, mode: ConsumerMode) -> Result<u64, RegistryError> {
        let (id, group_id) = match mode {
            ConsumerMode::Independent { topics } => {
                if parse_topics(&topics).is_empty() {
                    return Err(RegistryError::EmptyTopics);
                }
                let (id, group_id) = loop {
                    let id = self.next_id();
                    let group_id = format!("Auto-{}", id);
                    if !self.groups.contains_key(&group_id) {
                        break (id, group_id);
                    }
                };
                self.groups
                    .insert(group_id.clone(), ConsumerGroup::automatic(&group_id, topics));
                self.emit(RegistryEvent::GroupAdded { id: group_id.clone() });
                (id, group_id)
            }
            ConsumerMode::Grouped { group } => {
                let group = group.trim();
                if group.is_empty() {
                    return Err(RegistryError::MissingGroup);
                }
                if !self.groups.contains_key(group) {
                    return Err(RegistryError::UnknownGroup(group.to_string()));
                }
                (self.next_id(), group.to_string())
            }
        };

        let topics: TopicList = match self.groups.get_mut(&group_id) {
            Some(group) => {
                group.join();
                group.topic_list().clone()
            }
            None => return Err(RegistryError::UnknownGroup(group_id)),
        };
        self.emit_group_members(&group_id);

        for topic in topics.topics() {
            let key = tracker_key(&group_id, topic);
            if !self.router.contains(&key) {
                self.router.insert(TopicProgressTracker::spawn(
                    group_id.clone(),
                    topic.clone(),
                    self.connector.clone(),
                    self.config.tracker,
                    self.events.clone(),
                ));
                self.emit(RegistryEvent::TrackerAdded { key });
            }
        }

        let logger = SessionLogger::new(
            ConsumerSession::source_id(&group_id, topics.topics(), id),
            Arc::new(self.consumer_logs.clone()),
        );
        let mut session = ConsumerSession::new(
            id,
            topics,
            self.config
                .consumer_config(format!("consumer-{}", id), group_id.clone()),
            self.config.consumer,
            self.router.clone(),
            logger,
        );
        session.start(self.connector.as_ref()).await;

        info!(id, group = %group_id, state = %session.state(), "consumer added");
        self.consumers.insert(id, session);
        self.emit(RegistryEvent::ConsumerAdded { id });
        Ok(id)
    }

    /// Stops and removes a consumer, then drops trackers no other group member still covers
    pub async fn remove_consumer(&mut self, id: u64) -> Result<(), RegistryError> {
        let mut session = self
            .consumers
            .shift_remove(&id)
            .ok_or(RegistryError::UnknownConsumer(id))?;
        let group_id = session.group().to_string();

        if let Some(group) = self.groups.get_mut(&group_id) {
            group.leave();
        }
        self.emit_group_members(&group_id);

        session.stop().await;

        for topic in session.topics() {
            let still_covered = self
                .consumers
                .values()
                .any(|other| other.group() == group_id && other.covers(topic));
            if still_covered {
                continue;
            }
            let key = tracker_key(&group_id, topic);
            if let Some(tracker) = self.router.remove(&key) {
                tracker.dispose();
                self.emit(RegistryEvent::TrackerRemoved { key });
            }
        }

        let drop_group = self
            .groups
            .get(&group_id)
            .is_some_and(|g| g.is_automatic() && g.member_count() == 0);
        if drop_group {
            self.groups.shift_remove(&group_id);
            self.emit(RegistryEvent::GroupRemoved { id: group_id.clone() });
        }

        info!(id, group = %group_id, "consumer removed");
        self.emit(RegistryEvent::ConsumerRemoved { id });
        Ok(())
    }

    fn emit_group_members(&self, group_id: &str) {
        if let Some(group) = self.groups.get(group_id) {
            self.emit(RegistryEvent::GroupUpdated {
                id: group_id.to_string(),
                members: group.member_count(),
            });
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            producers: self.producers.values().map(ProducerSession::snapshot).collect(),
            groups: self.groups.values().map(ConsumerGroup::snapshot).collect(),
            consumers: self.consumers.values().map(ConsumerSession::snapshot).collect(),
            trackers: self.router.snapshots(),
        }
    }

    /// Stops every session concurrently and disposes all trackers
    pub async fn shutdown(&mut self) {
        info!(
            producers = self.producers.len(),
            consumers = self.consumers.len(),
            "shutting down sessions"
        );
        let producers = join_all(self.producers.values_mut().map(|p| p.stop()));
        let consumers = join_all(self.consumers.values_mut().map(|c| c.stop()));
        futures::join!(producers, consumers);

        for (id, _) in self.producers.drain(..) {
            let _ = self.events.send(RegistryEvent::ProducerRemoved { id });
        }
        for (id, _) in self.consumers.drain(..) {
            let _ = self.events.send(RegistryEvent::ConsumerRemoved { id });
        }
        for tracker in self.router.drain() {
            tracker.dispose();
            let _ = self.events.send(RegistryEvent::TrackerRemoved {
                key: tracker.key().to_string(),
            });
        }
        for group in self.groups.values_mut() {
            group.clear_members();
        }
        self.groups.retain(|_, g| !g.is_automatic());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::session::SessionState;
    use std::time::Duration;
    use tokio::time;

    fn registry(broker: &MemoryBroker) -> SessionRegistry {
        SessionRegistry::new(HarnessConfig::default(), Arc::new(broker.clone()))
    }

    fn grouped(group: &str) -> ConsumerMode {
        ConsumerMode::Grouped { group: group.into() }
    }

    fn producer(topic: &str, min: f64, max: f64) -> NewProducer {
        NewProducer {
            topic: topic.into(),
            interval_min_secs: min,
            interval_max_secs: max,
            template: None,
        }
    }

    #[test]
    fn test_duplicate_group_rejected_without_mutation() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        registry.add_group("G1", "t1").unwrap();

        let err = registry.add_group("G1", "t2, t3").unwrap_err();
        assert_eq!(err, RegistryError::DuplicateGroup("G1".into()));
        assert_eq!(err.to_string(), "Consumer group ID existed");
        assert_eq!(registry.group("G1").unwrap().topics(), ["t1"]);
    }

    #[test]
    fn test_group_validation() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        assert_eq!(registry.add_group("G1", " , ").unwrap_err(), RegistryError::EmptyTopics);
        assert_eq!(registry.add_group("  ", "t1").unwrap_err(), RegistryError::EmptyGroupId);
        assert_eq!(
            registry.remove_group("nope").unwrap_err(),
            RegistryError::UnknownGroup("nope".into())
        );
        assert_eq!(registry.groups().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_validation() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        assert_eq!(
            registry.add_consumer(grouped("")).await.unwrap_err().to_string(),
            "Must choose a consumer group"
        );
        assert_eq!(
            registry.add_consumer(grouped("G9")).await.unwrap_err(),
            RegistryError::UnknownGroup("G9".into())
        );
        assert_eq!(
            registry
                .add_consumer(ConsumerMode::Independent { topics: ",".into() })
                .await
                .unwrap_err()
                .to_string(),
            "Must choose at least one topic"
        );
        assert_eq!(registry.consumers().count(), 0);
        assert!(registry.tracker_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_with_members_cannot_be_removed() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        registry.add_group("G1", "t1").unwrap();
        let consumer = registry.add_consumer(grouped("G1")).await.unwrap();

        let err = registry.remove_group("G1").unwrap_err();
        assert_eq!(err.to_string(), "Cannot delete consumer group: 1 consumer(s) alive");
        assert_eq!(registry.group("G1").unwrap().member_count(), 1);
        assert_eq!(registry.consumer(consumer).unwrap().state(), SessionState::Running);

        registry.remove_consumer(consumer).await.unwrap();
        assert_eq!(registry.group("G1").unwrap().member_count(), 0);
        registry.remove_group("G1").unwrap();
        assert!(registry.group("G1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trackers_follow_group_topics() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        registry.add_group("G1", "t1, t2").unwrap();
        assert!(registry.tracker_keys().is_empty());

        let consumer = registry.add_consumer(grouped("G1")).await.unwrap();
        assert_eq!(registry.tracker_keys(), vec!["G1|t1", "G1|t2"]);

        registry.remove_consumer(consumer).await.unwrap();
        assert!(registry.tracker_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trackers_kept_while_another_member_covers_topic() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        registry.add_group("G1", "t1").unwrap();
        let first = registry.add_consumer(grouped("G1")).await.unwrap();
        let second = registry.add_consumer(grouped("G1")).await.unwrap();
        let tracker = registry.tracker("G1|t1").unwrap();

        registry.remove_consumer(first).await.unwrap();
        assert!(registry.tracker("G1|t1").is_some());
        assert!(!tracker.is_disposed());

        registry.remove_consumer(second).await.unwrap();
        assert!(registry.tracker("G1|t1").is_none());
        assert!(tracker.is_disposed());
        assert!(!registry.message_processed("G1", "t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_consumer_gets_auto_group() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        registry.add_group("Auto-1", "other").unwrap();

        let id = registry
            .add_consumer(ConsumerMode::Independent { topics: "t1".into() })
            .await
            .unwrap();
        assert_eq!(id, 2);
        let group = registry.group("Auto-2").unwrap();
        assert!(group.is_automatic());
        assert_eq!(group.member_count(), 1);
        assert!(registry.tracker("Auto-2|t1").is_some());

        registry.remove_consumer(id).await.unwrap();
        assert!(registry.group("Auto-2").is_none());
        assert!(registry.group("Auto-1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_lifecycle_and_validation() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        assert_eq!(
            registry.add_producer(producer("  ", 1.0, 2.0)).await.unwrap_err(),
            RegistryError::EmptyProducerTopic
        );
        assert!(matches!(
            registry.add_producer(producer("orders", 3.0, 1.0)).await,
            Err(RegistryError::InvalidInterval { .. })
        ));

        let id = registry.add_producer(producer("orders", 1.0, 1.0)).await.unwrap();
        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(registry.producer(id).unwrap().sent(), 2);
        assert_eq!(
            registry.producer_logs().tail(Some("Producer-orders:1"), 10).len(),
            3
        );

        registry.remove_producer(id).await.unwrap();
        assert!(registry.producer(id).is_none());
        assert_eq!(
            registry.remove_producer(id).await.unwrap_err(),
            RegistryError::UnknownProducer(id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_progress() {
        let broker = MemoryBroker::new(2);
        let mut registry = registry(&broker);
        registry.add_producer(producer("orders", 1.0, 1.0)).await.unwrap();
        registry.add_group("G1", "orders").unwrap();
        registry.add_consumer(grouped("G1")).await.unwrap();

        time::sleep(Duration::from_secs(10)).await;
        let tracker = registry.tracker("G1|orders").unwrap();
        assert!(tracker.total() >= 8);
        assert!(tracker.processed() >= 5);
        assert!(tracker.ratio() <= 1.0);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.producers.len(), 1);
        assert_eq!(snapshot.consumers.len(), 1);
        assert_eq!(snapshot.trackers[0].key, "G1|orders");
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_members_split_the_work() {
        let broker = MemoryBroker::new(1);
        broker.create_topic("t1", 1);
        for v in ["a", "b", "c", "d"] {
            broker.append("t1", 0, v).unwrap();
        }
        let mut registry = registry(&broker);
        registry.add_group("G1", "t1").unwrap();
        let first = registry.add_consumer(grouped("G1")).await.unwrap();
        let second = registry.add_consumer(grouped("G1")).await.unwrap();

        time::sleep(Duration::from_secs(10)).await;
        let a = registry.consumer(first).unwrap().processed();
        let b = registry.consumer(second).unwrap().processed();
        assert_eq!(a + b, 4, "a = {}, b = {}", a, b);

        let tracker = registry.tracker("G1|t1").unwrap();
        assert_eq!(tracker.total(), 4);
        assert_eq!(tracker.processed(), 4);
        assert_eq!(tracker.ratio(), 1.0);
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_members_each_take_partitions() {
        let broker = MemoryBroker::new(1);
        broker.create_topic("t1", 2);
        for partition in [0, 0, 1, 1] {
            broker.append("t1", partition, "v").unwrap();
        }
        let mut registry = registry(&broker);
        registry.add_group("G1", "t1").unwrap();
        let first = registry.add_consumer(grouped("G1")).await.unwrap();
        let second = registry.add_consumer(grouped("G1")).await.unwrap();

        time::sleep(Duration::from_secs(10)).await;
        let a = registry.consumer(first).unwrap().processed();
        let b = registry.consumer(second).unwrap().processed();
        assert!(a >= 1 && b >= 1, "a = {}, b = {}", a, b);
        assert_eq!(a + b, 4);
        assert_eq!(broker.committed_offset("G1", "t1", 0), Some(2));
        assert_eq!(broker.committed_offset("G1", "t1", 1), Some(2));
        assert_eq!(registry.tracker("G1|t1").unwrap().ratio(), 1.0);
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_broadcast() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        let mut events = registry.subscribe();

        registry.add_group("G1", "t1").unwrap();
        registry.add_consumer(grouped("G1")).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), RegistryEvent::GroupAdded { id: "G1".into() });
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::GroupUpdated { id: "G1".into(), members: 1 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::TrackerAdded { key: "G1|t1".into() }
        );
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let broker = MemoryBroker::new(1);
        let mut registry = registry(&broker);
        registry.add_producer(producer("orders", 1.0, 2.0)).await.unwrap();
        registry.add_group("G1", "orders").unwrap();
        registry.add_consumer(grouped("G1")).await.unwrap();
        registry
            .add_consumer(ConsumerMode::Independent { topics: "orders".into() })
            .await
            .unwrap();
        let tracker = registry.tracker("G1|orders").unwrap();

        registry.shutdown().await;
        assert_eq!(broker.closed_connections(), 3);
        assert!(tracker.is_disposed());
        assert_eq!(registry.producers().count(), 0);
        assert_eq!(registry.consumers().count(), 0);
        assert!(registry.tracker_keys().is_empty());
        assert_eq!(registry.group("G1").unwrap().member_count(), 0);
        assert_eq!(registry.groups().count(), 1);
    }
}
