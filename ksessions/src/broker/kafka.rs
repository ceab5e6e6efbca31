//! Kafka-backed implementation of the broker capability seam
//!
//! Each connection owns its own [`KafkaCluster`], so one session's slow request never
//! blocks another session. Produce, fetch and watermark requests go to partition
//! leaders. Consumers join their group through the coordinator and read only the
//! partitions assigned to them, committing under the current generation.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use super::kafka_client::BrokerError;
use super::kafka_cluster::KafkaCluster;
use super::kafka_group::GroupMember;
use super::{
    BrokerConnector, ConsumedRecord, ConsumerConnection, DeliveryReport, DeliveryStatus,
    MetadataClient, PollError, ProducerConnection, Watermarks,
};
use crate::config::{Acks, ConsumerConfig, OffsetReset, ProducerConfig};

const OFFSET_OUT_OF_RANGE: i16 = 1;

/// Opens Kafka connections against a bootstrap list
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    bootstrap: Vec<String>,
    io_timeout: Duration,
}

impl KafkaConnector {
    pub fn new(bootstrap: Vec<String>, io_timeout: Duration) -> Self {
        Self {
            bootstrap,
            io_timeout,
        }
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    async fn connect_producer(&self, config: &ProducerConfig) -> Result<Box<dyn ProducerConnection>> {
        let cluster = KafkaCluster::connect(&config.bootstrap, &config.client_id, config.socket_timeout)
            .await
            .with_context(|| format!("producer {} could not connect", config.client_id))?;
        Ok(Box::new(KafkaProducer {
            cluster,
            config: config.clone(),
            partitions: Mutex::new(HashMap::new()),
        }))
    }

    async fn connect_consumer(&self, config: &ConsumerConfig) -> Result<Box<dyn ConsumerConnection>> {
        if config.enable_auto_commit || config.enable_auto_offset_store {
            bail!("consumer {} must use manual offset commits", config.client_id);
        }
        let cluster = KafkaCluster::connect(&config.bootstrap, &config.client_id, config.socket_timeout)
            .await
            .with_context(|| format!("consumer {} could not connect", config.client_id))?;
        Ok(Box::new(KafkaConsumer {
            cluster,
            group_id: config.group_id.clone(),
            offset_reset: config.offset_reset,
            closed: AtomicBool::new(false),
            state: Mutex::new(SubscriptionState::default()),
        }))
    }

    async fn connect_metadata(&self, client_id: &str) -> Result<Box<dyn MetadataClient>> {
        let cluster = KafkaCluster::connect(&self.bootstrap, client_id, self.io_timeout)
            .await
            .with_context(|| format!("metadata client {} could not connect", client_id))?;
        Ok(Box::new(KafkaMetadata { cluster }))
    }
}

/// Producer connection; partition metadata is cached for `metadata_max_age`
pub struct KafkaProducer {
    cluster: KafkaCluster,
    config: ProducerConfig,
    partitions: Mutex<HashMap<String, (Instant, Vec<i32>)>>,
}

impl KafkaProducer {
    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>> {
        let mut cache = self.partitions.lock().await;
        if let Some((fetched_at, partitions)) = cache.get(topic) {
            if fetched_at.elapsed() < self.config.metadata_max_age && !partitions.is_empty() {
                return Ok(partitions.clone());
            }
        }

        let partitions = self.cluster.partitions(topic).await?;
        cache.insert(topic.to_string(), (Instant::now(), partitions.clone()));
        Ok(partitions)
    }
}

#[async_trait]
impl ProducerConnection for KafkaProducer {
    async fn send(&self, topic: &str, message: Bytes) -> Result<DeliveryReport> {
        let delivery = async {
            let partitions = self.partitions_for(topic).await?;
            let partition = *partitions
                .choose(&mut thread_rng())
                .ok_or_else(|| anyhow!("topic '{}' has no available partitions yet", topic))?;

            let leader = self.cluster.leader(topic, partition).await?;
            let ack = match leader
                .produce(
                    topic,
                    partition,
                    message,
                    self.config.acks.wire_value(),
                    self.config.request_timeout,
                )
                .await
            {
                Ok(ack) => ack,
                Err(e) => {
                    // The next send looks the leader up again
                    self.cluster.invalidate(&e, Some((topic, partition)), None).await;
                    return Err(e);
                }
            };

            let status = match self.config.acks {
                Acks::All => DeliveryStatus::Persisted,
                Acks::Leader => DeliveryStatus::PossiblyPersisted,
            };
            Ok(DeliveryReport {
                partition: ack.partition,
                offset: ack.base_offset,
                status,
            })
        };

        timeout(self.config.message_timeout, delivery)
            .await
            .map_err(|_| {
                anyhow!(
                    "message to '{}' not delivered within {:?}",
                    topic,
                    self.config.message_timeout
                )
            })?
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        // Sends are request/response, so flushing means waiting for the one in flight
        self.cluster.drain(timeout).await
    }

    async fn close(&self) -> Result<()> {
        self.cluster.close().await
    }
}

#[derive(Default)]
struct SubscriptionState {
    member: Option<GroupMember>,
    /// Set when a new assignment still needs starting positions
    positions_pending: bool,
    /// Next offset to fetch per assigned (topic, partition)
    positions: BTreeMap<(String, i32), i64>,
    buffered: VecDeque<ConsumedRecord>,
}

impl SubscriptionState {
    /// Forgets positions and buffered records of the previous assignment
    fn reassigned(&mut self) {
        self.positions.clear();
        self.buffered.clear();
        self.positions_pending = true;
    }
}

/// Consumer connection that shares its topics' partitions with the rest of its group
pub struct KafkaConsumer {
    cluster: KafkaCluster,
    group_id: String,
    offset_reset: OffsetReset,
    closed: AtomicBool,
    state: Mutex<SubscriptionState>,
}

impl KafkaConsumer {
    /// Starts every assigned partition at the group's committed offset, or at the
    /// reset policy where nothing is committed
    async fn assign_positions(&self, state: &mut SubscriptionState) -> Result<()> {
        let assignment = state
            .member
            .as_ref()
            .and_then(|m| m.assignment())
            .cloned()
            .unwrap_or_default();

        for (topic, partitions) in assignment {
            if partitions.is_empty() {
                continue;
            }
            let coordinator = self.cluster.coordinator(&self.group_id).await?;
            let committed = match coordinator
                .committed_offsets(&self.group_id, &topic, &partitions)
                .await
            {
                Ok(committed) => committed,
                Err(e) => {
                    self.cluster.invalidate(&e, None, Some(&self.group_id)).await;
                    return Err(e);
                }
            };

            for partition in partitions {
                let position = match committed.get(&partition) {
                    Some(offset) if *offset >= 0 => *offset,
                    _ => self.reset_position(&topic, partition).await?,
                };
                debug!(
                    "Group '{}' starts {}[{}] at offset {}",
                    self.group_id, topic, partition, position
                );
                state.positions.insert((topic.clone(), partition), position);
            }
        }
        state.positions_pending = false;
        Ok(())
    }

    async fn reset_position(&self, topic: &str, partition: i32) -> Result<i64> {
        let leader = self.cluster.leader(topic, partition).await?;
        let result = leader
            .list_offset(topic, partition, self.offset_reset.list_offsets_timestamp())
            .await;
        if let Err(e) = &result {
            self.cluster.invalidate(e, Some((topic, partition)), None).await;
        }
        result
    }
}

#[async_trait]
impl ConsumerConnection for KafkaConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        // Joining waits for the whole group, so it happens from poll
        state.member = Some(GroupMember::new(&self.group_id, topics));
        state.reassigned();
        Ok(())
    }

    async fn poll(&self, wait: Duration) -> std::result::Result<Option<ConsumedRecord>, PollError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PollError::Fatal(anyhow!("consumer connection is closed")));
        }

        let mut state = self.state.lock().await;
        let reassigned = match state.member.as_mut() {
            Some(member) => member
                .maintain(&self.cluster)
                .await
                .map_err(PollError::Transient)?,
            None => false,
        };
        if reassigned {
            state.reassigned();
        }
        if state.positions_pending && state.member.as_ref().is_some_and(|m| m.assignment().is_some()) {
            state.positions.clear();
            self.assign_positions(&mut state)
                .await
                .map_err(PollError::Transient)?;
        }

        if let Some(record) = state.buffered.pop_front() {
            return Ok(Some(record));
        }
        if state.positions.is_empty() {
            drop(state);
            sleep(wait).await;
            return Ok(None);
        }

        let positions: Vec<(String, i32, i64)> = state
            .positions
            .iter()
            .map(|((topic, partition), offset)| (topic.clone(), *partition, *offset))
            .collect();
        let routed = self
            .cluster
            .by_leader(positions)
            .await
            .map_err(PollError::Transient)?;
        let responses = join_all(routed.iter().map(|(leader, positions)| leader.fetch(positions, wait))).await;

        let mut first_error = None;
        let mut fetched = Vec::new();
        for response in responses {
            match response {
                Ok(partitions) => fetched.extend(partitions),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        for partition_fetch in fetched {
            let key = (partition_fetch.topic.clone(), partition_fetch.partition);
            let Some(position) = state.positions.get(&key).copied() else {
                continue;
            };

            match partition_fetch.error_code {
                0 => {}
                OFFSET_OUT_OF_RANGE => {
                    let reset = self
                        .reset_position(&partition_fetch.topic, partition_fetch.partition)
                        .await
                        .map_err(PollError::Transient)?;
                    warn!(
                        "Offset {} out of range for {}[{}], resetting to {}",
                        position, partition_fetch.topic, partition_fetch.partition, reset
                    );
                    state.positions.insert(key, reset);
                    continue;
                }
                code => {
                    let err: anyhow::Error = BrokerError {
                        operation: format!(
                            "fetch from {}[{}]",
                            partition_fetch.topic, partition_fetch.partition
                        ),
                        code,
                    }
                    .into();
                    self.cluster
                        .invalidate(&err, Some((&partition_fetch.topic, partition_fetch.partition)), None)
                        .await;
                    first_error.get_or_insert(err);
                    continue;
                }
            }

            let mut next = position;
            for record in partition_fetch.records {
                // Batches may start before the requested offset
                if record.offset < position {
                    continue;
                }
                next = record.offset + 1;
                state.buffered.push_back(ConsumedRecord {
                    topic: partition_fetch.topic.clone(),
                    partition: partition_fetch.partition,
                    offset: record.offset,
                    value: record.value,
                });
            }
            state.positions.insert(key, next);
        }

        match state.buffered.pop_front() {
            Some(record) => Ok(Some(record)),
            None => match first_error {
                Some(err) => Err(PollError::Transient(err)),
                None => Ok(None),
            },
        }
    }

    async fn commit(&self, record: &ConsumedRecord) -> Result<()> {
        let (generation, member_id) = {
            let state = self.state.lock().await;
            match state.member.as_ref() {
                Some(member) => (member.generation(), member.member_id().to_string()),
                None => bail!("consumer of group '{}' is not subscribed", self.group_id),
            }
        };

        let coordinator = self.cluster.coordinator(&self.group_id).await?;
        let result = coordinator
            .commit_offset(
                &self.group_id,
                generation,
                &member_id,
                &record.topic,
                record.partition,
                record.offset + 1,
            )
            .await;
        if let Err(e) = &result {
            self.cluster.invalidate(e, None, Some(&self.group_id)).await;
        }
        result
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(member) = state.member.as_mut() {
            if let Err(e) = member.leave(&self.cluster).await {
                warn!("Could not leave group '{}': {:#}", self.group_id, e);
            }
        }
        drop(state);
        self.cluster.close().await
    }
}

/// Metadata client used by progress trackers
pub struct KafkaMetadata {
    cluster: KafkaCluster,
}

impl KafkaMetadata {
    async fn list_offset(&self, topic: &str, partition: i32, timestamp: i64) -> Result<i64> {
        let leader = self.cluster.leader(topic, partition).await?;
        let result = leader.list_offset(topic, partition, timestamp).await;
        if let Err(e) = &result {
            self.cluster.invalidate(e, Some((topic, partition)), None).await;
        }
        result
    }
}

#[async_trait]
impl MetadataClient for KafkaMetadata {
    async fn topic_partitions(&self, topic: &str, wait: Duration) -> Result<Vec<i32>> {
        timeout(wait, self.cluster.partitions(topic))
            .await
            .map_err(|_| anyhow!("metadata for '{}' not returned within {:?}", topic, wait))?
    }

    async fn watermarks(&self, topic: &str, partition: i32, wait: Duration) -> Result<Watermarks> {
        let query = async {
            let low = self.list_offset(topic, partition, -2).await?;
            let high = self.list_offset(topic, partition, -1).await?;
            Ok::<_, anyhow::Error>(Watermarks { low, high })
        };
        timeout(wait, query).await.map_err(|_| {
            anyhow!(
                "watermarks for {}[{}] not returned within {:?}",
                topic,
                partition,
                wait
            )
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, partition: i32, offset: i64) -> ConsumedRecord {
        ConsumedRecord {
            topic: topic.into(),
            partition,
            offset,
            value: None,
        }
    }

    #[test]
    fn test_reassignment_drops_previous_partitions() {
        let mut state = SubscriptionState::default();
        state.positions.insert(("a".into(), 0), 5);
        state.buffered.push_back(record("a", 0, 4));
        state.reassigned();
        assert!(state.positions.is_empty());
        assert!(state.buffered.is_empty());
        assert!(state.positions_pending);
    }

    #[tokio::test]
    async fn test_connect_fails_without_broker() {
        // Port 1 on loopback is never a Kafka broker
        let connector = KafkaConnector::new(vec!["127.0.0.1:1".into()], Duration::from_millis(200));
        let config = ProducerConfig::with_send_timeout(
            vec!["127.0.0.1:1".into()],
            "p-test".into(),
            Duration::from_millis(200),
        );
        assert!(connector.connect_producer(&config).await.is_err());
        assert!(connector.connect_metadata("m-test").await.is_err());
    }

    #[tokio::test]
    async fn test_consumer_requires_manual_commit() {
        let connector = KafkaConnector::new(vec!["127.0.0.1:1".into()], Duration::from_millis(200));
        let mut config = ConsumerConfig::manual_commit(
            vec!["127.0.0.1:1".into()],
            "c-test".into(),
            "G1".into(),
            OffsetReset::Earliest,
            Duration::from_millis(200),
        );
        config.enable_auto_commit = true;
        let err = connector.connect_consumer(&config).await.err().unwrap();
        assert!(err.to_string().contains("manual offset commits"));
    }
}
