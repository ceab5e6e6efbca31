//! In-process broker for demo mode and tests
//!
//! Topics are auto-created on first produce. Consumers that subscribe under the
//! same group share its partitions: partition `p` belongs to the member at index
//! `p % members` in join order. A partition changes hands only once the record
//! its previous owner is processing has been committed or released, and the new
//! owner resumes from the group's committed offset. Fault switches let tests
//! refuse connections, fail sends, polls, commits or metadata queries, and stall
//! polls.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use super::{
    BrokerConnector, ConsumedRecord, ConsumerConnection, DeliveryReport, DeliveryStatus,
    MetadataClient, PollError, ProducerConnection, Watermarks,
};
use crate::config::{ConsumerConfig, OffsetReset, ProducerConfig};

/// A commit observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    /// Offset of the record whose processing was committed
    pub offset: i64,
}

/// Failure injected into every consumer poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFault {
    Transient,
    Fatal,
}

type PartitionKey = (String, String, i32);

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<Bytes>>>,
    /// Next offset to read per (group, topic, partition)
    committed: HashMap<PartitionKey, i64>,
    commits: Vec<CommitRecord>,
    /// Live consumer members per group, in join order
    members: HashMap<String, Vec<u64>>,
    /// Uncommitted record handed to a member, per (group, topic, partition)
    in_flight: HashMap<PartitionKey, (u64, i64)>,
    next_member: u64,
    opened: usize,
    closed: usize,
}

impl BrokerState {
    fn owner(&self, group: &str, partition: i32) -> Option<u64> {
        let members = self.members.get(group).filter(|m| !m.is_empty())?;
        members.get(partition as usize % members.len()).copied()
    }

    /// True when `member` owns the partition and no other member still holds a record from it
    fn may_read(&self, group: &str, topic: &str, partition: i32, member: u64) -> bool {
        if self.owner(group, partition) != Some(member) {
            return false;
        }
        let key = (group.to_string(), topic.to_string(), partition);
        !self
            .in_flight
            .get(&key)
            .is_some_and(|(holder, _)| *holder != member)
    }

    fn start_offset(&self, group: &str, topic: &str, partition: i32, log_end: i64, reset: OffsetReset) -> i64 {
        let key = (group.to_string(), topic.to_string(), partition);
        match self.committed.get(&key) {
            Some(offset) => *offset,
            None => match reset {
                OffsetReset::Earliest => 0,
                OffsetReset::Latest => log_end,
            },
        }
    }

    fn join(&mut self, group: &str, member: u64) -> bool {
        let members = self.members.entry(group.to_string()).or_default();
        if members.contains(&member) {
            return false;
        }
        members.push(member);
        true
    }

    fn leave(&mut self, group: &str, member: u64) {
        if let Some(members) = self.members.get_mut(group) {
            members.retain(|m| *m != member);
            if members.is_empty() {
                self.members.remove(group);
            }
        }
        self.in_flight.retain(|_, (holder, _)| *holder != member);
    }
}

#[derive(Default)]
struct Faults {
    refuse_connections: AtomicBool,
    fail_sends: AtomicBool,
    fail_metadata: AtomicBool,
    fail_commits: AtomicBool,
    fail_polls: Mutex<Option<PollFault>>,
    stall_polls: AtomicBool,
}

struct Inner {
    state: Mutex<BrokerState>,
    /// Woken on new records and on group membership or ownership changes
    arrivals: Notify,
    faults: Faults,
    default_partitions: AtomicUsize,
}

/// Shared handle to an in-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryBroker {
    /// Creates a broker that auto-creates topics with `default_partitions` partitions
    pub fn new(default_partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                arrivals: Notify::new(),
                faults: Faults::default(),
                default_partitions: AtomicUsize::new(default_partitions.max(1)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_consumers(&self) {
        self.inner.arrivals.notify_waiters();
    }

    /// Creates `topic` with `partitions` partitions if it does not exist yet
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.lock()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    /// Appends a record directly, bypassing any producer; returns its offset
    pub fn append(&self, topic: &str, partition: i32, value: impl Into<Bytes>) -> Result<i64> {
        let offset = {
            let mut state = self.lock();
            let log = state
                .topics
                .get_mut(topic)
                .and_then(|partitions| partitions.get_mut(partition as usize))
                .ok_or_else(|| anyhow!("unknown partition {}[{}]", topic, partition))?;
            log.push(value.into());
            log.len() as i64 - 1
        };
        self.wake_consumers();
        Ok(offset)
    }

    /// Sum of high watermarks across the topic's partitions
    pub fn topic_size(&self, topic: &str) -> i64 {
        self.lock()
            .topics
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(|p| p.len() as i64).sum())
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.lock().commits.clone()
    }

    /// Number of live consumers subscribed under `group`
    pub fn group_members(&self, group: &str) -> usize {
        self.lock().members.get(group).map_or(0, Vec::len)
    }

    pub fn opened_connections(&self) -> usize {
        self.lock().opened
    }

    pub fn closed_connections(&self) -> usize {
        self.lock().closed
    }

    pub fn set_refuse_connections(&self, on: bool) {
        self.inner.faults.refuse_connections.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, on: bool) {
        self.inner.faults.fail_sends.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_metadata(&self, on: bool) {
        self.inner.faults.fail_metadata.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_commits(&self, on: bool) {
        self.inner.faults.fail_commits.store(on, Ordering::SeqCst);
    }

    /// Makes every poll fail with `fault` until cleared with `None`
    pub fn set_fail_polls(&self, fault: Option<PollFault>) {
        *self
            .inner
            .faults
            .fail_polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = fault;
    }

    fn poll_fault(&self) -> Option<PollFault> {
        *self
            .inner
            .faults
            .fail_polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// When on, every poll blocks indefinitely
    pub fn set_stall_polls(&self, on: bool) {
        self.inner.faults.stall_polls.store(on, Ordering::SeqCst);
    }

    fn open_connection(&self) -> Result<()> {
        if self.inner.faults.refuse_connections.load(Ordering::SeqCst) {
            bail!("connection refused by broker");
        }
        self.lock().opened += 1;
        Ok(())
    }

    fn close_connection(&self) {
        self.lock().closed += 1;
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect_producer(&self, _config: &ProducerConfig) -> Result<Box<dyn ProducerConnection>> {
        self.open_connection()?;
        Ok(Box::new(MemoryProducer {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn connect_consumer(&self, config: &ConsumerConfig) -> Result<Box<dyn ConsumerConnection>> {
        self.open_connection()?;
        let member = {
            let mut state = self.lock();
            state.next_member += 1;
            state.next_member
        };
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            member,
            group: config.group_id.clone(),
            offset_reset: config.offset_reset,
            closed: AtomicBool::new(false),
            subscription: Mutex::new(Subscription::default()),
        }))
    }

    async fn connect_metadata(&self, _client_id: &str) -> Result<Box<dyn MetadataClient>> {
        self.open_connection()?;
        Ok(Box::new(MemoryMetadata {
            broker: self.clone(),
        }))
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerConnection for MemoryProducer {
    async fn send(&self, topic: &str, message: Bytes) -> Result<DeliveryReport> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("producer connection is closed");
        }
        if self.broker.inner.faults.fail_sends.load(Ordering::SeqCst) {
            bail!("broker rejected message to '{}'", topic);
        }

        let partition_count = self.broker.inner.default_partitions.load(Ordering::SeqCst);
        let report = {
            let mut state = self.broker.lock();
            let partitions = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); partition_count]);
            let partition = rand::thread_rng().gen_range(0..partitions.len());
            partitions[partition].push(message);
            DeliveryReport {
                partition: partition as i32,
                offset: partitions[partition].len() as i64 - 1,
                status: DeliveryStatus::Persisted,
            }
        };
        self.broker.wake_consumers();
        Ok(report)
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.close_connection();
        }
        Ok(())
    }
}

#[derive(Default)]
struct Subscription {
    topics: Vec<String>,
    positions: HashMap<(String, i32), i64>,
}

struct MemoryConsumer {
    broker: MemoryBroker,
    member: u64,
    group: String,
    offset_reset: OffsetReset,
    closed: AtomicBool,
    subscription: Mutex<Subscription>,
}

impl MemoryConsumer {
    fn take_next(&self) -> Option<ConsumedRecord> {
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut guard = self.broker.lock();
        let state = &mut *guard;
        let Subscription { topics, positions } = &mut *subscription;

        let mut next = None;
        'topics: for topic in topics.iter() {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (index, log) in partitions.iter().enumerate() {
                let partition = index as i32;
                let key = (topic.clone(), partition);
                if !state.may_read(&self.group, topic, partition, self.member) {
                    // Re-seeded from the committed offset if it comes back
                    positions.remove(&key);
                    continue;
                }
                let position = positions.entry(key).or_insert_with(|| {
                    state.start_offset(&self.group, topic, partition, log.len() as i64, self.offset_reset)
                });
                if let Some(value) = log.get(*position as usize) {
                    next = Some(ConsumedRecord {
                        topic: topic.clone(),
                        partition,
                        offset: *position,
                        value: Some(value.clone()),
                    });
                    *position += 1;
                    break 'topics;
                }
            }
        }

        let record = next?;
        state.in_flight.insert(
            (self.group.clone(), record.topic.clone(), record.partition),
            (self.member, record.offset),
        );
        Some(record)
    }
}

#[async_trait]
impl ConsumerConnection for MemoryConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        {
            let mut subscription = self
                .subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscription.topics = topics.to_vec();
            subscription.positions.retain(|(topic, _), _| topics.contains(topic));
        }
        if self.broker.lock().join(&self.group, self.member) {
            self.broker.wake_consumers();
        }
        Ok(())
    }

    async fn poll(&self, wait: Duration) -> std::result::Result<Option<ConsumedRecord>, PollError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PollError::Fatal(anyhow!("consumer connection is closed")));
        }
        match self.broker.poll_fault() {
            Some(PollFault::Transient) => {
                return Err(PollError::Transient(anyhow!("broker not reachable")));
            }
            Some(PollFault::Fatal) => {
                return Err(PollError::Fatal(anyhow!("consumer fenced by broker")));
            }
            None => {}
        }
        if self.broker.inner.faults.stall_polls.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so an append in between is not missed
            let arrival = self.broker.inner.arrivals.notified();
            if let Some(record) = self.take_next() {
                return Ok(Some(record));
            }
            if timeout_at(deadline, arrival).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&self, record: &ConsumedRecord) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("consumer connection is closed");
        }
        if self.broker.inner.faults.fail_commits.load(Ordering::SeqCst) {
            bail!(
                "commit of {}[{}]@{} rejected by broker",
                record.topic,
                record.partition,
                record.offset
            );
        }
        {
            let mut state = self.broker.lock();
            let key = (self.group.clone(), record.topic.clone(), record.partition);
            state.committed.insert(key.clone(), record.offset + 1);
            if state.in_flight.get(&key) == Some(&(self.member, record.offset)) {
                state.in_flight.remove(&key);
            }
            state.commits.push(CommitRecord {
                group: self.group.clone(),
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
            });
        }
        // A partition waiting on this record may now move to its new owner
        self.broker.wake_consumers();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.lock().leave(&self.group, self.member);
            self.broker.close_connection();
            self.broker.wake_consumers();
        }
        Ok(())
    }
}

struct MemoryMetadata {
    broker: MemoryBroker,
}

#[async_trait]
impl MetadataClient for MemoryMetadata {
    async fn topic_partitions(&self, topic: &str, _timeout: Duration) -> Result<Vec<i32>> {
        if self.broker.inner.faults.fail_metadata.load(Ordering::SeqCst) {
            bail!("metadata request for '{}' timed out", topic);
        }
        Ok(self
            .broker
            .lock()
            .topics
            .get(topic)
            .map(|partitions| (0..partitions.len() as i32).collect())
            .unwrap_or_default())
    }

    async fn watermarks(&self, topic: &str, partition: i32, _timeout: Duration) -> Result<Watermarks> {
        if self.broker.inner.faults.fail_metadata.load(Ordering::SeqCst) {
            bail!("watermark query for {}[{}] timed out", topic, partition);
        }
        let state = self.broker.lock();
        let log = state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .ok_or_else(|| anyhow!("unknown partition {}[{}]", topic, partition))?;
        Ok(Watermarks {
            low: 0,
            high: log.len() as i64,
        })
    }
}
