//! Consumer sessions
//!
//! A [`ConsumerSession`] owns one inbound connection subscribed to a set of
//! topics on behalf of a consumer group. Its poll loop handles one record at a
//! time: log, process, commit, then report the message to the progress router.

use anyhow::anyhow;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerConnector, ConsumedRecord, ConsumerConnection, PollError};
use crate::config::{ConsumerConfig, ConsumerSettings};
use crate::group::TopicList;
use crate::log_sink::SessionLogger;
use crate::session::{SessionState, StateCell};
use crate::tracker::ProgressRouter;

/// Simulated unit of business work with a randomized latency in `[min, max)`
#[derive(Debug, Clone, Copy)]
pub struct ProcessingStep {
    min: Duration,
    max: Duration,
}

impl ProcessingStep {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn latency(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..self.max)
    }

    /// Processes one record; returns false when cancelled before completion
    pub async fn run(&self, _record: &ConsumedRecord, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = time::sleep(self.latency()) => true,
        }
    }
}

impl From<&ConsumerSettings> for ProcessingStep {
    fn from(settings: &ConsumerSettings) -> Self {
        Self::new(settings.processing_min, settings.processing_max)
    }
}

/// One consumer and its background poll loop
pub struct ConsumerSession {
    id: u64,
    group: String,
    topics: TopicList,
    config: ConsumerConfig,
    settings: ConsumerSettings,
    router: ProgressRouter,
    logger: SessionLogger,
    state: StateCell,
    processed: Arc<AtomicU64>,
    cancel: CancellationToken,
    connection: Option<Arc<dyn ConsumerConnection>>,
    task: Option<JoinHandle<()>>,
}

impl ConsumerSession {
    pub fn new(
        id: u64,
        topics: TopicList,
        config: ConsumerConfig,
        settings: ConsumerSettings,
        router: ProgressRouter,
        logger: SessionLogger,
    ) -> Self {
        Self {
            id,
            group: config.group_id.clone(),
            topics,
            config,
            settings,
            router,
            logger,
            state: StateCell::new(),
            processed: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            connection: None,
            task: None,
        }
    }

    /// Source id used in this session's log entries
    pub fn source_id(group: &str, topics: &[String], id: u64) -> String {
        format!("Consumer-{}[{}]:{}", group, topics.join(","), id)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topics(&self) -> &[String] {
        self.topics.topics()
    }

    pub fn covers(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// Replaces the topic string; only possible before the session starts
    pub fn set_topics(&mut self, source: &str) -> bool {
        if self.state.get() != SessionState::Configured {
            return false;
        }
        self.topics.set_source(source);
        true
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Messages processed and committed by this session
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Connects, subscribes and spawns the poll loop
    ///
    /// Connection or subscription failures are logged and leave the session inert.
    pub async fn start(&mut self, connector: &dyn BrokerConnector) {
        if self.state.get() != SessionState::Configured {
            self.logger.warn(format!("Consumer already {}", self.state.get()));
            return;
        }

        let connection: Arc<dyn ConsumerConnection> = match connector.connect_consumer(&self.config).await {
            Ok(connection) => Arc::from(connection),
            Err(e) => {
                self.logger.error_with("Failed to initialize Kafka Consumer", &e);
                self.state.set(SessionState::Inert);
                return;
            }
        };

        if let Err(e) = connection.subscribe(self.topics.topics()).await {
            self.logger.error_with("Failed to initialize Kafka Consumer", &e);
            if let Err(e) = connection.close().await {
                self.logger.error_with("Error occurs when stopping Consumer", &e);
            }
            self.state.set(SessionState::Inert);
            return;
        }

        let poll_loop = PollLoop {
            group: self.group.clone(),
            connection: connection.clone(),
            poll_timeout: self.settings.poll_timeout,
            step: ProcessingStep::from(&self.settings),
            router: self.router.clone(),
            logger: self.logger.clone(),
            state: self.state.clone(),
            processed: self.processed.clone(),
            cancel: self.cancel.clone(),
        };
        self.connection = Some(connection);
        self.state.set(SessionState::Running);
        self.task = Some(tokio::spawn(poll_loop.run()));

        self.logger.info(format!(
            "Consumer started: Topics={}, GroupId={}",
            self.topics.source(),
            self.group
        ));
    }

    /// Cancels the poll loop, waits up to the grace period, then closes the connection
    ///
    /// The connection is closed even when the loop did not exit in time.
    pub async fn stop(&mut self) {
        let from = self.state.get();
        match from {
            SessionState::Stopped | SessionState::Stopping => return,
            SessionState::Configured => {
                self.state.set(SessionState::Stopped);
                return;
            }
            SessionState::Running | SessionState::Inert => {}
        }

        self.state.set(SessionState::Stopping);
        self.cancel.cancel();
        self.logger.warn("Stopping consumer.");

        if let Some(mut task) = self.task.take() {
            match time::timeout(self.settings.stop_grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self
                    .logger
                    .error_with("Error occurs when waiting Consumer to complete task", &anyhow!(e)),
                Err(_) => {
                    self.logger.warn(format!(
                        "Consumer did not finish within {:?}, closing anyway",
                        self.settings.stop_grace
                    ));
                    task.abort();
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                self.logger.error_with("Error occurs when stopping Consumer", &e);
            }
        }

        self.state.set(SessionState::Stopped);
        self.logger.info(format!(
            "Consumer stopped: Topics={}, GroupId={}",
            self.topics.source(),
            self.group
        ));
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            id: self.id,
            source: self.logger.source().to_string(),
            group: self.group.clone(),
            topics: self.topics().to_vec(),
            state: self.state.get(),
            processed: self.processed(),
        }
    }
}

impl Drop for ConsumerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSnapshot {
    pub id: u64,
    pub source: String,
    pub group: String,
    pub topics: Vec<String>,
    pub state: SessionState,
    pub processed: u64,
}

struct PollLoop {
    group: String,
    connection: Arc<dyn ConsumerConnection>,
    poll_timeout: Duration,
    step: ProcessingStep,
    router: ProgressRouter,
    logger: SessionLogger,
    state: StateCell,
    processed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        while !self.cancel.is_cancelled() {
            let record = match self.connection.poll(self.poll_timeout).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e @ PollError::Transient(_)) => {
                    self.logger
                        .error(format!("Error occurs when consuming message: {}", e));
                    // Failed polls can return at once; wait out one poll period before retrying
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = time::sleep(self.poll_timeout) => continue,
                    }
                }
                Err(PollError::Fatal(e)) => {
                    self.fail("Unexpected error occurs when consuming message", &e);
                    return;
                }
            };

            self.logger.info(format!(
                "Consuming message: Topic={}, Partition={}, Offset={}, Message={}",
                record.topic,
                record.partition,
                record.offset,
                record.value_str()
            ));

            if !self.step.run(&record, &self.cancel).await {
                self.logger.warn(format!(
                    "Processing cancelled, offset {} of {}[{}] left uncommitted",
                    record.offset, record.topic, record.partition
                ));
                break;
            }

            if let Err(e) = self.connection.commit(&record).await {
                self.fail("Unexpected error occurs when committing offset", &e);
                return;
            }

            self.processed.fetch_add(1, Ordering::SeqCst);
            self.router.message_processed(&self.group, &record.topic);
        }
    }

    /// Ends the loop for good; the session stays inert until stopped
    fn fail(&self, message: &str, err: &anyhow::Error) {
        self.logger.error_with(message, err);
        self.state.transition(SessionState::Running, SessionState::Inert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::PollFault;
    use crate::broker::MemoryBroker;
    use crate::config::{HarnessConfig, TrackerSettings};
    use crate::log_sink::LogBuffer;
    use crate::tracker::TopicProgressTracker;
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    fn session(group: &str, topics: &str, router: &ProgressRouter, logs: &LogBuffer) -> ConsumerSession {
        let harness = HarnessConfig::default();
        let topics = TopicList::new(topics);
        let source = ConsumerSession::source_id(group, topics.topics(), 7);
        ConsumerSession::new(
            7,
            topics,
            harness.consumer_config("c-7".into(), group.into()),
            harness.consumer,
            router.clone(),
            SessionLogger::new(source, Arc::new(logs.clone())),
        )
    }

    fn seeded_broker(values: &[&str]) -> MemoryBroker {
        let broker = MemoryBroker::new(1);
        broker.create_topic("t1", 1);
        for v in values {
            broker.append("t1", 0, v.to_string()).unwrap();
        }
        broker
    }

    #[test]
    fn test_processing_latency_bounds() {
        let step = ProcessingStep::new(Duration::from_millis(500), Duration::from_millis(1000));
        for _ in 0..500 {
            let latency = step.latency();
            assert!(latency >= Duration::from_millis(500));
            assert!(latency < Duration::from_millis(1000));
        }

        let min = Duration::from_micros(500_400);
        let max = Duration::from_micros(501_600);
        let narrow = ProcessingStep::new(min, max);
        for _ in 0..500 {
            let latency = narrow.latency();
            assert!(latency >= min && latency < max, "latency = {:?}", latency);
        }
    }

    #[test]
    fn test_source_id() {
        let topics = vec!["t1".to_string(), "t2".to_string()];
        assert_eq!(ConsumerSession::source_id("G1", &topics, 4), "Consumer-G1[t1,t2]:4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_processes_then_commits_each_record() {
        let broker = seeded_broker(&["a", "b"]);
        let router = ProgressRouter::new();
        let logs = LogBuffer::with_capacity(100);
        let mut consumer = session("G1", "t1", &router, &logs);

        consumer.start(&broker).await;
        assert_eq!(consumer.state(), SessionState::Running);
        time::sleep(Duration::from_secs(3)).await;

        assert_eq!(consumer.processed(), 2);
        assert_eq!(broker.committed_offset("G1", "t1", 0), Some(2));
        let offsets: Vec<_> = broker.commits().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 1]);
        assert_eq!(logs.count_matching("Consuming message: Topic=t1"), 2);

        consumer.stop().await;
        assert_eq!(consumer.state(), SessionState::Stopped);
        assert_eq!(broker.closed_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_processing_skips_commit() {
        let broker = seeded_broker(&["a"]);
        let router = ProgressRouter::new();
        let logs = LogBuffer::with_capacity(100);
        let mut consumer = session("G1", "t1", &router, &logs);

        consumer.start(&broker).await;
        // Processing takes at least 500ms; stop while it is underway
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(logs.count_matching("Consuming message"), 1);

        consumer.stop().await;
        assert!(broker.commits().is_empty());
        assert_eq!(broker.committed_offset("G1", "t1", 0), None);
        assert_eq!(consumer.processed(), 0);
        assert_eq!(logs.count_matching("left uncommitted"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_blocked_poll_closes_after_grace() {
        let broker = MemoryBroker::new(1);
        broker.set_stall_polls(true);
        let router = ProgressRouter::new();
        let logs = LogBuffer::with_capacity(100);
        let mut consumer = session("G1", "t1", &router, &logs);

        consumer.start(&broker).await;
        time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        consumer.stop().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5), "elapsed = {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "elapsed = {:?}", elapsed);
        assert_eq!(broker.closed_connections(), 1);
        assert_eq!(consumer.state(), SessionState::Stopped);
        assert_eq!(logs.count_matching("closing anyway"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_messages_reach_tracker() {
        let broker = seeded_broker(&["a", "b", "c"]);
        let router = ProgressRouter::new();
        let (events, _) = broadcast::channel(16);
        router.insert(TopicProgressTracker::spawn(
            "G1",
            "t1",
            Arc::new(broker.clone()),
            TrackerSettings::default(),
            events,
        ));
        let logs = LogBuffer::with_capacity(100);
        let mut consumer = session("G1", "t1", &router, &logs);

        consumer.start(&broker).await;
        time::sleep(Duration::from_secs(5)).await;

        let tracker = router.get("G1|t1").unwrap();
        assert_eq!(tracker.total(), 3);
        assert_eq!(tracker.processed(), 3);
        assert_eq!(tracker.ratio(), 1.0);

        consumer.stop().await;
        tracker.dispose();
    }

    #[tokio::test]
    async fn test_connection_failure_leaves_session_inert() {
        let broker = MemoryBroker::new(1);
        broker.set_refuse_connections(true);
        let router = ProgressRouter::new();
        let logs = LogBuffer::with_capacity(10);
        let mut consumer = session("G1", "t1", &router, &logs);

        consumer.start(&broker).await;
        assert_eq!(consumer.state(), SessionState::Inert);
        assert_eq!(logs.count_matching("Failed to initialize Kafka Consumer"), 1);

        consumer.stop().await;
        assert_eq!(consumer.state(), SessionState::Stopped);
    }

    #[test]
    fn test_topics_fixed_after_start() {
        let router = ProgressRouter::new();
        let logs = LogBuffer::with_capacity(10);
        let mut consumer = session("G1", "t1", &router, &logs);
        assert!(consumer.set_topics("t2, t3"));
        assert_eq!(consumer.topics(), ["t2", "t3"]);
        assert!(consumer.covers("t3"));
        consumer.state.set(SessionState::Running);
        assert!(!consumer.set_topics("t4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_errors_back_off_and_recover() {
        let broker = seeded_broker(&["a"]);
        broker.set_fail_polls(Some(PollFault::Transient));
        let router = ProgressRouter::new();
        let logs = LogBuffer::with_capacity(1000);
        let mut consumer = session("G1", "t1", &router, &logs);

        consumer.start(&broker).await;
        time::sleep(Duration::from_millis(1050)).await;
        let errors = logs.count_matching("Error occurs when consuming message");
        assert!((5..=12).contains(&errors), "errors = {}", errors);
        assert_eq!(consumer.state(), SessionState::Running);

        broker.set_fail_polls(None);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(consumer.processed(), 1);
        assert_eq!(broker.committed_offset("G1", "t1", 0), Some(1));

        consumer.stop().await;
        assert_eq!(consumer.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_poll_error_leaves_session_inert() {
        let broker = seeded_broker(&["a"]);
        broker.set_fail_polls(Some(PollFault::Fatal));
        let router = ProgressRouter::new();
        let logs = LogBuffer::with_capacity(100);
        let mut consumer = session("G1", "t1", &router, &logs);

        consumer.start(&broker).await;
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(consumer.state(), SessionState::Inert);
        assert_eq!(logs.count_matching("Unexpected error occurs when consuming message"), 1);

        // The loop has exited, so clearing the fault changes nothing
        broker.set_fail_polls(None);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(consumer.processed(), 0);

        let started = Instant::now();
        consumer.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(consumer.state(), SessionState::Stopped);
        assert_eq!(broker.closed_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_failure_stops_loop_without_progress() {
        let broker = seeded_broker(&["a", "b"]);
        broker.set_fail_commits(true);
        let router = ProgressRouter::new();
        let (events, _) = broadcast::channel(16);
        router.insert(TopicProgressTracker::spawn(
            "G1",
            "t1",
            Arc::new(broker.clone()),
            TrackerSettings::default(),
            events,
        ));
        let logs = LogBuffer::with_capacity(100);
        let mut consumer = session("G1", "t1", &router, &logs);

        consumer.start(&broker).await;
        time::sleep(Duration::from_secs(3)).await;

        assert_eq!(consumer.state(), SessionState::Inert);
        assert_eq!(consumer.processed(), 0);
        assert_eq!(logs.count_matching("Consuming message"), 1);
        assert_eq!(logs.count_matching("Unexpected error occurs when committing offset"), 1);
        let tracker = router.get("G1|t1").unwrap();
        assert_eq!(tracker.processed(), 0);
        assert_eq!(tracker.pending(), 0);
        assert_eq!(tracker.total(), 2);

        consumer.stop().await;
        tracker.dispose();
    }
}

