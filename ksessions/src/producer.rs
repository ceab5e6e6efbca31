//! Producer sessions
//!
//! A [`ProducerSession`] owns one outbound connection and sends one message per
//! cycle to its topic. Each cycle waits a delay drawn from its [`SendSchedule`],
//! so at most one send is ever in flight per session.

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Local};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerConnector, DeliveryStatus, ProducerConnection};
use crate::config::ProducerConfig;
use crate::log_sink::SessionLogger;
use crate::session::{SessionState, StateCell};
use crate::utils::format_timestamp;

/// Placeholder replaced by the send time in a message template
pub const TIMESTAMP_TOKEN: &str = "{timestamp}";

/// Decides how long a producer waits before each send
pub trait SendSchedule: Send + Sync {
    fn next_delay(&self) -> Duration;
}

/// Delay drawn uniformly from `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformSchedule {
    min: Duration,
    max: Duration,
}

impl UniformSchedule {
    /// Returns `None` unless `min <= max`
    pub fn new(min: Duration, max: Duration) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    /// Builds a schedule from bounds in (possibly fractional) seconds
    pub fn from_secs(min: f64, max: f64) -> Option<Self> {
        if !min.is_finite() || !max.is_finite() || min < 0.0 {
            return None;
        }
        Self::new(Duration::from_secs_f64(min), Duration::from_secs_f64(max))
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl SendSchedule for UniformSchedule {
    fn next_delay(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..self.max)
    }
}

/// Renders the message for one send: the template with its timestamp token
/// replaced, or a timestamped default when no template is set
pub fn render_message(template: Option<&str>, now: DateTime<Local>) -> String {
    let stamp = format_timestamp(now);
    match template {
        Some(t) if !t.trim().is_empty() => t.replace(TIMESTAMP_TOKEN, &stamp),
        _ => format!("Test message at {}", stamp),
    }
}

/// What a producer session is asked to do
#[derive(Debug, Clone)]
pub struct ProducerSpec {
    pub topic: String,
    pub interval_min: Duration,
    pub interval_max: Duration,
    pub template: Option<String>,
}

#[derive(Debug, Default)]
struct ProducerCounters {
    sent: AtomicU64,
    failed: AtomicU64,
}

/// One producer and its background send loop
pub struct ProducerSession {
    id: u64,
    spec: ProducerSpec,
    config: ProducerConfig,
    /// Bound on the final flush and on waiting for the send loop to exit
    flush_timeout: Duration,
    schedule: Arc<dyn SendSchedule>,
    logger: SessionLogger,
    state: StateCell,
    counters: Arc<ProducerCounters>,
    cancel: CancellationToken,
    connection: Option<Arc<dyn ProducerConnection>>,
    task: Option<JoinHandle<()>>,
}

impl ProducerSession {
    /// Creates a configured, not yet started session
    ///
    /// # Arguments
    /// * `id` - Registry-assigned identity
    /// * `spec` - Topic, interval bounds and template
    /// * `config` - Connection settings for the outbound connection
    /// * `flush_timeout` - Grace period used by [`stop`](Self::stop)
    /// * `schedule` - Source of per-cycle delays
    /// * `logger` - Handle tagged with this session's source id
    pub fn new(
        id: u64,
        spec: ProducerSpec,
        config: ProducerConfig,
        flush_timeout: Duration,
        schedule: Arc<dyn SendSchedule>,
        logger: SessionLogger,
    ) -> Self {
        Self {
            id,
            spec,
            config,
            flush_timeout,
            schedule,
            logger,
            state: StateCell::new(),
            counters: Arc::new(ProducerCounters::default()),
            cancel: CancellationToken::new(),
            connection: None,
            task: None,
        }
    }

    /// Source id used in this session's log entries
    pub fn source_id(topic: &str, id: u64) -> String {
        format!("Producer-{}:{}", topic, id)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.spec.topic
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::SeqCst)
    }

    /// Connects and starts the send loop
    ///
    /// A connection failure is logged and leaves the session inert; it is not retried.
    pub async fn start(&mut self, connector: &dyn BrokerConnector) {
        if self.state.get() != SessionState::Configured {
            self.logger.warn(format!("Producer already {}", self.state.get()));
            return;
        }

        let connection: Arc<dyn ProducerConnection> = match connector.connect_producer(&self.config).await {
            Ok(connection) => Arc::from(connection),
            Err(e) => {
                self.logger.error_with("Failed to create producer", &e);
                self.state.set(SessionState::Inert);
                return;
            }
        };

        self.logger.info(format!(
            "Producer started: Topic={}, Interval={}s-{}s",
            self.spec.topic,
            self.spec.interval_min.as_secs_f64(),
            self.spec.interval_max.as_secs_f64()
        ));

        let send_loop = SendLoop {
            topic: self.spec.topic.clone(),
            template: self.spec.template.clone(),
            connection: connection.clone(),
            schedule: self.schedule.clone(),
            logger: self.logger.clone(),
            counters: self.counters.clone(),
            cancel: self.cancel.clone(),
        };
        self.connection = Some(connection);
        self.state.set(SessionState::Running);
        self.task = Some(tokio::spawn(send_loop.run()));
    }

    /// Stops the send loop, flushes with a bounded wait and closes the connection
    ///
    /// Flush and close failures are logged, never returned.
    pub async fn stop(&mut self) {
        match self.state.get() {
            SessionState::Stopped | SessionState::Stopping => return,
            SessionState::Configured | SessionState::Inert => {
                self.state.set(SessionState::Stopped);
                return;
            }
            SessionState::Running => {}
        }

        self.state.set(SessionState::Stopping);
        self.logger.warn("Stopping producer.");
        self.cancel.cancel();

        if let Some(mut task) = self.task.take() {
            if time::timeout(self.flush_timeout, &mut task).await.is_err() {
                self.logger.warn("Send loop did not finish in time, abandoning in-flight send");
                task.abort();
            }
        }

        if let Some(connection) = self.connection.take() {
            if let Err(e) = shutdown_connection(connection.as_ref(), self.flush_timeout).await {
                self.logger.error_with("Error when stopping Producer.", &e);
            }
        }

        self.state.set(SessionState::Stopped);
        self.logger.info(format!("Producer stopped: Topic={}", self.spec.topic));
    }

    pub fn snapshot(&self) -> ProducerSnapshot {
        ProducerSnapshot {
            id: self.id,
            source: self.logger.source().to_string(),
            topic: self.spec.topic.clone(),
            interval_min_secs: self.spec.interval_min.as_secs_f64(),
            interval_max_secs: self.spec.interval_max.as_secs_f64(),
            template: self.spec.template.clone(),
            state: self.state.get(),
            sent: self.sent(),
            failed: self.failed(),
        }
    }
}

impl Drop for ProducerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn shutdown_connection(connection: &dyn ProducerConnection, flush_timeout: Duration) -> Result<()> {
    let flushed = connection.flush(flush_timeout).await;
    connection.close().await?;
    flushed
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerSnapshot {
    pub id: u64,
    pub source: String,
    pub topic: String,
    pub interval_min_secs: f64,
    pub interval_max_secs: f64,
    pub template: Option<String>,
    pub state: SessionState,
    pub sent: u64,
    pub failed: u64,
}

struct SendLoop {
    topic: String,
    template: Option<String>,
    connection: Arc<dyn ProducerConnection>,
    schedule: Arc<dyn SendSchedule>,
    logger: SessionLogger,
    counters: Arc<ProducerCounters>,
    cancel: CancellationToken,
}

impl SendLoop {
    async fn run(self) {
        loop {
            let delay = self.schedule.next_delay();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = time::sleep(delay) => {}
            }
            // The send itself is never raced with cancellation; stop() bounds it instead
            self.send_once().await;
        }
    }

    async fn send_once(&self) {
        let message = render_message(self.template.as_deref(), Local::now());
        match self.connection.send(&self.topic, Bytes::from(message.clone())).await {
            Ok(report) if report.status == DeliveryStatus::Persisted => {
                self.counters.sent.fetch_add(1, Ordering::SeqCst);
                self.logger.info(format!(
                    "Message sent: Partition={}, Offset={}, Message={}",
                    report.partition, report.offset, message
                ));
            }
            Ok(report) => {
                if report.status == DeliveryStatus::NotPersisted {
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.counters.sent.fetch_add(1, Ordering::SeqCst);
                }
                self.logger
                    .warn(format!("Message status: {}, Message={}", report.status, message));
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                self.logger.error_with("Error when sending message", &e);
            }
        }
    }
}
