//! Per-(group, topic) consumption progress
//!
//! A [`TopicProgressTracker`] periodically sums the topic's high watermarks and
//! folds locally counted processed messages into its visible counters. Consumer
//! sessions never touch the visible counters directly: [`TopicProgressTracker::increment`]
//! only bumps a pending accumulator, which the refresh task drains.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::broker::BrokerConnector;
use crate::config::TrackerSettings;
use crate::registry::RegistryEvent;

/// Unique key of the tracker for `topic` as consumed by `group`
pub fn tracker_key(group: &str, topic: &str) -> String {
    format!("{}|{}", group, topic)
}

/// Fraction of the topic processed; 0 when the topic is empty or unknown
pub fn progress_ratio(processed: u64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        processed as f64 / total as f64
    }
}

#[derive(Default)]
struct Counters {
    /// Sum of high watermarks at the last successful refresh
    total: AtomicI64,
    processed: AtomicU64,
    pending: Mutex<u64>,
    refreshes: AtomicU64,
}

impl Counters {
    fn take_pending(&self) -> u64 {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Background watermark poller for one (group, topic) pair
pub struct TopicProgressTracker {
    group: String,
    topic: String,
    key: String,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TopicProgressTracker {
    /// Creates the tracker and starts its refresh task; the first refresh runs immediately
    pub fn spawn(
        group: impl Into<String>,
        topic: impl Into<String>,
        connector: Arc<dyn BrokerConnector>,
        settings: TrackerSettings,
        events: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        let group = group.into();
        let topic = topic.into();
        let key = tracker_key(&group, &topic);
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(refresh_loop(
            counters.clone(),
            connector,
            topic.clone(),
            key.clone(),
            settings,
            cancel.clone(),
            events,
        ));

        Self {
            group,
            topic,
            key,
            counters,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Records one processed message; becomes visible at the next refresh
    pub fn increment(&self) {
        *self.counters.pending.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    pub fn total(&self) -> i64 {
        self.counters.total.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.counters.processed.load(Ordering::SeqCst)
    }

    /// Increments not yet folded into [`processed`](Self::processed)
    pub fn pending(&self) -> u64 {
        *self.counters.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of refreshes that completed successfully
    pub fn refresh_count(&self) -> u64 {
        self.counters.refreshes.load(Ordering::SeqCst)
    }

    pub fn ratio(&self) -> f64 {
        progress_ratio(self.processed(), self.total())
    }

    pub fn percentage(&self) -> f64 {
        self.ratio() * 100.0
    }

    /// `processed/total`
    pub fn label(&self) -> String {
        format!("{}/{}", self.processed(), self.total())
    }

    /// Stops the refresh task. Calling it again has no effect.
    pub fn dispose(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            key: self.key.clone(),
            group: self.group.clone(),
            topic: self.topic.clone(),
            processed: self.processed(),
            total: self.total(),
            percentage: self.percentage(),
            progress: self.label(),
        }
    }
}

impl Drop for TopicProgressTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub key: String,
    pub group: String,
    pub topic: String,
    pub processed: u64,
    pub total: i64,
    pub percentage: f64,
    pub progress: String,
}

async fn refresh_loop(
    counters: Arc<Counters>,
    connector: Arc<dyn BrokerConnector>,
    topic: String,
    key: String,
    settings: TrackerSettings,
    cancel: CancellationToken,
    events: broadcast::Sender<RegistryEvent>,
) {
    let mut ticker = time::interval(settings.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = refresh(&counters, connector.as_ref(), &topic, settings.query_timeout) => outcome,
        };

        match outcome {
            Ok(()) => {
                counters.refreshes.fetch_add(1, Ordering::SeqCst);
                // No subscribers is fine
                let _ = events.send(RegistryEvent::TrackerUpdated { key: key.clone() });
            }
            // Previous values stay in place until a later refresh succeeds
            Err(e) => debug!(tracker = %key, "progress refresh skipped: {:#}", e),
        }
    }
    debug!(tracker = %key, "progress refresh stopped");
}

async fn refresh(
    counters: &Counters,
    connector: &dyn BrokerConnector,
    topic: &str,
    timeout: Duration,
) -> Result<()> {
    let client_id = format!("ksessions-progress-{}", Uuid::new_v4());
    let metadata = time::timeout(timeout, connector.connect_metadata(&client_id))
        .await
        .context("metadata connection timed out")??;

    let partitions = metadata.topic_partitions(topic, timeout).await?;
    if partitions.is_empty() {
        counters.total.store(0, Ordering::SeqCst);
        return Ok(());
    }

    let mut total = 0;
    for partition in partitions {
        total += metadata.watermarks(topic, partition, timeout).await?.high;
    }

    let drained = counters.take_pending();
    counters.total.store(total, Ordering::SeqCst);
    counters.processed.fetch_add(drained, Ordering::SeqCst);
    Ok(())
}

/// Shared view of the live trackers, keyed by `group|topic`
///
/// Consumer sessions hold a clone to report processed messages; only the
/// registry adds or removes trackers.
#[derive(Clone, Default)]
pub struct ProgressRouter {
    trackers: Arc<RwLock<IndexMap<String, Arc<TopicProgressTracker>>>>,
}

impl ProgressRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forwards one processed message to the matching tracker.
    /// Returns false when no tracker exists for the pair; the event is dropped.
    pub fn message_processed(&self, group: &str, topic: &str) -> bool {
        let trackers = self.trackers.read().unwrap_or_else(PoisonError::into_inner);
        match trackers.get(&tracker_key(group, topic)) {
            Some(tracker) => {
                tracker.increment();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<TopicProgressTracker>> {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.trackers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshots(&self) -> Vec<TrackerSnapshot> {
        self.trackers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|t| t.snapshot())
            .collect()
    }

    pub(crate) fn insert(&self, tracker: TopicProgressTracker) -> Arc<TopicProgressTracker> {
        let tracker = Arc::new(tracker);
        self.trackers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tracker.key().to_string(), tracker.clone());
        tracker
    }

    pub(crate) fn remove(&self, key: &str) -> Option<Arc<TopicProgressTracker>> {
        self.trackers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(key)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<TopicProgressTracker>> {
        self.trackers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .map(|(_, tracker)| tracker)
            .collect()
    }
}
