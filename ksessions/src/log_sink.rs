//! Bounded, per-source session logs
//!
//! Sessions log through a [`SessionLogger`], which forwards every entry to
//! `tracing` and appends it to a [`LogSink`]. The default sink is a
//! [`LogBuffer`] that keeps the most recent entries and drops the oldest.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

use crate::config::DEFAULT_LOG_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One log line produced by a session
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5} [{}] {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.source,
            self.message
        )
    }
}

/// Append-only destination for session log entries
pub trait LogSink: Send + Sync {
    fn append(&self, entry: LogEntry);
}

/// Ring buffer of the most recent log entries
#[derive(Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies out all retained entries, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Returns up to `limit` of the newest entries, optionally restricted to one source
    pub fn tail(&self, source: Option<&str>, limit: usize) -> Vec<LogEntry> {
        let entries = self.lock();
        let mut selected: Vec<LogEntry> = entries
            .iter()
            .rev()
            .filter(|e| source.map_or(true, |s| e.source == s))
            .take(limit)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    /// Counts retained entries whose message contains `needle`
    pub fn count_matching(&self, needle: &str) -> usize {
        self.lock().iter().filter(|e| e.message.contains(needle)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogSink for LogBuffer {
    fn append(&self, entry: LogEntry) {
        let mut entries = self.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }
}

/// Leveled log-and-continue handle bound to one session's source id
#[derive(Clone)]
pub struct SessionLogger {
    source: Arc<str>,
    sink: Arc<dyn LogSink>,
}

impl SessionLogger {
    pub fn new(source: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            source: Arc::from(source.into()),
            sink,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(source = %self.source, "{}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(source = %self.source, "{}", message);
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(source = %self.source, "{}", message);
        self.push(LogLevel::Error, message);
    }

    /// Logs an error together with its full cause chain
    pub fn error_with(&self, message: impl Into<String>, err: &anyhow::Error) {
        self.error(format!("{}: {:#}", message.into(), err));
    }

    fn push(&self, level: LogLevel, message: String) {
        self.sink.append(LogEntry {
            timestamp: Local::now(),
            level,
            source: self.source.to_string(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_buffer_drops_oldest_beyond_capacity() {
        let buffer = LogBuffer::with_capacity(3);
        let logger = SessionLogger::new("Producer-t:0", Arc::new(buffer.clone()));
        for i in 0..5 {
            logger.info(format!("message {}", i));
        }
        let messages: Vec<_> = buffer.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["message 2", "message 3", "message 4"]);
    }

    #[test]
    fn test_default_capacity() {
        let buffer = LogBuffer::default();
        assert_eq!(buffer.capacity(), 1000);
        let logger = SessionLogger::new("s", Arc::new(buffer.clone()));
        for _ in 0..1200 {
            logger.info("x");
        }
        assert_eq!(buffer.len(), 1000);
    }

    #[test]
    fn test_tail_filters_by_source() {
        let buffer = LogBuffer::with_capacity(10);
        let a = SessionLogger::new("a", Arc::new(buffer.clone()));
        let b = SessionLogger::new("b", Arc::new(buffer.clone()));
        a.info("a1");
        b.warn("b1");
        a.error("a2");
        a.info("a3");

        let tail = buffer.tail(Some("a"), 2);
        let messages: Vec<_> = tail.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["a2", "a3"]);
        assert_eq!(buffer.tail(None, 10).len(), 4);
        assert_eq!(buffer.tail(Some("b"), 10)[0].level, LogLevel::Warn);
    }

    #[test]
    fn test_error_with_includes_cause_chain() {
        let buffer = LogBuffer::with_capacity(10);
        let logger = SessionLogger::new("c", Arc::new(buffer.clone()));
        let err = anyhow!("socket reset").context("fetch failed");
        logger.error_with("Error consuming", &err);
        let entry = &buffer.entries()[0];
        assert_eq!(entry.level, LogLevel::Error);
        assert!(entry.message.contains("fetch failed"));
        assert!(entry.message.contains("socket reset"));
    }
}
