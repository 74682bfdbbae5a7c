//! Bounded ring buffer of structured log records, surfaced via the
//! gateway's `/api/logs` endpoint. A `tracing` layer mirrors every event
//! into the ring; secrets are redacted before insertion.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;

use crate::redact;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(text)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// Case-insensitive; accepts `warning` as an alias for `warn`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            component: component.into(),
            message: message.into(),
            attrs: BTreeMap::new(),
            trace_id: None,
        }
    }
}

/// Mutex-guarded ring of redacted records. `push` never fails; the oldest
/// record is dropped when the ring is full.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    inner: Mutex<VecDeque<LogRecord>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Redact and insert one record.
    pub fn push(&self, mut record: LogRecord) {
        record.message = redact::redact_text(&record.message);
        for (key, value) in std::mem::take(&mut record.attrs) {
            if redact::is_sensitive_key(&key) {
                record.attrs.insert(key, redact::REDACTED.to_string());
            } else {
                let redacted = redact::redact_text(&value);
                record.attrs.insert(key, redacted);
            }
        }

        let mut ring = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `lines` most recent records at or above `min_level`, oldest
    /// first (newest last).
    pub fn tail(&self, lines: usize, min_level: Option<LogLevel>) -> Vec<LogRecord> {
        let ring = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut selected: Vec<LogRecord> = ring
            .iter()
            .rev()
            .filter(|record| min_level.is_none_or(|min| record.level >= min))
            .take(lines)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }
}

/// `tracing` layer that mirrors events into a [`LogBuffer`].
#[derive(Clone)]
pub struct RingLayer {
    buffer: Arc<LogBuffer>,
}

impl RingLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for RingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = match *metadata.level() {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        };

        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(level, metadata.target(), visitor.message);
        record.trace_id = visitor.trace_id;
        record.attrs = visitor.attrs;
        self.buffer.push(record);
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    trace_id: Option<String>,
    attrs: BTreeMap<String, String>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "trace_id" => self.trace_id = Some(value),
            name => {
                self.attrs.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }
}
