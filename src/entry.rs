//! Log and metric records flowing through the pipeline
//!
//! Entries are built once by the producer, moved into the queue, and handed
//! to sinks by shared reference. Nothing mutates an entry after construction.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved field keys with pipeline-defined meaning
pub mod keys {
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const REQUEST_ID: &str = "request_id";
    pub const DURATION_MS: &str = "duration_ms";
    pub const ERROR: &str = "error";
    pub const SLOW: &str = "slow";

    /// Keys of the JSON record shape that extra fields can never overwrite
    pub const RECORD_KEYS: [&str; 5] = ["timestamp", "level", "logger", "message", "correlation_id"];
}

/// Log severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[serde(alias = "DEBUG", alias = "trace", alias = "TRACE")]
    Debug,
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "WARN", alias = "warning", alias = "WARNING")]
    Warn,
    #[serde(alias = "ERROR")]
    Error,
    #[serde(alias = "CRITICAL", alias = "fatal", alias = "FATAL")]
    Critical,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" | "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insertion-ordered string-keyed field map
///
/// Re-inserting an existing key replaces its value in place, keeping the
/// original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(Vec<(String, Value)>);

impl Fields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

impl Serialize for Fields {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Metric labels; sorted by key so equal label sets compare and hash equal
pub type Labels = BTreeMap<String, String>;

/// Build a label set from key/value pairs
pub fn labels<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Labels
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// A structured log record
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Unix seconds
    pub timestamp: f64,
    pub level: Level,
    pub logger_name: Arc<str>,
    pub message: Arc<str>,
    pub correlation_id: Option<String>,
    pub fields: Fields,
}

impl LogEntry {
    pub fn new(
        logger_name: impl Into<Arc<str>>,
        level: Level,
        message: impl Into<Arc<str>>,
        correlation_id: Option<String>,
        fields: Fields,
    ) -> Self {
        Self {
            timestamp: unix_seconds(),
            level,
            logger_name: logger_name.into(),
            message: message.into(),
            correlation_id,
            fields,
        }
    }

    /// JSON record with extra fields merged at top level.
    ///
    /// Extra fields never shadow the reserved keys. Keys serialize in sorted
    /// order regardless of where they came from.
    pub fn to_json(&self) -> Value {
        let mut record = Map::new();
        record.insert("timestamp".into(), Value::String(format_timestamp(self.timestamp)));
        record.insert("level".into(), Value::String(self.level.as_str().to_string()));
        record.insert("logger".into(), Value::String(self.logger_name.to_string()));
        record.insert("message".into(), Value::String(self.message.to_string()));
        record.insert(
            "correlation_id".into(),
            self.correlation_id
                .as_ref()
                .map(|id| Value::String(id.clone()))
                .unwrap_or(Value::Null),
        );

        for (key, value) in self.fields.iter() {
            if keys::RECORD_KEYS.contains(&key) {
                continue;
            }
            record.insert(key.to_string(), value.clone());
        }

        Value::Object(record)
    }
}

/// A single metric observation
#[derive(Debug, Clone)]
pub struct MetricEntry {
    /// Unix seconds
    pub timestamp: f64,
    pub kind: MetricKind,
    pub name: Arc<str>,
    pub value: f64,
    pub labels: Labels,
    pub correlation_id: Option<String>,
    /// Timing at or above the configured slow-operation threshold
    pub slow: bool,
}

impl MetricEntry {
    pub fn new(
        kind: MetricKind,
        name: impl Into<Arc<str>>,
        value: f64,
        labels: Labels,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            timestamp: unix_seconds(),
            kind,
            name: name.into(),
            value,
            labels,
            correlation_id,
            slow: false,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "timestamp": format_timestamp(self.timestamp),
            "type": "metric",
            "kind": self.kind.as_str(),
            "name": &*self.name,
            "value": self.value,
            "labels": self.labels,
            "correlation_id": self.correlation_id,
            "slow": self.slow,
        })
    }
}

/// Anything that can sit in the queue
#[derive(Debug, Clone)]
pub enum Entry {
    Log(LogEntry),
    Metric(MetricEntry),
}

impl Entry {
    /// Key used to group a batch for sink locality
    pub fn routing_key(&self) -> &str {
        match self {
            Self::Log(log) => &log.logger_name,
            Self::Metric(metric) => &metric.name,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Log(log) => log.correlation_id.as_deref(),
            Self::Metric(metric) => metric.correlation_id.as_deref(),
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            Self::Log(log) => log.timestamp,
            Self::Metric(metric) => metric.timestamp,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Log(log) => log.to_json(),
            Self::Metric(metric) => metric.to_json(),
        }
    }

    pub fn as_log(&self) -> Option<&LogEntry> {
        match self {
            Self::Log(log) => Some(log),
            Self::Metric(_) => None,
        }
    }

    pub fn as_metric(&self) -> Option<&MetricEntry> {
        match self {
            Self::Metric(metric) => Some(metric),
            Self::Log(_) => None,
        }
    }
}

impl From<LogEntry> for Entry {
    fn from(entry: LogEntry) -> Self {
        Self::Log(entry)
    }
}

impl From<MetricEntry> for Entry {
    fn from(entry: MetricEntry) -> Self {
        Self::Metric(entry)
    }
}

/// Current time as fractional Unix seconds
pub fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Render fractional Unix seconds as RFC 3339 / ISO-8601 with milliseconds
pub fn format_timestamp(timestamp: f64) -> String {
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::<Utc>::from_timestamp(secs as i64, nanos)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
