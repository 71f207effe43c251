//! In-memory metric aggregation
//!
//! Counters, gauges and histograms keyed by name plus a sorted label set,
//! so `{a=1,b=2}` and `{b=2,a=1}` land on the same series.
//!
//! Series live in a sharded [`DashMap`]; each series has its own short
//! mutex, so unrelated metric names never contend. Histograms keep a
//! bounded FIFO window of recent samples and compute percentiles at
//! snapshot time.

pub mod histogram;
pub mod prometheus;

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::entry::{unix_seconds, Labels, MetricKind};
use histogram::{calculate_percentiles, BucketCounts, SampleWindow};

pub use prometheus::{MetricsExporter, PrometheusTextExporter};

/// Default samples retained per histogram series
pub const DEFAULT_WINDOW: usize = 1_000;

/// Series identity: metric name plus label set (sorted by key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub labels: Labels,
}

impl MetricKey {
    pub fn new(name: impl Into<String>, labels: Labels) -> Self {
        Self {
            name: name.into(),
            labels,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.labels.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (i, (k, v)) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Aggregated view of one series, computed on read
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedMetric {
    pub name: String,
    pub labels: Labels,
    pub kind: MetricKind,
    /// Counter total, last gauge value, or histogram sum
    pub value: f64,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Only histograms carry percentiles and buckets
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub buckets: Vec<(f64, u64)>,
    /// Unix seconds of the most recent update
    pub last_updated: f64,
}

/// Snapshot keyed by the series' canonical key (`name{k=v,...}`)
pub type MetricsSnapshot = BTreeMap<String, AggregatedMetric>;

#[derive(Debug)]
struct Series {
    kind: MetricKind,
    value: f64,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    /// Histograms only: recent samples for percentiles
    window: Option<SampleWindow>,
    /// Histograms only: lifetime bucket counts for exposition
    buckets: Option<BucketCounts>,
    last_updated: f64,
}

impl Series {
    fn new(kind: MetricKind, window_cap: usize, bounds: &[f64]) -> Self {
        let histogram = kind == MetricKind::Histogram;
        Self {
            kind,
            value: 0.0,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            window: histogram.then(|| SampleWindow::new(window_cap)),
            buckets: histogram.then(|| BucketCounts::new(bounds)),
            last_updated: 0.0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last_updated = unix_seconds();

        match self.kind {
            MetricKind::Counter => self.value += value,
            MetricKind::Gauge => self.value = value,
            MetricKind::Histogram => {
                self.value = self.sum;
                if let Some(window) = self.window.as_mut() {
                    window.push(value);
                }
                if let Some(buckets) = self.buckets.as_mut() {
                    buckets.observe(value);
                }
            }
        }
    }

    /// `count`, `sum`, `min`, `max`, `avg` and buckets cover every
    /// observation; percentiles cover the sample window only
    fn aggregate(&self, key: &MetricKey) -> AggregatedMetric {
        let (min, max, avg) = if self.count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (self.min, self.max, self.sum / self.count as f64)
        };
        let percentiles = self
            .window
            .as_ref()
            .and_then(|window| calculate_percentiles(&window.sorted()));

        AggregatedMetric {
            name: key.name.clone(),
            labels: key.labels.clone(),
            kind: self.kind,
            value: self.value,
            count: self.count,
            sum: self.sum,
            min,
            max,
            avg,
            p50: percentiles.map(|p| p.p50),
            p95: percentiles.map(|p| p.p95),
            p99: percentiles.map(|p| p.p99),
            buckets: self
                .buckets
                .as_ref()
                .map(BucketCounts::cumulative)
                .unwrap_or_default(),
            last_updated: self.last_updated,
        }
    }
}

/// Concurrent metric store
pub struct MetricsAggregator {
    series: DashMap<MetricKey, Arc<Mutex<Series>>>,
    /// Kind registered for each metric name, shared by all its label sets
    kinds: DashMap<String, MetricKind>,
    window_cap: usize,
    buckets: Vec<f64>,
    slow_threshold_ms: f64,
    kind_conflicts: AtomicU64,
}

impl MetricsAggregator {
    /// `buckets` are sorted and deduplicated; `+Inf` is always implied
    pub fn new(window_cap: usize, mut buckets: Vec<f64>, slow_threshold_ms: f64) -> Self {
        buckets.retain(|b| b.is_finite());
        buckets.sort_by(|a, b| a.total_cmp(b));
        buckets.dedup();
        Self {
            series: DashMap::new(),
            kinds: DashMap::new(),
            window_cap: window_cap.max(1),
            buckets,
            slow_threshold_ms,
            kind_conflicts: AtomicU64::new(0),
        }
    }

    pub fn increment_counter(&self, name: &str, delta: f64, labels: &Labels) {
        self.record(MetricKind::Counter, name, delta, labels);
    }

    pub fn set_gauge(&self, name: &str, value: f64, labels: &Labels) {
        self.record(MetricKind::Gauge, name, value, labels);
    }

    pub fn record_histogram(&self, name: &str, value: f64, labels: &Labels) {
        self.record(MetricKind::Histogram, name, value, labels);
    }

    /// Record a duration (in milliseconds) into a histogram.
    ///
    /// Returns true if the timing met the slow-operation threshold; slow
    /// timings also bump `slow_operations_total{metric=<name>}`.
    pub fn record_timing(&self, name: &str, duration: Duration, labels: &Labels) -> bool {
        let ms = duration.as_secs_f64() * 1_000.0;
        self.record_histogram(name, ms, labels);
        let slow = self.is_slow(ms);
        if slow {
            let mut slow_labels = Labels::new();
            slow_labels.insert("metric".to_string(), name.to_string());
            self.increment_counter("slow_operations_total", 1.0, &slow_labels);
        }
        slow
    }

    /// Whether a millisecond timing meets the slow-operation threshold
    pub fn is_slow(&self, ms: f64) -> bool {
        ms >= self.slow_threshold_ms
    }

    /// Record a value of the given kind
    pub fn record(&self, kind: MetricKind, name: &str, value: f64, labels: &Labels) {
        if !value.is_finite() {
            tracing::debug!(
                target: "telemetry_pipeline::aggregator",
                metric = name,
                value,
                "Ignoring non-finite metric value"
            );
            return;
        }

        let registered = match self.kinds.get(name) {
            Some(existing) => *existing.value(),
            None => *self.kinds.entry(name.to_string()).or_insert(kind).value(),
        };
        if registered != kind {
            self.kind_conflicts.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                target: "telemetry_pipeline::aggregator",
                metric = name,
                existing = %registered,
                attempted = %kind,
                "Metric kind conflict, value dropped"
            );
            return;
        }

        let key = MetricKey::new(name, labels.clone());
        let series = match self.series.get(&key) {
            Some(existing) => existing.value().clone(),
            None => self
                .series
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Series::new(kind, self.window_cap, &self.buckets)))
                })
                .value()
                .clone(),
        };

        series
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(value);
    }

    /// Aggregated view of a single series
    pub fn get(&self, name: &str, labels: &Labels) -> Option<AggregatedMetric> {
        let key = MetricKey::new(name, labels.clone());
        let series = self.series.get(&key)?.value().clone();
        let series = series.lock().unwrap_or_else(PoisonError::into_inner);
        Some(series.aggregate(&key))
    }

    /// Aggregated view of every series
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Collect handles first so no shard lock is held while sorting windows
        let handles: Vec<(MetricKey, Arc<Mutex<Series>>)> = self
            .series
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        handles
            .into_iter()
            .map(|(key, series)| {
                let series = series.lock().unwrap_or_else(PoisonError::into_inner);
                (key.to_string(), series.aggregate(&key))
            })
            .collect()
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Values dropped because a metric name was reused with another kind
    pub fn kind_conflicts(&self) -> u64 {
        self.kind_conflicts.load(Ordering::Relaxed)
    }

    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }

    pub fn reset(&self) {
        self.series.clear();
        self.kinds.clear();
        self.kind_conflicts.store(0, Ordering::Relaxed);
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(
            DEFAULT_WINDOW,
            crate::config::DEFAULT_BUCKETS.to_vec(),
            1_000.0,
        )
    }
}
