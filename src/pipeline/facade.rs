//! Single entry point for application code
//!
//! ```ignore
//! let pipeline = Arc::new(PipelineFacade::from_config(config));
//! pipeline.start()?;
//!
//! pipeline.log("api.orders", Level::Info, "order placed", Fields::new().with("order_id", 42));
//! pipeline.record_metric(MetricKind::Counter, "orders_total", 1.0, Labels::new());
//!
//! pipeline.stop().await;
//! ```
//!
//! Producer calls (`log`, `record_metric`, `record_timing`) never block and
//! never fail; problems are counted and show up in [`HealthStatus`] and
//! [`PerformanceSnapshot`]. Once `stop` begins, new entries are refused and
//! counted as shutdown drops until the pipeline is started again.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

use super::direct::DirectDispatcher;
use super::processor::{BatchProcessor, ProcessorStats, ShutdownReport};
use super::stats::{PerformanceSnapshot, PerformanceStats};
use crate::aggregator::{MetricsAggregator, MetricsExporter, MetricsSnapshot, PrometheusTextExporter};
use crate::cache::{ContextPool, Logger, LoggerCache, MessageCache, SharedContext};
use crate::config::{validate_config, PipelineConfig};
use crate::correlation;
use crate::entry::{keys, Entry, Fields, Labels, Level, LogEntry, MetricEntry, MetricKind};
use crate::error::PipelineError;
use crate::queue::BoundedQueue;
use crate::sinks::{self, SharedSink};

const LOG_TARGET: &str = "telemetry_pipeline::facade";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Never started; entries wait in the queue
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Hit rates of the three caches
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheHitRates {
    pub logger: f64,
    pub message: f64,
    pub context: f64,
}

/// Health snapshot; safe to take at any time, including mid-shutdown
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub overflow_count: u64,
    pub cache_hit_rates: CacheHitRates,
    pub worker_count: usize,
    pub running: bool,
    pub processed: u64,
    pub errors: u64,
}

pub struct PipelineFacade {
    config: PipelineConfig,
    queue: Arc<BoundedQueue<Entry>>,
    processor: Arc<BatchProcessor>,
    direct: DirectDispatcher,
    aggregator: MetricsAggregator,
    loggers: LoggerCache,
    messages: MessageCache,
    contexts: Arc<ContextPool>,
    stats: Arc<PerformanceStats>,
    lifecycle: Mutex<Lifecycle>,
    /// Set from the start of `stop` until the next `start`
    closed: AtomicBool,
}

impl PipelineFacade {
    /// Build a pipeline with explicit sinks. Nothing runs until [`Self::start`].
    ///
    /// Entries logged before `start` wait in the queue (subject to its
    /// capacity) and are delivered once workers run.
    pub fn new(config: PipelineConfig, sinks: Vec<SharedSink>) -> Self {
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let stats = Arc::new(PerformanceStats::new());
        let contexts = Arc::new(ContextPool::new(&config.caches.context));
        let processor = Arc::new(BatchProcessor::new(
            queue.clone(),
            &config,
            sinks,
            stats.clone(),
            contexts.clone(),
        ));

        Self {
            aggregator: MetricsAggregator::new(
                config.histogram_window,
                config.histogram_buckets.clone(),
                config.slow_threshold_ms,
            ),
            loggers: LoggerCache::new(&config),
            messages: MessageCache::new(&config.caches.message, config.message_intern_max_len),
            direct: DirectDispatcher::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
            closed: AtomicBool::new(false),
            config,
            queue,
            processor,
            contexts,
            stats,
        }
    }

    /// Build a pipeline with the sinks named in `config.sinks`
    pub fn from_config(config: PipelineConfig) -> Self {
        let sinks = sinks::from_config(&config.sinks);
        Self::new(config, sinks)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    /// Start background delivery on the current tokio runtime.
    ///
    /// Idempotent. Fails only on invalid configuration or when called
    /// outside a runtime.
    pub fn start(&self) -> Result<(), PipelineError> {
        validate_config(&self.config).map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        let handle =
            Handle::try_current().map_err(|e| PipelineError::NoRuntime(e.to_string()))?;

        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopping => {
                tracing::warn!(target: LOG_TARGET, "start() called while stopping, ignored");
                return Ok(());
            }
            Lifecycle::Idle | Lifecycle::Stopped => {}
        }

        if self.config.batching_enabled {
            self.processor.start_on(&handle, self.config.worker_count);
        } else {
            self.direct.start_on(&handle, self.processor.clone());
        }
        *lifecycle = Lifecycle::Running;
        self.closed.store(false, Ordering::Release);

        tracing::info!(
            target: LOG_TARGET,
            batching = self.config.batching_enabled,
            workers = self.worker_count(),
            queue_capacity = self.queue.capacity(),
            "Telemetry pipeline started"
        );
        Ok(())
    }

    /// Stop workers and flush within the shutdown grace period.
    ///
    /// Idempotent; a no-op before `start`. Entries submitted after this is
    /// called are refused and counted as shutdown drops. The pipeline may be
    /// started again afterwards.
    pub async fn stop(&self) -> ShutdownReport {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle != Lifecycle::Running {
                return ShutdownReport::default();
            }
            *lifecycle = Lifecycle::Stopping;
            self.closed.store(true, Ordering::Release);
        }

        let mut report = ShutdownReport::default();
        if !self.config.batching_enabled {
            let abandoned = self
                .direct
                .stop(Instant::now() + self.config.shutdown_grace())
                .await;
            if abandoned > 0 {
                self.stats.record_shutdown_loss(abandoned);
                crate::metrics::record_dropped("shutdown", abandoned as u64);
            }
            report.dropped += abandoned;
            report.timed_out = abandoned > 0;
        }

        // Also covers entries queued while the direct dispatcher was stopping
        let drained = self.processor.stop().await;
        report.flushed += drained.flushed;
        report.dropped += drained.dropped;
        report.aborted_workers += drained.aborted_workers;
        report.timed_out |= drained.timed_out;

        *self.lifecycle() = Lifecycle::Stopped;

        // Producers that passed the closed check just before it flipped
        let late = self.queue.drain_all().len();
        if late > 0 {
            self.stats.record_shutdown_loss(late);
            crate::metrics::record_dropped("shutdown", late as u64);
            report.dropped += late;
        }

        tracing::info!(
            target: LOG_TARGET,
            flushed = report.flushed,
            dropped = report.dropped,
            processed = self.stats.entries_processed(),
            "Telemetry pipeline stopped"
        );
        report
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle() == Lifecycle::Running
    }

    // ============================================================
    // Producers
    // ============================================================

    /// Record a log entry.
    ///
    /// The entry's correlation id is the caller's current context id, unless
    /// `fields` carries an explicit `correlation_id`: that value overrides
    /// the context (for work done on behalf of another request) and is
    /// removed from the fields. A numeric `duration_ms` at or above the slow
    /// threshold marks the entry `slow`.
    pub fn log(&self, logger_name: &str, level: Level, message: &str, mut fields: Fields) {
        let logger = self.loggers.get(logger_name);
        if !logger.enabled(level) {
            return;
        }

        let correlation_id = match fields.remove(keys::CORRELATION_ID) {
            Some(Value::String(id)) => correlation::normalize_id(&id),
            Some(Value::Null) | None => correlation::current_id(),
            Some(other) => correlation::normalize_id(&other.to_string()),
        };

        if let Some(ms) = fields.get(keys::DURATION_MS).and_then(Value::as_f64) {
            if self.aggregator.is_slow(ms) {
                fields.insert(keys::SLOW, true);
                self.stats.record_slow_operation();
            }
        }

        let entry = LogEntry::new(
            logger.shared_name(),
            level,
            self.messages.intern(message),
            correlation_id,
            fields,
        );
        self.submit(entry.into());
    }

    /// Log at `Error` level with the error's message under the `error` key
    pub fn log_error(
        &self,
        logger_name: &str,
        message: &str,
        error: &dyn std::error::Error,
        fields: Fields,
    ) {
        self.log(
            logger_name,
            Level::Error,
            message,
            fields.with(keys::ERROR, error.to_string()),
        );
    }

    /// Update the aggregator and forward the observation to the sinks
    pub fn record_metric(&self, kind: MetricKind, name: &str, value: f64, labels: Labels) {
        self.aggregator.record(kind, name, value, &labels);
        let entry = MetricEntry::new(kind, name, value, labels, correlation::current_id());
        self.submit(entry.into());
    }

    /// Record a duration as a millisecond histogram. Returns whether it was
    /// at or above the slow-operation threshold.
    pub fn record_timing(&self, name: &str, duration: Duration, labels: Labels) -> bool {
        let slow = self.aggregator.record_timing(name, duration, &labels);
        if slow {
            self.stats.record_slow_operation();
        }

        let mut entry = MetricEntry::new(
            MetricKind::Histogram,
            name,
            duration.as_secs_f64() * 1_000.0,
            labels,
            correlation::current_id(),
        );
        entry.slow = slow;
        self.submit(entry.into());
        slow
    }

    fn submit(&self, entry: Entry) {
        if self.closed.load(Ordering::Acquire) {
            self.stats.record_shutdown_loss(1);
            crate::metrics::record_dropped("shutdown", 1);
            tracing::debug!(target: LOG_TARGET, "Pipeline stopping or stopped, entry dropped");
            return;
        }

        let entry = if self.config.batching_enabled {
            entry
        } else {
            match self.direct.send(entry) {
                Ok(()) => return,
                // Not running yet: park it in the queue until start()
                Err(entry) => entry,
            }
        };

        if !self.queue.try_enqueue(entry) {
            crate::metrics::record_dropped("overflow", 1);
            tracing::debug!(
                target: LOG_TARGET,
                overflow = self.queue.overflow_count(),
                "Queue full, entry dropped"
            );
        }
    }

    // ============================================================
    // Accessors
    // ============================================================

    pub fn logger(&self, name: &str) -> Arc<Logger> {
        self.loggers.get(name)
    }

    /// Reusable scratch context for `key`, reset on reuse
    pub fn acquire_context(&self, key: &str) -> SharedContext {
        self.contexts.acquire(key)
    }

    /// Add a sink; it receives every batch dispatched from now on
    pub fn add_sink(&self, sink: SharedSink) {
        self.processor.add_sink(sink);
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.aggregator.snapshot()
    }

    /// Aggregated metrics in Prometheus text format
    pub fn render_prometheus(&self) -> String {
        PrometheusTextExporter::new().export(&self.aggregator.snapshot())
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    pub fn worker_count(&self) -> usize {
        if self.config.batching_enabled {
            self.processor.worker_count()
        } else if self.direct.is_running() {
            1
        } else {
            0
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus {
            queue_depth: self.queue.size(),
            queue_capacity: self.queue.capacity(),
            overflow_count: self.queue.overflow_count(),
            cache_hit_rates: CacheHitRates {
                logger: self.loggers.stats().hit_rate,
                message: self.messages.stats().hit_rate,
                context: self.contexts.stats().hit_rate,
            },
            worker_count: self.worker_count(),
            running: self.is_running(),
            processed: self.stats.entries_processed(),
            errors: self.stats.sink_errors(),
        }
    }

    pub fn performance_stats(&self) -> PerformanceSnapshot {
        let caches = [
            self.loggers.stats(),
            self.messages.stats(),
            self.contexts.stats(),
        ];
        PerformanceSnapshot {
            cache_hits: caches.iter().map(|c| c.hit_count).sum(),
            cache_misses: caches.iter().map(|c| c.miss_count).sum(),
            queue_overflow: self.queue.overflow_count(),
            ..self.stats.snapshot()
        }
    }

    /// Zero every running total (pipeline, caches and queue overflow)
    pub fn reset_performance_stats(&self) {
        self.stats.reset();
        self.queue.reset_overflow_count();
        self.loggers.reset_stats();
        self.messages.reset_stats();
        self.contexts.reset_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::MemorySink;

    fn config() -> PipelineConfig {
        PipelineConfig {
            batch_size: 10,
            flush_interval_ms: 20,
            worker_count: 1,
            sinks: crate::config::SinksConfig {
                console: false,
                file_path: None,
                file_max_bytes: None,
            },
            ..PipelineConfig::default()
        }
    }

    fn pipeline(config: PipelineConfig) -> (PipelineFacade, Arc<MemorySink>) {
        let memory = Arc::new(MemorySink::new());
        (PipelineFacade::new(config, vec![memory.clone()]), memory)
    }

    #[tokio::test]
    async fn test_log_captures_current_correlation_id() {
        let (p, memory) = pipeline(config());
        p.start().unwrap();

        {
            let guard = correlation::with_context(None);
            let expected = guard.id().to_string();
            p.log("api", Level::Info, "inside", Fields::new());
            drop(guard);

            p.stop().await;
            let entries = memory.entries();
            assert_eq!(entries[0].correlation_id(), Some(expected.as_str()));
        }
    }

    #[tokio::test]
    async fn test_explicit_correlation_field_wins() {
        let (p, memory) = pipeline(config());
        p.start().unwrap();

        let _guard = correlation::with_context(None);
        p.log(
            "api",
            Level::Info,
            "explicit",
            Fields::new().with(keys::CORRELATION_ID, "req-123"),
        );
        p.stop().await;

        let entry = memory.entries().remove(0);
        assert_eq!(entry.correlation_id(), Some("req-123"));
        assert!(entry.as_log().unwrap().fields.get(keys::CORRELATION_ID).is_none());
    }

    #[tokio::test]
    async fn test_level_filtering_uses_logger_threshold() {
        let mut cfg = config();
        cfg.logger_levels.insert("chatty".to_string(), Level::Warn);
        let (p, memory) = pipeline(cfg);
        p.start().unwrap();

        p.log("chatty", Level::Info, "dropped", Fields::new());
        p.log("chatty", Level::Error, "kept", Fields::new());
        p.log("other", Level::Debug, "dropped too", Fields::new());
        p.stop().await;

        assert_eq!(memory.messages(), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_slow_duration_field_is_flagged() {
        let mut cfg = config();
        cfg.slow_threshold_ms = 100.0;
        let (p, memory) = pipeline(cfg);
        p.start().unwrap();

        p.log("db", Level::Info, "fast", Fields::new().with(keys::DURATION_MS, 5));
        p.log("db", Level::Info, "slow", Fields::new().with(keys::DURATION_MS, 250.5));
        p.stop().await;

        let entries = memory.entries();
        assert!(entries[0].as_log().unwrap().fields.get(keys::SLOW).is_none());
        assert_eq!(
            entries[1].as_log().unwrap().fields.get(keys::SLOW),
            Some(&Value::Bool(true))
        );
        assert_eq!(p.performance_stats().slow_operations, 1);
    }

    #[tokio::test]
    async fn test_record_metric_updates_aggregator_and_sinks() {
        let (p, memory) = pipeline(config());
        p.start().unwrap();

        p.record_metric(MetricKind::Counter, "orders_total", 2.0, Labels::new());
        p.record_metric(MetricKind::Counter, "orders_total", 3.0, Labels::new());
        assert!(p.record_timing("checkout_ms", Duration::from_secs(2), Labels::new()));
        p.stop().await;

        let snapshot = p.metrics_snapshot();
        assert_eq!(snapshot["orders_total"].value, 5.0);
        assert_eq!(snapshot["checkout_ms"].count, 1);

        let metrics: Vec<_> = memory.entries().into_iter().filter_map(|e| match e {
            Entry::Metric(m) => Some(m),
            Entry::Log(_) => None,
        }).collect();
        assert_eq!(metrics.len(), 3);
        assert!(metrics.iter().any(|m| &*m.name == "checkout_ms" && m.slow));

        let text = p.render_prometheus();
        assert!(text.contains("orders_total 5"));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent_and_restartable() {
        let (p, memory) = pipeline(config());
        assert_eq!(p.stop().await, ShutdownReport::default());

        p.start().unwrap();
        p.start().unwrap();
        assert!(p.health_status().running);
        assert_eq!(p.health_status().worker_count, 1);

        p.stop().await;
        p.stop().await;
        assert!(!p.health_status().running);

        p.start().unwrap();
        p.log("api", Level::Info, "after restart", Fields::new());
        p.stop().await;
        assert_eq!(memory.messages(), vec!["after restart"]);
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let (p, _) = pipeline(config());
        assert!(matches!(p.start(), Err(PipelineError::NoRuntime(_))));
        assert!(!p.health_status().running);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let (p, _) = pipeline(PipelineConfig {
            batch_size: 0,
            ..config()
        });
        assert!(matches!(p.start(), Err(PipelineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_entries_after_stop_are_counted_not_stranded() {
        let (p, memory) = pipeline(config());
        p.start().unwrap();
        p.log("api", Level::Info, "delivered", Fields::new());
        assert_eq!(p.stop().await.dropped, 0);

        p.log("late", Level::Info, "too late", Fields::new());
        p.record_metric(MetricKind::Counter, "late_total", 1.0, Labels::new());

        let health = p.health_status();
        assert!(!health.running);
        assert_eq!(health.queue_depth, 0);
        assert_eq!(p.performance_stats().dropped_on_shutdown, 2);
        assert_eq!(memory.messages(), vec!["delivered"]);

        // A restart accepts work again
        p.start().unwrap();
        p.log("api", Level::Info, "after restart", Fields::new());
        p.stop().await;
        assert_eq!(memory.messages(), vec!["delivered", "after restart"]);
        assert_eq!(p.performance_stats().dropped_on_shutdown, 2);
    }

    #[tokio::test]
    async fn test_log_error_records_error_message() {
        let (p, memory) = pipeline(config());
        p.start().unwrap();

        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out");
        p.log_error("api", "request failed", &err, Fields::new().with("route", "/orders"));
        p.stop().await;

        let entries = memory.entries();
        let log = entries[0].as_log().unwrap();
        assert_eq!(log.level, Level::Error);
        assert_eq!(&*log.message, "request failed");
        assert_eq!(
            log.fields.get(keys::ERROR),
            Some(&Value::from("upstream timed out"))
        );
        assert_eq!(log.fields.get("route"), Some(&Value::from("/orders")));
    }

    #[tokio::test]
    async fn test_entries_before_start_are_buffered() {
        let (p, memory) = pipeline(config());
        p.log("early", Level::Info, "queued", Fields::new());
        assert_eq!(p.health_status().queue_depth, 1);

        p.start().unwrap();
        assert!(memory.wait_for(1, Duration::from_secs(1)).await);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_direct_mode_preserves_order() {
        let (p, memory) = pipeline(PipelineConfig {
            batching_enabled: false,
            worker_count: 0,
            ..config()
        });
        p.log("direct", Level::Info, "before start", Fields::new());
        p.start().unwrap();
        for i in 0..5 {
            p.log("direct", Level::Info, &format!("m{}", i), Fields::new());
        }
        p.stop().await;

        assert_eq!(
            memory.messages(),
            vec!["before start", "m0", "m1", "m2", "m3", "m4"]
        );
        assert!(memory.batches().iter().all(|b| b.len() == 1));
    }

    #[tokio::test]
    async fn test_health_and_cache_rates() {
        let (p, _) = pipeline(config());
        for _ in 0..4 {
            p.log("svc", Level::Info, "same message", Fields::new());
        }

        let health = p.health_status();
        assert_eq!(health.queue_depth, 4);
        assert_eq!(health.cache_hit_rates.logger, 0.75);
        assert_eq!(health.cache_hit_rates.message, 0.75);
        assert!(!health.running);

        let stats = p.performance_stats();
        assert_eq!(stats.cache_hits, 6);
        assert_eq!(stats.cache_misses, 2);

        p.reset_performance_stats();
        assert_eq!(p.performance_stats().cache_hits, 0);
    }
}
