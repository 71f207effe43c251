//! Batch processor
//!
//! Drains the shared queue into batches bounded by size and age and fans
//! each batch out to every registered sink:
//! - a batch closes at `batch_size` entries or `flush_interval` after its
//!   first entry, whichever comes first
//! - entries are grouped by routing key (logger or metric name), keeping
//!   first-appearance order
//! - sinks run concurrently, each under `sink_timeout`; failures are
//!   counted and logged, never propagated

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::stats::PerformanceStats;
use super::worker::{ShutdownSignal, WorkerPool};
use crate::cache::{ContextPool, SharedContext};
use crate::config::PipelineConfig;
use crate::entry::Entry;
use crate::error::{PipelineError, SinkError};
use crate::queue::BoundedQueue;
use crate::sinks::SharedSink;

const LOG_TARGET: &str = "telemetry_pipeline::processor";

/// Processor counters as seen by callers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessorStats {
    pub processed_count: u64,
    pub error_count: u64,
    pub current_queue_size: usize,
    pub overflow_count: u64,
    pub batch_count: u64,
    pub dropped_on_shutdown: u64,
}

/// Outcome of [`BatchProcessor::stop`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Entries dispatched by the final drain
    pub flushed: usize,
    /// Entries that could not be delivered within the grace period
    pub dropped: usize,
    /// Workers that had to be aborted
    pub aborted_workers: usize,
    pub timed_out: bool,
}

/// Entries currently held by a worker between dequeue and dispatch
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    count: usize,
}

impl<'a> InFlight<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        Self { counter, count: 0 }
    }

    fn add(&mut self, n: usize) {
        self.counter.fetch_add(n, Ordering::SeqCst);
        self.count += n;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.count, Ordering::SeqCst);
    }
}

pub struct BatchProcessor {
    queue: Arc<BoundedQueue<Entry>>,
    sinks: RwLock<Vec<SharedSink>>,
    stats: Arc<PerformanceStats>,
    contexts: Arc<ContextPool>,
    batch_size: usize,
    flush_interval: Duration,
    sink_timeout: Duration,
    shutdown_grace: Duration,
    group_by_logger: bool,
    in_flight: AtomicUsize,
    pool: Mutex<Option<WorkerPool>>,
}

impl BatchProcessor {
    /// Create a processor over `queue`
    ///
    /// # Arguments
    ///
    /// * `queue` - Shared entry queue (producers enqueue, workers drain)
    /// * `config` - Batch size, flush interval, timeouts and grouping
    /// * `sinks` - Initial sinks; more can be added with [`Self::add_sink`]
    /// * `stats` - Shared running totals
    /// * `contexts` - Pool providing each worker's scratch context
    pub fn new(
        queue: Arc<BoundedQueue<Entry>>,
        config: &PipelineConfig,
        sinks: Vec<SharedSink>,
        stats: Arc<PerformanceStats>,
        contexts: Arc<ContextPool>,
    ) -> Self {
        Self {
            queue,
            sinks: RwLock::new(sinks),
            stats,
            contexts,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            sink_timeout: config.sink_timeout(),
            shutdown_grace: config.shutdown_grace(),
            group_by_logger: config.group_by_logger,
            in_flight: AtomicUsize::new(0),
            pool: Mutex::new(None),
        }
    }

    pub fn add_sink(&self, sink: SharedSink) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn sinks(&self) -> Vec<SharedSink> {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn queue(&self) -> &Arc<BoundedQueue<Entry>> {
        &self.queue
    }

    pub(crate) fn contexts(&self) -> &ContextPool {
        &self.contexts
    }

    pub(crate) fn performance(&self) -> &PerformanceStats {
        &self.stats
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Spawn `worker_count` drain loops on the current runtime.
    ///
    /// Calling `start` on a running processor is a no-op.
    pub fn start(self: &Arc<Self>, worker_count: usize) -> Result<(), PipelineError> {
        let handle =
            Handle::try_current().map_err(|e| PipelineError::NoRuntime(e.to_string()))?;
        self.start_on(&handle, worker_count);
        Ok(())
    }

    pub(crate) fn start_on(self: &Arc<Self>, handle: &Handle, worker_count: usize) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.is_some() {
            return;
        }
        *pool = Some(WorkerPool::start(self.clone(), worker_count, handle));
    }

    pub fn is_running(&self) -> bool {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn worker_count(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(WorkerPool::worker_count)
            .unwrap_or(0)
    }

    /// Stop the workers, then flush whatever is left in the queue.
    ///
    /// Everything is bounded by the shutdown grace period. Entries still
    /// undelivered when it runs out are counted and reported, not retried.
    pub async fn stop(&self) -> ShutdownReport {
        let deadline = Instant::now() + self.shutdown_grace;
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut report = ShutdownReport::default();
        if let Some(pool) = pool {
            let stranded = pool.stop(deadline, &self.in_flight).await;
            report.aborted_workers = stranded.aborted;
            report.dropped += stranded.entries;
        }

        let remaining = self.queue.drain_all();
        let total = remaining.len();
        let mut flushed = 0usize;
        if total > 0 {
            let flush = async {
                for chunk in remaining.chunks(self.batch_size) {
                    self.dispatch(chunk.to_vec()).await;
                    flushed += chunk.len();
                }
            };
            if tokio::time::timeout_at(deadline, flush).await.is_err() {
                report.timed_out = true;
            }
        }
        report.flushed = flushed;
        report.dropped += total - flushed;
        report.timed_out |= report.aborted_workers > 0;

        if report.dropped > 0 {
            self.stats.record_shutdown_loss(report.dropped);
            crate::metrics::record_dropped("shutdown", report.dropped as u64);
            tracing::warn!(
                target: LOG_TARGET,
                dropped = report.dropped,
                aborted_workers = report.aborted_workers,
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Shutdown grace period exceeded, entries lost"
            );
        } else {
            tracing::debug!(
                target: LOG_TARGET,
                flushed = report.flushed,
                "Batch processor stopped"
            );
        }

        report
    }

    /// One drain-loop iteration.
    ///
    /// Returns false once shutdown has been signalled; the caller then
    /// leaves the loop and the final drain picks up whatever is queued.
    /// The scratch context for `scratch_key` is acquired into `scratch` only
    /// when there is a batch to describe.
    pub(crate) async fn drain_once(
        &self,
        shutdown: &mut broadcast::Receiver<ShutdownSignal>,
        scratch_key: &str,
        scratch: &mut Option<SharedContext>,
    ) -> bool {
        let first = tokio::select! {
            biased;
            _ = shutdown.recv() => return false,
            batch = self.queue.dequeue_batch(self.batch_size, self.flush_interval) => batch,
        };
        if first.is_empty() {
            return true;
        }

        let mut held = InFlight::new(&self.in_flight);
        held.add(first.len());
        let mut batch = first;
        let mut running = true;

        // Keep filling until the batch is full or its oldest entry is due
        let deadline = Instant::now() + self.flush_interval;
        while batch.len() < self.batch_size {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    running = false;
                    break;
                }
                more = self.queue.dequeue_batch(self.batch_size - batch.len(), deadline - now) => {
                    if more.is_empty() {
                        break;
                    }
                    held.add(more.len());
                    batch.extend(more);
                }
            }
        }

        let context = self.contexts.acquire(scratch_key);
        {
            let mut ctx = context.lock().unwrap_or_else(PoisonError::into_inner);
            ctx.correlation_id = batch
                .iter()
                .find_map(Entry::correlation_id)
                .map(str::to_owned);
            ctx.insert("batch_size", batch.len());
            ctx.insert("first_key", batch[0].routing_key().to_string());
        }
        *scratch = Some(context);

        self.dispatch(batch).await;
        running
    }

    /// Group and send one batch to every sink
    pub async fn dispatch(&self, batch: Vec<Entry>) {
        if batch.is_empty() {
            return;
        }

        let started = std::time::Instant::now();
        let count = batch.len();
        let batch = if self.group_by_logger {
            group_by_routing_key(batch)
        } else {
            batch
        };

        let sinks = self.sinks();
        let results = join_all(sinks.iter().map(|sink| self.emit_to(sink, &batch))).await;

        for (sink, result) in sinks.iter().zip(results) {
            if let Err(e) = result {
                self.stats.record_sink_error();
                crate::metrics::record_sink_error(sink.name(), e.kind());
                tracing::warn!(
                    target: LOG_TARGET,
                    sink = sink.name(),
                    error = %e,
                    count,
                    "Sink dispatch failed"
                );
            }
        }

        self.stats.record_batch(count);
        crate::metrics::record_processed(count);
        crate::metrics::record_batch(started.elapsed());

        tracing::debug!(
            target: LOG_TARGET,
            count,
            sinks = sinks.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Flushed batch"
        );
    }

    async fn emit_to(&self, sink: &SharedSink, batch: &[Entry]) -> Result<(), SinkError> {
        match tokio::time::timeout(self.sink_timeout, sink.emit(batch)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(self.sink_timeout)),
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed_count: self.stats.entries_processed(),
            error_count: self.stats.sink_errors(),
            current_queue_size: self.queue.size(),
            overflow_count: self.queue.overflow_count(),
            batch_count: self.stats.batch_count(),
            dropped_on_shutdown: self.stats.dropped_on_shutdown(),
        }
    }
}

/// Stable grouping: groups appear in first-seen order, entries keep their
/// order within a group
pub fn group_by_routing_key(batch: Vec<Entry>) -> Vec<Entry> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<Entry>> = Vec::new();

    for entry in batch {
        let slot = match index.get(entry.routing_key()) {
            Some(slot) => *slot,
            None => {
                index.insert(entry.routing_key().to_string(), groups.len());
                groups.push(Vec::new());
                groups.len() - 1
            }
        };
        groups[slot].push(entry);
    }

    groups.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::entry::{Fields, Level, LogEntry};
    use crate::sinks::{FailingSink, MemorySink, SlowSink};

    fn log(logger: &str, message: &str) -> Entry {
        LogEntry::new(logger, Level::Info, message, None, Fields::new()).into()
    }

    fn processor(config: &PipelineConfig, sinks: Vec<SharedSink>) -> Arc<BatchProcessor> {
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let contexts = Arc::new(ContextPool::new(&CacheConfig {
            capacity: 8,
            ttl_secs: None,
        }));
        Arc::new(BatchProcessor::new(
            queue,
            config,
            sinks,
            Arc::new(PerformanceStats::new()),
            contexts,
        ))
    }

    #[test]
    fn test_group_by_routing_key_is_stable() {
        let batch = vec![
            log("a", "1"),
            log("b", "2"),
            log("a", "3"),
            log("c", "4"),
            log("b", "5"),
        ];

        let grouped: Vec<String> = group_by_routing_key(batch)
            .iter()
            .map(|e| e.as_log().unwrap().message.to_string())
            .collect();
        assert_eq!(grouped, vec!["1", "3", "2", "5", "4"]);
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failing_sink() {
        let memory = Arc::new(MemorySink::new());
        let failing = Arc::new(FailingSink::new());
        let p = processor(
            &PipelineConfig::default(),
            vec![failing.clone(), memory.clone()],
        );

        p.dispatch(vec![log("a", "x"), log("a", "y")]).await;

        assert_eq!(memory.messages(), vec!["x", "y"]);
        assert_eq!(failing.attempts(), 1);
        let stats = p.stats();
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.processed_count, 2);
        assert_eq!(stats.batch_count, 1);
    }

    #[tokio::test]
    async fn test_dispatch_times_out_slow_sink() {
        let config = PipelineConfig {
            sink_timeout_ms: 20,
            ..PipelineConfig::default()
        };
        let slow = Arc::new(SlowSink::new(Duration::from_secs(5)));
        let memory = Arc::new(MemorySink::new());
        let p = processor(&config, vec![slow.clone(), memory.clone()]);

        let started = std::time::Instant::now();
        p.dispatch(vec![log("a", "x")]).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(memory.len(), 1);
        assert!(slow.delivered().is_empty());
        assert_eq!(p.stats().error_count, 1);
    }

    #[tokio::test]
    async fn test_full_batch_flushes_immediately() {
        let config = PipelineConfig {
            batch_size: 5,
            flush_interval_ms: 200,
            worker_count: 1,
            ..PipelineConfig::default()
        };
        let memory = Arc::new(MemorySink::new());
        let p = processor(&config, vec![memory.clone()]);
        p.start(1).unwrap();

        for i in 0..5 {
            p.queue().try_enqueue(log("app", &i.to_string()));
        }

        assert!(memory.wait_for(5, Duration::from_millis(150)).await);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_after_interval() {
        let config = PipelineConfig {
            batch_size: 5,
            flush_interval_ms: 200,
            worker_count: 1,
            ..PipelineConfig::default()
        };
        let memory = Arc::new(MemorySink::new());
        let p = processor(&config, vec![memory.clone()]);
        p.start(1).unwrap();

        p.queue().try_enqueue(log("app", "a"));
        p.queue().try_enqueue(log("app", "b"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(memory.is_empty());

        assert!(memory.wait_for(2, Duration::from_secs(1)).await);
        assert_eq!(memory.batches().len(), 1);
        assert_eq!(memory.messages(), vec!["a", "b"]);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_queue() {
        let config = PipelineConfig {
            batch_size: 10,
            flush_interval_ms: 5_000,
            ..PipelineConfig::default()
        };
        let memory = Arc::new(MemorySink::new());
        let p = processor(&config, vec![memory.clone()]);

        for i in 0..25 {
            p.queue().try_enqueue(log("app", &i.to_string()));
        }
        p.start(2).unwrap();
        let report = p.stop().await;

        assert_eq!(p.queue().size(), 0);
        assert_eq!(report.dropped, 0);
        assert_eq!(memory.len(), 25);
        assert!(!p.is_running());
    }

    #[tokio::test]
    async fn test_scratch_context_is_only_taken_for_real_batches() {
        let config = PipelineConfig {
            flush_interval_ms: 10,
            ..PipelineConfig::default()
        };
        let p = processor(&config, vec![Arc::new(MemorySink::new())]);
        let (_tx, mut rx) = broadcast::channel(1);

        for _ in 0..3 {
            let mut scratch = None;
            assert!(p.drain_once(&mut rx, "worker-0", &mut scratch).await);
            assert!(scratch.is_none());
        }
        let idle = p.contexts().stats();
        assert_eq!(idle.hit_count + idle.miss_count, 0);

        p.queue().try_enqueue(log("app", "plain"));
        p.queue().try_enqueue(
            LogEntry::new(
                "app",
                Level::Info,
                "traced",
                Some("req-7".to_string()),
                Fields::new(),
            )
            .into(),
        );
        let mut scratch = None;
        assert!(p.drain_once(&mut rx, "worker-0", &mut scratch).await);

        let shared = scratch.unwrap();
        let ctx = shared.lock().unwrap();
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(ctx.fields.get("batch_size"), Some(&serde_json::json!(2)));
        assert_eq!(p.contexts().stats().miss_count, 1);
    }

    #[tokio::test]
    async fn test_start_requires_no_second_pool() {
        let p = processor(&PipelineConfig::default(), vec![]);
        p.start(2).unwrap();
        p.start(4).unwrap();
        assert_eq!(p.worker_count(), 2);
        p.stop().await;
        assert_eq!(p.worker_count(), 0);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let p = processor(&PipelineConfig::default(), vec![]);
        assert!(matches!(p.start(1), Err(PipelineError::NoRuntime(_))));
    }
}
