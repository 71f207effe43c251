use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals shared by every pipeline component
///
/// Counters only move forward until [`PerformanceStats::reset`] is called.
#[derive(Debug, Default)]
pub struct PerformanceStats {
    entries_processed: AtomicU64,
    batches: AtomicU64,
    sink_errors: AtomicU64,
    worker_failures: AtomicU64,
    dropped_on_shutdown: AtomicU64,
    slow_operations: AtomicU64,
}

/// Point-in-time copy of [`PerformanceStats`] plus cache and queue totals
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub entries_processed: u64,
    pub batch_count: u64,
    pub sink_errors: u64,
    pub worker_failures: u64,
    pub dropped_on_shutdown: u64,
    pub slow_operations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub queue_overflow: u64,
}

impl PerformanceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, entries: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.entries_processed
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn record_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_failure(&self) {
        self.worker_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shutdown_loss(&self, entries: usize) {
        self.dropped_on_shutdown
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn record_slow_operation(&self) {
        self.slow_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entries_processed(&self) -> u64 {
        self.entries_processed.load(Ordering::Relaxed)
    }

    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn sink_errors(&self) -> u64 {
        self.sink_errors.load(Ordering::Relaxed)
    }

    pub fn worker_failures(&self) -> u64 {
        self.worker_failures.load(Ordering::Relaxed)
    }

    pub fn dropped_on_shutdown(&self) -> u64 {
        self.dropped_on_shutdown.load(Ordering::Relaxed)
    }

    /// Copy of the counters; cache and queue fields are left at zero for
    /// the owner to fill in
    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            entries_processed: self.entries_processed(),
            batch_count: self.batch_count(),
            sink_errors: self.sink_errors(),
            worker_failures: self.worker_failures(),
            dropped_on_shutdown: self.dropped_on_shutdown(),
            slow_operations: self.slow_operations.load(Ordering::Relaxed),
            ..PerformanceSnapshot::default()
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.entries_processed,
            &self.batches,
            &self.sink_errors,
            &self.worker_failures,
            &self.dropped_on_shutdown,
            &self.slow_operations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
