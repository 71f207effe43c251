use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::Sink;
use crate::entry::Entry;
use crate::error::SinkError;

/// Collects batches in memory
///
/// Useful for tests and for embedding the pipeline where entries are
/// inspected in-process.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<Entry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<Entry>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every received entry, in arrival order
    pub fn entries(&self) -> Vec<Entry> {
        self.lock().iter().flatten().cloned().collect()
    }

    /// Received batches, as delivered
    pub fn batches(&self) -> Vec<Vec<Entry>> {
        self.lock().clone()
    }

    /// Messages of received log entries, in arrival order
    pub fn messages(&self) -> Vec<String> {
        self.lock()
            .iter()
            .flatten()
            .filter_map(Entry::as_log)
            .map(|log| log.message.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Poll until at least `count` entries arrived or `timeout` elapsed.
    /// Returns whether the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn emit(&self, batch: &[Entry]) -> Result<(), SinkError> {
        self.lock().push(batch.to_vec());
        Ok(())
    }
}

/// Rejects every batch
#[derive(Debug, Default)]
pub struct FailingSink {
    attempts: AtomicU64,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn emit(&self, _batch: &[Entry]) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(SinkError::Rejected("sink is configured to fail".to_string()))
    }
}

/// Delays every batch before forwarding it to an inner [`MemorySink`]
#[derive(Debug)]
pub struct SlowSink {
    delay: Duration,
    inner: Arc<MemorySink>,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: Arc::new(MemorySink::new()),
        }
    }

    /// Entries that made it through the delay
    pub fn delivered(&self) -> Arc<MemorySink> {
        self.inner.clone()
    }
}

#[async_trait]
impl Sink for SlowSink {
    fn name(&self) -> &str {
        "slow"
    }

    async fn emit(&self, batch: &[Entry]) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.emit(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Fields, Level, LogEntry};

    fn entry(message: &str) -> Entry {
        LogEntry::new("mem", Level::Info, message, None, Fields::new()).into()
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_batches() {
        let sink = MemorySink::new();
        sink.emit(&[entry("a"), entry("b")]).await.unwrap();
        sink.emit(&[entry("c")]).await.unwrap();

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.batches().len(), 2);
        assert_eq!(sink.messages(), vec!["a", "b", "c"]);
        assert!(sink.wait_for(3, Duration::from_millis(10)).await);
        assert!(!sink.wait_for(4, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_failing_sink_counts_attempts() {
        let sink = FailingSink::new();
        assert!(sink.emit(&[entry("x")]).await.is_err());
        assert_eq!(sink.attempts(), 1);
    }
}
