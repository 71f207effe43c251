//! Unbatched dispatch
//!
//! With batching disabled, every entry goes to the sinks on its own, in
//! submission order. Producers still never block: entries travel over an
//! unbounded channel to one background task that emits them one by one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::processor::BatchProcessor;
use crate::entry::Entry;

const LOG_TARGET: &str = "telemetry_pipeline::direct";

struct Running {
    sender: mpsc::UnboundedSender<Entry>,
    task: JoinHandle<usize>,
}

/// Single-task dispatcher used when batching is disabled
#[derive(Default)]
pub struct DirectDispatcher {
    running: Mutex<Option<Running>>,
    /// Sent but not yet emitted
    pending: Arc<AtomicUsize>,
}

impl DirectDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the dispatch task. Entries already sitting in the processor's
    /// queue are sent first.
    pub fn start_on(&self, handle: &Handle, processor: Arc<BatchProcessor>) {
        let mut running = self.lock();
        if running.is_some() {
            return;
        }

        let (sender, rx) = mpsc::unbounded_channel();
        let task = handle.spawn(dispatch_task(processor, rx, self.pending.clone()));
        *running = Some(Running { sender, task });
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Hand an entry to the dispatch task (non-blocking).
    ///
    /// Gives the entry back when the dispatcher is not running.
    pub fn send(&self, entry: Entry) -> Result<(), Entry> {
        match self.lock().as_ref() {
            Some(running) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                running.sender.send(entry).map_err(|e| {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    e.0
                })
            }
            None => Err(entry),
        }
    }

    /// Close the channel and wait (until `deadline`) for the task to emit
    /// everything already sent. Returns the number of entries abandoned.
    pub async fn stop(&self, deadline: Instant) -> usize {
        let Some(Running { sender, mut task }) = self.lock().take() else {
            return 0;
        };
        // Closing the channel lets the task finish once it is empty
        drop(sender);

        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(_)) => 0,
            Ok(Err(e)) => {
                tracing::error!(target: LOG_TARGET, error = %e, "Direct dispatch task failed");
                0
            }
            Err(_) => {
                let abandoned = self.pending.swap(0, Ordering::SeqCst);
                task.abort();
                tracing::warn!(
                    target: LOG_TARGET,
                    abandoned,
                    "Direct dispatcher did not finish within the grace period, aborting"
                );
                abandoned
            }
        }
    }
}

async fn dispatch_task(
    processor: Arc<BatchProcessor>,
    mut rx: mpsc::UnboundedReceiver<Entry>,
    pending: Arc<AtomicUsize>,
) -> usize {
    let mut emitted = 0;

    for entry in processor.queue().drain_all() {
        processor.dispatch(vec![entry]).await;
        emitted += 1;
    }

    while let Some(entry) = rx.recv().await {
        processor.dispatch(vec![entry]).await;
        pending.fetch_sub(1, Ordering::SeqCst);
        emitted += 1;
    }

    tracing::debug!(target: LOG_TARGET, emitted, "Direct dispatcher shutting down");
    emitted
}
