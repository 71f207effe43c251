use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::processor::BatchProcessor;

const LOG_TARGET: &str = "telemetry_pipeline::worker";

/// Shutdown signal types
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    /// Finish the current batch, then leave the loop
    Graceful,
}

/// What a stop left behind
#[derive(Debug, Clone, Copy, Default)]
pub struct Stranded {
    /// Workers aborted after the deadline
    pub aborted: usize,
    /// Entries those workers were holding
    pub entries: usize,
}

/// Background drain loops sharing one processor
pub struct WorkerPool {
    shutdown: broadcast::Sender<ShutdownSignal>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` drain loops on `handle`
    pub fn start(processor: Arc<BatchProcessor>, worker_count: usize, handle: &Handle) -> Self {
        let (shutdown, _) = broadcast::channel(16);

        let handles = (0..worker_count)
            .map(|id| {
                let rx = shutdown.subscribe();
                handle.spawn(worker_loop(id, processor.clone(), rx))
            })
            .collect();

        tracing::debug!(target: LOG_TARGET, workers = worker_count, "Worker pool started");

        Self { shutdown, handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait for them until `deadline`.
    ///
    /// Workers still running at the deadline are aborted; `in_flight` is
    /// read first so the entries they held can be reported as lost.
    pub async fn stop(self, deadline: Instant, in_flight: &AtomicUsize) -> Stranded {
        // No receivers left means every worker already exited
        let _ = self.shutdown.send(ShutdownSignal::Graceful);

        let mut stranded = Stranded::default();
        let mut handles = self.handles.into_iter();

        while let Some(mut handle) = handles.next() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(target: LOG_TARGET, error = %e, "Worker task failed");
                }
                Err(_) => {
                    stranded.entries = in_flight.load(Ordering::SeqCst);
                    let rest: Vec<JoinHandle<()>> =
                        std::iter::once(handle).chain(handles.by_ref()).collect();
                    stranded.aborted = rest.iter().filter(|h| !h.is_finished()).count();
                    for h in rest {
                        h.abort();
                    }
                    tracing::warn!(
                        target: LOG_TARGET,
                        aborted = stranded.aborted,
                        in_flight = stranded.entries,
                        "Workers did not stop within the grace period, aborting"
                    );
                    break;
                }
            }
        }

        stranded
    }
}

async fn worker_loop(
    id: usize,
    processor: Arc<BatchProcessor>,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    let scratch_key = format!("worker-{}", id);
    tracing::debug!(target: LOG_TARGET, worker = id, "Worker started");

    loop {
        let mut scratch = None;
        let iteration =
            AssertUnwindSafe(processor.drain_once(&mut shutdown, &scratch_key, &mut scratch))
                .catch_unwind()
                .await;

        match iteration {
            Ok(true) => {}
            Ok(false) => break,
            Err(panic) => {
                processor.performance().record_worker_failure();
                let (correlation_id, context) = match &scratch {
                    Some(shared) => {
                        let ctx = shared.lock().unwrap_or_else(PoisonError::into_inner);
                        let fields = ctx
                            .fields
                            .iter()
                            .map(|(k, v)| format!("{}={}", k, v))
                            .collect::<Vec<_>>()
                            .join(" ");
                        (ctx.correlation_id.clone(), fields)
                    }
                    None => (None, String::new()),
                };
                tracing::error!(
                    target: LOG_TARGET,
                    worker = id,
                    panic = panic_message(panic.as_ref()),
                    correlation_id = correlation_id.as_deref().unwrap_or("-"),
                    context = %context,
                    "Worker iteration panicked, batch lost"
                );
            }
        }
    }

    tracing::debug!(target: LOG_TARGET, worker = id, "Worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
