//! Correlation context propagation
//!
//! Each logical task (a request handler, a background job) carries at most
//! one [`CorrelationContext`]. The binding lives in a tokio task-local when
//! the caller runs inside [`scope`] / [`run_with_snapshot`], and in a
//! thread-local otherwise.
//!
//! Task-locals do not follow work across `tokio::spawn`, so crossing a task
//! boundary is explicit: capture a [`Snapshot`] in the parent and install it
//! in the child with [`run_with_snapshot`], or use [`spawn_with_context`].
//! A snapshot is a deep copy, so the child can mutate its metadata without
//! affecting the parent.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;
use uuid::Uuid;

tokio::task_local! {
    static TASK_CONTEXT: RefCell<Option<CorrelationContext>>;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<CorrelationContext>> = const { RefCell::new(None) };
}

/// Correlation identifier plus free-form metadata for one logical task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CorrelationContext {
    /// New context with a freshly generated id
    pub fn new() -> Self {
        Self::with_id(generate())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: Map::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque by-value capture of the current task's context
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    context: Option<CorrelationContext>,
}

impl Snapshot {
    /// Snapshot that installs no context
    pub fn empty() -> Self {
        Self { context: None }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.context.as_ref().map(|ctx| ctx.id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_none()
    }
}

impl From<CorrelationContext> for Snapshot {
    fn from(context: CorrelationContext) -> Self {
        Self {
            context: Some(context),
        }
    }
}

/// Restores the previously bound context when dropped
///
/// The guard is `!Send`: it must be dropped on the thread / task that
/// created it. Use [`scope`] to bind a context across `.await` points.
#[must_use = "the context is unbound as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<CorrelationContext>,
    id: String,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    /// Id of the context installed by this guard
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        try_with_slot((), |slot| {
            slot.try_borrow_mut().ok().map(|mut ctx| {
                *ctx = previous;
            })
        });
    }
}

/// Run `f` against the active slot: the task-local if one is in scope, the
/// thread-local otherwise. A failure to reach storage (thread teardown, a
/// re-entrant borrow) degrades to `fallback`.
fn try_with_slot<R>(
    fallback: R,
    f: impl FnOnce(&RefCell<Option<CorrelationContext>>) -> Option<R>,
) -> R {
    let result = if TASK_CONTEXT.try_with(|_| ()).is_ok() {
        TASK_CONTEXT.try_with(|slot| f(slot)).ok().flatten()
    } else {
        THREAD_CONTEXT.try_with(|slot| f(slot)).ok().flatten()
    };

    match result {
        Some(value) => value,
        None => {
            tracing::debug!(
                target: "telemetry_pipeline::correlation",
                "Correlation storage unavailable, continuing without context"
            );
            fallback
        }
    }
}

/// Context bound to the calling task, if any
pub fn current() -> Option<CorrelationContext> {
    try_with_slot(None, |slot| {
        slot.try_borrow().ok().map(|ctx| ctx.as_ref().cloned())
    })
}

/// Id of the context bound to the calling task, if any
pub fn current_id() -> Option<String> {
    try_with_slot(None, |slot| {
        slot.try_borrow()
            .ok()
            .map(|ctx| ctx.as_ref().map(|c| c.id.clone()))
    })
}

/// Set a metadata key on the current context. Returns false when no
/// context is bound.
pub fn set_metadata(key: impl Into<String>, value: impl Into<Value>) -> bool {
    let key = key.into();
    let value = value.into();
    try_with_slot(false, |slot| {
        let mut guard = slot.try_borrow_mut().ok()?;
        Some(match guard.as_mut() {
            Some(ctx) => {
                ctx.metadata.insert(key, value);
                true
            }
            None => false,
        })
    })
}

/// Unbind the current context
pub fn clear() {
    try_with_slot((), |slot| {
        slot.try_borrow_mut().ok().map(|mut ctx| {
            *ctx = None;
        })
    })
}

/// Generate a correlation id.
///
/// UUID v4 from the OS RNG. If the RNG fails, falls back to an id derived
/// from the monotonic clock and a process-wide counter so generation never
/// fails.
pub fn generate() -> String {
    let mut bytes = [0u8; 16];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string(),
        Err(e) => {
            tracing::warn!(
                target: "telemetry_pipeline::correlation",
                error = %e,
                "OS RNG unavailable, using clock-derived correlation id"
            );
            fallback_id()
        }
    }
}

fn fallback_id() -> String {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let origin = ORIGIN.get_or_init(Instant::now);
    let nanos = origin.elapsed().as_nanos();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("mono-{:x}-{:x}-{:x}", std::process::id(), nanos, seq)
}

/// Parse a correlation id, accepting any non-empty string; UUIDs are
/// normalised to their hyphenated lowercase form.
pub fn normalize_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        Uuid::parse_str(trimmed)
            .map(|id| id.to_string())
            .unwrap_or_else(|_| trimmed.to_string()),
    )
}

/// Install `ctx` (or a fresh context) until the returned guard drops
pub fn with_context(ctx: Option<CorrelationContext>) -> ContextGuard {
    let ctx = ctx.unwrap_or_default();
    let id = ctx.id.clone();
    let previous = try_with_slot(None, |slot| {
        let mut guard = slot.try_borrow_mut().ok()?;
        Some(guard.replace(ctx))
    });

    ContextGuard {
        previous,
        id,
        _not_send: PhantomData,
    }
}

/// Capture the current context by value
pub fn snapshot() -> Snapshot {
    Snapshot { context: current() }
}

/// Run `future` with `ctx` (or a fresh context) bound for its whole
/// lifetime, across `.await` points
pub async fn scope<F>(ctx: Option<CorrelationContext>, future: F) -> F::Output
where
    F: Future,
{
    let ctx = ctx.unwrap_or_default();
    TASK_CONTEXT.scope(RefCell::new(Some(ctx)), future).await
}

/// Run `future` with the snapshot installed, ignoring the caller's context
pub async fn run_with_snapshot<F>(snapshot: Snapshot, future: F) -> F::Output
where
    F: Future,
{
    TASK_CONTEXT
        .scope(RefCell::new(snapshot.context), future)
        .await
}

/// Synchronous counterpart of [`run_with_snapshot`]
pub fn run_with_snapshot_sync<R>(snapshot: Snapshot, f: impl FnOnce() -> R) -> R {
    TASK_CONTEXT.sync_scope(RefCell::new(snapshot.context), f)
}

/// Spawn a tokio task that inherits a copy of the caller's context
pub fn spawn_with_context<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let snapshot = snapshot();
    tokio::spawn(run_with_snapshot(snapshot, future))
}
