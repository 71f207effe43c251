use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by pipeline lifecycle calls.
///
/// Producer-side calls (`log`, `record_metric`, cache lookups) never return
/// these; they degrade and count instead. Only `start()` reports errors, and
/// only for programmer-error class conditions.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration values that cannot drive a pipeline
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// `start()` was called outside of a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Errors a sink may return from `emit`.
///
/// A sink error never propagates past the batch processor: it is counted,
/// reported on the last-resort channel, and the batch continues to the
/// remaining sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink timed out after {0:?}")]
    Timeout(Duration),

    /// The sink refused the batch (remote collector rejected it, sink closed, ...)
    #[error("Batch rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    /// Short machine-friendly label used for metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Timeout(_) => "timeout",
            Self::Rejected(_) => "rejected",
        }
    }
}
