pub mod aggregator;
pub mod cache;
pub mod config;
pub mod correlation;
pub mod entry;
pub mod error;
pub mod layer;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod signals;
pub mod sinks;

pub use aggregator::{AggregatedMetric, MetricsAggregator, MetricsSnapshot};
pub use config::{load_config, PipelineConfig};
pub use correlation::{CorrelationContext, Snapshot};
pub use entry::{labels, Entry, Fields, Labels, Level, LogEntry, MetricEntry, MetricKind};
pub use error::{PipelineError, SinkError};
pub use layer::PipelineLayer;
pub use pipeline::{HealthStatus, PipelineFacade, ShutdownReport};
pub use queue::BoundedQueue;
pub use sinks::{Sink, SharedSink};

use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing/logging
///
/// Note: This function can only be called once per process.
pub fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(env_filter());

    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Initialize tracing with application events also forwarded into
/// `pipeline`
///
/// # Arguments
///
/// * `pipeline` - Pipeline receiving every non-internal event
/// * `json` - Emit console diagnostics as JSON
///
/// # Notes
///
/// Like [`init_tracing`], this installs the global subscriber and can only
/// succeed once. A second call leaves the existing subscriber in place.
pub fn init_tracing_with_pipeline(pipeline: Arc<PipelineFacade>, json: bool) {
    let pipeline_layer = PipelineLayer::new(pipeline);
    let registry = tracing_subscriber::registry()
        .with(env_filter())
        .with(pipeline_layer);

    let result = if json {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_target(true)),
        )
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
    };

    match result {
        Ok(_) => {
            tracing::debug!(target: "telemetry_pipeline", "Pipeline layer added to tracing subscriber");
        }
        Err(e) => {
            eprintln!("Warning: Failed to install tracing subscriber: {}", e);
            eprintln!("Application events will not be forwarded to the pipeline");
        }
    }
}
