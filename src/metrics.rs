use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder for the pipeline's own counters.
///
/// Fails if a global recorder is already installed (e.g., in tests).
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    init_metric_descriptions();

    Ok(handle)
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "telemetry_pipeline_entries_processed_total",
        "Entries delivered to at least one sink attempt"
    );
    describe_counter!(
        "telemetry_pipeline_entries_dropped_total",
        "Entries dropped by overflow, shutdown or missing runtime"
    );
    describe_counter!(
        "telemetry_pipeline_sink_errors_total",
        "Failed or timed-out sink dispatches"
    );
    describe_counter!(
        "telemetry_pipeline_batches_total",
        "Batches dispatched"
    );
    describe_histogram!(
        "telemetry_pipeline_batch_flush_seconds",
        "Time spent dispatching one batch to all sinks"
    );
    describe_counter!(
        "telemetry_pipeline_cache_lookups_total",
        "Cache lookups by cache and result"
    );
    describe_gauge!(
        "telemetry_pipeline_info",
        "Pipeline version information"
    );

    gauge!("telemetry_pipeline_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Record entries handed to the sinks
pub fn record_processed(count: usize) {
    counter!("telemetry_pipeline_entries_processed_total").increment(count as u64);
}

/// Record dropped entries; `reason` is `overflow` or `shutdown`
pub fn record_dropped(reason: &'static str, count: u64) {
    counter!("telemetry_pipeline_entries_dropped_total", "reason" => reason).increment(count);
}

/// Record a sink failure
pub fn record_sink_error(sink: &str, kind: &'static str) {
    counter!(
        "telemetry_pipeline_sink_errors_total",
        "sink" => sink.to_string(),
        "kind" => kind,
    )
    .increment(1);
}

/// Record one dispatched batch and its flush duration
pub fn record_batch(duration: Duration) {
    counter!("telemetry_pipeline_batches_total").increment(1);
    histogram!("telemetry_pipeline_batch_flush_seconds").record(duration.as_secs_f64());
}

/// Record a cache lookup
pub fn record_cache_lookup(cache: &'static str, hit: bool) {
    counter!(
        "telemetry_pipeline_cache_lookups_total",
        "cache" => cache,
        "result" => if hit { "hit" } else { "miss" },
    )
    .increment(1);
}
