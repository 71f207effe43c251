use anyhow::Result;
use colored::Colorize;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::{
    config, correlation, init_tracing_with_pipeline, labels, metrics, signals, Fields, Level,
    MetricKind, PipelineFacade,
};
use tokio::sync::broadcast;
use tracing::info;

/// Synthetic workload settings
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub duration: u64,
    pub rate: u64,
    pub producers: usize,
    pub quiet: bool,
    pub json_logs: bool,
}

const ROUTES: [&str; 4] = ["/orders", "/checkout", "/search", "/health"];

/// Execute the run command
///
/// This will:
/// 1. Load configuration and build the pipeline
/// 2. Install tracing with the pipeline layer attached
/// 3. Drive `producers` tasks for `duration` seconds (or until SIGINT/SIGTERM)
/// 4. Stop the pipeline and print health, self-telemetry and aggregated metrics
pub async fn execute(config_path: &Path, options: RunOptions) -> Result<()> {
    let mut cfg = config::load_config(Some(config_path))?;
    if options.quiet {
        cfg.sinks.console = false;
    }

    let pipeline = Arc::new(PipelineFacade::from_config(cfg));
    init_tracing_with_pipeline(pipeline.clone(), options.json_logs);

    let prometheus = match metrics::init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Self-telemetry disabled");
            None
        }
    };

    pipeline.start()?;
    info!(
        producers = options.producers,
        rate = options.rate,
        duration_secs = options.duration,
        "Starting synthetic workload"
    );

    let (shutdown_tx, signal_task) = signals::setup_signal_handlers();

    let producers: Vec<_> = (0..options.producers)
        .map(|id| {
            let pipeline = pipeline.clone();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(produce(id, pipeline, options.clone(), shutdown))
        })
        .collect();

    let mut produced = 0u64;
    for producer in producers {
        produced += producer.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Producer task failed");
            0
        });
    }
    signal_task.abort();

    let report = pipeline.stop().await;
    let health = pipeline.health_status();

    println!();
    println!("{}", "Workload complete".green().bold());
    println!("  {}: {}", "Produced".cyan(), produced);
    println!("  {}: {}", "Processed".cyan(), health.processed);
    println!("  {}: {}", "Overflowed".cyan(), health.overflow_count);
    println!("  {}: {}", "Lost on shutdown".cyan(), report.dropped);
    println!();
    println!("{}", "Health:".bold());
    println!("{}", serde_json::to_string_pretty(&health)?);
    println!();
    println!("{}", "Performance:".bold());
    println!(
        "{}",
        serde_json::to_string_pretty(&pipeline.performance_stats())?
    );
    println!();
    println!("{}", "Aggregated metrics:".bold());
    print!("{}", pipeline.render_prometheus());

    if let Some(handle) = prometheus {
        println!();
        println!("{}", "Pipeline self-telemetry:".bold());
        print!("{}", handle.render());
    }

    Ok(())
}

/// One producer: a correlation context per simulated request, a log entry
/// through the tracing bridge, and a timing per request
async fn produce(
    id: usize,
    pipeline: Arc<PipelineFacade>,
    options: RunOptions,
    mut shutdown: broadcast::Receiver<signals::ShutdownSignal>,
) -> u64 {
    let period = Duration::from_micros(1_000_000 / options.rate.max(1));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(options.duration);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut produced = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            _ = ticker.tick() => {}
        }

        let (route, latency_ms, failed) = {
            let mut rng = rand::thread_rng();
            (
                ROUTES[rng.gen_range(0..ROUTES.len())],
                rng.gen_range(1.0..1_500.0_f64),
                rng.gen_bool(0.05),
            )
        };

        let ctx = correlation::CorrelationContext::new();
        correlation::scope(Some(ctx), async {
            correlation::set_metadata("producer", id);

            if failed {
                tracing::error!(target: "demo.http", route, latency_ms, "request failed");
            } else {
                tracing::info!(target: "demo.http", route, latency_ms, "request handled");
            }

            pipeline.log(
                "demo.db",
                Level::Info,
                "query executed",
                Fields::new().with("route", route).with("duration_ms", latency_ms / 3.0),
            );
            pipeline.record_timing(
                "request_duration_ms",
                Duration::from_secs_f64(latency_ms / 1_000.0),
                labels([("route", route)]),
            );
            pipeline.record_metric(
                MetricKind::Counter,
                "requests_total",
                1.0,
                labels([("route", route), ("status", if failed { "500" } else { "200" })]),
            );
        })
        .await;

        produced += 1;
    }

    produced
}
