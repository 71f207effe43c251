/// Integration tests for the caches and metric aggregation
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::{
    aggregator::{MetricsExporter, PrometheusTextExporter},
    cache::LruCache,
    config::SinksConfig,
    labels,
    sinks::MemorySink,
    Fields, Labels, Level, MetricKind, MetricsAggregator, PipelineConfig, PipelineFacade,
};

fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        flush_interval_ms: 10,
        worker_count: 1,
        sinks: SinksConfig {
            console: false,
            file_path: None,
            file_max_bytes: None,
        },
        ..PipelineConfig::default()
    }
}

#[test]
fn test_lru_evicts_least_recently_used() {
    let cache: LruCache<String, usize> = LruCache::new("test", 3, None);
    for i in 0..3 {
        cache.get(&*format!("k{}", i), |_| i);
    }

    // Touch k0 so k1 becomes the eviction candidate
    assert_eq!(cache.get("k0", |_| 99), 0);
    cache.get("k3", |_| 3);

    assert_eq!(cache.len(), 3);
    assert!(cache.contains("k0"));
    assert!(!cache.contains("k1"));
    assert!(cache.contains("k2"));
    assert!(cache.contains("k3"));

    let stats = cache.stats();
    assert_eq!(stats.hit_count, 1);
    assert_eq!(stats.miss_count, 4);
    assert!((stats.hit_rate - 0.2).abs() < 1e-9);
}

#[test]
fn test_cache_is_safe_under_contention() {
    let cache: Arc<LruCache<String, String>> = Arc::new(LruCache::new("test", 16, None));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let key = format!("key-{}", (i + t) % 32);
                    let value = cache.get(&*key, |k| k.to_uppercase());
                    assert_eq!(value, key.to_uppercase());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(cache.len() <= 16);
    let stats = cache.stats();
    assert_eq!(stats.hit_count + stats.miss_count, 4_000);
}

#[test]
fn test_percentiles_over_one_to_ten() {
    let aggregator = MetricsAggregator::default();
    let none = Labels::new();
    for v in 1..=10 {
        aggregator.record_histogram("latency", v as f64, &none);
    }

    let metric = aggregator.get("latency", &none).unwrap();
    assert_eq!(metric.count, 10);
    assert_eq!(metric.min, 1.0);
    assert_eq!(metric.max, 10.0);
    assert!((metric.avg - 5.5).abs() < 1e-9);
    assert!((metric.p50.unwrap() - 5.5).abs() < 1e-9);
    assert!((metric.p95.unwrap() - 9.55).abs() < 1e-9);
    assert!((metric.p99.unwrap() - 9.91).abs() < 1e-9);
}

#[test]
fn test_concurrent_counter_updates_are_not_lost() {
    let aggregator = Arc::new(MetricsAggregator::default());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let aggregator = aggregator.clone();
            std::thread::spawn(move || {
                let route = labels([("route", "/a")]);
                for _ in 0..2_500 {
                    aggregator.increment_counter("hits", 1.0, &route);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let metric = aggregator.get("hits", &labels([("route", "/a")])).unwrap();
    assert_eq!(metric.value, 10_000.0);
}

#[tokio::test]
async fn test_facade_metrics_reach_aggregator_and_exporter() {
    let memory = Arc::new(MemorySink::new());
    let pipeline = PipelineFacade::new(quiet_config(), vec![memory.clone()]);
    pipeline.start().unwrap();

    pipeline.record_metric(
        MetricKind::Counter,
        "requests_total",
        1.0,
        labels([("method", "GET")]),
    );
    pipeline.record_metric(
        MetricKind::Counter,
        "requests_total",
        2.0,
        labels([("method", "GET")]),
    );
    let slow = pipeline.record_timing(
        "db_query",
        Duration::from_millis(1_500),
        labels([("table", "users")]),
    );
    assert!(slow);

    pipeline.stop().await;

    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(snapshot["requests_total{method=GET}"].value, 3.0);
    assert_eq!(snapshot["db_query{table=users}"].count, 1);
    assert_eq!(snapshot["slow_operations_total{metric=db_query}"].value, 1.0);

    let text = PrometheusTextExporter::new().export(&snapshot);
    assert!(text.contains("# TYPE requests_total counter"));
    assert!(text.contains("requests_total{method=\"GET\"} 3"));
    assert_eq!(text, pipeline.render_prometheus());

    let slow_entries: Vec<_> = memory
        .entries()
        .iter()
        .filter_map(|e| e.as_metric().cloned())
        .filter(|m| m.slow)
        .collect();
    assert_eq!(slow_entries.len(), 1);
    assert_eq!(&*slow_entries[0].name, "db_query");
    assert_eq!(pipeline.performance_stats().slow_operations, 1);
}

#[tokio::test]
async fn test_logger_levels_and_cache_hit_rates() {
    let memory = Arc::new(MemorySink::new());
    let mut levels = HashMap::new();
    levels.insert("noisy".to_string(), Level::Error);
    let config = PipelineConfig {
        logger_levels: levels,
        ..quiet_config()
    };
    let pipeline = PipelineFacade::new(config, vec![memory.clone()]);
    pipeline.start().unwrap();

    for _ in 0..5 {
        pipeline.log("noisy.child", Level::Warn, "filtered", Fields::new());
        pipeline.log("app", Level::Info, "kept", Fields::new());
    }
    pipeline.stop().await;

    assert_eq!(memory.messages(), vec!["kept"; 5]);

    // Two distinct loggers, ten lookups
    let health = pipeline.health_status();
    assert!((health.cache_hit_rates.logger - 0.8).abs() < 1e-9);
    // One interned message, five lookups
    assert!((health.cache_hit_rates.message - 0.8).abs() < 1e-9);

    pipeline.reset_performance_stats();
    let perf = pipeline.performance_stats();
    assert_eq!(perf.cache_hits, 0);
    assert_eq!(perf.entries_processed, 0);
}
