use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::entry::Level;

/// Environment variable prefix, e.g. `TELEMETRY_PIPELINE__BATCH_SIZE=500`
pub const ENV_PREFIX: &str = "TELEMETRY_PIPELINE";

/// Default histogram bucket bounds, in milliseconds
pub const DEFAULT_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of pending entries before producers start dropping
    pub queue_capacity: usize,
    /// Maximum entries per dispatched batch
    pub batch_size: usize,
    /// Maximum time a partially filled batch waits before dispatch
    pub flush_interval_ms: u64,
    /// Background drain workers
    pub worker_count: usize,
    /// When false, entries bypass the queue and go straight to the sinks
    pub batching_enabled: bool,
    /// Upper bound on `stop()` (worker join + final flush)
    pub shutdown_grace_ms: u64,
    /// Upper bound on a single `Sink::emit` call
    pub sink_timeout_ms: u64,
    /// Group each batch by logger / metric name before dispatch
    pub group_by_logger: bool,
    /// Samples retained per histogram series
    pub histogram_window: usize,
    /// Bucket upper bounds used when rendering histograms
    pub histogram_buckets: Vec<f64>,
    /// Timings at or above this value are flagged as slow
    pub slow_threshold_ms: f64,
    /// Level applied to loggers without an explicit override
    pub default_level: Level,
    /// Per-logger level overrides, matched by exact name or dotted prefix
    pub logger_levels: HashMap<String, Level>,
    /// Messages longer than this are not interned in the message cache
    pub message_intern_max_len: usize,
    pub caches: CachesConfig,
    pub sinks: SinksConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CachesConfig {
    pub logger: CacheConfig,
    pub message: CacheConfig,
    pub context: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub capacity: usize,
    /// Entries older than this are rebuilt on access
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SinksConfig {
    /// Write JSON lines to stdout
    pub console: bool,
    /// Append JSON lines to this file
    pub file_path: Option<String>,
    /// Rotate the file once it grows past this many bytes
    pub file_max_bytes: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval_ms: 100,
            worker_count: 2,
            batching_enabled: true,
            shutdown_grace_ms: 5_000,
            sink_timeout_ms: 2_000,
            group_by_logger: true,
            histogram_window: 1_000,
            histogram_buckets: DEFAULT_BUCKETS.to_vec(),
            slow_threshold_ms: 1_000.0,
            default_level: Level::Info,
            logger_levels: HashMap::new(),
            message_intern_max_len: 256,
            caches: CachesConfig::default(),
            sinks: SinksConfig::default(),
        }
    }
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            logger: CacheConfig {
                capacity: 1_000,
                ttl_secs: None,
            },
            message: CacheConfig {
                capacity: 1_000,
                ttl_secs: None,
            },
            context: CacheConfig {
                capacity: 100,
                ttl_secs: None,
            },
        }
    }
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            console: true,
            file_path: None,
            file_max_bytes: None,
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    /// Resolve the level threshold for a logger name.
    ///
    /// The longest matching override wins; `a.b` matches loggers `a.b` and
    /// `a.b.c` but not `a.bc`.
    pub fn level_for(&self, logger_name: &str) -> Level {
        resolve_level(&self.logger_levels, self.default_level, logger_name)
    }
}

/// Longest-prefix match of `logger_name` against `overrides`
pub fn resolve_level(
    overrides: &HashMap<String, Level>,
    default_level: Level,
    logger_name: &str,
) -> Level {
    overrides
        .iter()
        .filter(|(prefix, _)| {
            logger_name == prefix.as_str()
                || (logger_name.starts_with(prefix.as_str())
                    && logger_name[prefix.len()..].starts_with(['.', ':']))
        })
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, level)| *level)
        .unwrap_or(default_level)
}

/// Load configuration from an optional file plus `TELEMETRY_PIPELINE__*`
/// environment variables, then validate it.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let cfg: PipelineConfig = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &PipelineConfig) -> anyhow::Result<()> {
    if cfg.queue_capacity == 0 {
        anyhow::bail!("queue_capacity must be greater than 0");
    }

    if cfg.batch_size == 0 {
        anyhow::bail!("batch_size must be greater than 0");
    }

    if cfg.flush_interval_ms == 0 {
        anyhow::bail!("flush_interval_ms must be greater than 0");
    }

    if cfg.batching_enabled && cfg.worker_count == 0 {
        anyhow::bail!("worker_count must be greater than 0 when batching is enabled");
    }

    if cfg.histogram_window == 0 {
        anyhow::bail!("histogram_window must be greater than 0");
    }

    for (name, cache) in [
        ("logger", &cfg.caches.logger),
        ("message", &cfg.caches.message),
        ("context", &cfg.caches.context),
    ] {
        if cache.capacity == 0 {
            anyhow::bail!("caches.{}.capacity must be greater than 0", name);
        }
    }

    if cfg
        .histogram_buckets
        .windows(2)
        .any(|pair| pair[0] >= pair[1])
    {
        anyhow::bail!("histogram_buckets must be strictly increasing");
    }

    if cfg.histogram_buckets.iter().any(|b| !b.is_finite()) {
        anyhow::bail!("histogram_buckets must be finite (+Inf is implicit)");
    }

    if cfg.slow_threshold_ms.is_nan() || cfg.slow_threshold_ms < 0.0 {
        anyhow::bail!("slow_threshold_ms must be a non-negative number");
    }

    Ok(())
}
