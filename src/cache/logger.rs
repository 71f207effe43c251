use std::collections::HashMap;
use std::sync::Arc;

use super::{CacheStats, LruCache};
use crate::config::{resolve_level, PipelineConfig};
use crate::entry::Level;

/// A named logger with its resolved level threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logger {
    name: Arc<str>,
    min_level: Level,
}

impl Logger {
    pub fn new(name: impl Into<Arc<str>>, min_level: Level) -> Self {
        Self {
            name: name.into(),
            min_level,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared name, cloned into every entry this logger produces
    pub fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn min_level(&self) -> Level {
        self.min_level
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }
}

/// Logger name -> `Arc<Logger>`, resolving level overrides once per name
pub struct LoggerCache {
    cache: LruCache<String, Arc<Logger>>,
    default_level: Level,
    overrides: HashMap<String, Level>,
}

impl LoggerCache {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            cache: LruCache::new(
                "logger",
                config.caches.logger.capacity,
                config.caches.logger.ttl(),
            ),
            default_level: config.default_level,
            overrides: config.logger_levels.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Arc<Logger> {
        self.cache.get(name, |name| {
            Arc::new(Logger::new(
                name,
                resolve_level(&self.overrides, self.default_level, name),
            ))
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn reset_stats(&self) {
        self.cache.reset_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_returns_same_instance() {
        let cache = LoggerCache::new(&PipelineConfig::default());
        let a = cache.get("app.http");
        let b = cache.get("app.http");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().hit_count, 1);
    }

    #[test]
    fn test_levels_resolved_from_overrides() {
        let mut config = PipelineConfig::default();
        config.logger_levels.insert("noisy".to_string(), Level::Error);
        let cache = LoggerCache::new(&config);

        let noisy = cache.get("noisy.worker");
        assert_eq!(noisy.min_level(), Level::Error);
        assert!(!noisy.enabled(Level::Warn));
        assert!(noisy.enabled(Level::Critical));

        let quiet = cache.get("api");
        assert_eq!(quiet.min_level(), Level::Info);
        assert!(!quiet.enabled(Level::Debug));
        assert!(quiet.enabled(Level::Info));
    }
}
