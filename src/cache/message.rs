use std::sync::Arc;

use super::{CacheStats, LruCache};
use crate::config::CacheConfig;

/// Interns repeated log messages as shared `Arc<str>`
///
/// Messages longer than `max_len` are usually unique (formatted payloads,
/// stack traces) and bypass the cache entirely.
pub struct MessageCache {
    cache: LruCache<String, Arc<str>>,
    max_len: usize,
}

impl MessageCache {
    pub fn new(config: &CacheConfig, max_len: usize) -> Self {
        Self {
            cache: LruCache::new("message", config.capacity, config.ttl()),
            max_len,
        }
    }

    pub fn intern(&self, message: &str) -> Arc<str> {
        if message.len() > self.max_len {
            return Arc::from(message);
        }
        self.cache.get(message, |m| Arc::from(m))
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
