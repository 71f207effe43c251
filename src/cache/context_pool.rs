use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

use super::{CacheStats, LruCache};
use crate::config::CacheConfig;
use crate::entry::Fields;

/// Reusable scratch context keyed by an identifier (e.g. a worker or route)
#[derive(Debug, Default)]
pub struct PooledContext {
    key: String,
    pub correlation_id: Option<String>,
    pub fields: Fields,
    uses: u64,
}

impl PooledContext {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Times this context has been handed out by the pool
    pub fn uses(&self) -> u64 {
        self.uses
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key, value);
    }

    /// Clear per-use state; the key and use counter survive
    pub fn reset(&mut self) {
        self.correlation_id = None;
        self.fields.clear();
    }
}

pub type SharedContext = Arc<Mutex<PooledContext>>;

pub struct ContextPool {
    cache: LruCache<String, SharedContext>,
}

impl ContextPool {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            cache: LruCache::new("context", config.capacity, config.ttl()),
        }
    }

    /// Hand out the context for `key`, creating it on first use.
    ///
    /// A reused context is reset before it is returned.
    pub fn acquire(&self, key: &str) -> SharedContext {
        let shared = self
            .cache
            .get(key, |key| Arc::new(Mutex::new(PooledContext::new(key))));

        {
            let mut ctx = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if ctx.uses > 0 {
                ctx.reset();
            }
            ctx.uses += 1;
        }
        shared
    }

    pub fn release(&self, key: &str) {
        self.cache.remove(key);
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
