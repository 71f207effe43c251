//! Capacity-bounded LRU caches
//!
//! [`LruCache`] is the shared building block; [`LoggerCache`],
//! [`MessageCache`] and [`ContextPool`] are the three instantiations the
//! pipeline uses.
//!
//! Recency is a logical tick bumped on every access. Eviction scans for the
//! smallest tick, which is O(n) but n is bounded by the configured capacity.

mod context_pool;
mod logger;
mod message;

pub use context_pool::{ContextPool, PooledContext, SharedContext};
pub use logger::{Logger, LoggerCache};
pub use message::MessageCache;

use serde::Serialize;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    last_access: u64,
    access_count: u64,
    inserted_at: Instant,
}

#[derive(Debug)]
struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    tick: u64,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_lru(&mut self) -> bool
    where
        K: Clone,
    {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());

        match oldest {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }
}

pub struct LruCache<K, V> {
    name: &'static str,
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum 1)
    ///
    /// # Arguments
    /// * `name` - Label used in self-telemetry (`cache="<name>"`)
    /// * `capacity` - Maximum number of entries
    /// * `ttl` - Entries older than this are rebuilt on access
    pub fn new(name: &'static str, capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        self.ttl
            .map(|ttl| entry.inserted_at.elapsed() >= ttl)
            .unwrap_or(false)
    }

    /// Look up `key`, building the value with `factory` on a miss.
    ///
    /// The factory runs without the cache lock held. If another caller
    /// inserted the same key meanwhile, their value wins and ours is
    /// discarded.
    pub fn get<Q>(&self, key: &Q, factory: impl FnOnce(&Q) -> V) -> V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if let Some(value) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_lookup(self.name, true);
            return value;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(self.name, false);

        let value = factory(key);

        let mut inner = self.lock();
        let tick = inner.next_tick();

        // Lost the race to a concurrent miss on the same key
        if let Some(entry) = inner.entries.get_mut(key) {
            if !self.is_expired(entry) {
                entry.last_access = tick;
                entry.access_count += 1;
                return entry.value.clone();
            }
        }

        inner.entries.remove(key);
        while inner.entries.len() >= self.capacity {
            if !inner.evict_lru() {
                break;
            }
        }

        inner.entries.insert(
            key.to_owned(),
            CacheEntry {
                value: value.clone(),
                last_access: tick,
                access_count: 1,
                inserted_at: Instant::now(),
            },
        );
        value
    }

    fn lookup<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.lock();
        let tick = inner.next_tick();

        let expired = match inner.entries.get(key) {
            Some(entry) => self.is_expired(entry),
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            return None;
        }

        let entry = inner.entries.get_mut(key)?;
        entry.last_access = tick;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    /// Whether `key` is cached, without touching its recency
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().entries.contains_key(key)
    }

    /// Number of accesses recorded for `key` since it was inserted
    pub fn access_count<Q>(&self, key: &Q) -> Option<u64>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().entries.get(key).map(|entry| entry.access_count)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().entries.remove(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hit_count,
            miss_count,
            hit_rate: if total == 0 {
                0.0
            } else {
                hit_count as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_hit_and_miss_accounting() {
        let cache: LruCache<String, usize> = LruCache::new("test", 10, None);

        assert_eq!(cache.get("a", |k| k.len()), 1);
        assert_eq!(cache.get("a", |_| 999), 1);
        assert_eq!(cache.get("bb", |k| k.len()), 2);

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 2);
        assert!((stats.hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(cache.access_count("a"), Some(2));
    }

    #[test]
    fn test_touching_oldest_protects_it_from_eviction() {
        let cache: LruCache<u32, u32> = LruCache::new("test", 3, None);
        for i in 0..3 {
            cache.get(&i, |k| *k);
        }

        // Touch 0 so 1 becomes the least recently used
        cache.get(&0, |_| unreachable!());
        cache.get(&3, |k| *k);

        assert!(cache.contains(&0));
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_eviction_follows_access_order() {
        let cache: LruCache<u32, u32> = LruCache::new("test", 2, None);
        cache.get(&1, |k| *k);
        cache.get(&2, |k| *k);
        cache.get(&1, |k| *k);
        cache.get(&3, |k| *k); // evicts 2
        cache.get(&4, |k| *k); // evicts 1

        assert!(!cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
    }

    #[test]
    fn test_ttl_expiry_rebuilds() {
        let cache: LruCache<String, u32> =
            LruCache::new("test", 4, Some(Duration::from_millis(30)));
        assert_eq!(cache.get("k", |_| 1), 1);
        assert_eq!(cache.get("k", |_| 2), 1);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("k", |_| 3), 3);
        assert_eq!(cache.stats().miss_count, 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache: LruCache<String, u32> = LruCache::new("test", 4, None);
        cache.get("a", |_| 1);
        cache.get("b", |_| 2);

        assert_eq!(cache.remove("a"), Some(1));
        assert_eq!(cache.remove("a"), None);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_factory_runs_without_lock() {
        let cache: Arc<LruCache<String, u32>> = Arc::new(LruCache::new("test", 4, None));
        let inner = cache.clone();

        // A factory that re-enters the cache would deadlock if the lock were held
        let value = cache.get("outer", |_| inner.get("inner", |_| 7) + 1);
        assert_eq!(value, 8);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_concurrent_gets_never_exceed_capacity() {
        let cache: Arc<LruCache<u32, u32>> = Arc::new(LruCache::new("test", 16, None));
        let builds = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                let builds = builds.clone();
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        let key = (i * 7 + t) % 40;
                        let value = cache.get(&key, |k| {
                            builds.fetch_add(1, Ordering::Relaxed);
                            k * 2
                        });
                        assert_eq!(value, key * 2);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(cache.len() <= 16);
        let stats = cache.stats();
        assert_eq!(stats.hit_count + stats.miss_count, 1_600);
        assert_eq!(stats.miss_count as usize, builds.load(Ordering::Relaxed));
    }
}
