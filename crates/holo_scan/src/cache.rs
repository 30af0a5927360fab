//! Bounded, expiring cache for per-query model metadata.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ScanConfig;

/// Cache identity: model name plus a hash of the data-type filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub model_name: String,
    pub datatype_filter_hash: u64,
}

impl CacheKey {
    /// Builds a key; the filter hash does not depend on the order of
    /// `datatype_filter`.
    pub fn new<I, S>(model_name: impl Into<String>, datatype_filter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = datatype_filter
            .into_iter()
            .map(|datatype| datatype.as_ref().to_string())
            .collect::<Vec<_>>();
        filter.sort();
        filter.dedup();
        let mut hasher = DefaultHasher::new();
        filter.hash(&mut hasher);
        Self {
            model_name: model_name.into(),
            datatype_filter_hash: hasher.finish(),
        }
    }
}

/// Field mapping between query-level names and stored column names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryModel {
    pub name: String,
    forward: BTreeMap<String, String>,
    reverse: BTreeMap<String, String>,
}

impl QueryModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_mapping(
        mut self,
        query_field: impl Into<String>,
        stored_field: impl Into<String>,
    ) -> Self {
        let (query_field, stored_field) = (query_field.into(), stored_field.into());
        self.reverse.insert(stored_field.clone(), query_field.clone());
        self.forward.insert(query_field, stored_field);
        self
    }

    /// Stored name of a query field; unmapped fields keep their name.
    pub fn stored_field<'a>(&'a self, query_field: &'a str) -> &'a str {
        self.forward.get(query_field).map_or(query_field, String::as_str)
    }

    pub fn query_field<'a>(&'a self, stored_field: &'a str) -> &'a str {
        self.reverse.get(stored_field).map_or(stored_field, String::as_str)
    }
}

struct Cached<V> {
    value: Arc<V>,
    inserted: Instant,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub len: usize,
}

pub struct ModelCache<V> {
    entries: Mutex<LruCache<CacheKey, Cached<V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl<V> std::fmt::Debug for ModelCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<V> ModelCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(config.model_cache_capacity, config.model_cache_ttl)
    }

    /// Returns the live value for `key`, evicting it when expired.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        let mut entries = self.lock_entries();
        let found = entries
            .get(key)
            .map(|cached| (cached.inserted.elapsed() < self.ttl, Arc::clone(&cached.value)));
        let live = match found {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                entries.pop(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                debug!(model = %key.model_name, "model cache entry expired");
                None
            }
            None => None,
        };
        match live {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.lock_entries().put(
            key,
            Cached {
                value: Arc::clone(&value),
                inserted: Instant::now(),
            },
        );
        value
    }

    /// Returns the cached value or builds and caches a new one.
    ///
    /// The builder runs outside the cache lock; concurrent misses may build
    /// twice and the last insert wins.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: CacheKey,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = build()?;
        Ok(self.insert(key, value))
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.lock_entries().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            len: self.lock_entries().len(),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, Cached<V>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_order_does_not_change_the_key() {
        assert_eq!(
            CacheKey::new("events", ["b", "a"]),
            CacheKey::new("events", ["a", "b", "a"])
        );
        assert_ne!(
            CacheKey::new("events", ["a"]),
            CacheKey::new("events", ["b"])
        );
    }

    #[test]
    fn model_maps_fields_both_ways() {
        let model = QueryModel::new("events").with_mapping("user", "USER_ID");
        assert_eq!(model.stored_field("user"), "USER_ID");
        assert_eq!(model.query_field("USER_ID"), "user");
        assert_eq!(model.stored_field("other"), "other");
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = ModelCache::new(2, Duration::from_secs(60));
        let a = CacheKey::new("a", ["x"]);
        let b = CacheKey::new("b", ["x"]);
        let c = CacheKey::new("c", ["x"]);
        cache.insert(a.clone(), 1);
        cache.insert(b.clone(), 2);
        assert_eq!(cache.get(&a).as_deref(), Some(&1));
        cache.insert(c.clone(), 3);
        assert!(cache.get(&b).is_none());
        assert_eq!(cache.get(&a).as_deref(), Some(&1));
        assert_eq!(cache.get(&c).as_deref(), Some(&3));
    }

    #[test]
    fn expired_entries_are_rebuilt() {
        let cache = ModelCache::new(4, Duration::from_millis(1));
        let key = CacheKey::new("m", ["x"]);
        cache.insert(key.clone(), "old");
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key).is_none());
        let value = cache
            .get_or_try_insert_with(key.clone(), || Ok::<_, ()>("new"))
            .expect("build");
        assert_eq!(*value, "new");
        let stats = cache.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.len, 1);
    }
}
