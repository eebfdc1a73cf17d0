// src/utils/cache.rs
// Bounded in-process cache with bulk half-eviction

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Cache hit/miss counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

struct CacheInner<V> {
    map: HashMap<String, V>,
    /// Keys in least-recently-used order (front = oldest)
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

/// LRU cache bounded by entry count.
///
/// When the cache reaches capacity, the oldest half of the entries is
/// dropped in one pass so eviction cost is amortized across many inserts
/// instead of paid on each one. Safe for concurrent use.
pub struct BoundedCache<V> {
    inner: Mutex<CacheInner<V>>,
    capacity: usize,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                misses: 0,
            }),
            capacity: capacity.max(2),
        }
    }

    /// Look up a key, refreshing its recency on hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        if let Some(value) = inner.map.get(key).cloned() {
            inner.hits += 1;
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
            inner.order.push_back(key.to_string());
            Some(value)
        } else {
            inner.misses += 1;
            None
        }
    }

    /// Insert a value, evicting the oldest half when the cache is full.
    pub fn insert(&self, key: String, value: V) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if !inner.map.contains_key(&key) && inner.map.len() >= self.capacity {
            let drop_count = self.capacity / 2;
            for _ in 0..drop_count {
                if let Some(old) = inner.order.pop_front() {
                    inner.map.remove(&old);
                }
            }
        }

        if inner.map.insert(key.clone(), value).is_some() {
            if let Some(pos) = inner.order.iter().position(|k| *k == key) {
                inner.order.remove(pos);
            }
        }
        inner.order.push_back(key);
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.map.clear();
            inner.order.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        match self.inner.lock() {
            Ok(inner) => CacheStats {
                hits: inner.hits,
                misses: inner.misses,
                len: inner.map.len(),
            },
            Err(_) => CacheStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_after_insert() {
        let cache: BoundedCache<i32> = BoundedCache::new(10);
        cache.insert("a".into(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_half_eviction_at_capacity() {
        let cache: BoundedCache<usize> = BoundedCache::new(10);
        for i in 0..10 {
            cache.insert(format!("k{i}"), i);
        }
        assert_eq!(cache.len(), 10);

        // The 11th insert drops the oldest five in one pass
        cache.insert("k10".into(), 10);
        assert_eq!(cache.len(), 6);
        for i in 0..5 {
            assert_eq!(cache.get(&format!("k{i}")), None, "k{i} should be evicted");
        }
        for i in 5..11 {
            assert!(cache.get(&format!("k{i}")).is_some(), "k{i} should survive");
        }
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache: BoundedCache<usize> = BoundedCache::new(4);
        for i in 0..4 {
            cache.insert(format!("k{i}"), i);
        }
        // Touch k0 so it is no longer the oldest
        assert!(cache.get("k0").is_some());
        cache.insert("k4".into(), 4);
        // Oldest half (k1, k2) evicted; refreshed k0 survives
        assert!(cache.get("k0").is_some());
        assert_eq!(cache.get("k1"), None);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache: BoundedCache<i32> = BoundedCache::new(4);
        cache.insert("a".into(), 1);
        let _ = cache.get("a");
        let _ = cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.len, 1);
    }

    #[test]
    fn test_reinsert_updates_value() {
        let cache: BoundedCache<i32> = BoundedCache::new(4);
        cache.insert("a".into(), 1);
        cache.insert("a".into(), 2);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.len(), 1);
    }
}
