//! Thread-safe LRU cache with strict eviction order.
//!
//! Uses `IndexMap` internally, which preserves insertion order and provides
//! O(1) access; recency updates move entries to the back (front = LRU,
//! back = MRU).
//!
//! A single mutex protects the map for the full duration of every operation.
//! Contention is acceptable because each critical section is short and does
//! no I/O. Hit/miss/eviction counters are atomics, so `stats()` reads from a
//! logging callback inside a caller's put path never touch the structural
//! lock.

#![allow(clippy::cast_precision_loss)] // Precision loss acceptable for utilization

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Current number of entries.
    pub size: usize,
    /// Maximum number of entries.
    pub capacity: usize,
    /// `size / capacity`, in `[0, 1]`.
    pub utilization: f64,
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of evictions.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit rate (0.0 to 1.0).
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe LRU cache.
pub struct LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Maximum capacity; `len() <= capacity` at all times.
    capacity: usize,
    /// Entries in recency order (front = LRU, back = MRU).
    inner: Mutex<IndexMap<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a new LRU cache with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. Configuration paths validate capacities
    /// before reaching this constructor.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(IndexMap::with_capacity(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get the capacity of the cache.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Get a value by key, updating recency.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.shift_remove(key) {
            // Re-insert at the back (MRU).
            inner.insert(key.clone(), value.clone());
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(value)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert a key-value pair, evicting the LRU entry if at capacity.
    ///
    /// An existing key has its value replaced and moves to the MRU position.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        if inner.shift_remove(&key).is_some() {
            inner.insert(key, value);
            return;
        }

        if inner.len() >= self.capacity {
            // The front entry is the least recently used.
            if inner.shift_remove_index(0).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        inner.insert(key, value);
    }

    /// Check whether a key is present, without updating recency or counters.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Get a value without updating recency (peek).
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Remove a key from the cache.
    pub fn remove(&self, key: &K) {
        self.inner.lock().shift_remove(key);
    }

    /// Discard all entries. Counters are preserved.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Keys in recency order (front = LRU, back = MRU). Test and diagnostic
    /// use; takes the lock for the full copy.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Get cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let size = self.inner.lock().len();
        CacheStats {
            size,
            capacity: self.capacity,
            utilization: size as f64 / self.capacity as f64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> std::fmt::Debug for LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
