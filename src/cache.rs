//! Size-bounded LRU cache with hit/miss accounting.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::metrics::{Counter, MetricsSink};
use crate::models::{AudioTrack, MediaInfo};

/// Size of a cache entry, in the unit the cache capacity is expressed in.
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl Weighted for MediaInfo {
    fn weight(&self) -> usize {
        1
    }
}

impl Weighted for AudioTrack {
    fn weight(&self) -> usize {
        self.byte_len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub name: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub size: usize,
    pub capacity: usize,
}

struct Inner<V> {
    entries: LruCache<String, V>,
    size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct Cache<V> {
    name: &'static str,
    capacity: usize,
    inner: Mutex<Inner<V>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<V: Weighted + Clone> Cache<V> {
    pub fn new(name: &'static str, capacity: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            name,
            capacity,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                size: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            metrics,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Looks up `key`, counting a hit or a miss and refreshing its recency.
    pub fn get(&self, key: &str) -> Option<V> {
        let value = {
            let mut inner = self.inner.lock();
            let value = inner.entries.get(key).cloned();
            match value {
                Some(_) => inner.hits += 1,
                None => inner.misses += 1,
            }
            value
        };

        match value {
            Some(_) => self.metrics.incr(Counter::CacheHit(self.name)),
            None => self.metrics.incr(Counter::CacheMiss(self.name)),
        }

        value
    }

    /// Stores `value`, evicting least-recently-used entries until it fits.
    ///
    /// A value heavier than the whole capacity is rejected and nothing is evicted.
    pub fn insert(&self, key: String, value: V) -> Result<()> {
        let weight = value.weight();
        if weight > self.capacity {
            return Err(Error::CacheCapacityExceeded {
                weight,
                capacity: self.capacity,
            });
        }

        let mut inner = self.inner.lock();

        if let Some(previous) = inner.entries.pop(&key) {
            inner.size -= previous.weight();
        }

        while inner.size + weight > self.capacity {
            match inner.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.size -= evicted.weight();
                    inner.evictions += 1;
                    debug!(cache = self.name, key = %evicted_key, "evicted cache entry");
                }
                None => break,
            }
        }

        inner.entries.put(key, value);
        inner.size += weight;

        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.pop(key);
        if let Some(value) = &removed {
            inner.size -= value.weight();
        }
        removed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            name: self.name,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            size: inner.size,
            capacity: self.capacity,
        }
    }
}
