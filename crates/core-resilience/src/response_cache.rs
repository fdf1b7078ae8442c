//! Bounded response cache with per-entry TTL and FIFO eviction
//!
//! Values live in a sharded map, so concurrent reads of different keys never
//! contend. Insertion order is tracked separately in a queue of
//! `(key, generation)` pairs; when the cache is full the oldest live insertion
//! is evicted. Eviction is insertion-ordered (FIFO), not access-ordered.
//!
//! Queue entries whose generation no longer matches the stored value (the key
//! was rewritten, expired or removed) are skipped during eviction and dropped
//! during `sweep()`.
//!
//! # Example
//!
//! ```
//! use conduit_core_resilience::response_cache::{CacheConfig, ResponseCache};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = ResponseCache::new(CacheConfig {
//!     capacity: 2,
//!     default_ttl: Duration::from_secs(60),
//!     ..Default::default()
//! });
//!
//! cache.set("getSlot:[]", 42u64, None);
//! assert_eq!(cache.get("getSlot:[]"), Some(42));
//! # }
//! ```

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for the response cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries; zero disables caching
    pub capacity: usize,
    /// TTL applied when a caller does not supply one
    pub default_ttl: Duration,
    /// How often the owner should call `sweep()`
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
    generation: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) > self.ttl
    }
}

/// Counters describing cache behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Fraction of lookups that were served from the cache
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Thread-safe TTL cache keyed by string
#[derive(Debug)]
pub struct ResponseCache<V> {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry<V>>,
    order: Mutex<VecDeque<(String, u64)>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::with_capacity(config.capacity),
            order: Mutex::new(VecDeque::with_capacity(config.capacity)),
            config,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a live entry; an expired entry is removed and reported as a miss
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired
            && self
                .entries
                .remove_if(key, |_, entry| entry.is_expired(now))
                .is_some()
        {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value` under `key` with `ttl` (or the default TTL)
    ///
    /// Rewriting an existing key moves it to the back of the eviction order.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        if self.config.capacity == 0 {
            return;
        }
        let key = key.into();
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        // The order lock serialises writers so the capacity bound holds
        let mut order = self.order();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.config.capacity {
                match order.pop_front() {
                    Some((oldest, oldest_gen)) => {
                        if self
                            .entries
                            .remove_if(&oldest, |_, entry| entry.generation == oldest_gen)
                            .is_some()
                        {
                            self.evictions.fetch_add(1, Ordering::Relaxed);
                            debug!(key = %oldest, "evicted oldest cache entry");
                        }
                    }
                    None => break,
                }
            }
        }

        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
                generation,
            },
        );
        order.push_back((key, generation));
        self.insertions.fetch_add(1, Ordering::Relaxed);

        if order.len() > self.config.capacity.saturating_mul(2) {
            self.compact(&mut order);
        }
    }

    /// Remove a single entry
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every expired entry; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "swept expired cache entries");
        }

        let mut order = self.order();
        self.compact(&mut order);
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut order = self.order();
        self.entries.clear();
        order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            capacity: self.config.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    fn compact(&self, order: &mut VecDeque<(String, u64)>) {
        order.retain(|(key, generation)| {
            self.entries
                .get(key)
                .map(|entry| entry.generation == *generation)
                .unwrap_or(false)
        });
    }

    fn order(&self) -> MutexGuard<'_, VecDeque<(String, u64)>> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
