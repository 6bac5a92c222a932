//! Bounded LRU cache with TTL.
//!
//! Used during a sync to hold customers and assets so ticket and invoice
//! documents can be enriched without a request per record.
//!
//! ## Capacity & TTL
//!
//! - `max_size` bounds the entry count; inserting a new key at capacity
//!   evicts the least-recently-used entry first
//! - `ttl_secs == 0` disables expiry, leaving a pure capacity-bounded cache
//! - expired entries are dropped lazily on `get` and in bulk by
//!   [`BoundedCache::cleanup_expired`]
//!
//! ## LRU Eviction
//!
//! Entries live in an `IndexMap` ordered from least to most recently used.
//! A hit moves the entry to the back; eviction pops the front.
//!
//! The clock is injectable so expiry can be tested without sleeping.

use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::models::{parse_record, Asset, Customer, EntityKind};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.base + offset
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

struct Inner<K, V> {
    entries: IndexMap<K, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// `hits / (hits + misses)`, or 0.0 before any lookup.
    pub hit_rate: f64,
}

/// Thread-safe LRU cache bounded by entry count and age.
pub struct BoundedCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_size: usize,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache holding at most `max_size` entries (minimum 1) that
    /// expire `ttl_secs` after insertion (0 = never).
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self::with_clock(max_size, ttl_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(max_size: usize, ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size: max_size.max(1),
            ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up `key`, marking it most recently used on a hit.
    ///
    /// An expired entry counts as a miss and is removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let Some(idx) = inner.entries.get_index_of(key) else {
            inner.misses += 1;
            return None;
        };

        if inner.entries[idx].is_expired(now) {
            inner.entries.shift_remove_index(idx);
            inner.misses += 1;
            return None;
        }

        let last = inner.entries.len() - 1;
        inner.entries.move_index(idx, last);
        inner.hits += 1;
        Some(inner.entries[last].value.clone())
    }

    /// Insert or overwrite `key`. A new key at capacity evicts the LRU entry.
    pub fn set(&self, key: K, value: V) {
        let expires_at = self.ttl.map(|ttl| self.clock.now() + ttl);
        let mut inner = self.lock();

        inner.entries.shift_remove(&key);
        while inner.entries.len() >= self.max_size {
            inner.entries.shift_remove_index(0);
            inner.evictions += 1;
        }
        inner.entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Return the cached value or run `loader` and cache what it yields.
    ///
    /// The lock is not held while `loader` runs, so the loader may use this
    /// cache. Two callers missing on the same key may both load; the later
    /// insert wins.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, loader: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(v) = self.get(&key) {
            return Ok(Some(v));
        }
        let loaded = loader().await?;
        if let Some(ref v) = loaded {
            self.set(key, v.clone());
        }
        Ok(loaded)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().entries.shift_remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Entry count, possibly including expired entries not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present and unexpired. Does not touch LRU order or counters.
    pub fn contains_unexpired(&self, key: &K) -> bool {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let now = self.clock.now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        before - inner.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            ttl_secs: self.ttl.map(|t| t.as_secs()).unwrap_or(0),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Entity cache
// ═══════════════════════════════════════════════════════════════════════

/// Caches used for enrichment during one sync run.
pub struct EntityCache {
    pub customers: BoundedCache<i64, Arc<Customer>>,
    pub assets: BoundedCache<i64, Arc<Asset>>,
    /// Asset ids per owning customer, in fetch order.
    pub assets_by_customer: BoundedCache<i64, Vec<i64>>,
}

impl EntityCache {
    pub fn new(customer_max_size: usize, asset_max_size: usize, ttl_secs: u64) -> Self {
        Self {
            customers: BoundedCache::new(customer_max_size, ttl_secs),
            assets: BoundedCache::new(asset_max_size, ttl_secs),
            assets_by_customer: BoundedCache::new(customer_max_size, ttl_secs),
        }
    }

    /// Cache a raw customer or asset record. Other kinds and records that
    /// fail to parse are ignored; they are reported when the record is built.
    pub fn absorb(&self, kind: EntityKind, record: &Value) {
        match kind {
            EntityKind::Customer => {
                if let Ok(customer) = parse_record::<Customer>(kind, record) {
                    self.customers.set(customer.id, Arc::new(customer));
                }
            }
            EntityKind::Asset => {
                if let Ok(asset) = parse_record::<Asset>(kind, record) {
                    self.insert_asset(Arc::new(asset));
                }
            }
            EntityKind::Ticket | EntityKind::Invoice => {}
        }
    }

    pub fn insert_asset(&self, asset: Arc<Asset>) {
        if let Some(owner) = asset.customer_id {
            let mut ids = self.assets_by_customer.get(&owner).unwrap_or_default();
            if !ids.contains(&asset.id) {
                ids.push(asset.id);
                self.assets_by_customer.set(owner, ids);
            }
        }
        self.assets.set(asset.id, asset);
    }

    /// First cached asset owned by `customer_id`.
    pub fn primary_asset_for(&self, customer_id: i64) -> Option<Arc<Asset>> {
        self.assets_by_customer
            .get(&customer_id)?
            .iter()
            .find_map(|id| self.assets.get(id))
    }

    pub fn clear_all(&self) {
        self.customers.clear();
        self.assets.clear();
        self.assets_by_customer.clear();
    }

    pub fn cleanup_expired(&self) -> usize {
        self.customers.cleanup_expired()
            + self.assets.cleanup_expired()
            + self.assets_by_customer.cleanup_expired()
    }
}
