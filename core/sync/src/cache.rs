//! TTL read cache shielding the remote store from redundant reads.
//!
//! Expiry is checked lazily on `get`; there is no background eviction
//! task. The cache is process-local: the mutation queue and the remote
//! store remain the sources of truth.

use futures::future::{self, BoxFuture, FutureExt};
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use showsync_common::Result;

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Monotonic system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
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
        let offset = *self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        self.origin + offset
    }
}

/// A cached value with its write time and lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub written_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) >= self.ttl
    }
}

/// In-memory key/value cache with per-entry expiry.
pub struct TtlCache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> TtlCache<T> {
    /// Create a cache on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a cache on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value for `key`, evicting it if it has expired.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Store `value` under `key` for `ttl`. A zero ttl stores nothing.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry {
            value,
            written_at: self.clock.now(),
            ttl,
        };
        self.lock().insert(key.into(), entry);
    }

    /// Drop a single key. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every key matching `pattern`. Returns how many were dropped.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !pattern.is_match(key));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Invalidated {} cache entries matching {}", removed, pattern);
        }
        removed
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Evict expired entries eagerly. Returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap `fetch` in a read-through cache.
///
/// The returned function derives a key from its argument with `key_fn`,
/// answers from `cache` when a fresh entry exists and otherwise calls
/// `fetch`, caching a successful result for `ttl`. Errors are not cached.
pub fn with_cache<A, T, F, Fut, K>(
    cache: Arc<TtlCache<T>>,
    fetch: F,
    key_fn: K,
    ttl: Duration,
) -> impl Fn(A) -> BoxFuture<'static, Result<T>>
where
    T: Clone + Send + 'static,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    K: Fn(&A) -> String,
{
    move |arg: A| {
        let key = key_fn(&arg);
        if let Some(hit) = cache.get(&key) {
            return future::ready(Ok(hit)).boxed();
        }
        let pending = fetch(arg);
        let cache = Arc::clone(&cache);
        async move {
            let value = pending.await?;
            cache.set(key, value.clone(), ttl);
            Ok(value)
        }
        .boxed()
    }
}
