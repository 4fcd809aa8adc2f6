//! Async TTL cache backed by Moka.
//!
//! Used for lookups against slow external collaborators (role rate limits,
//! policy enumeration) where concurrent misses for the same key should
//! trigger a single fetch. Moka's `try_get_with()` provides that coalescing.
//!
//! Enable the `cache-tracing` feature for debug spans on cache operations.

use moka::Expiry;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Conditional tracing macros - no-op when feature is disabled
#[cfg(feature = "cache-tracing")]
macro_rules! cache_event {
    ($level:ident, $($arg:tt)*) => {
        tracing::$level!($($arg)*)
    };
}

#[cfg(not(feature = "cache-tracing"))]
macro_rules! cache_event {
    ($level:ident, $($arg:tt)*) => {};
}

/// Default maximum number of cached entries.
pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;

/// A cached value together with its own TTL.
#[derive(Debug, Clone)]
pub struct CachedEntry<V> {
    pub value: V,
    ttl: Duration,
    inserted: Instant,
}

impl<V> CachedEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            ttl,
            inserted: Instant::now(),
        }
    }

    /// Returns the remaining time until expiration.
    pub fn time_remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.inserted.elapsed())
    }
}

/// Expiry implementation that uses the TTL stored in each entry.
struct PerEntryExpiry;

impl<K, V> Expiry<K, CachedEntry<V>> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &CachedEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &CachedEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Async cache with per-entry TTL and coalesced loading.
///
/// # Example
///
/// ```
/// use filegate_common::AsyncTtlCache;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let rates: AsyncTtlCache<String, u64> = AsyncTtlCache::new(Duration::from_secs(300));
///     let rate = rates
///         .try_get_or_insert(&"editor".to_string(), || async { Ok::<_, std::io::Error>(65_536) })
///         .await
///         .unwrap();
///     assert_eq!(rate, 65_536);
/// }
/// ```
pub struct AsyncTtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: moka::future::Cache<K, CachedEntry<V>>,
    ttl: Duration,
}

impl<K, V> AsyncTtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, max_capacity: u64) -> Self {
        Self {
            inner: moka::future::Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryExpiry)
                .build(),
            ttl,
        }
    }

    /// Gets a cached value if it exists and hasn't expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        let hit = self.inner.get(key).await;
        cache_event!(debug, hit = hit.is_some(), "cache lookup");
        hit.map(|entry| entry.value)
    }

    /// Gets a cached value, computing it with a fallible loader on a miss.
    ///
    /// Concurrent misses for the same key run the loader once; every waiter
    /// receives the same value or the same shared error. Errors are not cached.
    pub async fn try_get_or_insert<F, Fut, E>(&self, key: &K, compute: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Send + Sync + 'static,
    {
        let ttl = self.ttl;
        let entry = self
            .inner
            .try_get_with(key.clone(), async {
                cache_event!(debug, "cache miss, loading value");
                compute().await.map(|value| CachedEntry::new(value, ttl))
            })
            .await?;
        Ok(entry.value)
    }

    pub async fn insert(&self, key: K, value: V) {
        self.inner.insert(key, CachedEntry::new(value, self.ttl)).await;
    }

    /// Inserts a value with a custom TTL.
    pub async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.inner.insert(key, CachedEntry::new(value, ttl)).await;
    }

    pub async fn invalidate(&self, key: &K) {
        self.inner.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
