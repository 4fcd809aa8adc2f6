//! Time-to-live map with lazy expiry and an optional background sweeper.
//!
//! Entries become invisible once their deadline passes. Expired entries are
//! removed when they are next touched, when the map grows past a cleanup
//! threshold, or when a sweeper task started with [`TtlMap::spawn_sweeper`]
//! runs. The map never schedules per-entry timers.
//!
//! Two expiry modes are supported:
//!
//! - fixed: the deadline is set on insert and never moves (download links,
//!   sessions)
//! - idle: every successful lookup pushes the deadline forward by the TTL
//!   (rate limiters that should live as long as they are used)

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Threshold for triggering automatic cleanup on insert.
const CLEANUP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
struct TtlEntry<V> {
    value: V,
    expires: Instant,
}

impl<V> TtlEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires: Instant::now() + ttl,
        }
    }

    #[inline]
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    fn touch(&mut self, ttl: Duration) {
        self.expires = Instant::now() + ttl;
    }
}

/// Thread-safe map whose entries expire after a time-to-live.
///
/// # Example
///
/// ```
/// use filegate_common::TtlMap;
/// use std::time::Duration;
///
/// let links: TtlMap<String, String> = TtlMap::new(Duration::from_secs(3 * 3600));
/// links.insert("42".to_string(), "/srv/files/report.pdf".to_string());
/// assert_eq!(links.get(&"42".to_string()).as_deref(), Some("/srv/files/report.pdf"));
/// ```
pub struct TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    entries: DashMap<K, TtlEntry<V>>,
    ttl: Duration,
    refresh_on_access: bool,
    cleanup_threshold: usize,
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a map whose entries expire `ttl` after insertion.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            refresh_on_access: false,
            cleanup_threshold: CLEANUP_THRESHOLD,
        }
    }

    /// Creates a map whose entries expire after `ttl` without access.
    pub fn with_idle_expiry(ttl: Duration) -> Self {
        Self {
            refresh_on_access: true,
            ..Self::new(ttl)
        }
    }

    /// Creates a map with a custom cleanup threshold.
    pub fn with_threshold(ttl: Duration, cleanup_threshold: usize) -> Self {
        Self {
            cleanup_threshold,
            ..Self::new(ttl)
        }
    }

    /// Returns the value for `key` if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired() {
                if self.refresh_on_access {
                    entry.touch(self.ttl);
                }
                return Some(entry.value.clone());
            }
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        None
    }

    /// Returns true if `key` maps to a live entry.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or replaces an entry, resetting its deadline.
    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, TtlEntry::new(value, self.ttl));
        self.maybe_cleanup();
    }

    /// Inserts or replaces an entry with a custom TTL.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(key, TtlEntry::new(value, ttl));
        self.maybe_cleanup();
    }

    /// Returns the live value for `key`, or inserts the one produced by `make`.
    ///
    /// The check and the insert happen under the key's shard lock, so two
    /// concurrent callers for the same key observe the same value. `make` runs
    /// while that lock is held and must not touch this map.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        let value = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    let value = make();
                    occupied.insert(TtlEntry::new(value.clone(), self.ttl));
                    value
                } else {
                    if self.refresh_on_access {
                        occupied.get_mut().touch(self.ttl);
                    }
                    occupied.get().value.clone()
                }
            }
            Entry::Vacant(vacant) => {
                let value = make();
                vacant.insert(TtlEntry::new(value.clone(), self.ttl));
                value
            }
        };
        self.maybe_cleanup();
        value
    }

    /// Removes `key`, returning its value if it was still live.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries
            .remove(key)
            .and_then(|(_, e)| (!e.is_expired()).then_some(e.value))
    }

    /// Removes every entry matching `predicate`.
    pub fn invalidate_where<F>(&self, predicate: F)
    where
        F: Fn(&K, &V) -> bool,
    {
        self.entries.retain(|k, e| !predicate(k, &e.value));
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        before.saturating_sub(self.entries.len())
    }

    fn maybe_cleanup(&self) {
        if self.entries.len() > self.cleanup_threshold {
            self.cleanup_expired();
        }
    }
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Starts a tokio task that sweeps expired entries every `interval`.
    ///
    /// The task holds only a weak reference and exits once the map is
    /// dropped. Dropping the returned handle stops it earlier.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(map) = weak.upgrade() else {
                    break;
                };
                let swept = map.cleanup_expired();
                if swept > 0 {
                    tracing::trace!(swept, remaining = map.len(), "ttl sweep");
                }
            }
        });
        SweeperHandle { task }
    }
}

/// Aborts the sweeper task when dropped.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
