//! Duplicate call suppression.
//!
//! [`SingleFlight`] collapses concurrent calls that share a key into a single
//! execution. The first caller for a key starts the work; callers arriving
//! while it is in flight await the same shared future and receive a clone of
//! its output. Once the work completes the key is released, so the next call
//! starts fresh. Failures are shared with the waiters of that flight but are
//! never cached or retried.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

type Flight<V> = Shared<BoxFuture<'static, V>>;

/// A group of in-flight calls keyed by `K`.
pub struct SingleFlight<K, V>
where
    V: Clone,
{
    calls: Mutex<HashMap<K, Flight<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `make()` for `key` unless a call for `key` is already running,
    /// in which case the running call's result is awaited instead.
    ///
    /// `make` is only invoked by the caller that starts the flight.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (flight, leader) = {
            let mut calls = self.calls.lock();
            if let Some(existing) = calls.get(&key) {
                (existing.clone(), false)
            } else {
                let flight = make().boxed().shared();
                calls.insert(key.clone(), flight.clone());
                (flight, true)
            }
        };
        tracing::trace!(leader, "single-flight call");

        let output = flight.clone().await;

        let mut calls = self.calls.lock();
        if calls.get(&key).is_some_and(|current| current.ptr_eq(&flight)) {
            calls.remove(&key);
        }
        output
    }

    /// Number of keys with a call currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns true if a call for `key` is currently running.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.calls.lock().contains_key(key)
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
