//! # Request deduplication
//!
//! The [`DeduplicatingCache`] maps a request key to either an operation that is still running,
//! or the value it produced. Concurrent requests for the same key share one operation:
//!
//! - A key that is [`Ready`](CacheEntry::Ready) is served from memory.
//! - A key that is [`InProgress`](CacheEntry::InProgress) hands out the shared [`Future`] of the
//!   running operation.
//! - A missing key starts a new operation. The entry is inserted in the same critical section
//!   as the lookup, so two callers can never both start an operation for one key.
//!
//! When the operation succeeds, its entry is promoted to `Ready`. When it fails, the entry is
//! removed, and the next request for that key starts over. Failures are never cached.
//!
//! The entry is updated before any caller observes the outcome. A caller that reacts to the
//! outcome by requesting the same key again either gets the ready value, or starts a new
//! operation.
//!
//! ### Metrics
//!
//! All metrics are tagged with the `cache` name:
//!
//! - `caches.dedup.ready_hit`: Requests served from a ready value.
//! - `caches.dedup.channel.hit`: Requests attached to an operation that is already running.
//! - `caches.dedup.channel.miss`: Requests that started a new operation.
//! - `caches.dedup.promoted`: Operations that succeeded and were stored.
//! - `caches.dedup.evicted`: Operations that failed and were removed, tagged with the error `kind`.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, Outcome};
use crate::promise::{Future, Promise};

/// The state of one key in a [`DeduplicatingCache`].
enum CacheEntry<V> {
    /// An operation for this key is running.
    ///
    /// The `generation` identifies the operation, so that it only ever updates its own entry.
    InProgress { generation: u64, future: Future<V> },
    /// The operation for this key succeeded with this value.
    Ready(V),
}

struct Entries<K, V> {
    name: &'static str,
    map: Mutex<FxHashMap<K, CacheEntry<V>>>,
    generation: AtomicU64,
}

impl<K, V> Entries<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Applies the outcome of the operation `generation` to the entry for `key`.
    ///
    /// Does nothing if the entry was invalidated or replaced in the meantime.
    fn complete(&self, key: K, generation: u64, outcome: &Outcome<V>) {
        let name = self.name;
        let mut map = self.map.lock();

        let is_current = matches!(
            map.get(&key),
            Some(CacheEntry::InProgress { generation: current, .. }) if *current == generation
        );
        if !is_current {
            tracing::trace!(cache = name, "Discarding outcome of an invalidated operation");
            return;
        }

        match outcome {
            Ok(value) => {
                metric!(counter("caches.dedup.promoted") += 1, "cache" => name);
                map.insert(key, CacheEntry::Ready(value.clone()));
            }
            Err(error) => {
                metric!(
                    counter("caches.dedup.evicted") += 1,
                    "cache" => name,
                    "kind" => error.kind(),
                );
                tracing::warn!(cache = name, %error, "Evicting failed operation");
                map.remove(&key);
            }
        }
    }
}

/// An in-memory store that runs at most one operation per key at a time.
///
/// See the [module level docs](self) for how entries move between states.
///
/// Cloning the cache is cheap and yields a handle to the same entries.
pub struct DeduplicatingCache<K, V> {
    entries: Arc<Entries<K, V>>,
}

impl<K, V> Clone for DeduplicatingCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K, V> fmt::Debug for DeduplicatingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .entries
            .map
            .try_lock()
            .map(|map| map.len())
            .unwrap_or_default();
        f.debug_struct("DeduplicatingCache")
            .field("name", &self.entries.name)
            .field("entries", &entries)
            .finish()
    }
}

impl<K, V> DeduplicatingCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache.
    ///
    /// The `name` is used to tag metrics and logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            entries: Arc::new(Entries {
                name,
                map: Mutex::new(FxHashMap::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the future value for `key`, calling `produce` only if no operation for `key` is
    /// running or has succeeded.
    ///
    /// `produce` is invoked at most once, synchronously, and without holding any lock.
    pub fn request<F>(&self, key: K, produce: F) -> Future<V>
    where
        F: FnOnce() -> Future<V>,
    {
        self.request_inner(key, None, produce)
    }

    /// Like [`request`](Self::request), but hands a cancellation `token` to `produce`.
    ///
    /// If the token is cancelled by the time the operation settles, its value is not stored,
    /// the entry is evicted, and all callers receive [`FetchError::Cancelled`].
    pub fn request_cancellable<F>(&self, key: K, token: CancellationToken, produce: F) -> Future<V>
    where
        F: FnOnce(CancellationToken) -> Future<V>,
    {
        let child = token.clone();
        self.request_inner(key, Some(token), move || produce(child))
    }

    fn request_inner<F>(&self, key: K, token: Option<CancellationToken>, produce: F) -> Future<V>
    where
        F: FnOnce() -> Future<V>,
    {
        let name = self.entries.name;

        let promise = {
            let mut map = self.entries.map.lock();
            match map.get(&key) {
                Some(CacheEntry::Ready(value)) => {
                    metric!(counter("caches.dedup.ready_hit") += 1, "cache" => name);
                    return Future::resolved(value.clone());
                }
                Some(CacheEntry::InProgress { future, .. }) => {
                    // A concurrent request was deduplicated.
                    metric!(counter("caches.dedup.channel.hit") += 1, "cache" => name);
                    return future.clone();
                }
                None => {
                    metric!(counter("caches.dedup.channel.miss") += 1, "cache" => name);
                }
            }

            let generation = self.entries.generation.fetch_add(1, Ordering::Relaxed);
            let promise = Promise::new();
            let future = promise.future();

            // Registered while the entry is being inserted, so this is the first callback to
            // run at settlement. If `produce` panics, the dropped promise still evicts the entry.
            let entries = Arc::clone(&self.entries);
            let entry_key = key.clone();
            future.observe(move |outcome| entries.complete(entry_key, generation, &outcome));

            map.insert(key, CacheEntry::InProgress { generation, future });
            promise
        };

        let future = promise.future();
        produce().observe(move |outcome| {
            let outcome = match token {
                Some(token) if token.is_cancelled() => Err(FetchError::Cancelled),
                _ => outcome,
            };
            promise.settle(outcome).ok();
        });

        future
    }

    /// Returns the value for `key` if its operation has succeeded.
    pub fn peek(&self, key: &K) -> Option<V> {
        match self.entries.map.lock().get(key) {
            Some(CacheEntry::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Removes the entry for `key`.
    ///
    /// An operation that is still running keeps running, and its callers still get its
    /// outcome, but the outcome is not stored. The next request for `key` starts over.
    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.map.lock().remove(key).is_some()
    }

    /// The number of entries, both running and ready.
    pub fn len(&self) -> usize {
        self.entries.map.lock().len()
    }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of operations currently running.
    pub fn in_flight(&self) -> usize {
        self.entries
            .map
            .lock()
            .values()
            .filter(|entry| matches!(entry, CacheEntry::InProgress { .. }))
            .count()
    }
}
