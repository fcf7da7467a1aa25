//! Operation sources produce the values that a [`DeduplicatingCache`] stores.
//!
//! A source only knows how to start one operation for one key. Pairing it with a cache in a
//! [`CachedSource`] makes sure that concurrent requests for the same key start at most one
//! operation, and that successful values are reused.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::DeduplicatingCache;
use crate::promise::Future;

mod http;

pub use http::{HttpSource, USER_AGENT, create_client};

/// Starts asynchronous operations for a key.
pub trait OperationSource<K>: Send + Sync + 'static {
    /// The value a successful operation produces.
    type Output: Clone + Send + Sync + 'static;

    /// Starts an operation for `key`, returning the future of its outcome.
    fn fetch(&self, key: &K) -> Future<Self::Output>;

    /// Starts an operation for `key` that stops early once `token` is cancelled.
    ///
    /// Sources that cannot be interrupted ignore the token.
    fn fetch_cancellable(&self, key: &K, _token: CancellationToken) -> Future<Self::Output> {
        self.fetch(key)
    }
}

impl<K, S> OperationSource<K> for Arc<S>
where
    S: OperationSource<K> + ?Sized,
{
    type Output = S::Output;

    fn fetch(&self, key: &K) -> Future<Self::Output> {
        (**self).fetch(key)
    }

    fn fetch_cancellable(&self, key: &K, token: CancellationToken) -> Future<Self::Output> {
        (**self).fetch_cancellable(key, token)
    }
}

/// An [`OperationSource`] backed by a closure.
///
/// Created through [`source_fn`].
#[derive(Clone)]
pub struct FnSource<F>(F);

impl<F> fmt::Debug for FnSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FnSource").finish()
    }
}

/// Turns a closure into an [`OperationSource`].
pub fn source_fn<K, V, F>(f: F) -> FnSource<F>
where
    F: Fn(&K) -> Future<V> + Send + Sync + 'static,
{
    FnSource(f)
}

impl<K, V, F> OperationSource<K> for FnSource<F>
where
    V: Clone + Send + Sync + 'static,
    F: Fn(&K) -> Future<V> + Send + Sync + 'static,
{
    type Output = V;

    fn fetch(&self, key: &K) -> Future<V> {
        (self.0)(key)
    }
}

/// An [`OperationSource`] whose operations are deduplicated and cached.
pub struct CachedSource<K, S: OperationSource<K>> {
    cache: DeduplicatingCache<K, S::Output>,
    source: S,
}

impl<K, S> CachedSource<K, S>
where
    K: Eq + Hash + Clone + Send + 'static,
    S: OperationSource<K>,
{
    /// Wraps `source` with a new cache called `name`.
    pub fn new(name: &'static str, source: S) -> Self {
        Self {
            cache: DeduplicatingCache::new(name),
            source,
        }
    }

    /// Returns the value for `key`, starting an operation on the source only if needed.
    pub fn get(&self, key: &K) -> Future<S::Output> {
        let source = &self.source;
        self.cache.request(key.clone(), || source.fetch(key))
    }

    /// Like [`get`](Self::get), but the operation is cancelled through `token`.
    ///
    /// Only the request that starts the operation passes its token on. Requests attaching to a
    /// running operation share the token of the first one.
    pub fn get_cancellable(&self, key: &K, token: CancellationToken) -> Future<S::Output> {
        let source = &self.source;
        self.cache.request_cancellable(key.clone(), token, |token| {
            source.fetch_cancellable(key, token)
        })
    }

    /// The underlying cache.
    pub fn cache(&self) -> &DeduplicatingCache<K, S::Output> {
        &self.cache
    }
}

impl<K, S> fmt::Debug for CachedSource<K, S>
where
    S: OperationSource<K> + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedSource")
            .field("cache", &self.cache)
            .field("source", &self.source)
            .finish()
    }
}
