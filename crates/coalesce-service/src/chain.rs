//! Sequential composition of [`Future`]s.
//!
//! [`Future::chain`] is the primitive: it runs a continuation on the success value and
//! forwards the outcome of the future the continuation returns. Failures short-circuit,
//! the error is passed on unchanged and the continuation is dropped without being called.
//! [`Future::transform`] and [`Future::decoded`] are built on top of it.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::FetchError;
use crate::promise::{Future, Promise};

impl<V> Future<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a future that settles with the outcome of `continuation(value)`.
    ///
    /// - On success, `continuation` is invoked with the value. If it returns an error, the
    ///   resulting future fails with that error. Otherwise the resulting future settles with
    ///   whatever the returned future settles with.
    /// - On failure, the resulting future fails with the same error, and `continuation` is
    ///   never invoked.
    pub fn chain<T, F>(&self, continuation: F) -> Future<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(V) -> Result<Future<T>, FetchError> + Send + 'static,
    {
        let promise = Promise::new();
        let chained = promise.future();

        self.observe(move |outcome| match outcome.and_then(continuation) {
            Ok(next) => next.observe(move |outcome| {
                promise.settle(outcome).ok();
            }),
            Err(error) => {
                promise.reject(error).ok();
            }
        });

        chained
    }

    /// Creates a future that settles with `f(value)`.
    ///
    /// This is [`chain`](Self::chain) with a continuation that returns an already resolved
    /// future. An error returned by `f` fails the resulting future.
    pub fn transform<T, F>(&self, f: F) -> Future<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(V) -> Result<T, FetchError> + Send + 'static,
    {
        self.chain(move |value| f(value).map(Future::resolved))
    }
}

impl Future<Bytes> {
    /// Decodes the payload as JSON.
    ///
    /// A malformed payload fails the resulting future with [`FetchError::Decode`].
    pub fn decoded<T>(&self) -> Future<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.transform(|data| Ok(serde_json::from_slice(&data)?))
    }
}
