//! Single-assignment results, observed through a [`Future`] and settled through a [`Promise`].
//!
//! A [`ResultCell`] holds the eventual [`Outcome`] of one operation. It is shared by two kinds
//! of handles with different capabilities:
//!
//! - Any number of [`Future`]s can read the outcome and register callbacks via
//!   [`Future::observe`].
//! - Exactly one [`Promise`] can write the outcome, once.
//!
//! Callbacks registered before settlement run in registration order on the thread that settles
//! the promise. Callbacks registered afterwards run immediately, before `observe` returns.
//! Nothing here ever blocks waiting for an outcome; async code can `.await` a [`Future`]
//! instead, which registers a callback under the hood.

use std::fmt;
use std::future::IntoFuture;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::{Arc, OnceLock};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::error::{FetchError, Outcome};

type Callback<V> = Box<dyn FnOnce(&Outcome<V>) + Send + 'static>;

/// A container that is assigned an [`Outcome`] at most once.
///
/// The `pending` lock guards both the callback list and the transition into the settled state,
/// so an observer racing settlement is either queued before the callbacks are taken, or sees
/// the outcome.
pub struct ResultCell<V> {
    outcome: OnceLock<Outcome<V>>,
    pending: Mutex<Vec<Callback<V>>>,
}

impl<V> ResultCell<V> {
    fn new() -> Self {
        Self {
            outcome: OnceLock::new(),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn settled(outcome: Outcome<V>) -> Self {
        Self {
            outcome: OnceLock::from(outcome),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Option<&Outcome<V>> {
        self.outcome.get()
    }

    fn settle(&self, outcome: Outcome<V>) -> Result<(), FetchError> {
        let callbacks = {
            let mut pending = self.pending.lock();
            if self.outcome.set(outcome).is_err() {
                return Err(FetchError::AlreadySettled);
            }
            std::mem::take(&mut *pending)
        };

        // Callbacks run without holding the lock, they are free to observe this cell again.
        // A panicking callback does not keep the others from running. The first panic is
        // raised again once every callback had its turn.
        let mut panic = None;
        if let Some(outcome) = self.outcome.get() {
            for callback in callbacks {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
                    panic.get_or_insert(payload);
                }
            }
        }
        if let Some(payload) = panic {
            resume_unwind(payload);
        }

        Ok(())
    }

    fn observe(&self, callback: Callback<V>) {
        {
            let mut pending = self.pending.lock();
            if self.outcome.get().is_none() {
                pending.push(callback);
                return;
            }
        }

        if let Some(outcome) = self.outcome.get() {
            callback(outcome);
        }
    }
}

/// A read-only handle to the eventual outcome of an operation.
///
/// Cloning a `Future` creates another handle to the same [`ResultCell`].
pub struct Future<V> {
    cell: Arc<ResultCell<V>>,
}

impl<V> Clone for Future<V> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<V> Future<V> {
    /// Creates a future that has already succeeded with `value`.
    pub fn resolved(value: V) -> Self {
        Self::from_outcome(Ok(value))
    }

    /// Creates a future that has already failed with `error`.
    pub fn rejected(error: FetchError) -> Self {
        Self::from_outcome(Err(error))
    }

    /// Creates a future that is already settled with `outcome`.
    pub fn from_outcome(outcome: Outcome<V>) -> Self {
        Self {
            cell: Arc::new(ResultCell::settled(outcome)),
        }
    }

    /// Whether the outcome of this future is known.
    pub fn is_settled(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<V: Clone> Future<V> {
    /// Returns a copy of the outcome, if the future is settled.
    pub fn outcome(&self) -> Option<Outcome<V>> {
        self.cell.get().cloned()
    }

    /// Registers a callback that receives the outcome of this future.
    ///
    /// The callback is invoked exactly once. If the future is already settled, that happens
    /// synchronously, before this function returns. Otherwise it happens at settlement, in
    /// registration order relative to the other pending callbacks.
    ///
    /// A panic in one callback does not prevent the others from running. It propagates to the
    /// caller that settled the promise.
    ///
    /// There is no way to unregister a callback.
    pub fn observe<F>(&self, callback: F)
    where
        F: FnOnce(Outcome<V>) + Send + 'static,
    {
        self.cell
            .observe(Box::new(move |outcome| callback(outcome.clone())));
    }
}

impl<V> fmt::Debug for Future<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Allows async code to wait for the outcome.
///
/// If the promise is dropped without being settled, this resolves to
/// [`FetchError::Abandoned`].
impl<V> IntoFuture for Future<V>
where
    V: Clone + Send + Sync + 'static,
{
    type Output = Outcome<V>;
    type IntoFuture = BoxFuture<'static, Outcome<V>>;

    fn into_future(self) -> Self::IntoFuture {
        let (sender, receiver) = oneshot::channel();
        self.observe(move |outcome| {
            sender.send(outcome).ok();
        });

        receiver
            .map(|received| received.unwrap_or(Err(FetchError::Abandoned)))
            .boxed()
    }
}

/// The write handle of a [`ResultCell`].
///
/// A `Promise` cannot be cloned, so there is exactly one writer per cell. Dropping a promise
/// that was never settled rejects it with [`FetchError::Abandoned`], so observers and caches
/// waiting on it are never left hanging.
pub struct Promise<V> {
    cell: Arc<ResultCell<V>>,
}

impl<V> Promise<V> {
    /// Creates a promise with an empty cell.
    pub fn new() -> Self {
        Self {
            cell: Arc::new(ResultCell::new()),
        }
    }

    /// Creates a promise whose value is known up front.
    ///
    /// The cell is settled at construction, so every observer takes the settled path.
    pub fn with_value(value: V) -> Self {
        Self {
            cell: Arc::new(ResultCell::settled(Ok(value))),
        }
    }

    /// Returns a read handle to this promise's cell.
    pub fn future(&self) -> Future<V> {
        Future {
            cell: Arc::clone(&self.cell),
        }
    }

    /// Whether this promise has already been settled.
    pub fn is_settled(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Succeeds the promise with `value`.
    ///
    /// Returns [`FetchError::AlreadySettled`] if the promise was settled before. The existing
    /// outcome is left untouched in that case.
    pub fn resolve(&self, value: V) -> Result<(), FetchError> {
        self.settle(Ok(value))
    }

    /// Fails the promise with `error`.
    ///
    /// Returns [`FetchError::AlreadySettled`] if the promise was settled before.
    pub fn reject(&self, error: FetchError) -> Result<(), FetchError> {
        self.settle(Err(error))
    }

    /// Settles the promise with the given `outcome`, running all pending callbacks.
    pub fn settle(&self, outcome: Outcome<V>) -> Result<(), FetchError> {
        self.cell.settle(outcome)
    }
}

impl<V> Default for Promise<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for Promise<V> {
    fn drop(&mut self) {
        if !self.is_settled() && self.cell.settle(Err(FetchError::Abandoned)).is_ok() {
            tracing::trace!("Promise dropped before being settled");
        }
    }
}

impl<V> fmt::Debug for Promise<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.is_settled())
            .finish()
    }
}
