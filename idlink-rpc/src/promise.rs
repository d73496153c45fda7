//! Single-assignment promise settled by one writer and awaited by many.

use crate::error::{RpcError, RpcResult};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::Notify;

type Callback<T> = Box<dyn FnOnce(&RpcResult<T>) + Send>;

struct State<T> {
    outcome: Option<RpcResult<T>>,
    callbacks: Vec<Callback<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    settled: Notify,
}

/// A value that becomes available later, or an [`RpcError`].
///
/// Clones share the same slot. The first call to [`resolve`](Self::resolve),
/// [`reject`](Self::reject) or [`cancel`](Self::cancel) wins; later calls
/// return `false` and change nothing.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Create an unsettled promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    callbacks: Vec::new(),
                }),
                settled: Notify::new(),
            }),
        }
    }

    /// Create a promise that is already resolved.
    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        promise.resolve(value);
        promise
    }

    /// Create a promise that is already rejected.
    pub fn rejected(err: RpcError) -> Self {
        let promise = Self::new();
        promise.reject(err);
        promise
    }

    /// Settle with a value.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error.
    pub fn reject(&self, err: RpcError) -> bool {
        self.settle(Err(err))
    }

    /// Settle with [`RpcError::RequestCancelled`].
    pub fn cancel(&self) -> bool {
        self.settle(Err(RpcError::RequestCancelled))
    }

    /// Settle with the given outcome.
    pub fn settle(&self, outcome: RpcResult<T>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };

        for callback in callbacks {
            callback(&outcome);
        }
        self.inner.settled.notify_waiters();
        true
    }

    /// Whether the promise has an outcome.
    pub fn is_settled(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// The outcome, if settled.
    pub fn outcome(&self) -> Option<RpcResult<T>> {
        self.inner.state.lock().outcome.clone()
    }

    /// Run `callback` once the promise settles, or right away if it already has.
    pub fn on_settle<F>(&self, callback: F)
    where
        F: FnOnce(&RpcResult<T>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.inner.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> RpcResult<T> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Promise<T> {
    type Output = RpcResult<T>;
    type IntoFuture = BoxFuture<'static, RpcResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settled = self.inner.state.lock().outcome.is_some();
        f.debug_struct("Promise").field("settled", &settled).finish()
    }
}
