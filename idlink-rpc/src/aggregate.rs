//! First-success-wins aggregation over several promises.
//!
//! A [`DeferredPromise`] settles with the first source that succeeds. It fails
//! only once every source has failed, carrying the last error seen. When
//! built with `expect_future_sources`, a placeholder keeps it pending until
//! [`seal`](DeferredPromise::seal) is called, so sources added late still count.
//!
//! Sources only hold a weak reference to the aggregate. A pending aggregate
//! keeps itself alive through its own promise until it settles.

use crate::error::RpcError;
use crate::promise::Promise;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::trace;

struct Counters {
    remaining: usize,
    sealed: bool,
    last_error: Option<RpcError>,
}

struct Shared<T> {
    promise: Promise<T>,
    counters: Mutex<Counters>,
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    fn source_settled(&self, outcome: &Result<T, RpcError>) {
        match outcome {
            Ok(value) => {
                self.promise.resolve(value.clone());
            }
            Err(err) => {
                let exhausted = {
                    let mut counters = self.counters.lock();
                    counters.last_error = Some(err.clone());
                    counters.remaining = counters.remaining.saturating_sub(1);
                    counters.remaining == 0
                };
                if exhausted {
                    self.fail();
                }
            }
        }
    }

    fn fail(&self) {
        let last = self
            .counters
            .lock()
            .last_error
            .clone()
            .unwrap_or(RpcError::NoDelegate);
        if self.promise.reject(RpcError::AggregateFailed(Box::new(last))) {
            trace!("Aggregate failed after every source failed");
        }
    }
}

/// Aggregate of N source promises.
pub struct DeferredPromise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DeferredPromise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DeferredPromise<T> {
    /// Create an aggregate.
    ///
    /// Without `expect_future_sources` the aggregate starts with nothing to
    /// wait for and is rejected right away with
    /// `AggregateFailed(NoDelegate)`.
    pub fn new(expect_future_sources: bool) -> Self {
        let shared = Arc::new(Shared {
            promise: Promise::new(),
            counters: Mutex::new(Counters {
                remaining: usize::from(expect_future_sources),
                sealed: !expect_future_sources,
                last_error: None,
            }),
        });
        if expect_future_sources {
            let keep = Arc::clone(&shared);
            shared.promise.on_settle(move |_| drop(keep));
        } else {
            shared.fail();
        }
        Self { shared }
    }

    /// Add a source. Returns whether the aggregate is still pending.
    pub fn add(&self, source: &Promise<T>) -> bool {
        if self.shared.promise.is_settled() {
            return false;
        }
        self.shared.counters.lock().remaining += 1;

        let shared: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        source.on_settle(move |outcome| {
            if let Some(shared) = shared.upgrade() {
                shared.source_settled(outcome);
            }
        });
        !self.shared.promise.is_settled()
    }

    /// Stop expecting further sources.
    pub fn seal(&self) {
        let exhausted = {
            let mut counters = self.shared.counters.lock();
            if counters.sealed {
                return;
            }
            counters.sealed = true;
            counters.remaining = counters.remaining.saturating_sub(1);
            counters.remaining == 0
        };
        if exhausted {
            self.shared.fail();
        }
    }

    /// Force-settle with [`RpcError::Closed`].
    pub fn shutdown(&self) {
        self.shared.promise.reject(RpcError::Closed);
    }

    /// Whether the aggregate is still waiting.
    pub fn is_pending(&self) -> bool {
        !self.shared.promise.is_settled()
    }

    /// The aggregate promise.
    pub fn promise(&self) -> Promise<T> {
        self.shared.promise.clone()
    }
}

/// Settle with the first source that succeeds, or fail once all have failed.
///
/// An empty set fails with `AggregateFailed(NoDelegate)`.
pub fn when<T, I>(sources: I) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let deferred = DeferredPromise::new(true);
    for source in sources {
        deferred.add(&source);
    }
    deferred.seal();
    deferred.promise()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate_of(err: RpcError) -> RpcError {
        RpcError::AggregateFailed(Box::new(err))
    }

    #[test]
    fn test_empty_set_fails() {
        let promise: Promise<u32> = when(Vec::new());
        assert_eq!(promise.outcome(), Some(Err(aggregate_of(RpcError::NoDelegate))));
    }

    #[test]
    fn test_not_expecting_sources_rejects_immediately() {
        let deferred: DeferredPromise<u32> = DeferredPromise::new(false);
        assert!(!deferred.is_pending());
        assert!(!deferred.add(&Promise::resolved(1)));
        assert_eq!(
            deferred.promise().outcome(),
            Some(Err(aggregate_of(RpcError::NoDelegate)))
        );
    }

    #[test]
    fn test_first_success_wins() {
        let sources: Vec<Promise<u32>> = (0..3).map(|_| Promise::new()).collect();
        let aggregate = when(sources.clone());

        sources[0].reject(RpcError::transport("down"));
        assert!(!aggregate.is_settled());
        sources[2].resolve(42);
        sources[1].resolve(7);
        assert_eq!(aggregate.outcome(), Some(Ok(42)));
    }

    #[test]
    fn test_all_failures_carry_last_error() {
        let sources: Vec<Promise<u32>> = (0..3).map(|_| Promise::new()).collect();
        let aggregate = when(sources.clone());

        sources[1].reject(RpcError::NoDelegate);
        sources[0].reject(RpcError::Closed);
        assert!(!aggregate.is_settled());
        sources[2].reject(RpcError::Unsupported("search".into()));

        assert_eq!(
            aggregate.outcome(),
            Some(Err(aggregate_of(RpcError::Unsupported("search".into()))))
        );
    }

    #[test]
    fn test_late_source_before_seal() {
        let deferred: DeferredPromise<&'static str> = DeferredPromise::new(true);
        assert!(deferred.add(&Promise::rejected(RpcError::NoDelegate)));
        assert!(deferred.is_pending());

        let late = Promise::new();
        assert!(deferred.add(&late));
        late.resolve("found");
        assert_eq!(deferred.promise().outcome(), Some(Ok("found")));

        deferred.seal();
        assert_eq!(deferred.promise().outcome(), Some(Ok("found")));
    }

    #[test]
    fn test_seal_after_all_failed_rejects() {
        let deferred: DeferredPromise<u8> = DeferredPromise::new(true);
        deferred.add(&Promise::rejected(RpcError::Closed));
        assert!(deferred.is_pending());
        deferred.seal();
        deferred.seal();
        assert_eq!(
            deferred.promise().outcome(),
            Some(Err(aggregate_of(RpcError::Closed)))
        );
    }

    #[test]
    fn test_settled_aggregate_is_not_held_by_open_sources() {
        let fast = Promise::resolved(1u8);
        let never = Promise::new();
        let deferred = DeferredPromise::new(true);
        deferred.add(&never);
        deferred.add(&fast);
        assert_eq!(deferred.promise().outcome(), Some(Ok(1)));

        let weak = Arc::downgrade(&deferred.shared);
        drop(deferred);
        assert!(weak.upgrade().is_none());
        assert!(!never.is_settled());
    }

    #[test]
    fn test_pending_aggregate_outlives_its_handle() {
        let source = Promise::new();
        let aggregate = when([source.clone()]);
        assert!(!aggregate.is_settled());

        source.resolve(5u8);
        assert_eq!(aggregate.outcome(), Some(Ok(5)));
    }

    #[test]
    fn test_shutdown() {
        let deferred: DeferredPromise<u8> = DeferredPromise::new(true);
        deferred.shutdown();
        assert_eq!(deferred.promise().outcome(), Some(Err(RpcError::Closed)));
    }
}
