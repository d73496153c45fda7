//! Bounded pool of expensive objects.
//!
//! Capacity is a semaphore sized `max_objects`: every live object, idle or
//! borrowed, holds one permit until it is disposed, so `active + idle` can
//! never exceed the configured maximum. Idle objects wait in a FIFO and are
//! always preferred over building a new one.
//!
//! A borrowed [`PoolEntry`] that is dropped instead of released is disposed
//! through the handler, so the counters and the first/last object callbacks
//! stay correct when a caller's future is cancelled mid-use.

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::handler::ObjectPoolHandler;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Where a dropped entry sends its object.
trait Reclaim<T>: Send + Sync {
    fn reclaim(&self, object: T, was_active: bool);
}

/// An object checked out of (or parked in) a [`ResourcePool`].
///
/// Hand it back with [`ResourcePool::release`] when done. Dropping it
/// instead disposes the object.
pub struct PoolEntry<T> {
    object: Option<T>,
    _permit: OwnedSemaphorePermit,
    home: Weak<dyn Reclaim<T>>,
    is_new: bool,
    is_active: bool,
    last_state_change: Instant,
}

impl<T> PoolEntry<T> {
    fn new(object: T, permit: OwnedSemaphorePermit, home: Weak<dyn Reclaim<T>>) -> Self {
        Self {
            object: Some(object),
            _permit: permit,
            home,
            is_new: true,
            is_active: false,
            last_state_change: Instant::now(),
        }
    }

    /// Whether the object was created for this borrow rather than recycled.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Whether the object is currently borrowed.
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// When the entry last moved between idle and active.
    pub fn last_state_change(&self) -> Instant {
        self.last_state_change
    }

    /// Time spent idle; zero while borrowed.
    pub fn idle_time(&self) -> Duration {
        if self.is_active {
            Duration::ZERO
        } else {
            self.last_state_change.elapsed()
        }
    }

    fn activate(&mut self) {
        self.is_active = true;
        self.last_state_change = Instant::now();
    }

    fn deactivate(&mut self) {
        self.is_active = false;
        self.is_new = false;
        self.last_state_change = Instant::now();
    }
}

impl<T> Deref for PoolEntry<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref().expect("pool entry used after disposal")
    }
}

impl<T> DerefMut for PoolEntry<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("pool entry used after disposal")
    }
}

impl<T> Drop for PoolEntry<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take()
            && let Some(home) = self.home.upgrade()
        {
            home.reclaim(object, self.is_active);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PoolEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("object", &self.object)
            .field("is_new", &self.is_new)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Point-in-time pool counters. Idle and active are read separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects parked in the idle queue.
    pub idle: usize,
    /// Objects currently borrowed.
    pub active: usize,
    /// Configured capacity.
    pub max_objects: usize,
}

enum Wake {
    Permit(OwnedSemaphorePermit),
    Released,
}

/// FIFO of idle entries whose head can be inspected in place.
///
/// Pushes go straight to the lock-free tail. Every pop goes through `head`,
/// which holds at most one entry that is older than anything in `tail`.
struct IdleQueue<T> {
    head: Mutex<Option<PoolEntry<T>>>,
    tail: SegQueue<PoolEntry<T>>,
}

impl<T> IdleQueue<T> {
    fn new() -> Self {
        Self {
            head: Mutex::new(None),
            tail: SegQueue::new(),
        }
    }

    fn push(&self, entry: PoolEntry<T>) {
        self.tail.push(entry);
    }

    fn pop(&self) -> Option<PoolEntry<T>> {
        let mut head = self.head.lock();
        head.take().or_else(|| self.tail.pop())
    }

    /// Pop the oldest entry only if `predicate` holds for it.
    fn pop_if(&self, predicate: impl FnOnce(&PoolEntry<T>) -> bool) -> Option<PoolEntry<T>> {
        let mut head = self.head.lock();
        if head.is_none() {
            *head = self.tail.pop();
        }
        match head.as_ref() {
            Some(entry) if predicate(entry) => head.take(),
            _ => None,
        }
    }

    fn len(&self) -> usize {
        let head = usize::from(self.head.lock().is_some());
        head + self.tail.len()
    }
}

/// State shared with outstanding entries.
struct Shared<H: ObjectPoolHandler> {
    handler: H,
    live: Mutex<usize>,
    active: AtomicUsize,
}

impl<H: ObjectPoolHandler> Shared<H> {
    fn dispose_object(&self, object: H::Object) {
        let result = {
            let mut live = self.live.lock();
            *live = live.saturating_sub(1);
            if *live == 0 {
                self.handler.dispose_last_object(object)
            } else {
                self.handler.dispose_object(object)
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to dispose pooled object");
        }
    }
}

impl<H: ObjectPoolHandler> Reclaim<H::Object> for Shared<H> {
    fn reclaim(&self, object: H::Object, was_active: bool) {
        if was_active {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("Pooled object dropped without release, disposing");
        self.dispose_object(object);
    }
}

/// Bounded concurrent pool of objects built by an [`ObjectPoolHandler`].
pub struct ResourcePool<H: ObjectPoolHandler> {
    shared: Arc<Shared<H>>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: IdleQueue<H::Object>,
    released: Notify,
    first_gate: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
}

impl<H: ObjectPoolHandler> ResourcePool<H> {
    /// Create a pool. The handler sees the configuration first.
    pub fn new(handler: H, config: PoolConfig) -> PoolResult<Self> {
        let config = handler
            .validate(config)
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        config.validate()?;

        debug!(
            max_objects = config.max_objects,
            max_idle = config.max_idle,
            max_wait_seconds = config.max_wait_seconds,
            "Resource pool initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                handler,
                live: Mutex::new(0),
                active: AtomicUsize::new(0),
            }),
            permits: Arc::new(Semaphore::new(config.max_objects)),
            config,
            idle: IdleQueue::new(),
            released: Notify::new(),
            first_gate: tokio::sync::Mutex::new(()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// The validated configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The handler backing this pool.
    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Best-effort counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            active: self.shared.active.load(Ordering::SeqCst),
            max_objects: self.config.max_objects,
        }
    }

    /// Check out an object, reusing an idle one when possible.
    ///
    /// Waits up to `max_wait_seconds` for capacity. A freshly built object
    /// that fails its test is reported as [`PoolError::ValidationFailed`]; a
    /// recycled one is discarded and the borrow starts over.
    pub async fn borrow(&self) -> PoolResult<PoolEntry<H::Object>> {
        let deadline = Instant::now() + self.config.max_wait();

        loop {
            if self.is_shutdown() {
                return Err(PoolError::Shutdown);
            }

            let candidate = match self.take_idle() {
                Some(entry) => entry,
                None => match self.wait_for_capacity(deadline).await? {
                    Wake::Permit(permit) => self.create(permit).await?,
                    Wake::Released => continue,
                },
            };

            if let Some(entry) = self.activate(candidate).await? {
                return Ok(entry);
            }
        }
    }

    /// Return a borrowed object.
    pub async fn release(&self, mut entry: PoolEntry<H::Object>) {
        if entry.is_active {
            self.shared.active.fetch_sub(1, Ordering::SeqCst);
        }
        entry.deactivate();

        if self.is_shutdown() || self.config.max_idle < 1 {
            self.dispose(entry);
            return;
        }

        self.evict_idle();
        self.idle.push(entry);
        self.released.notify_one();

        // Lost a race with shutdown(): nobody will drain this entry otherwise.
        if self.is_shutdown() {
            self.drain_idle();
        }
    }

    /// Stop issuing objects and dispose the idle ones.
    ///
    /// Borrowed objects are disposed when they are released or dropped.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        self.drain_idle();
        self.released.notify_waiters();
        debug!(active = self.shared.active.load(Ordering::SeqCst), "Resource pool shut down");
    }

    /// Pop the oldest idle entry, disposing stale ones on the way.
    fn take_idle(&self) -> Option<PoolEntry<H::Object>> {
        while self.idle.len() > self.config.min_idle {
            match self.idle.pop_if(|entry| self.is_stale(entry)) {
                Some(entry) => {
                    trace!(idle_ms = entry.idle_time().as_millis() as u64, "Evicting stale idle object");
                    self.dispose(entry);
                }
                None => break,
            }
        }
        self.idle.pop()
    }

    async fn wait_for_capacity(&self, deadline: Instant) -> PoolResult<Wake> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => return Ok(Wake::Permit(permit)),
            Err(TryAcquireError::Closed) => return Err(PoolError::Shutdown),
            Err(TryAcquireError::NoPermits) => {}
        }

        let released = self.released.notified();
        let permit = Arc::clone(&self.permits).acquire_owned();

        tokio::select! {
            biased;
            _ = released => Ok(Wake::Released),
            permit = permit => permit.map(Wake::Permit).map_err(|_| PoolError::Shutdown),
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    max_wait_seconds = self.config.max_wait_seconds,
                    "Timed out waiting for a pooled object"
                );
                Err(PoolError::Exhausted {
                    max_wait_seconds: self.config.max_wait_seconds,
                })
            }
        }
    }

    fn home(&self) -> Weak<dyn Reclaim<H::Object>> {
        Arc::downgrade(&self.shared) as Weak<dyn Reclaim<H::Object>>
    }

    async fn create(&self, permit: OwnedSemaphorePermit) -> PoolResult<PoolEntry<H::Object>> {
        let gate = self.first_gate.lock().await;
        let first = {
            let mut live = self.shared.live.lock();
            if *live == 0 {
                true
            } else {
                *live += 1;
                false
            }
        };

        let object = if first {
            // The gate stays held so no other object is built before the
            // shared setup done by the first one completes.
            let object = self
                .shared
                .handler
                .make_first_object()
                .await
                .map_err(|e| PoolError::Create(e.to_string()))?;
            *self.shared.live.lock() += 1;
            debug!("Created first pooled object");
            object
        } else {
            drop(gate);
            match self.shared.handler.make_object().await {
                Ok(object) => object,
                Err(e) => {
                    let mut live = self.shared.live.lock();
                    *live = live.saturating_sub(1);
                    return Err(PoolError::Create(e.to_string()));
                }
            }
        };

        Ok(PoolEntry::new(object, permit, self.home()))
    }

    async fn activate(
        &self,
        mut entry: PoolEntry<H::Object>,
    ) -> PoolResult<Option<PoolEntry<H::Object>>> {
        match self.shared.handler.test_object(&*entry).await {
            Ok(()) => {
                entry.activate();
                self.shared.active.fetch_add(1, Ordering::SeqCst);
                Ok(Some(entry))
            }
            Err(e) if entry.is_new => {
                warn!(error = %e, "Freshly created object failed validation");
                self.dispose(entry);
                Err(PoolError::ValidationFailed(e.to_string()))
            }
            Err(e) => {
                debug!(error = %e, "Discarding idle object that failed validation");
                self.dispose(entry);
                Ok(None)
            }
        }
    }

    /// Make room for one more idle entry and drop entries past their age.
    fn evict_idle(&self) {
        while self.idle.len() >= self.config.max_idle {
            match self.idle.pop() {
                Some(entry) => {
                    trace!("Evicting idle object above max_idle");
                    self.dispose(entry);
                }
                None => break,
            }
        }

        while self.idle.len() > self.config.min_idle {
            match self.idle.pop_if(|entry| self.is_stale(entry)) {
                Some(entry) => {
                    trace!(idle_ms = entry.idle_time().as_millis() as u64, "Evicting stale idle object");
                    self.dispose(entry);
                }
                None => break,
            }
        }
    }

    fn drain_idle(&self) {
        while let Some(entry) = self.idle.pop() {
            self.dispose(entry);
        }
    }

    fn is_stale(&self, entry: &PoolEntry<H::Object>) -> bool {
        entry.idle_time() >= self.config.min_evictable_idle()
    }

    /// Dispose the object; the permit is returned when `entry` drops.
    fn dispose(&self, mut entry: PoolEntry<H::Object>) {
        if let Some(object) = entry.object.take() {
            self.shared.dispose_object(object);
        }
    }
}

impl<H: ObjectPoolHandler> fmt::Debug for ResourcePool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
