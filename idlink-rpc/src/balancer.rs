//! Load balancing across redundant endpoints.
//!
//! # Policies
//!
//! - **Round robin**: one shared cursor. A call whose route key equals the
//!   previous call's stays on the same delegate; a new key advances it.
//! - **Failover**: delegates in priority order. A call starts at the last
//!   delegate that served its route key, moves on when a delegate fails,
//!   and wraps around once.
//!
//! Delegates are [`Endpoint`]s, so a balancer can sit inside another one.
//! Non-operational delegates are skipped by both policies.
//!
//! # Lookups
//!
//! [`LoadBalancer::find_info`] asks the delegates present now and fails once
//! all of them have. [`LoadBalancer::find_info_async`] stays open for
//! delegates added later; concurrent open lookups for one key share a single
//! registration, which is dropped as soon as it settles.

use crate::aggregate::DeferredPromise;
use crate::connector::{ConnectorConfig, ConnectorInfo, ConnectorKey, OperationCall};
use crate::endpoint::{ConnectorFacade, Endpoint};
use crate::error::{RpcError, RpcResult};
use crate::promise::Promise;
use crate::request::ProgressHandler;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, select_ok};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Delegate selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    /// Rotate through delegates.
    #[default]
    RoundRobin,
    /// Use delegates in priority order, moving on when one fails.
    Failover,
}

/// Balancer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Name used in logs.
    pub name: String,
    /// Selection policy.
    pub policy: BalancePolicy,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            policy: BalancePolicy::default(),
        }
    }
}

/// Balancer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalancerStats {
    /// Calls handed to a delegate, retries included.
    pub dispatched: u64,
    /// Times a failover call moved to the next delegate.
    pub failovers: u64,
    /// Calls that failed on every delegate.
    pub exhausted: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    failovers: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Default)]
struct Cursor {
    last_key: Option<String>,
    index: Option<usize>,
}

/// Composes several endpoints into one.
pub struct LoadBalancer {
    name: String,
    policy: BalancePolicy,
    delegates: RwLock<Vec<Endpoint>>,
    cursor: Mutex<Cursor>,
    last_good: DashMap<String, usize>,
    pending: DashMap<ConnectorKey, DeferredPromise<ConnectorInfo>>,
    counters: Counters,
    closed: AtomicBool,
    self_ref: Weak<LoadBalancer>,
}

impl LoadBalancer {
    /// Create a balancer.
    pub fn new(name: impl Into<String>, policy: BalancePolicy, delegates: Vec<Endpoint>) -> Arc<Self> {
        let name = name.into();
        info!(balancer = %name, ?policy, delegates = delegates.len(), "Load balancer created");
        Arc::new_cyclic(|self_ref| Self {
            name,
            policy,
            delegates: RwLock::new(delegates),
            cursor: Mutex::new(Cursor::default()),
            last_good: DashMap::new(),
            pending: DashMap::new(),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Create a balancer from settings.
    pub fn from_config(config: &BalancerConfig, delegates: Vec<Endpoint>) -> Arc<Self> {
        Self::new(config.name.clone(), config.policy, delegates)
    }

    /// Balancer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Selection policy.
    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    /// Snapshot of the delegates.
    pub fn delegates(&self) -> Vec<Endpoint> {
        self.delegates.read().clone()
    }

    /// Counters.
    pub fn stats(&self) -> BalancerStats {
        BalancerStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            failovers: self.counters.failovers.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Number of connector keys with an open lookup.
    pub fn pending_lookups(&self) -> usize {
        self.pending.len()
    }

    /// Whether the balancer is open and has an operational delegate.
    pub fn is_operational(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.delegates.read().iter().any(|d| d.is_operational())
    }

    /// Add a delegate. Pending lookups ask it too.
    pub fn add_delegate(&self, delegate: Endpoint) {
        self.delegates.write().push(delegate.clone());
        debug!(balancer = %self.name, "Delegate added");

        let lookups: Vec<(ConnectorKey, DeferredPromise<ConnectorInfo>)> = self
            .pending
            .iter()
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect();
        for (key, aggregate) in lookups {
            if aggregate.is_pending() {
                aggregate.add(&delegate.find_info_async(&key));
            }
        }
    }

    /// Remove a delegate. Returns `false` if it was not present.
    pub fn remove_delegate(&self, delegate: &Endpoint) -> bool {
        let mut delegates = self.delegates.write();
        let before = delegates.len();
        delegates.retain(|d| !d.ptr_eq(delegate));
        delegates.len() != before
    }

    /// Look up connector info on every delegate; the first answer wins.
    ///
    /// The lookup stays open for delegates added later and only fails if
    /// the balancer is closed. A lookup already open for `key` is shared.
    pub fn find_info_async(&self, key: &ConnectorKey) -> Promise<ConnectorInfo> {
        if self.closed.load(Ordering::SeqCst) {
            return Promise::rejected(RpcError::Closed);
        }

        let aggregate = match self.pending.entry(key.clone()) {
            Entry::Occupied(open) => return open.get().promise(),
            Entry::Vacant(slot) => slot.insert(DeferredPromise::new(true)).value().clone(),
        };

        let balancer = self.self_ref.clone();
        let registered = key.clone();
        aggregate.promise().on_settle(move |_| {
            if let Some(balancer) = balancer.upgrade() {
                balancer
                    .pending
                    .remove_if(&registered, |_, aggregate| !aggregate.is_pending());
            }
        });

        for delegate in self.delegates() {
            aggregate.add(&delegate.find_info_async(key));
        }
        aggregate.promise()
    }

    /// Look up connector info on the delegates present now.
    ///
    /// Nested balancers are asked with this bounded lookup too, so the call
    /// always settles once every delegate has answered.
    pub async fn find_info(&self, key: &ConnectorKey) -> RpcResult<ConnectorInfo> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let lookups: Vec<_> = self.delegates().iter().map(|d| d.find_info(key)).collect();
        if lookups.is_empty() {
            return Err(RpcError::AggregateFailed(Box::new(RpcError::NoDelegate)));
        }
        match select_ok(lookups).await {
            Ok((info, _)) => Ok(info),
            Err(last) => Err(RpcError::AggregateFailed(Box::new(last))),
        }
    }

    /// Run an operation on the delegate the policy picks.
    pub fn invoke(
        &self,
        call: OperationCall,
        progress: Option<ProgressHandler>,
    ) -> BoxFuture<'static, RpcResult<Value>> {
        let Some(this) = self.self_ref.upgrade() else {
            return Box::pin(async { Err(RpcError::Closed) });
        };
        Box::pin(async move {
            match this.policy {
                BalancePolicy::RoundRobin => this.invoke_round_robin(call, progress).await,
                BalancePolicy::Failover => this.invoke_failover(call, progress).await,
            }
        })
    }

    async fn invoke_round_robin(
        &self,
        call: OperationCall,
        progress: Option<ProgressHandler>,
    ) -> RpcResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let (_, delegate) = self.next_round_robin(&call.route_key())?;
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        delegate.invoke(call, progress).await
    }

    async fn invoke_failover(
        &self,
        call: OperationCall,
        progress: Option<ProgressHandler>,
    ) -> RpcResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let delegates = self.delegates();
        if delegates.is_empty() {
            return Err(RpcError::NoDelegate);
        }

        let route_key = call.route_key();
        let start = self.failover_start(&route_key, delegates.len());
        let mut last_error = None;

        for offset in 0..delegates.len() {
            let index = (start + offset) % delegates.len();
            let delegate = &delegates[index];
            if !delegate.is_operational() {
                continue;
            }

            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            match delegate.invoke(call.clone(), progress.clone()).await {
                Ok(value) => {
                    self.last_good.insert(route_key, index);
                    return Ok(value);
                }
                Err(e) if e.is_delegate_failure() => {
                    warn!(balancer = %self.name, delegate = index, error = %e, "Delegate failed, trying next");
                    self.counters.failovers.fetch_add(1, Ordering::Relaxed);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        Err(RpcError::AggregateFailed(Box::new(
            last_error.unwrap_or(RpcError::NoDelegate),
        )))
    }

    fn failover_start(&self, route_key: &str, len: usize) -> usize {
        self.last_good.get(route_key).map_or(0, |i| *i % len)
    }

    /// Index the round-robin policy would serve `route_key` from.
    fn round_robin_index(cursor: &Cursor, route_key: &str, delegates: &[Endpoint]) -> Option<usize> {
        let len = delegates.len();
        let start = match cursor.index {
            Some(index) if cursor.last_key.as_deref() == Some(route_key) => index % len,
            Some(index) => (index + 1) % len,
            None => 0,
        };
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&index| delegates[index].is_operational())
    }

    /// Advance the round-robin cursor for `route_key`.
    fn next_round_robin(&self, route_key: &str) -> RpcResult<(usize, Endpoint)> {
        let delegates = self.delegates();
        if delegates.is_empty() {
            return Err(RpcError::NoDelegate);
        }

        let mut cursor = self.cursor.lock();
        let index = Self::round_robin_index(&cursor, route_key, &delegates).ok_or(RpcError::NoDelegate)?;
        cursor.index = Some(index);
        cursor.last_key = Some(route_key.to_string());
        Ok((index, delegates[index].clone()))
    }

    /// The delegate the policy would choose, leaving the cursor untouched.
    fn pick(&self, route_key: &str) -> RpcResult<Endpoint> {
        match self.policy {
            BalancePolicy::RoundRobin => {
                let delegates = self.delegates();
                if delegates.is_empty() {
                    return Err(RpcError::NoDelegate);
                }
                let cursor = self.cursor.lock();
                Self::round_robin_index(&cursor, route_key, &delegates)
                    .map(|index| delegates[index].clone())
                    .ok_or(RpcError::NoDelegate)
            }
            BalancePolicy::Failover => {
                let delegates = self.delegates();
                if delegates.is_empty() {
                    return Err(RpcError::NoDelegate);
                }
                let start = self.failover_start(route_key, delegates.len());
                (0..delegates.len())
                    .map(|offset| &delegates[(start + offset) % delegates.len()])
                    .find(|d| d.is_operational())
                    .cloned()
                    .ok_or(RpcError::NoDelegate)
            }
        }
    }

    /// Create a facade bound to this balancer.
    ///
    /// The policy-chosen delegate supplies the default configuration, falling
    /// back to any delegate that knows the connector.
    pub async fn new_instance<F>(&self, key: &ConnectorKey, transformer: F) -> RpcResult<ConnectorFacade>
    where
        F: FnOnce(ConnectorConfig) -> ConnectorConfig + Send,
    {
        let this = self.self_ref.upgrade().ok_or(RpcError::Closed)?;
        let delegate = self.pick(&format!("{key}#info"))?;

        let info = match delegate.find_info(key).await {
            Ok(info) => info,
            Err(e) => {
                debug!(balancer = %self.name, connector = %key, error = %e, "Chosen delegate lacks connector info");
                self.find_info(key).await?
            }
        };
        Ok(ConnectorFacade::new(
            Endpoint::Balanced(this),
            key.clone(),
            transformer(info.default_config),
        ))
    }

    /// Close the balancer. Pending lookups fail with [`RpcError::Closed`];
    /// delegates are left open.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let keys: Vec<ConnectorKey> = self.pending.iter().map(|p| p.key().clone()).collect();
        for key in keys {
            if let Some((_, aggregate)) = self.pending.remove(&key) {
                aggregate.shutdown();
            }
        }
        info!(balancer = %self.name, "Load balancer closed");
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("delegates", &self.delegates.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}
