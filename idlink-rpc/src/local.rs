//! In-process endpoint backed by a table of connector factories.

use crate::connector::{
    ConnectorFactory, ConnectorInfo, ConnectorKey, ConnectorPoolHandler, OperationCall,
    ProgressSink,
};
use crate::error::{RemoteFailure, RpcError, RpcResult};
use crate::promise::Promise;
use dashmap::DashMap;
use idlink_pool::{PoolConfig, PoolError, PoolStats, ResourcePool};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

type ConnectorPool = ResourcePool<ConnectorPoolHandler>;

/// Builder for [`LocalEndpoint`].
#[derive(Default)]
pub struct LocalEndpointBuilder {
    factories: HashMap<ConnectorKey, Arc<dyn ConnectorFactory>>,
    pool_config: Option<PoolConfig>,
}

impl LocalEndpointBuilder {
    /// Register a factory under the key from its info.
    pub fn register<F: ConnectorFactory>(self, factory: F) -> Self {
        self.register_arc(Arc::new(factory))
    }

    /// Register a shared factory.
    pub fn register_arc(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        let key = factory.info().key;
        self.factories.insert(key, factory);
        self
    }

    /// Pool settings used for every pooled factory instead of its own.
    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = Some(config);
        self
    }

    /// Build the endpoint.
    pub fn build(self) -> Arc<LocalEndpoint> {
        info!(connectors = self.factories.len(), "Local endpoint ready");
        Arc::new(LocalEndpoint {
            factories: self.factories,
            pool_config: self.pool_config,
            pools: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Runs connectors in this process.
///
/// Factories that ask for pooling get one [`ResourcePool`] per distinct
/// connector key and configuration; the others build a fresh instance for
/// every operation and dispose it afterwards.
pub struct LocalEndpoint {
    factories: HashMap<ConnectorKey, Arc<dyn ConnectorFactory>>,
    pool_config: Option<PoolConfig>,
    pools: DashMap<String, Arc<ConnectorPool>>,
    closed: AtomicBool,
}

impl LocalEndpoint {
    /// Start building an endpoint.
    pub fn builder() -> LocalEndpointBuilder {
        LocalEndpointBuilder::default()
    }

    /// Registered connector keys, sorted.
    pub fn keys(&self) -> Vec<ConnectorKey> {
        let mut keys: Vec<_> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Info for a registered connector.
    pub fn find_info(&self, key: &ConnectorKey) -> Option<ConnectorInfo> {
        self.factories.get(key).map(|f| f.info())
    }

    /// Info as an already settled promise.
    pub fn find_info_async(&self, key: &ConnectorKey) -> Promise<ConnectorInfo> {
        match self.find_info(key) {
            Some(info) => Promise::resolved(info),
            None => Promise::rejected(not_found(key)),
        }
    }

    /// Whether the endpoint accepts work.
    pub fn is_operational(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Run an operation.
    pub async fn invoke(&self, call: OperationCall, progress: &dyn ProgressSink) -> RpcResult<Value> {
        if !self.is_operational() {
            return Err(RpcError::Closed);
        }
        let factory = self
            .factories
            .get(&call.key)
            .cloned()
            .ok_or_else(|| not_found(&call.key))?;

        match factory.pooling() {
            Some(config) => self.invoke_pooled(factory, config, call, progress).await,
            None => {
                let connector = factory.create(&call.config).await?;
                let result = connector.execute(call.operation, call.args, progress).await;
                connector.dispose();
                Ok(result?)
            }
        }
    }

    async fn invoke_pooled(
        &self,
        factory: Arc<dyn ConnectorFactory>,
        config: PoolConfig,
        call: OperationCall,
        progress: &dyn ProgressSink,
    ) -> RpcResult<Value> {
        let pool = self.pool_for(factory, config, &call)?;
        let connector = pool.borrow().await.map_err(pool_error)?;
        let result = connector.execute(call.operation, call.args, progress).await;
        pool.release(connector).await;
        Ok(result?)
    }

    fn pool_for(
        &self,
        factory: Arc<dyn ConnectorFactory>,
        config: PoolConfig,
        call: &OperationCall,
    ) -> RpcResult<Arc<ConnectorPool>> {
        let config_key = serde_json::to_string(&call.config)
            .map_err(|e| RpcError::application(format!("Unserializable configuration: {e}")))?;
        let pool_key = format!("{}|{}", call.key, config_key);

        let pool = self
            .pools
            .entry(pool_key)
            .or_try_insert_with(|| {
                let config = self.pool_config.clone().unwrap_or(config);
                debug!(connector = %call.key, max_objects = config.max_objects, "Creating connector pool");
                let handler = ConnectorPoolHandler::new(factory, call.config.clone());
                ResourcePool::new(handler, config).map(Arc::new)
            })
            .map_err(pool_error)?;
        Ok(Arc::clone(pool.value()))
    }

    /// Number of connector pools created so far.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Counters of every connector pool.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|p| p.value().stats()).collect()
    }

    /// Stop accepting work and shut down every pool.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let keys: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        for key in keys {
            if let Some((_, pool)) = self.pools.remove(&key) {
                pool.shutdown().await;
            }
        }
        info!("Local endpoint closed");
    }
}

impl fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEndpoint")
            .field("connectors", &self.keys())
            .field("pools", &self.pool_count())
            .field("operational", &self.is_operational())
            .finish()
    }
}

fn not_found(key: &ConnectorKey) -> RpcError {
    RpcError::Unsupported(format!("Connector not found: {key}"))
}

fn pool_error(err: PoolError) -> RpcError {
    RpcError::RequestRejected(RemoteFailure::resource(err.to_string()))
}
