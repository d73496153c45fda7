//! The endpoint abstraction shared by local, remote and balanced endpoints.

use crate::balancer::LoadBalancer;
use crate::connector::{CallbackSink, ConnectorConfig, ConnectorInfo, ConnectorKey, NoProgress, OperationCall, OperationKind};
use crate::error::RpcResult;
use crate::local::LocalEndpoint;
use crate::promise::Promise;
use crate::remote::RemoteEndpoint;
use crate::request::ProgressHandler;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;

/// Somewhere connectors can be looked up and invoked.
#[derive(Clone)]
pub enum Endpoint {
    /// Connectors in this process.
    Local(Arc<LocalEndpoint>),
    /// Connectors on the peer of a connection group.
    Remote(Arc<RemoteEndpoint>),
    /// Several endpoints behind a policy.
    Balanced(Arc<LoadBalancer>),
}

impl Endpoint {
    /// Look up connector info.
    ///
    /// A balanced endpoint keeps the lookup open for delegates added later.
    pub fn find_info_async(&self, key: &ConnectorKey) -> Promise<ConnectorInfo> {
        match self {
            Self::Local(local) => local.find_info_async(key),
            Self::Remote(remote) => remote.find_info_async(key),
            Self::Balanced(balancer) => balancer.find_info_async(key),
        }
    }

    /// Look up connector info among the endpoints available now.
    ///
    /// Always settles, including through nested balancers.
    pub fn find_info(&self, key: &ConnectorKey) -> BoxFuture<'static, RpcResult<ConnectorInfo>> {
        let key = key.clone();
        match self {
            Self::Local(local) => local.find_info_async(&key).into_future(),
            Self::Remote(remote) => {
                let remote = Arc::clone(remote);
                Box::pin(async move { remote.find_info(&key).await })
            }
            Self::Balanced(balancer) => {
                let balancer = Arc::clone(balancer);
                Box::pin(async move { balancer.find_info(&key).await })
            }
        }
    }

    /// Run an operation.
    pub fn invoke(
        &self,
        call: OperationCall,
        progress: Option<ProgressHandler>,
    ) -> BoxFuture<'static, RpcResult<Value>> {
        match self {
            Self::Local(local) => {
                let local = Arc::clone(local);
                Box::pin(async move {
                    match progress {
                        Some(handler) => local.invoke(call, &CallbackSink(handler)).await,
                        None => local.invoke(call, &NoProgress).await,
                    }
                })
            }
            Self::Remote(remote) => {
                let remote = Arc::clone(remote);
                Box::pin(async move { remote.invoke(call, progress).await })
            }
            Self::Balanced(balancer) => balancer.invoke(call, progress),
        }
    }

    /// Create a facade for `key`, starting from the connector's default
    /// configuration adjusted by `transformer`.
    pub async fn new_instance<F>(&self, key: &ConnectorKey, transformer: F) -> RpcResult<ConnectorFacade>
    where
        F: FnOnce(ConnectorConfig) -> ConnectorConfig + Send,
    {
        match self {
            Self::Balanced(balancer) => balancer.new_instance(key, transformer).await,
            _ => {
                let info = self.find_info(key).await?;
                Ok(ConnectorFacade::new(
                    self.clone(),
                    key.clone(),
                    transformer(info.default_config),
                ))
            }
        }
    }

    /// Whether the endpoint can take work.
    pub fn is_operational(&self) -> bool {
        match self {
            Self::Local(local) => local.is_operational(),
            Self::Remote(remote) => remote.is_operational(),
            Self::Balanced(balancer) => balancer.is_operational(),
        }
    }

    /// Close the endpoint.
    pub async fn close(&self) {
        match self {
            Self::Local(local) => local.close().await,
            Self::Remote(remote) => remote.close().await,
            Self::Balanced(balancer) => balancer.close(),
        }
    }

    /// Whether both values refer to the same endpoint.
    pub fn ptr_eq(&self, other: &Endpoint) -> bool {
        match (self, other) {
            (Self::Local(a), Self::Local(b)) => Arc::ptr_eq(a, b),
            (Self::Remote(a), Self::Remote(b)) => Arc::ptr_eq(a, b),
            (Self::Balanced(a), Self::Balanced(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Arc<LocalEndpoint>> for Endpoint {
    fn from(endpoint: Arc<LocalEndpoint>) -> Self {
        Self::Local(endpoint)
    }
}

impl From<Arc<RemoteEndpoint>> for Endpoint {
    fn from(endpoint: Arc<RemoteEndpoint>) -> Self {
        Self::Remote(endpoint)
    }
}

impl From<Arc<LoadBalancer>> for Endpoint {
    fn from(balancer: Arc<LoadBalancer>) -> Self {
        Self::Balanced(balancer)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(local) => f.debug_tuple("Local").field(local).finish(),
            Self::Remote(remote) => f.debug_tuple("Remote").field(remote).finish(),
            Self::Balanced(balancer) => f.debug_tuple("Balanced").field(&balancer.name()).finish(),
        }
    }
}

/// A configured connector instance on some endpoint.
#[derive(Debug, Clone)]
pub struct ConnectorFacade {
    endpoint: Endpoint,
    key: ConnectorKey,
    config: ConnectorConfig,
}

impl ConnectorFacade {
    /// Bind a key and configuration to an endpoint.
    pub fn new(endpoint: Endpoint, key: ConnectorKey, config: ConnectorConfig) -> Self {
        Self {
            endpoint,
            key,
            config,
        }
    }

    /// Connector key.
    pub fn key(&self) -> &ConnectorKey {
        &self.key
    }

    /// Instance configuration.
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Endpoint the calls go to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn call(&self, operation: OperationKind, args: Value) -> OperationCall {
        OperationCall::new(self.key.clone(), self.config.clone(), operation, args)
    }

    /// Run an operation.
    pub async fn execute(&self, operation: OperationKind, args: Value) -> RpcResult<Value> {
        self.endpoint.invoke(self.call(operation, args), None).await
    }

    /// Run an operation, streaming progress items to `handler`.
    pub async fn execute_with_progress<F>(
        &self,
        operation: OperationKind,
        args: Value,
        handler: F,
    ) -> RpcResult<Value>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.endpoint
            .invoke(self.call(operation, args), Some(Arc::new(handler)))
            .await
    }

    /// Create an object; returns its uid.
    pub async fn create(&self, attributes: Value) -> RpcResult<Value> {
        self.execute(OperationKind::Create, json!({ "attributes": attributes }))
            .await
    }

    /// Read an object.
    pub async fn get(&self, uid: &str) -> RpcResult<Value> {
        self.execute(OperationKind::Get, json!({ "uid": uid })).await
    }

    /// Update an object; returns its uid.
    pub async fn update(&self, uid: &str, attributes: Value) -> RpcResult<Value> {
        self.execute(
            OperationKind::Update,
            json!({ "uid": uid, "attributes": attributes }),
        )
        .await
    }

    /// Delete an object.
    pub async fn delete(&self, uid: &str) -> RpcResult<()> {
        self.execute(OperationKind::Delete, json!({ "uid": uid }))
            .await
            .map(|_| ())
    }

    /// Stream objects matching `filter` to `handler`.
    pub async fn search<F>(&self, filter: Value, handler: F) -> RpcResult<Value>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.execute_with_progress(OperationKind::Search, json!({ "filter": filter }), handler)
            .await
    }

    /// Stream changes since `token` to `handler`; returns the new token.
    pub async fn sync<F>(&self, token: Value, handler: F) -> RpcResult<Value>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.execute_with_progress(OperationKind::Sync, json!({ "token": token }), handler)
            .await
    }

    /// Check the configuration against the backend.
    pub async fn test(&self) -> RpcResult<()> {
        self.execute(OperationKind::Test, Value::Null).await.map(|_| ())
    }
}
