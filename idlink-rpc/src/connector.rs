//! Connector model: keys, configuration, operations and the adapter traits.

use crate::error::{FailureKind, RemoteFailure};
use crate::request::ProgressHandler;
use async_trait::async_trait;
use idlink_pool::{HandlerError, ObjectPoolHandler, PoolConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Identifies a connector implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorKey {
    /// Bundle the connector ships in.
    pub bundle_name: String,
    /// Bundle version.
    pub bundle_version: String,
    /// Connector name within the bundle.
    pub connector_name: String,
}

impl ConnectorKey {
    /// Create a key.
    pub fn new(
        bundle_name: impl Into<String>,
        bundle_version: impl Into<String>,
        connector_name: impl Into<String>,
    ) -> Self {
        Self {
            bundle_name: bundle_name.into(),
            bundle_version: bundle_version.into(),
            connector_name: connector_name.into(),
        }
    }
}

impl fmt::Display for ConnectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.bundle_name, self.bundle_version, self.connector_name
        )
    }
}

/// Configuration handed to a connector instance.
///
/// Credentials are opaque bytes and never printed.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Configuration properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Opaque credential blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Vec<u8>>,
}

impl ConnectorConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Set the credentials.
    pub fn with_credentials(mut self, credentials: impl Into<Vec<u8>>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    /// Get a property.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("properties", &self.properties)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Description of an available connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    /// Connector key.
    pub key: ConnectorKey,
    /// Display name.
    pub display_name: String,
    /// Configuration a new instance starts from.
    pub default_config: ConnectorConfig,
}

/// Operations a connector can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create an object.
    Create,
    /// Read one object.
    Get,
    /// Update an object.
    Update,
    /// Delete an object.
    Delete,
    /// Stream objects matching a filter.
    Search,
    /// Stream changes since a token.
    Sync,
    /// Check the configuration against the backend.
    Test,
}

impl OperationKind {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Get => "get",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Search => "search",
            Self::Sync => "sync",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operation invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCall {
    /// Target connector.
    pub key: ConnectorKey,
    /// Instance configuration.
    pub config: ConnectorConfig,
    /// Operation to run.
    pub operation: OperationKind,
    /// Operation arguments.
    #[serde(default)]
    pub args: Value,
}

impl OperationCall {
    /// Create a call.
    pub fn new(key: ConnectorKey, config: ConnectorConfig, operation: OperationKind, args: Value) -> Self {
        Self {
            key,
            config,
            operation,
            args,
        }
    }

    /// Key used to route this call: connector plus operation.
    pub fn route_key(&self) -> String {
        format!("{}#{}", self.key, self.operation)
    }
}

/// Where a running operation streams its items.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Emit one item. Returns `false` when the consumer is gone and the
    /// operation should stop.
    async fn progress(&self, item: Value) -> bool;

    /// Whether the caller cancelled the operation.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Sink that drops every item.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn progress(&self, _item: Value) -> bool {
        true
    }
}

/// Sink that forwards items to a [`ProgressHandler`].
pub struct CallbackSink(pub ProgressHandler);

#[async_trait]
impl ProgressSink for CallbackSink {
    async fn progress(&self, item: Value) -> bool {
        (self.0)(item);
        true
    }
}

/// A connector instance bound to one configuration.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Run an operation.
    async fn execute(
        &self,
        operation: OperationKind,
        args: Value,
        progress: &dyn ProgressSink,
    ) -> Result<Value, RemoteFailure>;

    /// Check that the instance can still reach its backend.
    async fn check_alive(&self) -> Result<(), RemoteFailure> {
        Ok(())
    }

    /// Release backend resources.
    fn dispose(&self) {}
}

/// Builds connector instances for one [`ConnectorKey`].
#[async_trait]
pub trait ConnectorFactory: Send + Sync + 'static {
    /// Connector description.
    fn info(&self) -> ConnectorInfo;

    /// Pool settings, or `None` to build a fresh instance per operation.
    fn pooling(&self) -> Option<PoolConfig> {
        None
    }

    /// Build an instance.
    async fn create(&self, config: &ConnectorConfig) -> Result<Box<dyn Connector>, RemoteFailure>;
}

/// Pools connector instances of one factory and configuration.
pub struct ConnectorPoolHandler {
    factory: Arc<dyn ConnectorFactory>,
    config: ConnectorConfig,
}

impl ConnectorPoolHandler {
    /// Create a handler.
    pub fn new(factory: Arc<dyn ConnectorFactory>, config: ConnectorConfig) -> Self {
        Self { factory, config }
    }
}

#[async_trait]
impl ObjectPoolHandler for ConnectorPoolHandler {
    type Object = Box<dyn Connector>;

    fn validate(&self, config: PoolConfig) -> Result<PoolConfig, HandlerError> {
        if config.max_objects == 0 {
            let key = self.factory.info().key;
            return Err(Box::new(RemoteFailure::new(
                FailureKind::Resource,
                format!("connector {key} needs at least one pooled instance"),
            )));
        }
        Ok(config)
    }

    async fn make_object(&self) -> Result<Box<dyn Connector>, HandlerError> {
        Ok(self.factory.create(&self.config).await?)
    }

    async fn test_object(&self, object: &Box<dyn Connector>) -> Result<(), HandlerError> {
        Ok(object.check_alive().await?)
    }

    fn dispose_object(&self, object: Box<dyn Connector>) -> Result<(), HandlerError> {
        object.dispose();
        Ok(())
    }
}
