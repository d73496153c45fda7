//! Endpoint reached through a [`ConnectionGroup`], and the service answering it.

use crate::connector::{ConnectorInfo, ConnectorKey, OperationCall};
use crate::error::{RemoteFailure, RpcError, RpcResult};
use crate::group::{ConnectionGroup, RequestHandler};
use crate::local::LocalEndpoint;
use crate::promise::Promise;
use crate::request::{LocalRequest, ProgressHandler, RequestOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Calls understood by [`EndpointService`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum EndpointCall {
    /// Look up connector info.
    FindInfo {
        /// Connector to describe.
        key: ConnectorKey,
    },
    /// Run an operation.
    Invoke(OperationCall),
}

impl EndpointCall {
    fn to_payload(&self) -> RpcResult<Value> {
        serde_json::to_value(self).map_err(|e| RpcError::transport(format!("Unencodable call: {e}")))
    }
}

/// Endpoint whose connectors run on the peer of a connection group.
pub struct RemoteEndpoint {
    group: Arc<ConnectionGroup>,
}

impl RemoteEndpoint {
    /// Wrap a group.
    pub fn new(group: Arc<ConnectionGroup>) -> Arc<Self> {
        Arc::new(Self { group })
    }

    /// The underlying group.
    pub fn group(&self) -> &Arc<ConnectionGroup> {
        &self.group
    }

    /// Ask the peer for connector info.
    pub async fn find_info(&self, key: &ConnectorKey) -> RpcResult<ConnectorInfo> {
        let payload = EndpointCall::FindInfo { key: key.clone() }.to_payload()?;
        let value = self.group.call(payload, RequestOptions::new()).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::transport(format!("Malformed connector info: {e}")))
    }

    /// Ask the peer for connector info without waiting.
    pub fn find_info_async(self: &Arc<Self>, key: &ConnectorKey) -> Promise<ConnectorInfo> {
        let promise = Promise::new();
        let this = Arc::clone(self);
        let key = key.clone();
        let settle = promise.clone();
        tokio::spawn(async move {
            settle.settle(this.find_info(&key).await);
        });
        promise
    }

    /// Run an operation on the peer.
    pub async fn invoke(&self, call: OperationCall, progress: Option<ProgressHandler>) -> RpcResult<Value> {
        let payload = EndpointCall::Invoke(call).to_payload()?;
        let options = RequestOptions::new().with_progress_handler(progress);
        self.group.call(payload, options).await
    }

    /// Whether the group can send.
    pub fn is_operational(&self) -> bool {
        self.group.is_operational()
    }

    /// Close the group.
    pub async fn close(&self) {
        self.group.close().await;
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint").field("group", &self.group).finish()
    }
}

/// Serves [`EndpointCall`]s from a [`LocalEndpoint`].
pub struct EndpointService {
    endpoint: Arc<LocalEndpoint>,
}

impl EndpointService {
    /// Serve `endpoint`.
    pub fn new(endpoint: Arc<LocalEndpoint>) -> Arc<Self> {
        Arc::new(Self { endpoint })
    }
}

#[async_trait]
impl RequestHandler for EndpointService {
    async fn handle(&self, request: &LocalRequest, payload: Value) -> Result<Value, RemoteFailure> {
        let call: EndpointCall = serde_json::from_value(payload)
            .map_err(|e| RemoteFailure::unsupported(format!("Malformed call: {e}")))?;

        match call {
            EndpointCall::FindInfo { key } => {
                debug!(connector = %key, "Serving connector lookup");
                let info = self
                    .endpoint
                    .find_info(&key)
                    .ok_or_else(|| RemoteFailure::unsupported(format!("Connector not found: {key}")))?;
                serde_json::to_value(info).map_err(|e| RemoteFailure::transport(e.to_string()))
            }
            EndpointCall::Invoke(call) => {
                debug!(connector = %call.key, operation = %call.operation, request_id = request.id(), "Serving operation");
                self.endpoint
                    .invoke(call, request)
                    .await
                    .map_err(RemoteFailure::from)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorConfig, OperationKind};
    use serde_json::json;

    #[test]
    fn test_call_encoding() {
        let key = ConnectorKey::new("b", "1", "c");
        let value = serde_json::to_value(EndpointCall::FindInfo { key: key.clone() }).unwrap();
        assert_eq!(value["call"], "find_info");

        let invoke = EndpointCall::Invoke(OperationCall::new(
            key,
            ConnectorConfig::new(),
            OperationKind::Get,
            json!({"uid": "u1"}),
        ));
        let value = serde_json::to_value(&invoke).unwrap();
        assert_eq!(value["call"], "invoke");
        assert_eq!(value["operation"], "get");
        assert_eq!(serde_json::from_value::<EndpointCall>(value).unwrap(), invoke);
    }

    #[tokio::test]
    async fn test_disconnected_endpoint_fails_fast() {
        let remote = RemoteEndpoint::new(ConnectionGroup::new("offline"));
        assert!(!remote.is_operational());

        let err = remote
            .find_info_async(&ConnectorKey::new("b", "1", "c"))
            .await
            .unwrap_err();
        assert!(err.is_delegate_failure());
    }
}
