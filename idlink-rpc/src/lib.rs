//! # idlink RPC
//!
//! Asynchronous request correlation between connector endpoints.
//!
//! ## Features
//!
//! - Single-assignment [`Promise`]s and first-success aggregation ([`when`])
//! - Request tracking with streaming progress and cancellation
//! - Connection groups multiplexing requests over redundant links
//! - Local, remote and load-balanced endpoints behind one [`Endpoint`] type
//! - Round-robin and failover policies
//!
//! ## Example
//!
//! ```rust,no_run
//! use idlink_rpc::{ConnectionGroup, EndpointService, LocalEndpoint, RemoteEndpoint, Endpoint, memory};
//!
//! # async fn example() -> idlink_rpc::RpcResult<()> {
//! let local = LocalEndpoint::builder().build();
//! let server = ConnectionGroup::with_handler("server", EndpointService::new(local));
//! let client = ConnectionGroup::new("client");
//! memory::connect(client.clone(), server.clone()).await;
//!
//! let remote = Endpoint::Remote(RemoteEndpoint::new(client));
//! assert!(remote.is_operational());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod aggregate;
mod balancer;
mod codec;
mod connector;
mod endpoint;
mod error;
mod group;
mod link;
mod local;
mod message;
mod promise;
mod remote;
mod request;
mod transport;

pub mod memory;

pub use aggregate::{DeferredPromise, when};
pub use balancer::{BalancePolicy, BalancerConfig, BalancerStats, LoadBalancer};
pub use codec::{JsonCodec, MessageCodec};
pub use connector::{
    CallbackSink, Connector, ConnectorConfig, ConnectorFactory, ConnectorInfo, ConnectorKey,
    ConnectorPoolHandler, NoProgress, OperationCall, OperationKind, ProgressSink,
};
pub use endpoint::{ConnectorFacade, Endpoint};
pub use error::{
    FailureKind, RemoteFailure, RpcError, RpcResult, TransportError, TransportResult,
};
pub use group::{ConnectionGroup, RequestHandler};
pub use link::{ConnectionLink, LinkId};
pub use local::{LocalEndpoint, LocalEndpointBuilder};
pub use message::{MessageBody, Payload, RequestId, RpcMessage};
pub use promise::Promise;
pub use remote::{EndpointCall, EndpointService, RemoteEndpoint};
pub use request::{
    LocalRequest, LocalState, ProgressHandler, RemoteRequest, RemoteState, RequestOptions,
};
pub use transport::{CLOSE_GOING_AWAY, CLOSE_NORMAL, MessageListener, Transport};
