//! Error types for request correlation and transports.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Category of a failure that crossed the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The connector itself rejected the operation.
    Application,
    /// The peer does not support the operation or connector.
    Unsupported,
    /// A resource (pool, backend session) could not be obtained.
    Resource,
    /// The link or codec failed.
    Transport,
    /// The request was cancelled.
    Cancelled,
    /// The peer is closing down.
    Closed,
}

/// Serializable description of an error reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

impl RemoteFailure {
    /// Create a failure.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// An application failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Application, message)
    }

    /// A transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    /// An unsupported-operation failure.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unsupported, message)
    }

    /// A resource failure.
    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Resource, message)
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteFailure {}

/// Error settled into request and aggregate promises.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The owning connection group was closed while the request was pending.
    #[error("Connection group closed")]
    ConnectionGroupClosed,

    /// The request was cancelled by the caller.
    #[error("Request cancelled")]
    RequestCancelled,

    /// The peer answered with an error, or the link failed.
    #[error("Request rejected: {0}")]
    RequestRejected(RemoteFailure),

    /// Every source of an aggregate failed; carries the last error seen.
    #[error("All sources failed, last error: {0}")]
    AggregateFailed(Box<RpcError>),

    /// The operation is not supported by the endpoint.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// No delegate or source was available.
    #[error("No delegate available")]
    NoDelegate,

    /// The component was shut down.
    #[error("Closed")]
    Closed,
}

impl RpcError {
    /// Shorthand for a transport-kind rejection.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::RequestRejected(RemoteFailure::transport(message))
    }

    /// Shorthand for an application-kind rejection.
    pub fn application(message: impl Into<String>) -> Self {
        Self::RequestRejected(RemoteFailure::application(message))
    }

    /// Whether a failover policy should try another delegate.
    ///
    /// Cancellations and application rejections are final; anything that
    /// points at the delegate itself is not.
    pub fn is_delegate_failure(&self) -> bool {
        match self {
            Self::RequestCancelled => false,
            Self::RequestRejected(failure) => !matches!(
                failure.kind,
                FailureKind::Application | FailureKind::Cancelled
            ),
            _ => true,
        }
    }
}

impl From<RpcError> for RemoteFailure {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::RequestRejected(failure) => failure,
            RpcError::RequestCancelled => Self::new(FailureKind::Cancelled, "request cancelled"),
            RpcError::Unsupported(msg) => Self::unsupported(msg),
            RpcError::ConnectionGroupClosed | RpcError::Closed => {
                Self::new(FailureKind::Closed, err.to_string())
            }
            RpcError::NoDelegate => Self::resource(err.to_string()),
            RpcError::AggregateFailed(inner) => {
                let inner = RemoteFailure::from(*inner);
                Self::new(inner.kind, format!("all sources failed: {}", inner.message))
            }
        }
    }
}

impl From<RemoteFailure> for RpcError {
    fn from(failure: RemoteFailure) -> Self {
        Self::RequestRejected(failure)
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        Self::transport(err.to_string())
    }
}

/// Result type for request operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Link-level error.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link is closed.
    #[error("Connection closed")]
    Closed,

    /// The frame could not be sent.
    #[error("Failed to send message: {0}")]
    Send(String),

    /// The frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The transport does not implement the operation.
    #[error("Unsupported transport operation: {0}")]
    Unsupported(&'static str),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegate_failure_classification() {
        assert!(RpcError::ConnectionGroupClosed.is_delegate_failure());
        assert!(RpcError::transport("link lost").is_delegate_failure());
        assert!(RpcError::NoDelegate.is_delegate_failure());
        assert!(!RpcError::RequestCancelled.is_delegate_failure());
        assert!(!RpcError::application("duplicate uid").is_delegate_failure());
    }

    #[test]
    fn test_transport_error_becomes_rejection() {
        let err: RpcError = TransportError::Closed.into();
        match err {
            RpcError::RequestRejected(failure) => assert_eq!(failure.kind, FailureKind::Transport),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failure_round_trips_through_rpc_error() {
        let failure = RemoteFailure::application("no such user");
        let err = RpcError::from(failure.clone());
        assert_eq!(RemoteFailure::from(err), failure);

        let nested = RpcError::AggregateFailed(Box::new(RpcError::transport("down")));
        let flattened = RemoteFailure::from(nested);
        assert_eq!(flattened.kind, FailureKind::Transport);
        assert!(flattened.message.contains("down"));
    }

    #[test]
    fn test_display() {
        let err = RpcError::AggregateFailed(Box::new(RpcError::NoDelegate));
        assert_eq!(err.to_string(), "All sources failed, last error: No delegate available");
    }
}
