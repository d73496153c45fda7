//! Messages exchanged between connection groups, and the frames that carry them.

use crate::error::RemoteFailure;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request identifier, unique within the group that allocated it.
pub type RequestId = u64;

/// Body of an [`RpcMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageBody {
    /// Start a request on the peer.
    Call(Value),
    /// Intermediate result of a streaming request.
    Progress(Value),
    /// Successful terminal result.
    Result(Value),
    /// Failed terminal result.
    Error(RemoteFailure),
    /// Ask the peer to stop working on a request.
    Cancel,
    /// The peer has stopped working on a request.
    CancelAck,
}

impl MessageBody {
    /// Whether the body ends the request on the caller side.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error(_))
    }
}

/// One correlated message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Id of the request this message belongs to.
    pub request_id: RequestId,
    /// Message body.
    pub body: MessageBody,
}

impl RpcMessage {
    /// Create a message.
    pub fn new(request_id: RequestId, body: MessageBody) -> Self {
        Self { request_id, body }
    }

    /// A call.
    pub fn call(request_id: RequestId, payload: Value) -> Self {
        Self::new(request_id, MessageBody::Call(payload))
    }

    /// A progress item.
    pub fn progress(request_id: RequestId, payload: Value) -> Self {
        Self::new(request_id, MessageBody::Progress(payload))
    }

    /// A successful result.
    pub fn result(request_id: RequestId, payload: Value) -> Self {
        Self::new(request_id, MessageBody::Result(payload))
    }

    /// A failed result.
    pub fn error(request_id: RequestId, failure: RemoteFailure) -> Self {
        Self::new(request_id, MessageBody::Error(failure))
    }

    /// A cancellation request.
    pub fn cancel(request_id: RequestId) -> Self {
        Self::new(request_id, MessageBody::Cancel)
    }

    /// A cancellation acknowledgement.
    pub fn cancel_ack(request_id: RequestId) -> Self {
        Self::new(request_id, MessageBody::CancelAck)
    }
}

/// A frame as seen by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl Payload {
    /// Raw bytes of the frame.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    /// Frame size in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the frame is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_bodies() {
        assert!(MessageBody::Result(json!(1)).is_terminal());
        assert!(MessageBody::Error(RemoteFailure::application("x")).is_terminal());
        assert!(!MessageBody::Progress(json!(1)).is_terminal());
        assert!(!MessageBody::Cancel.is_terminal());
        assert!(!MessageBody::CancelAck.is_terminal());
    }

    #[test]
    fn test_wire_shape() {
        let encoded = serde_json::to_value(RpcMessage::progress(9, json!({"uid": "a"}))).unwrap();
        assert_eq!(
            encoded,
            json!({"request_id": 9, "body": {"type": "progress", "data": {"uid": "a"}}})
        );

        let cancel = serde_json::to_value(RpcMessage::cancel(3)).unwrap();
        assert_eq!(cancel, json!({"request_id": 3, "body": {"type": "cancel"}}));
    }

    #[test]
    fn test_payload_len() {
        assert_eq!(Payload::Text("abc".into()).len(), 3);
        assert!(Payload::Binary(Bytes::new()).is_empty());
    }
}
