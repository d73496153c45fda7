//! Serialization of [`RpcMessage`]s to and from transport frames.

use crate::error::{TransportError, TransportResult};
use crate::message::{Payload, RpcMessage};

/// Turns messages into frames and back. One codec is bound to each link.
pub trait MessageCodec: Send + Sync + 'static {
    /// Encode a message.
    fn encode(&self, message: &RpcMessage) -> TransportResult<Payload>;

    /// Decode a frame.
    fn decode(&self, payload: &Payload) -> TransportResult<RpcMessage>;
}

/// JSON codec producing text frames. Accepts text or binary input.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, message: &RpcMessage) -> TransportResult<Payload> {
        Ok(Payload::Text(serde_json::to_string(message)?))
    }

    fn decode(&self, payload: &Payload) -> TransportResult<RpcMessage> {
        if payload.is_empty() {
            return Err(TransportError::Codec("empty frame".to_string()));
        }
        Ok(serde_json::from_slice(payload.as_bytes())?)
    }
}
