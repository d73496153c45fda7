//! One physical multiplexed connection.

use crate::codec::{JsonCodec, MessageCodec};
use crate::error::{TransportError, TransportResult};
use crate::message::{Payload, RpcMessage};
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Unique identifier for a link.
pub type LinkId = String;

/// A transport paired with the codec used to talk over it.
///
/// A link starts active and is deactivated once, either explicitly or when
/// the underlying connection closes.
pub struct ConnectionLink {
    id: LinkId,
    active: AtomicBool,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn MessageCodec>,
}

impl ConnectionLink {
    /// Create a link with the JSON codec.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_codec(transport, Arc::new(JsonCodec))
    }

    /// Create a link with a specific codec.
    pub fn with_codec(transport: Arc<dyn Transport>, codec: Arc<dyn MessageCodec>) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            active: AtomicBool::new(true),
            transport,
            codec,
        })
    }

    /// Link id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the link can carry new requests.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.transport.is_open()
    }

    /// Mark the link unusable. Returns `false` if it already was.
    pub fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if was_active {
            debug!(link_id = %self.id, "Link deactivated");
        }
        was_active
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Encode and send a message.
    pub async fn send(&self, message: &RpcMessage) -> TransportResult<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        trace!(link_id = %self.id, request_id = message.request_id, "Sending message");
        match self.codec.encode(message)? {
            Payload::Text(text) => self.transport.send_string(text).await,
            Payload::Binary(data) => self.transport.send_bytes(data).await,
        }
    }

    /// Decode a frame received on this link.
    pub fn decode(&self, payload: &Payload) -> TransportResult<RpcMessage> {
        self.codec.decode(payload)
    }

    /// Deactivate and close the transport.
    pub async fn close(&self, code: u16, reason: &str) -> TransportResult<()> {
        self.deactivate();
        self.transport.close(code, reason).await
    }
}

impl fmt::Debug for ConnectionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLink")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
