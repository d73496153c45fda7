//! Transport and listener traits implemented by concrete connections.

use crate::error::{TransportError, TransportResult};
use crate::link::ConnectionLink;
use crate::message::Payload;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Close code used for a normal shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code used when the peer goes away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Write side of one physical connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a binary frame.
    async fn send_bytes(&self, data: Bytes) -> TransportResult<()>;

    /// Send a text frame.
    async fn send_string(&self, text: String) -> TransportResult<()>;

    /// Send a ping.
    async fn send_ping(&self, payload: Bytes) -> TransportResult<()> {
        let _ = payload;
        Err(TransportError::Unsupported("ping"))
    }

    /// Send a pong.
    async fn send_pong(&self, payload: Bytes) -> TransportResult<()> {
        let _ = payload;
        Err(TransportError::Unsupported("pong"))
    }

    /// Close the connection.
    async fn close(&self, code: u16, reason: &str) -> TransportResult<()>;

    /// Whether frames can still be sent.
    fn is_open(&self) -> bool;
}

/// Receives the events of one or more links.
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    /// Called once the link is ready to carry messages.
    async fn on_connect(&self, link: &Arc<ConnectionLink>) {
        let _ = link;
    }

    /// Called for every data frame, in arrival order.
    async fn on_message(&self, link: &Arc<ConnectionLink>, payload: Payload);

    /// Called when a ping arrives. Answers with a pong by default.
    async fn on_ping(&self, link: &Arc<ConnectionLink>, payload: Bytes) {
        if let Err(e) = link.transport().send_pong(payload).await {
            tracing::trace!(link_id = %link.id(), error = %e, "Pong not sent");
        }
    }

    /// Called when a pong arrives.
    async fn on_pong(&self, link: &Arc<ConnectionLink>, payload: Bytes) {
        let _ = (link, payload);
    }

    /// Called once when the link is closed by either side.
    async fn on_close(&self, link: &Arc<ConnectionLink>, code: u16, reason: &str) {
        let _ = (link, code, reason);
    }
}
