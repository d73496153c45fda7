//! In-process transport pair.
//!
//! [`connect`] wires two listeners together through unbounded channels, the
//! way a WebSocket connection wires a client and a server. Each side gets its
//! own [`ConnectionLink`] and a reader task that feeds frames to its listener
//! in order. Closing either side closes both.

use crate::error::{TransportError, TransportResult};
use crate::link::ConnectionLink;
use crate::message::Payload;
use crate::transport::{CLOSE_GOING_AWAY, MessageListener, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

enum Frame {
    Data(Payload),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

/// One side of an in-memory connection.
pub struct MemoryTransport {
    peer: mpsc::UnboundedSender<Frame>,
    own: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
}

impl MemoryTransport {
    fn deliver(&self, frame: Frame) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.peer
            .send(frame)
            .map_err(|_| TransportError::Send("peer reader has stopped".to_string()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_bytes(&self, data: Bytes) -> TransportResult<()> {
        self.deliver(Frame::Data(Payload::Binary(data)))
    }

    async fn send_string(&self, text: String) -> TransportResult<()> {
        self.deliver(Frame::Data(Payload::Text(text)))
    }

    async fn send_ping(&self, payload: Bytes) -> TransportResult<()> {
        self.deliver(Frame::Ping(payload))
    }

    async fn send_pong(&self, payload: Bytes) -> TransportResult<()> {
        self.deliver(Frame::Pong(payload))
    }

    async fn close(&self, code: u16, reason: &str) -> TransportResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for side in [&self.peer, &self.own] {
            let _ = side.send(Frame::Close {
                code,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Connect two listeners. Returns the left and right links.
pub async fn connect(
    left: Arc<dyn MessageListener>,
    right: Arc<dyn MessageListener>,
) -> (Arc<ConnectionLink>, Arc<ConnectionLink>) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let left_link = ConnectionLink::new(Arc::new(MemoryTransport {
        peer: right_tx.clone(),
        own: left_tx.clone(),
        open: Arc::clone(&open),
    }));
    let right_link = ConnectionLink::new(Arc::new(MemoryTransport {
        peer: left_tx,
        own: right_tx,
        open,
    }));

    left.on_connect(&left_link).await;
    right.on_connect(&right_link).await;

    tokio::spawn(read_loop(Arc::clone(&left_link), left_rx, left));
    tokio::spawn(read_loop(Arc::clone(&right_link), right_rx, right));

    debug!(left = %left_link.id(), right = %right_link.id(), "In-memory link established");
    (left_link, right_link)
}

async fn read_loop(
    link: Arc<ConnectionLink>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    listener: Arc<dyn MessageListener>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Data(payload) => listener.on_message(&link, payload).await,
            Frame::Ping(payload) => listener.on_ping(&link, payload).await,
            Frame::Pong(payload) => listener.on_pong(&link, payload).await,
            Frame::Close { code, reason } => {
                link.deactivate();
                listener.on_close(&link, code, &reason).await;
                return;
            }
        }
    }

    link.deactivate();
    listener.on_close(&link, CLOSE_GOING_AWAY, "channel closed").await;
}
