//! Connection groups: one logical endpoint over one or more links.
//!
//! A group owns the request tables for its endpoint. Outbound requests are
//! pinned to the first active link; inbound frames from any link are decoded
//! and routed to the matching request. Remote requests are keyed by the id
//! this group allocated. Local requests are keyed by link and peer id, since
//! several peers may share one serving group.

use crate::error::{FailureKind, RemoteFailure, RpcError, RpcResult};
use crate::link::{ConnectionLink, LinkId};
use crate::message::{MessageBody, Payload, RequestId, RpcMessage};
use crate::request::{LocalRequest, RemoteRequest, RequestOptions};
use crate::transport::{CLOSE_NORMAL, MessageListener};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Serves requests that arrive from the peer.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one call. Progress can be streamed through `request` while it
    /// runs; the returned value or failure becomes the terminal message.
    async fn handle(&self, request: &LocalRequest, payload: Value) -> Result<Value, RemoteFailure>;
}

/// Request tables and links of one logical endpoint.
pub struct ConnectionGroup {
    session_id: String,
    links: RwLock<Vec<Arc<ConnectionLink>>>,
    local_requests: DashMap<(LinkId, RequestId), Arc<LocalRequest>>,
    remote_requests: DashMap<RequestId, Arc<RemoteRequest>>,
    next_request_id: AtomicU64,
    handler: Option<Arc<dyn RequestHandler>>,
    closed: AtomicBool,
    self_ref: Weak<ConnectionGroup>,
}

impl ConnectionGroup {
    /// Create a group that only sends requests.
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        Self::build(session_id.into(), None)
    }

    /// Create a group that also serves requests with `handler`.
    pub fn with_handler(session_id: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        Self::build(session_id.into(), Some(handler))
    }

    fn build(session_id: String, handler: Option<Arc<dyn RequestHandler>>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            session_id,
            links: RwLock::new(Vec::new()),
            local_requests: DashMap::new(),
            remote_requests: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            handler,
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Session id shared by the links of this group.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Add a link. Returns `false` if it was already present.
    pub fn add_link(&self, link: Arc<ConnectionLink>) -> bool {
        let mut links = self.links.write();
        if links.iter().any(|l| l.id() == link.id()) {
            return false;
        }
        debug!(session_id = %self.session_id, link_id = %link.id(), "Link added");
        links.push(link);
        true
    }

    /// Remove a link. Returns `false` if it was not present.
    pub fn remove_link(&self, link: &ConnectionLink) -> bool {
        let mut links = self.links.write();
        let before = links.len();
        links.retain(|l| l.id() != link.id());
        let removed = links.len() != before;
        if removed {
            debug!(session_id = %self.session_id, link_id = %link.id(), "Link removed");
        }
        removed
    }

    /// Snapshot of the links, in insertion order.
    pub fn links(&self) -> Vec<Arc<ConnectionLink>> {
        self.links.read().clone()
    }

    /// Whether the group can send: not closed and at least one active link.
    pub fn is_operational(&self) -> bool {
        !self.is_closed() && self.links.read().iter().any(|l| l.is_active())
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of outbound requests awaiting a terminal message.
    pub fn pending_remote(&self) -> usize {
        self.remote_requests.len()
    }

    /// Number of inbound requests still being served.
    pub fn pending_local(&self) -> usize {
        self.local_requests.len()
    }

    /// Look up an outbound request.
    pub fn remote_request(&self, id: RequestId) -> Option<Arc<RemoteRequest>> {
        self.remote_requests.get(&id).map(|r| Arc::clone(r.value()))
    }

    fn pick_link(&self) -> Option<Arc<ConnectionLink>> {
        self.links.read().iter().find(|l| l.is_active()).cloned()
    }

    /// Apply `f` to the first active link, or return `None` if there is none.
    pub fn try_send<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Arc<ConnectionLink>) -> R,
    {
        self.pick_link().map(|link| f(&link))
    }

    /// Register and send a request.
    ///
    /// Fails up front only when the group is closed or has no active link.
    /// A failed send rejects the returned request's promise instead.
    pub async fn send_request(
        &self,
        payload: Value,
        options: RequestOptions,
    ) -> RpcResult<Arc<RemoteRequest>> {
        if self.is_closed() {
            return Err(RpcError::ConnectionGroupClosed);
        }
        let link = self
            .pick_link()
            .ok_or_else(|| RpcError::transport(format!("No active link in group {}", self.session_id)))?;

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let request = Arc::new(RemoteRequest::new(
            id,
            Arc::clone(&link),
            self.self_ref.clone(),
            options,
        ));
        self.remote_requests.insert(id, Arc::clone(&request));

        // close() may have run between the check above and the insert.
        if self.is_closed() {
            request.abort(RpcError::ConnectionGroupClosed);
            return Ok(request);
        }

        trace!(session_id = %self.session_id, request_id = id, link_id = %link.id(), "Request sent");
        if let Err(e) = link.send(&RpcMessage::call(id, payload)).await {
            warn!(request_id = id, error = %e, "Failed to send request");
            request.abort(RpcError::from(e));
        }
        Ok(request)
    }

    /// Send a request and wait for its result.
    pub async fn call(&self, payload: Value, options: RequestOptions) -> RpcResult<Value> {
        self.send_request(payload, options).await?.promise().await
    }

    pub(crate) fn deregister_remote(&self, id: RequestId) {
        self.remote_requests.remove(&id);
    }

    pub(crate) fn deregister_local(&self, link_id: &str, id: RequestId) {
        self.local_requests.remove(&(link_id.to_string(), id));
    }

    /// Decode a frame and route it.
    pub async fn handle_payload(&self, link: &Arc<ConnectionLink>, payload: Payload) {
        match link.decode(&payload) {
            Ok(message) => self.handle_message(link, message).await,
            Err(e) => warn!(link_id = %link.id(), error = %e, "Dropping undecodable frame"),
        }
    }

    /// Route an inbound message to the request it belongs to.
    pub async fn handle_message(&self, link: &Arc<ConnectionLink>, message: RpcMessage) {
        let RpcMessage { request_id, body } = message;
        match body {
            MessageBody::Call(payload) => self.start_local(link, request_id, payload).await,
            MessageBody::Cancel => {
                let key = (link.id().to_string(), request_id);
                let request = self.local_requests.get(&key).map(|r| Arc::clone(r.value()));
                match request {
                    Some(request) if request.cancel() => {
                        debug!(request_id, "Inbound request cancelled by peer");
                        if let Err(e) = link.send(&RpcMessage::cancel_ack(request_id)).await {
                            trace!(request_id, error = %e, "Cancel ack not delivered");
                        }
                    }
                    _ => trace!(request_id, "Cancel for unknown request"),
                }
            }
            body => match self.remote_request(request_id) {
                Some(request) => request.handle_message(body),
                None => trace!(request_id, "Message for unknown request dropped"),
            },
        }
    }

    async fn start_local(&self, link: &Arc<ConnectionLink>, request_id: RequestId, payload: Value) {
        let failure = if self.is_closed() {
            Some(RemoteFailure::new(FailureKind::Closed, "connection group closed"))
        } else if self.handler.is_none() {
            Some(RemoteFailure::unsupported("this endpoint does not serve requests"))
        } else {
            None
        };
        if let Some(failure) = failure {
            if let Err(e) = link.send(&RpcMessage::error(request_id, failure)).await {
                trace!(request_id, error = %e, "Rejection not delivered");
            }
            return;
        }
        let Some(handler) = self.handler.clone() else {
            return;
        };

        let request = Arc::new(LocalRequest::new(
            request_id,
            Arc::clone(link),
            self.self_ref.clone(),
        ));
        self.local_requests
            .insert((link.id().to_string(), request_id), Arc::clone(&request));

        tokio::spawn(async move {
            let outcome = handler.handle(&request, payload).await;
            if request.is_cancelled() {
                trace!(request_id, "Handler finished after cancellation");
                return;
            }
            match outcome {
                Ok(value) => request.handle_result(value).await,
                Err(failure) => request.handle_error(failure).await,
            };
        });
    }

    /// Fail every request pinned to `link`.
    pub fn fail_link_requests(&self, link: &ConnectionLink) {
        let remote: Vec<RequestId> = self
            .remote_requests
            .iter()
            .filter(|r| r.value().link().id() == link.id())
            .map(|r| *r.key())
            .collect();
        for id in remote {
            if let Some((_, request)) = self.remote_requests.remove(&id) {
                request.abort(RpcError::transport(format!("link {} closed", link.id())));
            }
        }

        let local: Vec<(LinkId, RequestId)> = self
            .local_requests
            .iter()
            .filter(|r| r.key().0 == link.id())
            .map(|r| r.key().clone())
            .collect();
        for key in local {
            if let Some((_, request)) = self.local_requests.remove(&key) {
                request.cancel();
            }
        }
    }

    /// Close the group.
    ///
    /// Every outstanding request is removed and settled exactly once: remote
    /// ones are rejected with [`RpcError::ConnectionGroupClosed`], local ones
    /// are cancelled. The links are closed afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let remote: Vec<RequestId> = self.remote_requests.iter().map(|r| *r.key()).collect();
        for id in remote {
            if let Some((_, request)) = self.remote_requests.remove(&id) {
                request.abort(RpcError::ConnectionGroupClosed);
            }
        }

        let local: Vec<(LinkId, RequestId)> =
            self.local_requests.iter().map(|r| r.key().clone()).collect();
        for key in local {
            if let Some((_, request)) = self.local_requests.remove(&key) {
                request.cancel();
            }
        }

        let links = std::mem::take(&mut *self.links.write());
        for link in links {
            if let Err(e) = link.close(CLOSE_NORMAL, "connection group closed").await {
                trace!(link_id = %link.id(), error = %e, "Link close failed");
            }
        }
        info!(session_id = %self.session_id, "Connection group closed");
    }
}

#[async_trait]
impl MessageListener for ConnectionGroup {
    async fn on_connect(&self, link: &Arc<ConnectionLink>) {
        if self.is_closed() {
            if let Err(e) = link.close(CLOSE_NORMAL, "connection group closed").await {
                trace!(session_id = %self.session_id, link_id = %link.id(), error = %e, "Close of late link failed");
            }
            return;
        }
        self.add_link(Arc::clone(link));
    }

    async fn on_message(&self, link: &Arc<ConnectionLink>, payload: Payload) {
        self.handle_payload(link, payload).await;
    }

    async fn on_close(&self, link: &Arc<ConnectionLink>, code: u16, reason: &str) {
        debug!(session_id = %self.session_id, link_id = %link.id(), code, reason, "Link closed");
        self.remove_link(link);
        self.fail_link_requests(link);
    }
}

impl fmt::Debug for ConnectionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGroup")
            .field("session_id", &self.session_id)
            .field("links", &self.links.read().len())
            .field("pending_remote", &self.pending_remote())
            .field("pending_local", &self.pending_local())
            .field("closed", &self.is_closed())
            .finish()
    }
}
