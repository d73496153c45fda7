//! Per-request state on both ends of a link.
//!
//! A [`RemoteRequest`] lives on the calling side and owns the promise the
//! caller waits on. A [`LocalRequest`] lives on the serving side while the
//! request handler runs. Each is registered in its [`ConnectionGroup`] and
//! deregisters itself exactly once, on the transition out of its initial
//! state.

use crate::connector::ProgressSink;
use crate::error::{RemoteFailure, RpcError};
use crate::group::ConnectionGroup;
use crate::link::ConnectionLink;
use crate::message::{MessageBody, RequestId, RpcMessage};
use crate::promise::Promise;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Receives progress items of a streaming request.
pub type ProgressHandler = Arc<dyn Fn(Value) + Send + Sync>;

type CompletionCallback = Box<dyn FnOnce(&Value) + Send>;

/// Caller-side options for a request.
#[derive(Default)]
pub struct RequestOptions {
    pub(crate) progress: Option<ProgressHandler>,
    pub(crate) completion: Option<CompletionCallback>,
}

impl RequestOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward progress items to `handler`.
    pub fn with_progress<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(handler));
        self
    }

    /// Forward progress items to a shared handler.
    pub fn with_progress_handler(mut self, handler: Option<ProgressHandler>) -> Self {
        self.progress = handler;
        self
    }

    /// Run `callback` with the result after a successful completion.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        self.completion = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("progress", &self.progress.is_some())
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

/// State of a [`RemoteRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Waiting for the terminal message.
    Pending,
    /// Completed with a result.
    Resolved,
    /// Completed with an error.
    Rejected,
    /// Cancelled by the caller.
    Cancelled,
}

/// A request this side sent to the peer.
pub struct RemoteRequest {
    id: RequestId,
    link: Arc<ConnectionLink>,
    group: Weak<ConnectionGroup>,
    state: Mutex<RemoteState>,
    promise: Promise<Value>,
    progress: Option<ProgressHandler>,
    completion: Mutex<Option<CompletionCallback>>,
}

impl RemoteRequest {
    pub(crate) fn new(
        id: RequestId,
        link: Arc<ConnectionLink>,
        group: Weak<ConnectionGroup>,
        options: RequestOptions,
    ) -> Self {
        Self {
            id,
            link,
            group,
            state: Mutex::new(RemoteState::Pending),
            promise: Promise::new(),
            progress: options.progress,
            completion: Mutex::new(options.completion),
        }
    }

    /// Request id.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The link the request is pinned to.
    pub fn link(&self) -> &Arc<ConnectionLink> {
        &self.link
    }

    /// Current state.
    pub fn state(&self) -> RemoteState {
        *self.state.lock()
    }

    /// The promise settled by the terminal message.
    pub fn promise(&self) -> Promise<Value> {
        self.promise.clone()
    }

    fn transition(&self, to: RemoteState) -> bool {
        let mut state = self.state.lock();
        if *state != RemoteState::Pending {
            return false;
        }
        *state = to;
        true
    }

    fn deregister(&self) {
        if let Some(group) = self.group.upgrade() {
            group.deregister_remote(self.id);
        }
    }

    /// Route an inbound message for this request.
    pub fn handle_message(&self, body: MessageBody) {
        match body {
            MessageBody::Result(value) => {
                if !self.transition(RemoteState::Resolved) {
                    trace!(request_id = self.id, "Late result dropped");
                    return;
                }
                self.deregister();
                self.promise.resolve(value.clone());
                if let Some(callback) = self.completion.lock().take() {
                    callback(&value);
                }
            }
            MessageBody::Error(failure) => {
                if !self.transition(RemoteState::Rejected) {
                    trace!(request_id = self.id, "Late error dropped");
                    return;
                }
                self.deregister();
                self.promise.reject(RpcError::RequestRejected(failure));
            }
            MessageBody::Progress(value) => {
                if self.state() != RemoteState::Pending {
                    return;
                }
                if let Some(handler) = &self.progress {
                    handler(value);
                }
            }
            MessageBody::CancelAck => {
                trace!(request_id = self.id, "Cancel acknowledged");
            }
            MessageBody::Call(_) | MessageBody::Cancel => {
                warn!(request_id = self.id, "Unexpected message for an outbound request");
            }
        }
    }

    /// Cancel the request.
    ///
    /// The promise is rejected with [`RpcError::RequestCancelled`] right away;
    /// the peer is told on a background task and may keep running for a while.
    pub fn cancel(&self) -> bool {
        if !self.transition(RemoteState::Cancelled) {
            return false;
        }
        self.deregister();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let link = Arc::clone(&self.link);
                let id = self.id;
                handle.spawn(async move {
                    if let Err(e) = link.send(&RpcMessage::cancel(id)).await {
                        debug!(request_id = id, error = %e, "Cancel not delivered");
                    }
                });
            }
            Err(_) => debug!(request_id = self.id, "No runtime to deliver cancel"),
        }

        self.promise.cancel();
        true
    }

    /// Fail the request locally, e.g. because its link or group went away.
    pub(crate) fn abort(&self, err: RpcError) -> bool {
        if !self.transition(RemoteState::Rejected) {
            return false;
        }
        self.deregister();
        self.promise.reject(err);
        true
    }
}

impl fmt::Debug for RemoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRequest")
            .field("id", &self.id)
            .field("link", &self.link.id())
            .field("state", &self.state())
            .finish()
    }
}

/// State of a [`LocalRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    /// The handler is running.
    Active,
    /// The terminal message was sent.
    Completed,
    /// The peer cancelled the request.
    Cancelled,
}

/// A request the peer sent to this side.
pub struct LocalRequest {
    id: RequestId,
    link: Arc<ConnectionLink>,
    group: Weak<ConnectionGroup>,
    state: Mutex<LocalState>,
    cancelled: AtomicBool,
    cancel_signal: Notify,
}

impl LocalRequest {
    pub(crate) fn new(id: RequestId, link: Arc<ConnectionLink>, group: Weak<ConnectionGroup>) -> Self {
        Self {
            id,
            link,
            group,
            state: Mutex::new(LocalState::Active),
            cancelled: AtomicBool::new(false),
            cancel_signal: Notify::new(),
        }
    }

    /// Request id, as allocated by the peer.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The link the request arrived on.
    pub fn link(&self) -> &Arc<ConnectionLink> {
        &self.link
    }

    /// Current state.
    pub fn state(&self) -> LocalState {
        *self.state.lock()
    }

    /// Whether the peer cancelled the request.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the peer cancels the request.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn transition(&self, to: LocalState) -> bool {
        let mut state = self.state.lock();
        if *state != LocalState::Active {
            return false;
        }
        *state = to;
        true
    }

    fn deregister(&self) {
        if let Some(group) = self.group.upgrade() {
            group.deregister_local(self.link.id(), self.id);
        }
    }

    /// Stream one progress item. Returns `false` once the request is over.
    pub async fn send_progress(&self, item: Value) -> bool {
        if self.state() != LocalState::Active {
            return false;
        }
        match self.link.send(&RpcMessage::progress(self.id, item)).await {
            Ok(()) => true,
            Err(e) => {
                debug!(request_id = self.id, error = %e, "Progress not delivered");
                false
            }
        }
    }

    /// Complete with a result.
    pub async fn handle_result(&self, value: Value) -> bool {
        self.finish(RpcMessage::result(self.id, value)).await
    }

    /// Complete with an error.
    pub async fn handle_error(&self, failure: RemoteFailure) -> bool {
        self.finish(RpcMessage::error(self.id, failure)).await
    }

    async fn finish(&self, message: RpcMessage) -> bool {
        if !self.transition(LocalState::Completed) {
            return false;
        }
        self.deregister();
        if let Err(e) = self.link.send(&message).await {
            warn!(request_id = self.id, error = %e, "Terminal message not delivered");
        }
        true
    }

    /// Mark the request cancelled and wake anyone waiting on [`cancelled`](Self::cancelled).
    pub fn cancel(&self) -> bool {
        if !self.transition(LocalState::Cancelled) {
            return false;
        }
        self.deregister();
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_signal.notify_waiters();
        true
    }
}

#[async_trait]
impl ProgressSink for LocalRequest {
    async fn progress(&self, item: Value) -> bool {
        self.send_progress(item).await
    }

    fn is_cancelled(&self) -> bool {
        LocalRequest::is_cancelled(self)
    }
}

impl fmt::Debug for LocalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRequest")
            .field("id", &self.id)
            .field("link", &self.link.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransportError, TransportResult};
    use crate::transport::Transport;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Sink {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Sink {
        async fn send_bytes(&self, _data: Bytes) -> TransportResult<()> {
            Err(TransportError::Unsupported("bytes"))
        }

        async fn send_string(&self, text: String) -> TransportResult<()> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) -> TransportResult<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    fn link() -> (Arc<ConnectionLink>, Arc<Sink>) {
        let sink = Arc::new(Sink::default());
        (ConnectionLink::new(sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_remote_request_ignores_messages_after_settlement() {
        let (link, _) = link();
        let progress = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let options = {
            let progress = Arc::clone(&progress);
            let completed = Arc::clone(&completed);
            RequestOptions::new()
                .with_progress(move |_| {
                    progress.fetch_add(1, Ordering::SeqCst);
                })
                .on_complete(move |_| {
                    completed.fetch_add(1, Ordering::SeqCst);
                })
        };
        let request = RemoteRequest::new(1, link, Weak::new(), options);

        request.handle_message(MessageBody::Progress(json!(1)));
        request.handle_message(MessageBody::Result(json!("done")));
        request.handle_message(MessageBody::Progress(json!(2)));
        request.handle_message(MessageBody::Error(RemoteFailure::application("late")));

        assert_eq!(request.state(), RemoteState::Resolved);
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(request.promise().await, Ok(json!("done")));
    }

    #[tokio::test]
    async fn test_remote_cancel_rejects_and_notifies_peer() {
        let (link, sink) = link();
        let request = RemoteRequest::new(5, link, Weak::new(), RequestOptions::new());

        assert!(request.cancel());
        assert!(!request.cancel());
        assert_eq!(request.promise().await, Err(RpcError::RequestCancelled));

        request.handle_message(MessageBody::Result(json!(1)));
        assert_eq!(request.state(), RemoteState::Cancelled);

        tokio::task::yield_now().await;
        let sent = sink.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("cancel"));
    }

    #[tokio::test]
    async fn test_local_request_sends_one_terminal() {
        let (link, sink) = link();
        let request = LocalRequest::new(3, link, Weak::new());

        assert!(request.send_progress(json!({"uid": "a"})).await);
        assert!(request.handle_result(json!(true)).await);
        assert!(!request.handle_error(RemoteFailure::application("x")).await);
        assert!(!request.send_progress(json!({"uid": "b"})).await);
        assert!(!request.cancel());

        let sent = sink.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("progress"));
        assert!(sent[1].contains("result"));
    }

    #[tokio::test]
    async fn test_local_cancel_wakes_waiters() {
        let (link, sink) = link();
        let request = Arc::new(LocalRequest::new(8, link, Weak::new()));

        let waiter = {
            let request = Arc::clone(&request);
            tokio::spawn(async move { request.cancelled().await })
        };
        tokio::task::yield_now().await;

        assert!(request.cancel());
        waiter.await.unwrap();
        assert!(ProgressSink::is_cancelled(request.as_ref()));
        assert!(!request.handle_result(json!(1)).await);
        assert!(sink.sent.lock().is_empty());
    }
}
