//! Integration tests for request correlation in idlink-rpc

use async_trait::async_trait;
use idlink_rpc::*;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Peer that records what it receives and answers only when told to.
#[derive(Default)]
struct ScriptedPeer {
    received: Mutex<Vec<RpcMessage>>,
    changed: Notify,
}

impl ScriptedPeer {
    async fn wait_for(&self, count: usize) -> Vec<RpcMessage> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.received.lock().len() >= count {
                    return self.received.lock().clone();
                }
                notified.await;
            }
        })
        .await
        .expect("peer did not receive enough messages")
    }
}

#[async_trait]
impl MessageListener for ScriptedPeer {
    async fn on_message(&self, link: &Arc<ConnectionLink>, payload: Payload) {
        let message = link.decode(&payload).unwrap();
        self.received.lock().push(message);
        self.changed.notify_waiters();
    }
}

/// Streams `items` progress messages, then answers with their count.
struct Streamer;

#[async_trait]
impl RequestHandler for Streamer {
    async fn handle(&self, request: &LocalRequest, payload: Value) -> Result<Value, RemoteFailure> {
        if payload["fail"].as_bool().unwrap_or(false) {
            return Err(RemoteFailure::application("rejected by handler"));
        }
        let items = payload["items"].as_u64().unwrap_or(0);
        for i in 0..items {
            request.send_progress(json!(i)).await;
        }
        Ok(json!({ "count": items }))
    }
}

/// Blocks until the caller cancels.
struct Blocker {
    saw_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl RequestHandler for Blocker {
    async fn handle(&self, request: &LocalRequest, _payload: Value) -> Result<Value, RemoteFailure> {
        request.cancelled().await;
        self.saw_cancel.store(true, Ordering::SeqCst);
        Err(RemoteFailure::new(FailureKind::Cancelled, "stopped"))
    }
}

async fn scripted() -> (Arc<ConnectionGroup>, Arc<ScriptedPeer>, Arc<ConnectionLink>) {
    let client = ConnectionGroup::new("client");
    let peer = Arc::new(ScriptedPeer::default());
    let (_, peer_link) = memory::connect(client.clone(), peer.clone()).await;
    (client, peer, peer_link)
}

#[tokio::test]
async fn test_progress_precedes_single_terminal() {
    let client = ConnectionGroup::new("client");
    let server = ConnectionGroup::with_handler("server", Arc::new(Streamer));
    memory::connect(client.clone(), server.clone()).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let progress = Arc::clone(&events);
        let done = Arc::clone(&events);
        RequestOptions::new()
            .with_progress(move |item| progress.lock().push(format!("progress:{item}")))
            .on_complete(move |result| done.lock().push(format!("done:{}", result["count"])))
    };

    let result = client.call(json!({"items": 3}), options).await.unwrap();
    assert_eq!(result, json!({"count": 3}));
    assert_eq!(
        *events.lock(),
        vec!["progress:0", "progress:1", "progress:2", "done:3"]
    );
    assert_eq!(client.pending_remote(), 0);
}

#[tokio::test]
async fn test_handler_error_rejects_request() {
    let client = ConnectionGroup::new("client");
    let server = ConnectionGroup::with_handler("server", Arc::new(Streamer));
    memory::connect(client.clone(), server.clone()).await;

    let err = client.call(json!({"fail": true}), RequestOptions::new()).await.unwrap_err();
    assert_eq!(err, RpcError::application("rejected by handler"));
    assert!(!err.is_delegate_failure());
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let client = ConnectionGroup::new("client");
    let server = ConnectionGroup::with_handler("server", Arc::new(Streamer));
    memory::connect(client.clone(), server.clone()).await;

    let calls: Vec<_> = (0..20u64)
        .map(|n| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let result = client.call(json!({"items": n}), RequestOptions::new()).await;
                (n, result)
            })
        })
        .collect();

    for call in calls {
        let (n, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), json!({"count": n}));
    }
    assert_eq!(client.pending_remote(), 0);
    assert_eq!(server.pending_local(), 0);
}

#[tokio::test]
async fn test_late_result_after_cancel_is_ignored() {
    let (client, peer, peer_link) = scripted().await;

    let request = client.send_request(json!("slow"), RequestOptions::new()).await.unwrap();
    assert!(request.cancel());
    assert_eq!(request.promise().await, Err(RpcError::RequestCancelled));
    assert_eq!(client.pending_remote(), 0);

    let received = peer.wait_for(2).await;
    assert_eq!(received[0], RpcMessage::call(request.id(), json!("slow")));
    assert_eq!(received[1], RpcMessage::cancel(request.id()));

    peer_link.send(&RpcMessage::result(request.id(), json!("late"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(request.state(), RemoteState::Cancelled);
    assert_eq!(request.promise().await, Err(RpcError::RequestCancelled));
}

#[tokio::test]
async fn test_close_settles_every_pending_request() {
    let (client, peer, _peer_link) = scripted().await;

    let mut requests = Vec::new();
    for i in 0..3 {
        requests.push(client.send_request(json!(i), RequestOptions::new()).await.unwrap());
    }
    peer.wait_for(3).await;
    assert_eq!(client.pending_remote(), 3);

    client.close().await;
    client.close().await;

    assert_eq!(client.pending_remote(), 0);
    for request in requests {
        assert_eq!(request.promise().await, Err(RpcError::ConnectionGroupClosed));
        assert_eq!(request.state(), RemoteState::Rejected);
    }
    assert!(!client.is_operational());
}

#[tokio::test]
async fn test_close_racing_new_requests_settles_each_once() {
    let (client, _peer, _peer_link) = scripted().await;
    let settled = Arc::new(AtomicUsize::new(0));

    let senders: Vec<_> = (0..16)
        .map(|i| {
            let client = Arc::clone(&client);
            let settled = Arc::clone(&settled);
            tokio::spawn(async move {
                let request = client.send_request(json!(i), RequestOptions::new()).await?;
                request.promise().on_settle(move |_| {
                    settled.fetch_add(1, Ordering::SeqCst);
                });
                Ok::<_, RpcError>(request)
            })
        })
        .collect();

    tokio::task::yield_now().await;
    client.close().await;

    let mut created = Vec::new();
    for sender in senders {
        match sender.await.unwrap() {
            Ok(request) => created.push(request),
            Err(err) => assert!(err == RpcError::ConnectionGroupClosed || err.is_delegate_failure(), "{err}"),
        }
    }

    for request in &created {
        let outcome = tokio::time::timeout(Duration::from_secs(1), request.promise())
            .await
            .expect("request should settle");
        assert!(outcome.is_err());
        assert_eq!(request.state(), RemoteState::Rejected);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(settled.load(Ordering::SeqCst), created.len());
    assert_eq!(client.pending_remote(), 0);
}

#[tokio::test]
async fn test_link_loss_rejects_pinned_requests() {
    let (client, peer, peer_link) = scripted().await;

    let request = client.send_request(json!(1), RequestOptions::new()).await.unwrap();
    peer.wait_for(1).await;

    peer_link.close(CLOSE_GOING_AWAY, "peer restart").await.unwrap();
    let err = request.promise().await.unwrap_err();
    assert!(matches!(err, RpcError::RequestRejected(ref f) if f.kind == FailureKind::Transport));
    assert!(err.is_delegate_failure());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(client.links().is_empty());
}

#[tokio::test]
async fn test_inbound_cancel_stops_handler_without_terminal() {
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let server = ConnectionGroup::with_handler(
        "server",
        Arc::new(Blocker {
            saw_cancel: Arc::clone(&saw_cancel),
        }),
    );
    let peer = Arc::new(ScriptedPeer::default());
    let (peer_link, _) = memory::connect(peer.clone(), server.clone()).await;

    peer_link.send(&RpcMessage::call(7, json!(null))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.pending_local(), 1);

    peer_link.send(&RpcMessage::cancel(7)).await.unwrap();
    let received = peer.wait_for(1).await;
    assert_eq!(received[0], RpcMessage::cancel_ack(7));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(saw_cancel.load(Ordering::SeqCst));
    assert_eq!(server.pending_local(), 0);
    assert_eq!(peer.received.lock().len(), 1);
}

#[tokio::test]
async fn test_requests_use_first_active_link() {
    let client = ConnectionGroup::new("client");
    let server = ConnectionGroup::with_handler("server", Arc::new(Streamer));
    let (link_a, _) = memory::connect(client.clone(), server.clone()).await;
    let (link_b, _) = memory::connect(client.clone(), server.clone()).await;

    for _ in 0..3 {
        let request = client.send_request(json!({"items": 0}), RequestOptions::new()).await.unwrap();
        assert_eq!(request.link().id(), link_a.id());
        request.promise().await.unwrap();
    }

    link_a.close(CLOSE_NORMAL, "maintenance").await.unwrap();
    let request = client.send_request(json!({"items": 1}), RequestOptions::new()).await.unwrap();
    assert_eq!(request.link().id(), link_b.id());
    assert_eq!(request.promise().await.unwrap(), json!({"count": 1}));
}
