//! Session state for one connected peer.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dslink_core::node::Node;
use dslink_core::{Envelope, Response, SessionId};
use tokio::sync::{mpsc, Mutex, MutexGuard};

use crate::tracker::ResponseTracker;

/// A node listener held on behalf of the peer: a value subscription keyed
/// by `sid`, or the child listener of a `list` stream keyed by rid.
#[derive(Debug)]
pub struct Subscription {
    pub path: String,
    pub node: Weak<Node>,
    pub listener_id: u64,
}

impl Subscription {
    /// Detach the value listener from its node.
    pub fn cancel(&self) {
        if let Some(node) = self.node.upgrade() {
            node.remove_listener(self.listener_id);
        }
    }
}

/// One transport session.
///
/// Lives exactly as long as the underlying connection. Outbound frames are
/// queued on an unbounded channel drained by whoever owns the transport, so
/// writes never block the request lane and never drop frames while the
/// session is alive.
pub struct Client {
    id: SessionId,
    ds_id: String,
    is_requester: bool,
    is_responder: bool,
    tx: mpsc::UnboundedSender<String>,
    tracker: ResponseTracker,
    subscriptions: DashMap<i64, Subscription>,
    list_streams: DashMap<i64, Subscription>,
    lane: Mutex<()>,
    connected_at: Instant,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("ds_id", &self.ds_id)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a session and the receiving end of its outbound channel.
    pub fn new(
        ds_id: impl Into<String>,
        is_requester: bool,
        is_responder: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            id: SessionId::new(),
            ds_id: ds_id.into(),
            is_requester,
            is_responder,
            tx,
            tracker: ResponseTracker::new(),
            subscriptions: DashMap::new(),
            list_streams: DashMap::new(),
            lane: Mutex::new(()),
            connected_at: Instant::now(),
        });
        (client, rx)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn ds_id(&self) -> &str {
        &self.ds_id
    }

    pub fn is_requester(&self) -> bool {
        self.is_requester
    }

    pub fn is_responder(&self) -> bool {
        self.is_responder
    }

    pub fn tracker(&self) -> &ResponseTracker {
        &self.tracker
    }

    /// Whether the transport side still drains this session.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queue a raw frame. Returns `false` once the session is gone.
    pub fn send_raw(&self, frame: String) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Serialize and queue an envelope.
    pub fn write(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(json) => self.send_raw(json),
            Err(err) => {
                tracing::error!(session_id = %self.id, error = %err, "failed to encode envelope");
                false
            }
        }
    }

    /// Queue a `{ "responses": [...] }` envelope.
    pub fn write_responses(&self, responses: &[Response]) -> bool {
        match Envelope::responses(responses) {
            Ok(envelope) => self.write(&envelope),
            Err(err) => {
                tracing::error!(session_id = %self.id, error = %err, "failed to encode responses");
                false
            }
        }
    }

    /// Enter this session's request lane. Holders are serialized.
    pub async fn lock_lane(&self) -> MutexGuard<'_, ()> {
        self.lane.lock().await
    }

    // ── subscriptions ───────────────────────────────────────────────

    /// Register `sid`, cancelling any subscription it replaces.
    pub fn add_subscription(&self, sid: i64, subscription: Subscription) {
        if let Some(previous) = self.subscriptions.insert(sid, subscription) {
            previous.cancel();
        }
    }

    pub fn remove_subscription(&self, sid: i64) -> bool {
        match self.subscriptions.remove(&sid) {
            Some((_, subscription)) => {
                subscription.cancel();
                true
            }
            None => false,
        }
    }

    pub fn has_subscription(&self, sid: i64) -> bool {
        self.subscriptions.contains_key(&sid)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ── list streams ────────────────────────────────────────────────

    /// Attach the child listener backing the `list` stream on `rid`. A
    /// listener already attached to that rid is cancelled.
    pub fn attach_list_stream(&self, rid: i64, listener: Subscription) {
        if let Some(previous) = self.list_streams.insert(rid, listener) {
            previous.cancel();
        }
    }

    pub fn list_stream_count(&self) -> usize {
        self.list_streams.len()
    }

    /// End the stream on `rid`: untrack it and cancel any listener feeding
    /// it. Returns whether the rid was tracked.
    pub fn end_stream(&self, rid: i64) -> bool {
        if let Some((_, listener)) = self.list_streams.remove(&rid) {
            listener.cancel();
        }
        self.tracker.untrack(rid)
    }

    /// Drop all per-session stream state. Tracked rids are invalidated
    /// without close notifications.
    pub fn teardown(&self) {
        self.tracker.clear();
        self.subscriptions.retain(|_, subscription| {
            subscription.cancel();
            false
        });
        self.list_streams.retain(|_, listener| {
            listener.cancel();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dslink_core::{NodeTree, StreamState};
    use serde_json::json;

    #[test]
    fn write_responses_queues_envelope() {
        let (client, mut rx) = Client::new("peer", true, true);
        assert!(client.write_responses(&[Response::closed(5)]));
        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"responses": [{"rid": 5, "stream": "closed"}]}));
    }

    #[test]
    fn write_fails_after_receiver_dropped() {
        let (client, rx) = Client::new("peer", true, true);
        drop(rx);
        assert!(!client.is_connected());
        assert!(!client.write_responses(&[Response::new(1, StreamState::Open)]));
    }

    #[test]
    fn replacing_subscription_cancels_previous_listener() {
        let tree = NodeTree::new();
        let node = tree.create_path("/temp").unwrap();
        let (client, _rx) = Client::new("peer", true, true);

        let first = node.on_value_update(std::sync::Arc::new(|_| true));
        client.add_subscription(
            1,
            Subscription {
                path: "/temp".into(),
                node: Arc::downgrade(&node),
                listener_id: first,
            },
        );
        let second = node.on_value_update(std::sync::Arc::new(|_| true));
        client.add_subscription(
            1,
            Subscription {
                path: "/temp".into(),
                node: Arc::downgrade(&node),
                listener_id: second,
            },
        );
        assert_eq!(node.listener_count(), 1);
        assert_eq!(client.subscription_count(), 1);
    }

    #[test]
    fn teardown_clears_streams_and_listeners() {
        let tree = NodeTree::new();
        let node = tree.create_path("/temp").unwrap();
        let (client, _rx) = Client::new("peer", true, true);
        client.tracker().track(3);
        let id = node.on_value_update(std::sync::Arc::new(|_| true));
        client.add_subscription(
            9,
            Subscription {
                path: "/temp".into(),
                node: Arc::downgrade(&node),
                listener_id: id,
            },
        );

        client.teardown();
        assert!(!client.tracker().is_tracking(3));
        assert!(!client.has_subscription(9));
        assert_eq!(node.listener_count(), 0);
    }

    #[test]
    fn end_stream_cancels_list_listener() {
        let tree = NodeTree::new();
        let node = tree.create_path("/dev").unwrap();
        let (client, _rx) = Client::new("peer", true, true);
        client.tracker().track(4);
        let id = node.on_child_event(std::sync::Arc::new(|_| true));
        client.attach_list_stream(
            4,
            Subscription {
                path: "/dev".into(),
                node: Arc::downgrade(&node),
                listener_id: id,
            },
        );

        assert!(client.end_stream(4));
        assert!(!client.tracker().is_tracking(4));
        assert_eq!(client.list_stream_count(), 0);
        assert_eq!(node.listener_count(), 0);
        assert!(!client.end_stream(4));
    }

    #[test]
    fn teardown_cancels_list_listeners() {
        let tree = NodeTree::new();
        let node = tree.create_path("/dev").unwrap();
        let (client, _rx) = Client::new("peer", true, true);
        let id = node.on_child_event(std::sync::Arc::new(|_| true));
        client.attach_list_stream(
            2,
            Subscription {
                path: "/dev".into(),
                node: Arc::downgrade(&node),
                listener_id: id,
            },
        );

        client.teardown();
        assert_eq!(client.list_stream_count(), 0);
        assert_eq!(node.listener_count(), 0);
    }

    #[tokio::test]
    async fn lane_serializes_holders() {
        let (client, _rx) = Client::new("peer", true, true);
        let guard = client.lock_lane().await;
        assert!(client.lane.try_lock().is_err());
        drop(guard);
        assert!(client.lane.try_lock().is_ok());
    }
}
