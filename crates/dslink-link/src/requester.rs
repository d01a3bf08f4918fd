//! Outbound requests and routing of the responses that answer them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use dslink_core::{Envelope, Request, Response, SessionId, StreamState, TransportError};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::Client;
use crate::methods::SUBSCRIPTION_RID;

type Key = (SessionId, i64);

/// Issues requests to the peer and delivers each response to the caller
/// that opened the rid.
///
/// Rids are allocated from 1 upward; rid 0 is reserved for subscription
/// updates, which go to the channel returned by
/// [`Requester::subscription_updates`].
pub struct Requester {
    next_rid: AtomicI64,
    pending: DashMap<Key, mpsc::UnboundedSender<Response>>,
    subscriptions: DashMap<SessionId, mpsc::UnboundedSender<Response>>,
}

impl Default for Requester {
    fn default() -> Self {
        Self::new()
    }
}

impl Requester {
    pub fn new() -> Self {
        Self {
            next_rid: AtomicI64::new(1),
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Build and send a request; see [`Requester::send`].
    pub fn request(
        &self,
        client: &Client,
        method: &str,
        path: Option<&str>,
        params: Map<String, Value>,
    ) -> Result<(i64, mpsc::UnboundedReceiver<Response>), TransportError> {
        let mut request = Request::new(0, method);
        request.path = path.map(str::to_owned);
        request.params = params;
        self.send(client, request)
    }

    /// Assign a fresh rid to `request` and write it to the session.
    ///
    /// Every response for that rid arrives on the returned channel, which is
    /// closed after the response that closes the stream.
    pub fn send(
        &self,
        client: &Client,
        mut request: Request,
    ) -> Result<(i64, mpsc::UnboundedReceiver<Response>), TransportError> {
        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed);
        request.rid = rid;

        let (tx, rx) = mpsc::unbounded_channel();
        let key = (client.id().clone(), rid);
        let _ = self.pending.insert(key.clone(), tx);

        let envelope = Envelope::requests(std::slice::from_ref(&request))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if !client.write(&envelope) {
            let _ = self.pending.remove(&key);
            return Err(TransportError::Closed);
        }
        debug!(rid, method = %request.method, session_id = %client.id(), "request sent");
        Ok((rid, rx))
    }

    /// Ask the peer to close `rid` and stop routing its responses.
    pub fn close(&self, client: &Client, rid: i64) -> Result<(), TransportError> {
        let _ = self.pending.remove(&(client.id().clone(), rid));
        let envelope = Envelope::requests(&[Request::new(rid, "close")])
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if client.write(&envelope) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Channel receiving every rid 0 update for this session. Replaces any
    /// previously returned channel.
    pub fn subscription_updates(&self, client: &Client) -> mpsc::UnboundedReceiver<Response> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.subscriptions.insert(client.id().clone(), tx);
        rx
    }

    /// Route inbound responses to their pending requests.
    pub fn parse(&self, client: &Arc<Client>, responses: Vec<Value>) {
        for raw in responses {
            let response: Response = match serde_json::from_value(raw) {
                Ok(response) => response,
                Err(err) => {
                    warn!(session_id = %client.id(), error = %err, "dropping malformed response");
                    continue;
                }
            };
            if response.rid == SUBSCRIPTION_RID {
                self.route_subscription(client.id(), response);
            } else {
                self.route_pending(client.id(), response);
            }
        }
    }

    fn route_subscription(&self, session: &SessionId, response: Response) {
        let delivered = self
            .subscriptions
            .get(session)
            .is_some_and(|tx| tx.send(response).is_ok());
        if !delivered {
            let _ = self.subscriptions.remove(session);
        }
    }

    fn route_pending(&self, session: &SessionId, response: Response) {
        let key = (session.clone(), response.rid);
        let rid = response.rid;
        let closed = response.stream == StreamState::Closed;
        let delivered = match self.pending.get(&key) {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(rid, session_id = %session, "response for unknown rid");
                return;
            }
        };
        if closed || !delivered {
            let _ = self.pending.remove(&key);
        }
    }

    /// Number of requests still waiting for their stream to close.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forget everything owned by a session that went away.
    pub fn clear_session(&self, session: &SessionId) {
        self.pending.retain(|(owner, _), _| owner != session);
        let _ = self.subscriptions.remove(session);
    }
}
