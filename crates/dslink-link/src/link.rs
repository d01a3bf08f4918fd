//! Routes decoded envelopes to the responder and requester.

use std::sync::Arc;

use dslink_core::{Envelope, NodeTree};

use crate::client::Client;
use crate::requester::Requester;
use crate::responder::Responder;

/// One endpoint's node tree together with both protocol roles.
///
/// Shared by every session the endpoint serves; a link process has one
/// session at a time, the broker one per connected peer.
pub struct Link {
    tree: NodeTree,
    responder: Responder,
    requester: Requester,
}

impl Link {
    pub fn new(tree: NodeTree) -> Self {
        Self::with_responder(tree.clone(), Responder::new(Arc::new(tree)))
    }

    /// Use a responder with extra methods registered.
    pub fn with_responder(tree: NodeTree, responder: Responder) -> Self {
        Self {
            tree,
            responder,
            requester: Requester::new(),
        }
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    /// Handle one envelope: requests first, then responses.
    pub async fn handle(&self, client: &Arc<Client>, envelope: Envelope) {
        if let Some(requests) = envelope.requests.filter(|r| !r.is_empty()) {
            let _ = self.responder.parse(client, requests).await;
        }
        if let Some(responses) = envelope.responses.filter(|r| !r.is_empty()) {
            self.requester.parse(client, responses);
        }
    }

    /// Drop all state the session left behind.
    pub fn end_session(&self, client: &Client) {
        client.teardown();
        self.requester.clear_session(client.id());
    }
}
