//! Frame handling between a connector and the link.

use std::sync::Arc;
use std::time::Duration;

use dslink_core::wire::decode_frame;
use dslink_core::{Envelope, TransportError, MAX_UPDATE_INTERVAL_SECS};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::connector::Connector;
use crate::link::Link;

/// Keep-alive frame sent every update interval.
pub const KEEPALIVE_FRAME: &str = "{}";

#[derive(Default)]
struct HandlerState {
    connector: Option<Arc<dyn Connector>>,
    session: Option<Arc<Client>>,
    cancel: Option<CancellationToken>,
}

/// Bridges one connector at a time to the link.
///
/// The handler outlives individual connections: it is rebound to each new
/// connector and keeps the update interval it was created with.
pub struct DataHandler {
    update_interval: Duration,
    link: Arc<Link>,
    state: Mutex<HandlerState>,
}

impl DataHandler {
    /// `update_interval` is clamped to one second through one day.
    pub fn new(link: Arc<Link>, update_interval: Duration) -> Self {
        Self {
            update_interval: update_interval.clamp(
                Duration::from_secs(1),
                Duration::from_secs(MAX_UPDATE_INTERVAL_SECS),
            ),
            link,
            state: Mutex::new(HandlerState::default()),
        }
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Route outbound traffic to `connector` from now on.
    pub fn bind(&self, connector: Arc<dyn Connector>) {
        self.state.lock().connector = Some(connector);
    }

    /// The live session, if connected.
    pub fn session(&self) -> Option<Arc<Client>> {
        self.state.lock().session.clone()
    }

    /// Open a session for the bound connector.
    ///
    /// Starts a writer task that drains the session's outbound queue into the
    /// connector and sends a keep-alive frame every update interval. Any
    /// previous session is dropped first.
    pub fn connected(&self, ds_id: &str, is_requester: bool, is_responder: bool) -> Result<Arc<Client>, TransportError> {
        self.disconnected();

        let mut state = self.state.lock();
        let connector = state.connector.clone().ok_or(TransportError::Closed)?;
        let (client, rx) = Client::new(ds_id, is_requester, is_responder);
        let cancel = CancellationToken::new();
        let _ = tokio::spawn(pump_outbound(
            connector,
            rx,
            self.update_interval,
            cancel.clone(),
        ));
        info!(session_id = %client.id(), ds_id, "session opened");
        state.session = Some(client.clone());
        state.cancel = Some(cancel);
        Ok(client)
    }

    /// Stop the writer and keep-alive and drop the session.
    pub fn disconnected(&self) {
        let (cancel, session) = {
            let mut state = self.state.lock();
            (state.cancel.take(), state.session.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(client) = session {
            self.link.end_session(&client);
            info!(session_id = %client.id(), "session closed");
        }
    }

    /// Decode an inbound text frame and hand each envelope to the link.
    pub async fn process_data(&self, text: &str) {
        let envelopes = match decode_frame(text) {
            Ok(envelopes) => envelopes,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return;
            }
        };
        let Some(client) = self.session() else {
            debug!("frame received without a session");
            return;
        };
        for envelope in envelopes.into_iter().filter(|e| !e.is_empty()) {
            self.link.handle(&client, envelope).await;
        }
    }

    /// Encode `envelope` and send it on the bound connector.
    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = envelope
            .to_json()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let connector = self.state.lock().connector.clone().ok_or(TransportError::Closed)?;
        connector.send(frame)
    }
}

async fn pump_outbound(
    connector: Arc<dyn Connector>,
    mut rx: mpsc::UnboundedReceiver<String>,
    update_interval: Duration,
    cancel: CancellationToken,
) {
    let mut keepalive = interval_at(Instant::now() + update_interval, update_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
            _ = keepalive.tick() => KEEPALIVE_FRAME.to_owned(),
        };
        if let Err(err) = connector.send(frame) {
            debug!(error = %err, "connector rejected frame");
        }
    }
}
