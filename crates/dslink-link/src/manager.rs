//! Connection supervision: handshake, transport, reconnect with backoff.
//!
//! ```text
//! Idle -> Handshaking -> Connecting -> Connected
//!              ^                          |
//!              +------ Disconnected <-----+
//! ```
//!
//! Every `start()` and every reconnect opens a new generation. Events and
//! timers carry the generation they were created in and are dropped once a
//! newer one exists.

use std::sync::Arc;
use std::time::Duration;

use dslink_core::LocalHandshake;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::connector::{Connector, ConnectorEvent, ConnectorFactory};
use crate::data_handler::DataHandler;
use crate::handshake::Negotiator;
use crate::link::Link;

/// Phase of the connection state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Handshaking,
    Connecting,
    Connected,
    Disconnected,
}

/// Handed to the connected callback once the transport is up.
#[derive(Clone)]
pub struct ClientConnected {
    pub is_requester: bool,
    pub is_responder: bool,
    pub handler: Arc<DataHandler>,
}

impl std::fmt::Debug for ClientConnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnected")
            .field("is_requester", &self.is_requester)
            .field("is_responder", &self.is_responder)
            .finish_non_exhaustive()
    }
}

pub type ConnectedCallback = Arc<dyn Fn(ClientConnected) + Send + Sync>;
/// Runs after a successful handshake, before the transport is opened.
pub type PreInitHook = Arc<dyn Fn(&ClientConnected) + Send + Sync>;

struct ManagerState {
    phase: ConnectionState,
    backoff: Backoff,
    generation: u64,
    handler: Option<Arc<DataHandler>>,
    connector: Option<Arc<dyn Connector>>,
    on_connected: Option<ConnectedCallback>,
}

struct Inner {
    local: LocalHandshake,
    link: Arc<Link>,
    negotiator: Arc<dyn Negotiator>,
    connectors: Arc<dyn ConnectorFactory>,
    pre_init: Option<PreInitHook>,
    state: Mutex<ManagerState>,
}

/// Keeps a link connected to its broker.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        local: LocalHandshake,
        link: Arc<Link>,
        negotiator: Arc<dyn Negotiator>,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Self {
        Self::build(local, link, negotiator, connectors, None)
    }

    pub fn with_pre_init(
        local: LocalHandshake,
        link: Arc<Link>,
        negotiator: Arc<dyn Negotiator>,
        connectors: Arc<dyn ConnectorFactory>,
        pre_init: PreInitHook,
    ) -> Self {
        Self::build(local, link, negotiator, connectors, Some(pre_init))
    }

    fn build(
        local: LocalHandshake,
        link: Arc<Link>,
        negotiator: Arc<dyn Negotiator>,
        connectors: Arc<dyn ConnectorFactory>,
        pre_init: Option<PreInitHook>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                link,
                negotiator,
                connectors,
                pre_init,
                state: Mutex::new(ManagerState {
                    phase: ConnectionState::Idle,
                    backoff: Backoff::new(),
                    generation: 0,
                    handler: None,
                    connector: None,
                    on_connected: None,
                }),
            }),
        }
    }

    /// Begin connecting, replacing any existing connection or pending
    /// attempt. The backoff starts over at one second.
    pub fn start(&self, on_connected: Option<ConnectedCallback>) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.backoff.reset();
            state.on_connected = on_connected;
            state.generation
        };
        self.stop();
        info!(generation, ds_id = %self.inner.local.ds_id, "connection manager starting");
        let _ = tokio::spawn(attempt(self.inner.clone(), generation));
    }

    /// Close the current transport, if any. Reconnect timers that are
    /// already scheduled still fire.
    pub fn stop(&self) {
        let (connector, handler) = {
            let mut state = self.inner.state.lock();
            let connector = state.connector.take();
            if connector.is_some() {
                state.phase = ConnectionState::Idle;
            }
            (connector, state.handler.clone())
        };
        if let Some(connector) = connector {
            connector.close();
            if let Some(handler) = handler {
                handler.disconnected();
            }
            info!("connection stopped");
        }
    }

    /// Stop and discard every pending attempt and timer.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.phase = ConnectionState::Idle;
        }
        self.stop();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    /// Delay the next reconnect would wait.
    pub fn current_delay(&self) -> Duration {
        self.inner.state.lock().backoff.current()
    }

    /// The frame handler, once a handshake has succeeded.
    pub fn handler(&self) -> Option<Arc<DataHandler>> {
        self.inner.state.lock().handler.clone()
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Set the phase unless `generation` has been superseded.
    fn enter(&self, generation: u64, phase: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.phase = phase;
        true
    }
}

fn attempt(inner: Arc<Inner>, generation: u64) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if !inner.enter(generation, ConnectionState::Handshaking) {
            return;
        }
        let remote = match inner.negotiator.negotiate(&inner.local).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(generation, error = %err, "handshake failed");
                schedule_reconnect(inner, generation);
                return;
            }
        };

        let handler = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            state
                .handler
                .get_or_insert_with(|| Arc::new(DataHandler::new(inner.link.clone(), remote.update_interval())))
                .clone()
        };
        let connected = ClientConnected {
            is_requester: inner.local.is_requester,
            is_responder: inner.local.is_responder,
            handler: handler.clone(),
        };
        if let Some(hook) = &inner.pre_init {
            hook(&connected);
        }

        if !inner.enter(generation, ConnectionState::Connecting) {
            return;
        }
        let connector = match inner.connectors.create(&inner.local, &remote) {
            Ok(connector) => connector,
            Err(err) => {
                warn!(generation, error = %err, "failed to create connector");
                schedule_reconnect(inner, generation);
                return;
            }
        };
        let previous = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                drop(state);
                debug!(generation, "discarding connector from superseded attempt");
                connector.close();
                return;
            }
            handler.bind(connector.clone());
            state.connector.replace(connector.clone())
        };
        if let Some(previous) = previous {
            previous.close();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        connector.start(tx);
        pump_events(inner, generation, rx, connected).await;
    })
}

async fn pump_events(
    inner: Arc<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ConnectorEvent>,
    connected: ClientConnected,
) {
    while let Some(event) = events.recv().await {
        if !inner.is_current(generation) {
            debug!(generation, "dropping event from superseded connection");
            return;
        }
        match event {
            ConnectorEvent::Connected => {
                let callback = {
                    let mut state = inner.state.lock();
                    state.phase = ConnectionState::Connected;
                    state.backoff.reset();
                    state.on_connected.clone()
                };
                if let Err(err) = connected.handler.connected(
                    &inner.local.ds_id,
                    inner.local.is_requester,
                    inner.local.is_responder,
                ) {
                    warn!(generation, error = %err, "could not open session");
                    continue;
                }
                info!(generation, "connected");
                if let Some(callback) = callback {
                    callback(connected.clone());
                }
            }
            ConnectorEvent::Disconnected => {
                connected.handler.disconnected();
                let _ = inner.state.lock().connector.take();
                warn!(generation, "disconnected");
                schedule_reconnect(inner, generation);
                return;
            }
            ConnectorEvent::Error(err) => {
                warn!(generation, error = %err, "transport error");
            }
            ConnectorEvent::Data(text) => {
                connected.handler.process_data(&text).await;
            }
        }
    }
}

fn schedule_reconnect(inner: Arc<Inner>, generation: u64) {
    let delay = {
        let mut state = inner.state.lock();
        if state.generation != generation {
            return;
        }
        state.phase = ConnectionState::Disconnected;
        state.backoff.next_delay()
    };
    info!(generation, delay_secs = delay.as_secs(), "reconnecting after delay");
    let _ = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let next = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.generation += 1;
            state.generation
        };
        attempt(inner, next).await;
    });
}
