//! Transport connectors.
//!
//! A connector owns one transport connection attempt. It reports lifecycle
//! and inbound data as [`ConnectorEvent`]s and accepts outbound text frames.

use std::sync::Arc;

use dslink_core::{LocalHandshake, RemoteHandshake, TransportError};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something that happened on the transport.
#[derive(Clone, Debug)]
pub enum ConnectorEvent {
    Connected,
    /// The remote side went away or the connection attempt failed.
    Disconnected,
    Error(TransportError),
    Data(String),
}

/// One transport connection.
///
/// [`Connector::close`] is a local shutdown and emits no further events.
pub trait Connector: Send + Sync {
    fn start(&self, events: mpsc::UnboundedSender<ConnectorEvent>);
    fn send(&self, frame: String) -> Result<(), TransportError>;
    fn close(&self);
}

/// Builds a fresh connector for each connection attempt.
pub trait ConnectorFactory: Send + Sync {
    fn create(
        &self,
        local: &LocalHandshake,
        remote: &RemoteHandshake,
    ) -> Result<Arc<dyn Connector>, TransportError>;
}

/// WebSocket URL for a negotiated session: the broker origin with the
/// negotiated `wsUri`, an upgraded scheme and `dsId`/`auth` query.
pub fn transport_url(
    broker: &Url,
    local: &LocalHandshake,
    remote: &RemoteHandshake,
) -> Result<Url, TransportError> {
    let mut url = broker
        .join(&remote.ws_uri)
        .map_err(|e| TransportError::Connect(format!("bad ws uri {}: {e}", remote.ws_uri)))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::Connect(format!("cannot use scheme {scheme} for {url}")))?;
    url.set_query(None);
    let _ = url
        .query_pairs_mut()
        .append_pair("dsId", &local.ds_id)
        .append_pair("auth", &remote.token);
    Ok(url)
}

/// Connector backed by `tokio-tungstenite`.
pub struct WebSocketConnector {
    url: Url,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    cancel: CancellationToken,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            outbound: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    fn start(&self, events: mpsc::UnboundedSender<ConnectorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        let _ = tokio::spawn(run_socket(self.url.clone(), rx, events, self.cancel.clone()));
    }

    fn send(&self, frame: String) -> Result<(), TransportError> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
        let _ = self.outbound.lock().take();
    }
}

async fn run_socket(
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
    cancel: CancellationToken,
) {
    let connect = tokio::select! {
        () = cancel.cancelled() => return,
        result = connect_async(url.as_str()) => result,
    };
    let ws = match connect {
        Ok((ws, _)) => ws,
        Err(err) => {
            let _ = events.send(ConnectorEvent::Error(TransportError::Connect(err.to_string())));
            let _ = events.send(ConnectorEvent::Disconnected);
            return;
        }
    };
    info!(url = %url, "transport connected");
    let _ = events.send(ConnectorEvent::Connected);

    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                debug!(url = %url, "transport closed locally");
                return;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = ws_tx.send(Message::Text(frame.into())).await {
                    let _ = events.send(ConnectorEvent::Error(TransportError::Io(err.to_string())));
                    break;
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ConnectorEvent::Data(text.as_str().to_owned()));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = events.send(ConnectorEvent::Error(TransportError::Io(err.to_string())));
                    break;
                }
            },
        }
    }
    if !cancel.is_cancelled() {
        warn!(url = %url, "transport disconnected");
        let _ = events.send(ConnectorEvent::Disconnected);
    }
}

/// Creates [`WebSocketConnector`]s against one broker.
pub struct WebSocketConnectorFactory {
    broker: Url,
}

impl WebSocketConnectorFactory {
    pub fn new(broker_url: &str) -> Result<Self, TransportError> {
        let broker = Url::parse(broker_url).map_err(|e| TransportError::Connect(format!("{broker_url}: {e}")))?;
        Ok(Self { broker })
    }
}

impl ConnectorFactory for WebSocketConnectorFactory {
    fn create(
        &self,
        local: &LocalHandshake,
        remote: &RemoteHandshake,
    ) -> Result<Arc<dyn Connector>, TransportError> {
        let url = transport_url(&self.broker, local, remote)?;
        Ok(Arc::new(WebSocketConnector::new(url)))
    }
}
