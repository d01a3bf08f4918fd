//! Axum HTTP + WebSocket front end of the broker.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use dslink_core::node::Node;
use dslink_core::wire::decode_frame;
use dslink_core::{HandshakeRequest, NodeTree, PathResolutionError, RemoteHandshake};
use dslink_link::{Client, Link};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::metrics::{HANDSHAKES_TOTAL, REJECTED_TRANSPORTS_TOTAL, SESSIONS_ACTIVE};

/// Broker configuration.
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Keep-alive period handed to links, in seconds.
    pub update_interval_secs: u64,
    /// How often the broker pings each WebSocket.
    pub ping_interval: Duration,
    /// Installed recorder; `/metrics` answers 404 without one.
    pub metrics: Option<PrometheusHandle>,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("update_interval_secs", &self.update_interval_secs)
            .field("ping_interval", &self.ping_interval)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            update_interval_secs: 30,
            ping_interval: Duration::from_secs(30),
            metrics: None,
        }
    }
}

/// Handshake accepted but transport not yet opened.
#[derive(Clone, Debug)]
struct PendingSession {
    token: String,
    is_requester: bool,
    is_responder: bool,
}

/// Broker state: the node tree, issued tokens and live sessions.
pub struct Broker {
    link: Arc<Link>,
    conns: Arc<Node>,
    pending: DashMap<String, PendingSession>,
    sessions: DashMap<String, Arc<Client>>,
    update_interval_secs: u64,
}

impl Broker {
    /// Broker with `/conns`, `/defs` and `/quarantine` in place.
    pub fn new(update_interval_secs: u64) -> Result<Self, PathResolutionError> {
        let tree = NodeTree::new();
        let conns = tree.create_path("/conns")?;
        let _ = tree.create_path("/defs")?;
        let _ = tree.create_path("/quarantine")?;
        Ok(Self {
            link: Arc::new(Link::new(tree)),
            conns,
            pending: DashMap::new(),
            sessions: DashMap::new(),
            update_interval_secs,
        })
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The live session of a connected link.
    pub fn session(&self, ds_id: &str) -> Option<Arc<Client>> {
        self.sessions.get(ds_id).map(|entry| entry.value().clone())
    }

    /// Accept a handshake and issue a fresh transport token for `ds_id`.
    /// Any earlier unused token for the same link is replaced.
    pub fn accept_handshake(&self, ds_id: &str, request: &HandshakeRequest) -> RemoteHandshake {
        let token = uuid::Uuid::now_v7().to_string();
        let _ = self.pending.insert(
            ds_id.to_owned(),
            PendingSession {
                token: token.clone(),
                is_requester: request.is_requester,
                is_responder: request.is_responder,
            },
        );
        counter!(HANDSHAKES_TOTAL).increment(1);
        RemoteHandshake {
            ds_id: Some(ds_id.to_owned()),
            path: format!("/conns/{ds_id}"),
            update_interval: self.update_interval_secs,
            token,
            ws_uri: "/ws".into(),
        }
    }

    /// Consume the token issued for `ds_id`. Returns the pending session if
    /// `auth` matches.
    fn redeem(&self, ds_id: &str, auth: &str) -> Option<PendingSession> {
        self.pending
            .remove_if(ds_id, |_, pending| pending.token == auth)
            .map(|(_, pending)| pending)
    }

    fn register(&self, ds_id: &str, client: Arc<Client>) -> Result<(), PathResolutionError> {
        let _ = self.conns.create_child(ds_id)?;
        if let Some(previous) = self.sessions.insert(ds_id.to_owned(), client) {
            info!(ds_id, session_id = %previous.id(), "session replaced by reconnect");
            self.link.end_session(&previous);
        }
        gauge!(SESSIONS_ACTIVE).set(self.sessions.len() as f64);
        Ok(())
    }

    fn unregister(&self, ds_id: &str, client: &Client) {
        let removed = self
            .sessions
            .remove_if(ds_id, |_, current| current.id() == client.id())
            .is_some();
        if removed {
            let _ = self.conns.remove_child(ds_id);
        }
        self.link.end_session(client);
        gauge!(SESSIONS_ACTIVE).set(self.sessions.len() as f64);
    }
}

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub ping_interval: Duration,
    pub metrics: Option<PrometheusHandle>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/conn", post(conn_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Handle returned by [`start`]; keeps the server task alive.
pub struct BrokerHandle {
    pub port: u16,
    pub broker: Arc<Broker>,
    _server: tokio::task::JoinHandle<()>,
}

/// Bind and serve the broker.
pub async fn start(config: BrokerConfig) -> Result<BrokerHandle, std::io::Error> {
    let broker = Arc::new(
        Broker::new(config.update_interval_secs)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?,
    );
    let router = build_router(AppState {
        broker: broker.clone(),
        ping_interval: config.ping_interval,
        metrics: config.metrics,
    });

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "broker started");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            warn!(error = %err, "broker server exited");
        }
    });

    Ok(BrokerHandle {
        port: local_addr.port(),
        broker,
        _server: server,
    })
}

#[derive(Debug, Deserialize)]
struct ConnQuery {
    #[serde(rename = "dsId")]
    ds_id: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "dsId")]
    ds_id: String,
    auth: String,
}

/// POST /conn?dsId=..
async fn conn_handler(
    State(state): State<AppState>,
    Query(query): Query<ConnQuery>,
    Json(request): Json<HandshakeRequest>,
) -> Response {
    if query.ds_id.is_empty() || query.ds_id.contains('/') {
        return (StatusCode::BAD_REQUEST, "invalid dsId").into_response();
    }
    let remote = state.broker.accept_handshake(&query.ds_id, &request);
    info!(ds_id = %query.ds_id, version = %request.version, "handshake accepted");
    Json(remote).into_response()
}

/// GET /ws?dsId=..&auth=..
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let Some(pending) = state.broker.redeem(&query.ds_id, &query.auth) else {
        warn!(ds_id = %query.ds_id, "rejected transport with unknown token");
        counter!(REJECTED_TRANSPORTS_TOTAL).increment(1);
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.ds_id, pending))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "sessions": state.broker.session_count(),
    }))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, ds_id: String, pending: PendingSession) {
    let broker = state.broker;
    let (client, mut rx) = Client::new(&ds_id, pending.is_requester, pending.is_responder);
    if let Err(err) = broker.register(&ds_id, client.clone()) {
        warn!(ds_id, error = %err, "cannot mount link");
        return;
    }
    info!(ds_id, session_id = %client.id(), "link connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let ping_interval = state.ping_interval;

    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        let _ = ping.tick().await;
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let link = broker.link().clone();
    let reader_client = client.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => match decode_frame(text.as_str()) {
                    Ok(envelopes) => {
                        for envelope in envelopes.into_iter().filter(|e| !e.is_empty()) {
                            link.handle(&reader_client, envelope).await;
                        }
                    }
                    Err(err) => debug!(error = %err, "dropping undecodable frame"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    broker.unregister(&ds_id, &client);
    info!(ds_id, session_id = %client.id(), "link disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState {
            broker: Arc::new(Broker::new(15).unwrap()),
            ping_interval: Duration::from_secs(30),
            metrics: None,
        }
    }

    fn handshake_body() -> String {
        json!({"publicKey": "abc", "isRequester": false, "isResponder": true, "version": "1.0.4"}).to_string()
    }

    #[test]
    fn root_nodes_exist() {
        let broker = Broker::new(30).unwrap();
        let tree = broker.link().tree();
        assert!(tree.get("/conns").is_some());
        assert!(tree.get("/defs").is_some());
        assert!(tree.get("/quarantine").is_some());
    }

    #[test]
    fn token_is_single_use() {
        let broker = Broker::new(30).unwrap();
        let request: HandshakeRequest = serde_json::from_str(&handshake_body()).unwrap();
        let remote = broker.accept_handshake("demo", &request);
        assert!(broker.redeem("demo", "wrong").is_none());
        assert!(broker.redeem("demo", &remote.token).is_some());
        assert!(broker.redeem("demo", &remote.token).is_none());
    }

    #[test]
    fn register_mounts_and_unregister_removes() {
        let broker = Broker::new(30).unwrap();
        let (client, _rx) = Client::new("demo", false, true);
        broker.register("demo", client.clone()).unwrap();
        assert_eq!(broker.session_count(), 1);
        assert!(broker.link().tree().get("/conns/demo").is_some());

        broker.unregister("demo", &client);
        assert_eq!(broker.session_count(), 0);
        assert!(broker.link().tree().get("/conns/demo").is_none());
    }

    #[test]
    fn stale_unregister_keeps_newer_session() {
        let broker = Broker::new(30).unwrap();
        let (old, _rx1) = Client::new("demo", false, true);
        let (new, _rx2) = Client::new("demo", false, true);
        broker.register("demo", old.clone()).unwrap();
        broker.register("demo", new.clone()).unwrap();

        broker.unregister("demo", &old);
        assert_eq!(broker.session("demo").map(|c| c.id().clone()), Some(new.id().clone()));
        assert!(broker.link().tree().get("/conns/demo").is_some());
    }

    #[tokio::test]
    async fn conn_returns_session_parameters() {
        let app = build_router(state());
        let req = Request::builder()
            .method("POST")
            .uri("/conn?dsId=demo-1")
            .header("content-type", "application/json")
            .body(Body::from(handshake_body()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["path"], "/conns/demo-1");
        assert_eq!(parsed["updateInterval"], 15);
        assert_eq!(parsed["wsUri"], "/ws");
        assert!(parsed["token"].as_str().is_some_and(|t| !t.is_empty()));
    }

    #[tokio::test]
    async fn conn_rejects_bad_ds_id() {
        let app = build_router(state());
        let req = Request::builder()
            .method("POST")
            .uri("/conn?dsId=a/b")
            .header("content-type", "application/json")
            .body(Body::from(handshake_body()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let app = build_router(state());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, json!({"status": "healthy", "sessions": 0}));
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let app = build_router(state());
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_renders_recorded_handshakes() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let state = AppState {
            metrics: Some(recorder.handle()),
            ..state()
        };
        let request: HandshakeRequest = serde_json::from_str(&handshake_body()).unwrap();
        metrics::with_local_recorder(&recorder, || {
            let _ = state.broker.accept_handshake("demo", &request);
        });

        let app = build_router(state);
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("dslink_broker_handshakes_total 1"));
    }
}
