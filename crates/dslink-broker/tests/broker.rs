//! Broker end-to-end tests over real HTTP and WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use dslink_broker::{start, BrokerConfig, BrokerHandle};
use dslink_core::{LocalHandshake, NodeTree, StreamState};
use dslink_link::{ConnectionManager, HttpNegotiator, Link, WebSocketConnectorFactory};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio_tungstenite::tungstenite::Message;

async fn broker() -> BrokerHandle {
    start(BrokerConfig {
        port: 0,
        update_interval_secs: 5,
        ..BrokerConfig::default()
    })
    .await
    .unwrap()
}

async fn handshake(port: u16, ds_id: &str) -> Value {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://127.0.0.1:{port}/conn?dsId={ds_id}"))
        .json(&json!({
            "publicKey": "key",
            "isRequester": true,
            "isResponder": true,
            "version": "1.0.4"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

/// Wait until `check` holds, polling every 20ms for up to five seconds.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn websocket_session_lists_conns() {
    let handle = broker().await;
    let remote = handshake(handle.port, "demo-1").await;
    assert_eq!(remote["path"], "/conns/demo-1");
    assert_eq!(remote["updateInterval"], 5);

    let url = format!(
        "ws://127.0.0.1:{}/ws?dsId=demo-1&auth={}",
        handle.port,
        remote["token"].as_str().unwrap()
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let broker = handle.broker.clone();
    eventually(|| broker.session_count() == 1).await;

    let request = json!({"requests": [{"rid": 1, "method": "list", "path": "/conns"}]});
    ws.send(Message::Text(request.to_string().into())).await.unwrap();

    let response = loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            break serde_json::from_str::<Value>(text.as_str()).unwrap();
        }
    };
    let first = &response["responses"][0];
    assert_eq!(first["rid"], 1);
    assert_eq!(first["stream"], "open");
    let updates = first["updates"].as_array().unwrap();
    assert!(updates.contains(&json!(["demo-1", {"$is": "node"}])));

    ws.close(None).await.unwrap();
    eventually(|| broker.session_count() == 0).await;
    assert!(broker.link().tree().get("/conns/demo-1").is_none());
}

#[tokio::test]
async fn wrong_token_is_unauthorized() {
    let handle = broker().await;
    let _ = handshake(handle.port, "demo-2").await;

    let url = format!("ws://127.0.0.1:{}/ws?dsId=demo-2&auth=nope", handle.port);
    let err = tokio_tungstenite::connect_async(url.as_str()).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn health_counts_sessions() {
    let handle = broker().await;
    let body: Value = reqwest::get(format!("http://127.0.0.1:{}/health", handle.port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"status": "healthy", "sessions": 0}));
}

#[tokio::test]
async fn link_connects_and_answers_broker_requests() {
    let handle = broker().await;
    let endpoint = format!("http://127.0.0.1:{}/conn", handle.port);

    let tree = NodeTree::new();
    let version = tree.create_path("/version").unwrap();
    version.set_value(json!("1.0.0"));

    let local = LocalHandshake::from_key("e2e", &[5u8; 32], false, true);
    let ds_id = local.ds_id.clone();
    let manager = ConnectionManager::new(
        local,
        Arc::new(Link::new(tree)),
        Arc::new(HttpNegotiator::new(&endpoint, None).unwrap()),
        Arc::new(WebSocketConnectorFactory::new(&endpoint).unwrap()),
    );
    manager.start(None);

    let broker = handle.broker.clone();
    eventually(|| broker.session(&ds_id).is_some()).await;
    let session = broker.session(&ds_id).unwrap();

    let (_rid, mut rx) = broker
        .link()
        .requester()
        .request(&session, "list", Some("/"), Map::new())
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.stream, StreamState::Open);
    assert!(response.updates.contains(&json!(["version", {"$is": "node"}])));

    manager.shutdown();
    eventually(|| broker.session_count() == 0).await;
}
