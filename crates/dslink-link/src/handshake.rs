//! Handshake negotiation with the broker's auth endpoint, and the persisted
//! link key.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dslink_core::{HandshakeError, LocalHandshake, RemoteHandshake};
use rand::RngCore;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

/// Length of a freshly generated link key.
const KEY_LEN: usize = 32;

/// Obtains session parameters for one connection attempt.
///
/// Implementations never retry; the connection manager owns the retry
/// policy.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(&self, local: &LocalHandshake) -> Result<RemoteHandshake, HandshakeError>;
}

/// Negotiates over HTTP: `POST <endpoint>?dsId=<ds_id>` with the local
/// handshake as JSON body.
pub struct HttpNegotiator {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<SecretString>,
}

impl std::fmt::Debug for HttpNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNegotiator")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpNegotiator {
    pub fn new(endpoint: &str, token: Option<SecretString>) -> Result<Self, HandshakeError> {
        let endpoint = Url::parse(endpoint).map_err(|e| HandshakeError::Endpoint(format!("{endpoint}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HandshakeError::Request(Box::new(e)))?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request_url(&self, ds_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        let _ = url.query_pairs_mut().append_pair("dsId", ds_id);
        url
    }
}

#[async_trait]
impl Negotiator for HttpNegotiator {
    async fn negotiate(&self, local: &LocalHandshake) -> Result<RemoteHandshake, HandshakeError> {
        let url = self.request_url(&local.ds_id);
        let body = local.to_request(self.token.as_ref().map(|t| t.expose_secret().to_owned()));
        debug!(url = %url, "negotiating session");

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HandshakeError::Request(Box::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandshakeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| HandshakeError::Request(Box::new(e)))?;
        let remote: RemoteHandshake =
            serde_json::from_str(&text).map_err(|e| HandshakeError::InvalidResponse(e.to_string()))?;
        info!(path = %remote.path, update_interval = remote.update_interval, "handshake accepted");
        Ok(remote)
    }
}

/// Read the link key at `path`, generating and persisting one if absent.
pub fn load_or_create_key(path: &Path) -> std::io::Result<Vec<u8>> {
    match std::fs::read_to_string(path) {
        Ok(text) => STANDARD
            .decode(text.trim())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let mut key = vec![0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, STANDARD.encode(&key))?;
            info!(path = %path.display(), "generated new link key");
            Ok(key)
        }
        Err(err) => Err(err),
    }
}

/// Local identity backed by the key file at `key_path`.
pub fn load_local_handshake(
    key_path: &Path,
    name: &str,
    is_requester: bool,
    is_responder: bool,
) -> std::io::Result<LocalHandshake> {
    let key = load_or_create_key(key_path)?;
    Ok(LocalHandshake::from_key(name, &key, is_requester, is_responder))
}
