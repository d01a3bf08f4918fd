//! Handshake value types.
//!
//! The local side is fixed for the lifetime of the process; the remote side
//! is produced fresh by every negotiation attempt.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Protocol version advertised during negotiation.
pub const PROTOCOL_VERSION: &str = "1.0.4";

/// Local identity and capabilities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalHandshake {
    pub ds_id: String,
    /// Base64url (unpadded) public key material.
    pub public_key: String,
    pub is_requester: bool,
    pub is_responder: bool,
}

impl LocalHandshake {
    /// Derive the identity from a link name and its persisted key.
    ///
    /// The ds id is `<name>-<base64url(sha256(key))>`, so it is stable for as
    /// long as the key file survives.
    pub fn from_key(name: &str, key: &[u8], is_requester: bool, is_responder: bool) -> Self {
        let digest = Sha256::digest(key);
        Self {
            ds_id: format!("{name}-{}", URL_SAFE_NO_PAD.encode(digest)),
            public_key: URL_SAFE_NO_PAD.encode(key),
            is_requester,
            is_responder,
        }
    }

    /// Body sent to the broker's auth endpoint.
    pub fn to_request(&self, token: Option<String>) -> HandshakeRequest {
        HandshakeRequest {
            public_key: self.public_key.clone(),
            is_requester: self.is_requester,
            is_responder: self.is_responder,
            version: PROTOCOL_VERSION.to_owned(),
            token,
        }
    }
}

/// Wire body of a handshake request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub public_key: String,
    pub is_requester: bool,
    pub is_responder: bool,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_ws_uri() -> String {
    "/ws".to_owned()
}

/// Session parameters negotiated with the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteHandshake {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ds_id: Option<String>,
    /// Path the broker mounted this link under.
    pub path: String,
    /// Keep-alive period in seconds.
    pub update_interval: u64,
    /// Session token presented when opening the transport.
    pub token: String,
    #[serde(default = "default_ws_uri")]
    pub ws_uri: String,
}

/// Longest keep-alive period a broker may ask for.
pub const MAX_UPDATE_INTERVAL_SECS: u64 = 86_400;

impl RemoteHandshake {
    /// Keep-alive period, clamped to one second through one day.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval.clamp(1, MAX_UPDATE_INTERVAL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ds_id_is_stable_for_same_key() {
        let a = LocalHandshake::from_key("demo", &[7u8; 32], false, true);
        let b = LocalHandshake::from_key("demo", &[7u8; 32], false, true);
        assert_eq!(a.ds_id, b.ds_id);
        assert!(a.ds_id.starts_with("demo-"));
    }

    #[test]
    fn ds_id_changes_with_key() {
        let a = LocalHandshake::from_key("demo", &[1u8; 32], false, true);
        let b = LocalHandshake::from_key("demo", &[2u8; 32], false, true);
        assert_ne!(a.ds_id, b.ds_id);
    }

    #[test]
    fn request_body_is_camel_case() {
        let local = LocalHandshake::from_key("demo", &[0u8; 32], true, false);
        let body = serde_json::to_value(local.to_request(None)).unwrap();
        assert_eq!(body["isRequester"], true);
        assert_eq!(body["isResponder"], false);
        assert_eq!(body["version"], PROTOCOL_VERSION);
        assert!(body.get("token").is_none());
    }

    #[test]
    fn remote_defaults_ws_uri() {
        let remote: RemoteHandshake = serde_json::from_value(json!({
            "path": "/conns/demo", "updateInterval": 30, "token": "abc"
        }))
        .unwrap();
        assert_eq!(remote.ws_uri, "/ws");
        assert_eq!(remote.update_interval(), Duration::from_secs(30));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let remote = RemoteHandshake {
            ds_id: None,
            path: "/".into(),
            update_interval: 0,
            token: String::new(),
            ws_uri: default_ws_uri(),
        };
        assert_eq!(remote.update_interval(), Duration::from_secs(1));
    }

    #[test]
    fn huge_interval_is_capped() {
        let remote = RemoteHandshake {
            ds_id: None,
            path: "/".into(),
            update_interval: u64::MAX,
            token: String::new(),
            ws_uri: default_ws_uri(),
        };
        assert_eq!(remote.update_interval(), Duration::from_secs(MAX_UPDATE_INTERVAL_SECS));
    }
}
