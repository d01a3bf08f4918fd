//! Settings structures and their compiled defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Top-level settings shared by the link and broker binaries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DslinkSettings {
    /// Link name; prefix of the derived ds id.
    pub name: String,
    /// Broker auth endpoint (`http://host:port/conn`).
    pub broker_url: String,
    /// Optional token presented during the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Default log level (`trace`..`error`). `RUST_LOG` wins over this.
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output.
    pub json_logs: bool,
    pub is_requester: bool,
    pub is_responder: bool,
    /// Key file backing the link identity. Relative paths resolve against
    /// `~/.dslink`.
    pub key_path: String,
    pub broker: BrokerSettings,
}

impl Default for DslinkSettings {
    fn default() -> Self {
        Self {
            name: "dslink".to_string(),
            broker_url: "http://127.0.0.1:8080/conn".to_string(),
            token: None,
            log_level: "info".to_string(),
            json_logs: false,
            is_requester: false,
            is_responder: true,
            key_path: ".key".to_string(),
            broker: BrokerSettings::default(),
        }
    }
}

impl DslinkSettings {
    /// Absolute location of the identity key file.
    pub fn resolved_key_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.key_path);
        if path.is_absolute() {
            path
        } else {
            crate::loader::dslink_home().join(path)
        }
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SettingsError::InvalidValue("name is empty".into()));
        }
        if !(self.broker_url.starts_with("http://") || self.broker_url.starts_with("https://")) {
            return Err(SettingsError::InvalidValue(format!(
                "broker url must be http(s): {}",
                self.broker_url
            )));
        }
        if !self.is_requester && !self.is_responder {
            return Err(SettingsError::InvalidValue(
                "link must be a requester, a responder, or both".into(),
            ));
        }
        Ok(())
    }
}

/// Broker listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    /// Keep-alive interval handed to links during the handshake, in seconds.
    pub update_interval_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            update_interval_secs: 30,
        }
    }
}
