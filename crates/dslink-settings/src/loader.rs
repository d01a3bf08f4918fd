//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DslinkSettings::default()`]
//! 2. If `~/.dslink/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `DSLINK_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::DslinkSettings;

/// `~/.dslink`, falling back to `/tmp/.dslink` without a home directory.
pub fn dslink_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".dslink")
}

/// Resolve the path to the settings file (`~/.dslink/settings.json`).
pub fn settings_path() -> PathBuf {
    dslink_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DslinkSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<DslinkSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<DslinkSettings> {
    let defaults = serde_json::to_value(DslinkSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, everything else is replaced by `source`, and
/// `null` in `source` keeps the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `DSLINK_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored.
pub fn apply_overrides(settings: &mut DslinkSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("DSLINK_NAME") {
        settings.name = v;
    }
    if let Some(v) = read("DSLINK_BROKER_URL") {
        settings.broker_url = v;
    }
    if let Some(v) = read("DSLINK_TOKEN") {
        settings.token = Some(v);
    }
    if let Some(v) = read("DSLINK_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(v) = read("DSLINK_JSON_LOGS") {
        match parse_bool(&v) {
            Some(b) => settings.json_logs = b,
            None => tracing::warn!(key = "DSLINK_JSON_LOGS", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("DSLINK_BROKER_PORT") {
        match v.parse::<u16>().ok().filter(|p| *p > 0) {
            Some(port) => settings.broker.port = port,
            None => tracing::warn!(key = "DSLINK_BROKER_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("DSLINK_UPDATE_INTERVAL") {
        match parse_u64_range(&v, 1, 3600) {
            Some(secs) => settings.broker.update_interval_secs = secs,
            None => tracing::warn!(key = "DSLINK_UPDATE_INTERVAL", value = %v, "invalid interval env var, ignoring"),
        }
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"broker": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"broker": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["broker"]["port"], 9090);
        assert_eq!(merged["broker"]["host"], "localhost");
    }

    #[test]
    fn merge_skips_null() {
        let merged = deep_merge(
            serde_json::json!({"name": "a"}),
            serde_json::json!({"name": null}),
        );
        assert_eq!(merged["name"], "a");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file_layer(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, DslinkSettings::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"name":"thermo","brokerUrl":"http://broker:9000/conn"}"#).unwrap();
        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.name, "thermo");
        assert_eq!(settings.broker_url, "http://broker:9000/conn");
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_file_layer(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = DslinkSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("DSLINK_NAME", "pump"),
                ("DSLINK_TOKEN", "secret"),
                ("DSLINK_LOG_LEVEL", "debug"),
                ("DSLINK_BROKER_PORT", "9100"),
                ("DSLINK_JSON_LOGS", "yes"),
            ]),
        );
        assert_eq!(settings.name, "pump");
        assert_eq!(settings.token.as_deref(), Some("secret"));
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.broker.port, 9100);
        assert!(settings.json_logs);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut settings = DslinkSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("DSLINK_BROKER_PORT", "0"),
                ("DSLINK_UPDATE_INTERVAL", "never"),
                ("DSLINK_NAME", ""),
            ]),
        );
        assert_eq!(settings, DslinkSettings::default());
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("11", 1, 10), None);
    }
}
