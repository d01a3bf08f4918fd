//! # dslink-settings
//!
//! Configuration for links and the broker, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`DslinkSettings::default()`]
//! 2. **User file**: `~/.dslink/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `DSLINK_*` overrides (highest priority)
//!
//! Command-line flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, dslink_home, load_settings, load_settings_from_path, settings_path};
pub use types::{BrokerSettings, DslinkSettings};
