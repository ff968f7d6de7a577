//! # switchboard-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SwitchboardSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `SWITCHBOARD_*` overrides (highest priority)
//!
//! There is no global instance. The binary loads settings once and passes
//! them by value into the components it constructs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::{ClusterSettings, LoggingSettings, ServerSettings, SwitchboardSettings};
