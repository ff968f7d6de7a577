//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SwitchboardSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `SWITCHBOARD_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::SwitchboardSettings;

/// Default settings file, relative to the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "switchboard.json";

/// Env var naming an alternative settings file.
pub const SETTINGS_PATH_ENV: &str = "SWITCHBOARD_CONFIG";

/// Resolve the settings file path: `$SWITCHBOARD_CONFIG` or `./switchboard.json`.
pub fn settings_path() -> PathBuf {
    std::env::var(SETTINGS_PATH_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE), PathBuf::from)
}

/// Load settings from `path` (or the default path) with env var overrides.
pub fn load_settings(path: Option<&Path>) -> Result<SwitchboardSettings> {
    match path {
        Some(p) => load_settings_from_path(p),
        None => load_settings_from_path(&settings_path()),
    }
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// [`SwitchboardSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SwitchboardSettings> {
    load_with(path, |name| std::env::var(name).ok())
}

fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<SwitchboardSettings> {
    let defaults = serde_json::to_value(SwitchboardSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SwitchboardSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup` (normally `std::env::var`).
///
/// Invalid values are logged at warn and ignored, leaving the file or
/// default value in place.
pub fn apply_overrides(settings: &mut SwitchboardSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("SWITCHBOARD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("SWITCHBOARD_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── Cluster ─────────────────────────────────────────────────────
    if let Some(v) = env.bool("SWITCHBOARD_CLUSTER_ENABLED") {
        settings.cluster.enabled = v;
    }
    if let Some(v) = env.u64("SWITCHBOARD_SESSION_TIMEOUT_MS", 1, 86_400_000) {
        settings.cluster.session_timeout_ms = v;
    }
    if let Some(v) = env.u64("SWITCHBOARD_HEARTBEAT_INTERVAL_MS", 1, 86_400_000) {
        settings.cluster.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.string("SWITCHBOARD_STORE_URL") {
        settings.cluster.store_url = v;
    }
    if let Some(v) = env.string("SWITCHBOARD_KEY_PREFIX") {
        settings.cluster.key_prefix = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("SWITCHBOARD_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Variable readers (thin wrappers) ────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}
