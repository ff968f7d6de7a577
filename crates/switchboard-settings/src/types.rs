//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may contain any subset of fields. Durations are stored as
//! milliseconds and exposed as [`Duration`] through accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for a Switchboard node.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "cluster": { "enabled": true, "storeUrl": "redis://cache:6379" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchboardSettings {
    /// Listener and per-connection limits.
    pub server: ServerSettings,
    /// Cluster membership and coordination store.
    pub cluster: ClusterSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl SwitchboardSettings {
    /// Reject values that would make the node misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        let zero_checks = [
            ("server.sendQueueCapacity", self.server.send_queue_capacity as u64),
            ("server.maxMessageSize", self.server.max_message_size as u64),
            ("server.handlerTimeoutMs", self.server.handler_timeout_ms),
            ("server.shutdownTimeoutMs", self.server.shutdown_timeout_ms),
            ("cluster.sessionTimeoutMs", self.cluster.session_timeout_ms),
            ("cluster.heartbeatIntervalMs", self.cluster.heartbeat_interval_ms),
            ("cluster.storeTimeoutMs", self.cluster.store_timeout_ms),
        ];
        if let Some((name, _)) = zero_checks.iter().find(|(_, v)| *v == 0) {
            return Err(SettingsError::InvalidValue(format!("{name} must be > 0")));
        }
        if self.cluster.key_prefix.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "cluster.keyPrefix must not be empty".to_string(),
            ));
        }
        if self.cluster.enabled && self.cluster.store_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "cluster.storeUrl is required when clustering is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Listener and per-connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP/WebSocket port.
    pub port: u16,
    /// Outbound frames buffered per connection before sends fail.
    pub send_queue_capacity: usize,
    /// Largest inbound text frame accepted, in bytes.
    pub max_message_size: usize,
    /// Upper bound on a single handler callback.
    pub handler_timeout_ms: u64,
    /// Grace period for in-flight work at shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024,
            handler_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Cluster coordination settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    /// Whether this node joins a cluster through the coordination store.
    pub enabled: bool,
    /// Idle session timeout; also the TTL for node and route records.
    pub session_timeout_ms: u64,
    /// Heartbeat and sweep cadence.
    pub heartbeat_interval_ms: u64,
    /// Coordination store URL (`redis://...`).
    pub store_url: String,
    /// Namespace prepended to every store key and channel.
    pub key_prefix: String,
    /// Upper bound on any single store call.
    pub store_timeout_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            store_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "switchboard".to_string(),
            store_timeout_ms: 2_000,
        }
    }
}

impl ClusterSettings {
    /// Session timeout / record TTL.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Effective tick interval, never longer than a third of the TTL so a
    /// live node refreshes its record at least twice per window.
    pub fn heartbeat_interval(&self) -> Duration {
        let ceiling = (self.session_timeout_ms / 3).max(1);
        if self.heartbeat_interval_ms > ceiling {
            tracing::warn!(
                configured_ms = self.heartbeat_interval_ms,
                effective_ms = ceiling,
                "heartbeat interval exceeds a third of the session timeout, clamping"
            );
        }
        Duration::from_millis(self.heartbeat_interval_ms.min(ceiling))
    }

    /// Store call timeout.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
