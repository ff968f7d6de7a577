//! Runtime knobs for a [`Hub`](crate::hub::Hub).

use std::time::Duration;

use switchboard_settings::SwitchboardSettings;

use crate::cluster::CoordinatorConfig;
use crate::dispatcher::DEFAULT_HANDLER_TIMEOUT;

/// Resolved hub configuration.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Idle sessions and stale node records older than this are reaped.
    pub session_timeout: Duration,
    /// Period of the liveness scheduler.
    pub heartbeat_interval: Duration,
    /// Upper bound on a single handler callback.
    pub handler_timeout: Duration,
    /// Upper bound on a single coordination-store call.
    pub store_timeout: Duration,
    /// Time allowed for background tasks to stop on shutdown.
    pub shutdown_timeout: Duration,
    /// Namespace for store keys and channels.
    pub key_prefix: String,
    /// Outbound frames queued per connection before sends fail.
    pub send_queue_capacity: usize,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            store_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            key_prefix: "switchboard".to_string(),
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024,
        }
    }
}

impl HubConfig {
    /// Project validated settings onto the hub.
    pub fn from_settings(settings: &SwitchboardSettings) -> Self {
        Self {
            session_timeout: settings.cluster.session_timeout(),
            heartbeat_interval: settings.cluster.heartbeat_interval(),
            handler_timeout: settings.server.handler_timeout(),
            store_timeout: settings.cluster.store_timeout(),
            shutdown_timeout: settings.server.shutdown_timeout(),
            key_prefix: settings.cluster.key_prefix.clone(),
            send_queue_capacity: settings.server.send_queue_capacity,
            max_message_size: settings.server.max_message_size,
        }
    }

    /// Coordinator settings derived from this config.
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            key_prefix: self.key_prefix.clone(),
            ttl: self.session_timeout,
            op_timeout: self.store_timeout,
        }
    }
}
