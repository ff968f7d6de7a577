//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Call once at startup before any metrics are recorded. Fails if another
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Connections accepted (counter).
pub const CONNECTIONS_OPENED_TOTAL: &str = "switchboard_connections_opened_total";
/// Connections closed (counter).
pub const CONNECTIONS_CLOSED_TOTAL: &str = "switchboard_connections_closed_total";
/// Connections refused at accept (counter, labels: reason).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "switchboard_connections_rejected_total";
/// Live connections on this node (gauge).
pub const CONNECTIONS_ACTIVE: &str = "switchboard_connections_active";
/// Local fan-out deliveries (counter).
pub const BROADCASTS_LOCAL_TOTAL: &str = "switchboard_broadcasts_local_total";
/// Envelopes published to the cluster (counter).
pub const BROADCASTS_PUBLISHED_TOTAL: &str = "switchboard_broadcasts_published_total";
/// Envelopes received from peers and delivered (counter).
pub const ENVELOPES_RECEIVED_TOTAL: &str = "switchboard_envelopes_received_total";
/// Own envelopes discarded on receipt (counter).
pub const ENVELOPES_DISCARDED_TOTAL: &str = "switchboard_envelopes_discarded_total";
/// Frames a transport refused (counter, labels: reason).
pub const SEND_FAILURES_TOTAL: &str = "switchboard_send_failures_total";
/// Failed or timed-out store calls (counter, labels: op, kind).
pub const STORE_ERRORS_TOTAL: &str = "switchboard_store_errors_total";
/// Store degraded state (gauge). 1 = local-only, 0 = healthy.
pub const CLUSTER_DEGRADED: &str = "switchboard_cluster_degraded";
/// Peers declared dead (counter).
pub const NODE_TIMEOUTS_TOTAL: &str = "switchboard_node_timeouts_total";
/// Sessions evicted by the idle sweep (counter).
pub const IDLE_EVICTIONS_TOTAL: &str = "switchboard_idle_evictions_total";
/// Handler failures (counter, labels: event, kind).
pub const HANDLER_ERRORS_TOTAL: &str = "switchboard_handler_errors_total";
/// Handler call duration seconds (histogram, labels: event).
pub const HANDLER_DURATION_SECONDS: &str = "switchboard_handler_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            CONNECTIONS_OPENED_TOTAL,
            CONNECTIONS_CLOSED_TOTAL,
            CONNECTIONS_REJECTED_TOTAL,
            CONNECTIONS_ACTIVE,
            BROADCASTS_LOCAL_TOTAL,
            BROADCASTS_PUBLISHED_TOTAL,
            ENVELOPES_RECEIVED_TOTAL,
            ENVELOPES_DISCARDED_TOTAL,
            SEND_FAILURES_TOTAL,
            STORE_ERRORS_TOTAL,
            CLUSTER_DEGRADED,
            NODE_TIMEOUTS_TOTAL,
            IDLE_EVICTIONS_TOTAL,
            HANDLER_ERRORS_TOTAL,
            HANDLER_DURATION_SECONDS,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
            assert!(name.starts_with("switchboard_"));
        }
    }
}
