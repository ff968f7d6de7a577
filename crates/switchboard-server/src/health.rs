//! `/health` endpoint.

use serde::Serialize;
use switchboard_core::NodeId;
use tokio::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` while the coordination store is failing.
    pub status: &'static str,
    /// Seconds since the hub started.
    pub uptime_secs: u64,
    /// This node.
    pub node_id: NodeId,
    /// Live sessions on this node.
    pub connections: usize,
    /// Whether a coordination store is configured.
    pub cluster_enabled: bool,
    /// Whether cluster features are currently local-only.
    pub degraded: bool,
    /// Live peers last observed.
    pub peers: usize,
}

/// Snapshot of node health.
pub struct HealthInputs {
    /// Hub start time.
    pub started_at: Instant,
    /// This node.
    pub node_id: NodeId,
    /// Live sessions.
    pub connections: usize,
    /// Coordination store configured.
    pub cluster_enabled: bool,
    /// Store currently failing.
    pub degraded: bool,
    /// Live peers.
    pub peers: usize,
}

/// Build a health response.
pub fn health_check(inputs: HealthInputs) -> HealthResponse {
    HealthResponse {
        status: if inputs.degraded { "degraded" } else { "ok" },
        uptime_secs: inputs.started_at.elapsed().as_secs(),
        node_id: inputs.node_id,
        connections: inputs.connections,
        cluster_enabled: inputs.cluster_enabled,
        degraded: inputs.degraded,
        peers: inputs.peers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn inputs(degraded: bool) -> HealthInputs {
        HealthInputs {
            started_at: Instant::now(),
            node_id: NodeId::from("n1"),
            connections: 3,
            cluster_enabled: true,
            degraded,
            peers: 2,
        }
    }

    #[test]
    fn healthy_status() {
        let resp = health_check(inputs(false));
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.connections, 3);
        assert_eq!(resp.peers, 2);
    }

    #[test]
    fn degraded_status() {
        assert_eq!(health_check(inputs(true)).status, "degraded");
    }

    #[tokio::test(start_paused = true)]
    async fn uptime_follows_clock() {
        let started_at = Instant::now();
        tokio::time::advance(Duration::from_secs(61)).await;
        let resp = health_check(HealthInputs {
            started_at,
            ..inputs(false)
        });
        assert_eq!(resp.uptime_secs, 61);
    }

    #[test]
    fn serialization() {
        let json = serde_json::to_value(health_check(inputs(false))).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["node_id"], "n1");
        assert_eq!(json["cluster_enabled"], true);
        assert!(json["uptime_secs"].is_number());
    }
}
