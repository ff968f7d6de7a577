//! Cluster wire types carried through the coordination store.
//!
//! Everything here is plain immutable data serialized as JSON. Timestamps are
//! wall-clock milliseconds since the UNIX epoch because they are compared
//! across processes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// Wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One broadcast published on a path's channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEnvelope {
    /// Logical endpoint the payload is addressed to.
    pub path: String,
    /// Opaque text payload.
    pub payload: String,
    /// Node that published the envelope.
    pub source_node_id: NodeId,
    /// Publish time (epoch ms).
    pub timestamp: i64,
}

impl BroadcastEnvelope {
    /// Build an envelope stamped with the current time.
    pub fn new(path: impl Into<String>, payload: impl Into<String>, source: NodeId) -> Self {
        Self {
            path: path.into(),
            payload: payload.into(),
            source_node_id: source,
            timestamp: now_ms(),
        }
    }

    /// Whether this envelope was published by `node`.
    pub fn is_from(&self, node: &NodeId) -> bool {
        &self.source_node_id == node
    }

    /// Serialize for the pub/sub transport.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse an envelope received from the pub/sub transport.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Liveness record a node keeps fresh in the coordination store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// The node this record describes.
    pub node_id: NodeId,
    /// Last heartbeat (epoch ms).
    pub last_heartbeat_at: i64,
    /// Process start (epoch ms).
    pub started_at: i64,
}

impl NodeRecord {
    /// A fresh record for a node starting now.
    pub fn new(node_id: NodeId) -> Self {
        let now = now_ms();
        Self {
            node_id,
            last_heartbeat_at: now,
            started_at: now,
        }
    }

    /// Copy of this record with the heartbeat set to `at`.
    #[must_use]
    pub fn beat_at(&self, at: i64) -> Self {
        Self {
            last_heartbeat_at: at,
            ..self.clone()
        }
    }

    /// Time since the last heartbeat, as seen at `now`. Clock skew that puts
    /// the heartbeat in the future counts as zero age.
    pub fn age_at(&self, now: i64) -> Duration {
        let elapsed = now.saturating_sub(self.last_heartbeat_at).max(0);
        Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
    }

    /// Whether the record is older than `ttl` at `now`.
    pub fn is_expired_at(&self, now: i64, ttl: Duration) -> bool {
        self.age_at(now) > ttl
    }
}

/// Out-of-band notices on the cluster control channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// The node is shutting down gracefully.
    Leave {
        /// Departing node.
        #[serde(rename = "nodeId")]
        node_id: NodeId,
    },
}

/// Membership and store-health events emitted by the cluster coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterEvent {
    /// A peer record was observed for the first time.
    NodeJoined {
        /// The new peer.
        node_id: NodeId,
    },
    /// A peer stopped heartbeating for longer than the TTL window.
    NodeTimeout {
        /// The dead peer.
        node_id: NodeId,
    },
    /// A peer announced a graceful shutdown.
    NodeLeft {
        /// The departed peer.
        node_id: NodeId,
    },
    /// Coordination store calls started failing; cluster features are local-only.
    StoreDegraded {
        /// Last failure observed.
        reason: String,
    },
    /// Coordination store calls succeed again.
    StoreRecovered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_encode_uses_camel_case() {
        let env = BroadcastEnvelope::new("/chat", "hi", NodeId::from("node-a"));
        let json = env.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["path"], "/chat");
        assert_eq!(value["payload"], "hi");
        assert_eq!(value["sourceNodeId"], "node-a");
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn envelope_decode_rejects_garbage() {
        assert!(BroadcastEnvelope::decode("not json").is_err());
        assert!(BroadcastEnvelope::decode(r#"{"path":"/x"}"#).is_err());
    }

    #[test]
    fn envelope_is_from() {
        let a = NodeId::from("a");
        let env = BroadcastEnvelope::new("/p", "x", a.clone());
        assert!(env.is_from(&a));
        assert!(!env.is_from(&NodeId::from("b")));
    }

    #[test]
    fn node_record_age_and_expiry() {
        let record = NodeRecord::new(NodeId::from("n")).beat_at(1_000);
        assert_eq!(record.age_at(4_000), Duration::from_secs(3));
        assert!(!record.is_expired_at(4_000, Duration::from_secs(3)));
        assert!(record.is_expired_at(4_001, Duration::from_secs(3)));
    }

    #[test]
    fn node_record_future_heartbeat_has_zero_age() {
        let record = NodeRecord::new(NodeId::from("n")).beat_at(10_000);
        assert_eq!(record.age_at(5_000), Duration::ZERO);
    }

    #[test]
    fn control_message_shape() {
        let msg = ControlMessage::Leave {
            node_id: NodeId::from("n1"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "leave");
        assert_eq!(json["nodeId"], "n1");
        let back: ControlMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn cluster_event_tag() {
        let ev = ClusterEvent::NodeTimeout {
            node_id: NodeId::from("dead"),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "NODE_TIMEOUT");
        assert_eq!(json["node_id"], "dead");
    }
}
