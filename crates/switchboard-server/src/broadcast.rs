//! Delivery facade handed to handlers.
//!
//! Cluster-wide broadcasts deliver to this node's sessions first and then
//! publish one envelope for every peer. Without a coordinator everything is
//! local.

use std::sync::Arc;

use metrics::counter;
use switchboard_core::{NodeId, SessionId};
use tracing::debug;

use crate::cluster::ClusterCoordinator;
use crate::metrics::BROADCASTS_LOCAL_TOTAL;
use crate::registry::{BroadcastReport, SessionRegistry};
use crate::session::Session;

/// Result of a cluster-wide [`Broadcaster::broadcast`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Delivery on this node.
    pub local: BroadcastReport,
    /// Whether an envelope reached the coordination store.
    pub published: bool,
}

/// Local and cluster delivery for one node.
#[derive(Clone)]
pub struct Broadcaster {
    node_id: NodeId,
    registry: Arc<SessionRegistry>,
    coordinator: Option<Arc<ClusterCoordinator>>,
}

impl Broadcaster {
    /// Single-node delivery.
    pub fn local(node_id: NodeId, registry: Arc<SessionRegistry>) -> Self {
        Self {
            node_id,
            registry,
            coordinator: None,
        }
    }

    /// Delivery that also fans out through `coordinator`.
    pub fn clustered(
        node_id: NodeId,
        registry: Arc<SessionRegistry>,
        coordinator: Arc<ClusterCoordinator>,
    ) -> Self {
        Self {
            node_id,
            registry,
            coordinator: Some(coordinator),
        }
    }

    /// Node this broadcaster publishes as.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Whether a coordinator is attached.
    pub fn is_clustered(&self) -> bool {
        self.coordinator.is_some()
    }

    /// Deliver `payload` to every session on `path` across the cluster.
    pub async fn broadcast(&self, path: &str, payload: &str) -> BroadcastOutcome {
        let local = self.broadcast_local(path, payload, |_| true);
        let published = match &self.coordinator {
            Some(coordinator) if !coordinator.is_destroyed() => {
                coordinator.broadcast(path, payload, &self.node_id).await
            }
            _ => false,
        };
        debug!(path, delivered = local.delivered, published, "broadcast");
        BroadcastOutcome { local, published }
    }

    /// Deliver `payload` to this node's sessions on `path` that match
    /// `predicate`.
    pub fn broadcast_local(
        &self,
        path: &str,
        payload: &str,
        predicate: impl Fn(&Session) -> bool,
    ) -> BroadcastReport {
        counter!(BROADCASTS_LOCAL_TOTAL).increment(1);
        self.registry.broadcast_local(path, payload, predicate)
    }

    /// Deliver to one session by id. `false` when the session is not on
    /// this node.
    pub async fn send_to_session(&self, path: &str, session: &SessionId, payload: &str) -> bool {
        match &self.coordinator {
            Some(coordinator) if !coordinator.is_destroyed() => {
                coordinator.send_to_session(path, session, payload).await
            }
            _ => self.registry.send_to(path, session, payload),
        }
    }
}
