//! Cross-node coordination over the shared store.
//!
//! The coordinator owns this node's liveness record, the per-path broadcast
//! subscription, best-effort session routing, and the peer table. Every store
//! call is bounded by `op_timeout`; any failure flips the coordinator into a
//! degraded, local-only mode that clears on the next successful call. Nothing
//! here returns a store error to its caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{StreamExt, stream};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use switchboard_core::{
    BroadcastEnvelope, ClusterEvent, ControlMessage, NodeId, NodeRecord, SessionId, now_ms,
};
use switchboard_store::{CoordinationStore, KeySpace, StoreError, StoreMessage, Subscription};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{
    BROADCASTS_PUBLISHED_TOTAL, CLUSTER_DEGRADED, ENVELOPES_DISCARDED_TOTAL,
    ENVELOPES_RECEIVED_TOTAL, NODE_TIMEOUTS_TOTAL, STORE_ERRORS_TOTAL,
};
use crate::registry::{BroadcastReport, SessionRegistry};

const EVENT_CAPACITY: usize = 256;

/// In-flight route writes during a refresh.
const ROUTE_CONCURRENCY: usize = 16;

/// Coordinator tuning.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Namespace for keys and channels.
    pub key_prefix: String,
    /// TTL of node and route records; also the dead-node threshold.
    pub ttl: Duration,
    /// Upper bound on any single store call.
    pub op_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            key_prefix: "switchboard".to_string(),
            ttl: Duration::from_secs(30),
            op_timeout: Duration::from_secs(2),
        }
    }
}

/// Cluster membership, routing and fan-out for one node.
pub struct ClusterCoordinator {
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
    registry: Arc<SessionRegistry>,
    keys: KeySpace,
    ttl: Duration,
    op_timeout: Duration,
    started_at: i64,
    events: broadcast::Sender<ClusterEvent>,
    peers: DashMap<NodeId, NodeRecord>,
    departed: DashMap<NodeId, i64>,
    degraded: AtomicBool,
    subscribed: AtomicBool,
    destroyed: AtomicBool,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterCoordinator {
    /// Coordinator for `node_id` delivering remote broadcasts into `registry`.
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn CoordinationStore>,
        registry: Arc<SessionRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            node_id,
            store,
            registry,
            keys: KeySpace::new(config.key_prefix),
            ttl: config.ttl,
            op_timeout: config.op_timeout,
            started_at: now_ms(),
            events,
            peers: DashMap::new(),
            departed: DashMap::new(),
            degraded: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            listener: Mutex::new(None),
            refresher: Mutex::new(None),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Key layout in use.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Whether store calls are currently failing.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Receive membership and store-health events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Live peers as last observed by a sweep.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.peers.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.as_str().cmp(b.node_id.as_str()));
        nodes
    }

    /// Subscribe to cluster channels and write the initial node record.
    ///
    /// A store failure here leaves the node running local-only; the next
    /// heartbeat retries the subscription.
    pub async fn init(self: &Arc<Self>) {
        self.ensure_subscribed().await;
        let _ = self.write_node_record().await;
        info!(
            node_id = %self.node_id,
            ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX),
            degraded = self.is_degraded(),
            "cluster coordinator started"
        );
    }

    /// Record that `session` on `path` lives on this node.
    pub async fn add_session_route(&self, path: &str, session: &SessionId) {
        let _ = self.write_route(path, session).await;
    }

    /// Forget the route for `session` on `path`.
    pub async fn remove_session_route(&self, path: &str, session: &SessionId) {
        let key = self.keys.route_key(path, session);
        let _ = self.guard("delete_route", self.store.delete(&key)).await;
    }

    /// Publish an envelope for `path`. Does not deliver locally.
    ///
    /// Returns whether the publish reached the store.
    pub async fn broadcast(&self, path: &str, payload: &str, source: &NodeId) -> bool {
        let envelope = BroadcastEnvelope::new(path, payload, source.clone());
        let message = match envelope.encode() {
            Ok(m) => m,
            Err(err) => {
                self.record_failure("publish", &StoreError::from(err));
                return false;
            }
        };
        let channel = self.keys.broadcast_channel(path);
        let published = self
            .guard("publish", self.store.publish(&channel, &message))
            .await
            .is_some();
        if published {
            counter!(BROADCASTS_PUBLISHED_TOTAL).increment(1);
        }
        published
    }

    /// Deliver to one session by id.
    ///
    /// Delivers when the session is registered on this node. A route that
    /// names another node is not followed: the call returns `false`.
    pub async fn send_to_session(&self, path: &str, session: &SessionId, payload: &str) -> bool {
        if self.registry.send_to(path, session, payload) {
            return true;
        }
        let key = self.keys.route_key(path, session);
        match self.guard("get_route", self.store.get(&key)).await {
            Some(Some(owner)) if owner == self.node_id.as_str() => {
                debug!(session_id = %session, path, "route names this node but session is gone");
                false
            }
            Some(Some(owner)) => {
                debug!(session_id = %session, path, %owner, "session owned by another node");
                false
            }
            _ => false,
        }
    }

    /// Handle an envelope received from the broadcast subscription.
    ///
    /// Envelopes this node published are discarded; local delivery already
    /// happened before the publish.
    pub fn on_remote_envelope(&self, envelope: &BroadcastEnvelope) -> Option<BroadcastReport> {
        if envelope.is_from(&self.node_id) {
            counter!(ENVELOPES_DISCARDED_TOTAL).increment(1);
            return None;
        }
        counter!(ENVELOPES_RECEIVED_TOTAL).increment(1);
        let report = self
            .registry
            .broadcast_local(&envelope.path, &envelope.payload, |_| true);
        debug!(
            path = %envelope.path,
            source = %envelope.source_node_id,
            delivered = report.delivered,
            "delivered remote envelope"
        );
        Some(report)
    }

    /// Handle a control-channel notice.
    pub fn handle_control(&self, message: &ControlMessage) {
        match message {
            ControlMessage::Leave { node_id } => {
                if node_id == &self.node_id {
                    return;
                }
                let first = self.departed.insert(node_id.clone(), now_ms()).is_none();
                let _ = self.peers.remove(node_id);
                if first {
                    info!(peer = %node_id, "peer left the cluster");
                    self.emit(ClusterEvent::NodeLeft {
                        node_id: node_id.clone(),
                    });
                }
            }
        }
    }

    /// Refresh this node's record, then start refreshing the routes of its
    /// local sessions in the background.
    ///
    /// Only the node record write is awaited, so the heartbeat cadence does
    /// not depend on how many sessions this node holds. A refresh still
    /// running from the previous beat is left to finish instead of stacking
    /// a second one. Returns whether the node record was written.
    pub async fn heartbeat(self: &Arc<Self>) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.ensure_subscribed().await;
        let ok = self.write_node_record().await;
        if ok {
            self.spawn_route_refresh();
        }
        ok
    }

    /// Rewrite the route of every session currently in the registry, with
    /// bounded concurrency. Returns how many routes were written.
    ///
    /// Sessions that leave the registry while the refresh runs are skipped,
    /// and a route written for a session that left meanwhile is deleted
    /// again.
    pub async fn refresh_routes(&self) -> usize {
        let written = AtomicUsize::new(0);
        stream::iter(self.registry.sessions())
            .for_each_concurrent(ROUTE_CONCURRENCY, |session| {
                let written = &written;
                async move {
                    if self.is_destroyed()
                        || self.registry.get(session.path(), session.id()).is_none()
                    {
                        return;
                    }
                    if !self.write_route(session.path(), session.id()).await {
                        return;
                    }
                    if self.registry.get(session.path(), session.id()).is_none() {
                        self.remove_session_route(session.path(), session.id()).await;
                        return;
                    }
                    let _ = written.fetch_add(1, Ordering::Relaxed);
                }
            })
            .await;
        written.into_inner()
    }

    /// Scan peer records and reap the dead.
    ///
    /// Emits `NodeJoined` the first time a peer is seen and `NodeTimeout`
    /// exactly once when a peer's record ages past the TTL (the record is
    /// deleted) or a previously seen peer's record has disappeared. Routes
    /// pointing at dead peers are purged. Returns the peers declared dead.
    pub async fn sweep_dead_nodes(&self) -> Vec<NodeId> {
        let prefix = self.keys.node_prefix();
        let Some(entries) = self.guard("scan_nodes", self.store.scan_prefix(&prefix)).await else {
            return Vec::new();
        };

        let now = now_ms();
        self.prune_departed(now);
        let mut seen: Vec<NodeId> = Vec::new();
        let mut dead: Vec<NodeId> = Vec::new();

        for (key, value) in entries {
            let record: NodeRecord = match serde_json::from_str(&value) {
                Ok(r) => r,
                Err(err) => {
                    warn!(%key, error = %err, "unreadable node record, skipping");
                    continue;
                }
            };
            if record.node_id == self.node_id || self.departed.contains_key(&record.node_id) {
                continue;
            }
            if record.is_expired_at(now, self.ttl) {
                let _ = self.guard("delete_node", self.store.delete(&key)).await;
                dead.push(record.node_id);
                continue;
            }
            if self.peers.insert(record.node_id.clone(), record.clone()).is_none() {
                info!(peer = %record.node_id, "peer joined the cluster");
                self.emit(ClusterEvent::NodeJoined {
                    node_id: record.node_id.clone(),
                });
            }
            seen.push(record.node_id);
        }

        let vanished: Vec<NodeId> = self
            .peers
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !seen.contains(id) && !dead.contains(id))
            .collect();
        dead.extend(vanished);

        for node in &dead {
            let _ = self.peers.remove(node);
            counter!(NODE_TIMEOUTS_TOTAL).increment(1);
            warn!(peer = %node, "peer heartbeat expired, declaring node dead");
            self.emit(ClusterEvent::NodeTimeout {
                node_id: node.clone(),
            });
        }
        if !dead.is_empty() {
            self.purge_routes_of(&dead).await;
        }
        dead
    }

    /// Leave the cluster: stop listening, delete this node's record, announce
    /// the departure and drop this node's routes. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            handle.abort();
        }
        let refresher = self.refresher.lock().take();
        if let Some(handle) = refresher {
            handle.abort();
        }

        let key = self.keys.node_key(&self.node_id);
        let _ = self.guard("delete_node", self.store.delete(&key)).await;

        let leave = ControlMessage::Leave {
            node_id: self.node_id.clone(),
        };
        match serde_json::to_string(&leave) {
            Ok(message) => {
                let channel = self.keys.control_channel();
                let _ = self.guard("publish_leave", self.store.publish(&channel, &message)).await;
            }
            Err(err) => self.record_failure("publish_leave", &StoreError::from(err)),
        }

        stream::iter(self.registry.sessions())
            .for_each_concurrent(ROUTE_CONCURRENCY, |session| async move {
                self.remove_session_route(session.path(), session.id()).await;
            })
            .await;
        info!(node_id = %self.node_id, "cluster coordinator stopped");
    }

    // ── internals ───────────────────────────────────────────────────

    async fn write_route(&self, path: &str, session: &SessionId) -> bool {
        let key = self.keys.route_key(path, session);
        self.guard("set_route", self.store.set(&key, self.node_id.as_str(), self.ttl))
            .await
            .is_some()
    }

    fn spawn_route_refresh(self: &Arc<Self>) {
        let mut slot = self.refresher.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(node_id = %self.node_id, "previous route refresh still running, skipping");
            return;
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let written = this.refresh_routes().await;
            debug!(node_id = %this.node_id, written, "refreshed session routes");
        }));
    }

    async fn write_node_record(&self) -> bool {
        let record = NodeRecord {
            node_id: self.node_id.clone(),
            last_heartbeat_at: now_ms(),
            started_at: self.started_at,
        };
        let value = match serde_json::to_string(&record) {
            Ok(v) => v,
            Err(err) => {
                self.record_failure("set_node", &StoreError::from(err));
                return false;
            }
        };
        let key = self.keys.node_key(&self.node_id);
        self.guard("set_node", self.store.set(&key, &value, self.ttl))
            .await
            .is_some()
    }

    async fn ensure_subscribed(self: &Arc<Self>) {
        if self.subscribed.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return;
        }
        let pattern = self.keys.broadcast_pattern();
        let Some(broadcasts) = self.guard("subscribe", self.store.subscribe(&pattern)).await else {
            return;
        };
        let control_pattern = self.keys.control_pattern();
        let Some(control) = self
            .guard("subscribe", self.store.subscribe(&control_pattern))
            .await
        else {
            return;
        };

        self.subscribed.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.listen(broadcasts, control).await });
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        debug!(node_id = %self.node_id, %pattern, "subscribed to cluster channels");
    }

    async fn listen(self: Arc<Self>, mut broadcasts: Subscription, mut control: Subscription) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                msg = broadcasts.recv() => match msg {
                    Some(msg) => self.handle_broadcast_message(&msg),
                    None => break,
                },
                msg = control.recv() => match msg {
                    Some(msg) => self.handle_control_message(&msg),
                    None => break,
                },
            }
        }
        self.subscribed.store(false, Ordering::SeqCst);
        warn!(node_id = %self.node_id, "cluster subscription ended, will resubscribe on next heartbeat");
    }

    fn handle_broadcast_message(&self, msg: &StoreMessage) {
        match BroadcastEnvelope::decode(&msg.payload) {
            Ok(envelope) => {
                if self.keys.path_from_channel(&msg.channel) != Some(envelope.path.as_str()) {
                    warn!(channel = %msg.channel, path = %envelope.path, "envelope path does not match channel, dropping");
                    return;
                }
                let _ = self.on_remote_envelope(&envelope);
            }
            Err(err) => warn!(channel = %msg.channel, error = %err, "undecodable envelope, dropping"),
        }
    }

    fn handle_control_message(&self, msg: &StoreMessage) {
        match serde_json::from_str::<ControlMessage>(&msg.payload) {
            Ok(control) => self.handle_control(&control),
            Err(err) => warn!(channel = %msg.channel, error = %err, "undecodable control message, dropping"),
        }
    }

    async fn purge_routes_of(&self, dead: &[NodeId]) {
        let prefix = self.keys.route_prefix();
        let Some(routes) = self.guard("scan_routes", self.store.scan_prefix(&prefix)).await else {
            return;
        };
        let purged = AtomicUsize::new(0);
        stream::iter(routes)
            .filter(|(_, owner)| {
                std::future::ready(dead.iter().any(|n| n.as_str() == owner.as_str()))
            })
            .for_each_concurrent(ROUTE_CONCURRENCY, |(key, _)| {
                let purged = &purged;
                async move {
                    if self.guard("delete_route", self.store.delete(&key)).await.is_some() {
                        let _ = purged.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;
        let purged = purged.into_inner();
        if purged > 0 {
            info!(purged, "purged routes of dead nodes");
        }
    }

    fn prune_departed(&self, now: i64) {
        let horizon = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX).saturating_mul(2);
        self.departed.retain(|_, left_at| now.saturating_sub(*left_at) <= horizon);
    }

    async fn guard<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.op_timeout, call).await {
            Ok(Ok(value)) => {
                self.record_success();
                Some(value)
            }
            Ok(Err(err)) => {
                self.record_failure(op, &err);
                None
            }
            Err(_elapsed) => {
                self.record_failure(op, &StoreError::Timeout(self.op_timeout));
                None
            }
        }
    }

    fn record_success(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            gauge!(CLUSTER_DEGRADED).set(0.0);
            info!(node_id = %self.node_id, "coordination store recovered");
            self.emit(ClusterEvent::StoreRecovered);
        }
    }

    fn record_failure(&self, op: &'static str, err: &StoreError) {
        counter!(STORE_ERRORS_TOTAL, "op" => op, "kind" => err.kind()).increment(1);
        if self.degraded.swap(true, Ordering::SeqCst) {
            debug!(op, error = %err, "coordination store call failed");
        } else {
            gauge!(CLUSTER_DEGRADED).set(1.0);
            warn!(op, error = %err, "coordination store degraded, operating local-only");
            self.emit(ClusterEvent::StoreDegraded {
                reason: err.to_string(),
            });
        }
    }

    fn emit(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
