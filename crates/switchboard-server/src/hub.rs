//! One node's session layer.
//!
//! The [`Hub`] ties the registry, dispatcher, optional cluster coordinator
//! and liveness scheduler together and owns every session's lifecycle:
//! `accept` registers and opens, `message` dispatches, `disconnect` tears
//! down exactly once. Transport adapters call into the hub; they never touch
//! the registry directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::{counter, gauge};
use switchboard_core::{AcceptError, ClusterEvent, NodeId, NodeRecord, SessionFault, SessionId};
use switchboard_store::CoordinationStore;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastOutcome, Broadcaster};
use crate::cluster::ClusterCoordinator;
use crate::config::HubConfig;
use crate::dispatcher::{HandlerContext, MessageDispatcher};
use crate::health::{HealthInputs, HealthResponse, health_check};
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_OPENED_TOTAL,
    CONNECTIONS_REJECTED_TOTAL,
};
use crate::registry::SessionRegistry;
use crate::scheduler::LivenessScheduler;
use crate::session::{HandshakeInfo, Session, Transport};
use crate::shutdown::ShutdownCoordinator;

/// Session layer for one node.
pub struct Hub {
    node_id: NodeId,
    config: HubConfig,
    registry: Arc<SessionRegistry>,
    dispatcher: MessageDispatcher,
    coordinator: Option<Arc<ClusterCoordinator>>,
    context: HandlerContext,
    shutdown: ShutdownCoordinator,
    started: AtomicBool,
    started_at: Instant,
}

impl Hub {
    /// Hub with a fresh node id. Clustered when `store` is set.
    pub fn new(
        config: HubConfig,
        dispatcher: MessageDispatcher,
        store: Option<Arc<dyn CoordinationStore>>,
    ) -> Arc<Self> {
        Self::with_node_id(NodeId::new(), config, dispatcher, store)
    }

    /// Hub with a caller-chosen node id.
    pub fn with_node_id(
        node_id: NodeId,
        config: HubConfig,
        dispatcher: MessageDispatcher,
        store: Option<Arc<dyn CoordinationStore>>,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let coordinator = store.map(|store| {
            Arc::new(ClusterCoordinator::new(
                node_id.clone(),
                store,
                Arc::clone(&registry),
                config.coordinator(),
            ))
        });
        let broadcaster = match &coordinator {
            Some(c) => Broadcaster::clustered(node_id.clone(), Arc::clone(&registry), Arc::clone(c)),
            None => Broadcaster::local(node_id.clone(), Arc::clone(&registry)),
        };
        let dispatcher = dispatcher.with_timeout(config.handler_timeout);
        Arc::new(Self {
            node_id,
            config,
            registry,
            dispatcher,
            coordinator,
            context: HandlerContext { broadcaster },
            shutdown: ShutdownCoordinator::new(),
            started: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    /// Join the cluster (when configured) and start the liveness scheduler.
    /// Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) || self.shutdown.is_shutting_down() {
            return;
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.init().await;
        }

        let scheduler = LivenessScheduler::new(
            Arc::clone(&self.registry),
            self.coordinator.clone(),
            self.config.session_timeout,
            self.config.heartbeat_interval,
        );
        let hub = Arc::downgrade(self);
        let handle = tokio::spawn(scheduler.run(self.shutdown.token(), move |evicted| {
            let hub = hub.clone();
            async move {
                let Some(hub) = hub.upgrade() else { return };
                for session in evicted {
                    hub.disconnect(&session).await;
                }
            }
        }));
        self.shutdown.track(handle);
        info!(
            node_id = %self.node_id,
            clustered = self.coordinator.is_some(),
            paths = ?self.dispatcher.paths(),
            "hub started"
        );
    }

    /// Register a new connection on `path` and deliver `on_open`.
    ///
    /// A failing `on_open` is reported to the handler's `on_error`; the
    /// session stays open.
    pub async fn accept(
        &self,
        path: &str,
        handshake: HandshakeInfo,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Session>, AcceptError> {
        if self.shutdown.is_shutting_down() {
            counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => "shutting_down").increment(1);
            return Err(AcceptError::Rejected("node is shutting down".into()));
        }
        if !self.dispatcher.has_path(path) {
            counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => "unknown_path").increment(1);
            debug!(path, "rejected connection for unknown path");
            return Err(AcceptError::UnknownPath(path.to_string()));
        }

        let session = Arc::new(Session::new(path, self.node_id.clone(), handshake, transport));
        if let Err(err) = self.registry.add(Arc::clone(&session)) {
            counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => "registry").increment(1);
            session.close();
            return Err(err.into());
        }
        counter!(CONNECTIONS_OPENED_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);

        if let Some(coordinator) = self.live_coordinator() {
            coordinator.add_session_route(path, session.id()).await;
        }
        info!(
            session_id = %session.id(),
            path,
            user_id = session.user_id().unwrap_or("-"),
            remote_addr = ?session.remote_addr(),
            "session opened"
        );
        let _ = self.dispatcher.open(&self.context, &session).await;
        Ok(session)
    }

    /// Dispatch an inbound text frame.
    pub async fn message(&self, session: &Arc<Session>, text: &str) {
        session.touch();
        let _ = self.dispatcher.message(&self.context, session, text).await;
    }

    /// Report a transport or protocol fault to the session's handler.
    pub async fn fault(&self, session: &Arc<Session>, fault: SessionFault) {
        warn!(session_id = %session.id(), path = session.path(), %fault, "session fault");
        self.dispatcher.error(&self.context, session, &fault).await;
    }

    /// Tear a session down: unregister, drop its route, close the
    /// transport, deliver `on_close`. Runs once per session no matter how
    /// many callers race here.
    pub async fn disconnect(&self, session: &Arc<Session>) {
        if !session.mark_finished() {
            return;
        }
        let _ = self.registry.remove(session.path(), session.id());
        session.close();
        if let Some(coordinator) = self.live_coordinator() {
            coordinator.remove_session_route(session.path(), session.id()).await;
        }
        counter!(CONNECTIONS_CLOSED_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        info!(
            session_id = %session.id(),
            path = session.path(),
            age_ms = u64::try_from(session.age().as_millis()).unwrap_or(u64::MAX),
            "session closed"
        );
        let _ = self.dispatcher.close(&self.context, session).await;
    }

    /// Deliver to every session on `path` across the cluster.
    pub async fn broadcast(&self, path: &str, payload: &str) -> BroadcastOutcome {
        self.context.broadcaster.broadcast(path, payload).await
    }

    /// Deliver to one session by id.
    pub async fn send_to_session(&self, path: &str, session: &SessionId, payload: &str) -> bool {
        self.context.broadcaster.send_to_session(path, session, payload).await
    }

    /// Stop the scheduler, leave the cluster, then close every session,
    /// delivering `on_close` for each. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_shutting_down() && self.registry.is_empty() {
            return;
        }
        info!(node_id = %self.node_id, sessions = self.registry.len(), "hub shutting down");
        self.shutdown.drain(self.config.shutdown_timeout).await;
        if let Some(coordinator) = &self.coordinator {
            coordinator.destroy().await;
        }
        for session in self.registry.sessions() {
            self.disconnect(&session).await;
        }
        info!(node_id = %self.node_id, "hub stopped");
    }

    /// This node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Resolved configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Whether a handler exists for `path`.
    pub fn has_path(&self, path: &str) -> bool {
        self.dispatcher.has_path(path)
    }

    /// The local session table.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Delivery facade shared with handlers.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.context.broadcaster
    }

    /// Sessions on this node.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Whether cluster features are currently local-only.
    pub fn is_degraded(&self) -> bool {
        self.coordinator.as_ref().is_some_and(|c| c.is_degraded())
    }

    /// Live peers as last observed.
    pub fn peers(&self) -> Vec<NodeRecord> {
        self.coordinator.as_ref().map(|c| c.nodes()).unwrap_or_default()
    }

    /// Cluster events, or `None` on a single-node hub.
    pub fn subscribe_events(&self) -> Option<broadcast::Receiver<ClusterEvent>> {
        self.coordinator.as_ref().map(|c| c.subscribe_events())
    }

    /// The coordinator, when clustered.
    pub fn coordinator(&self) -> Option<&Arc<ClusterCoordinator>> {
        self.coordinator.as_ref()
    }

    /// Current health snapshot.
    pub fn health(&self) -> HealthResponse {
        health_check(HealthInputs {
            started_at: self.started_at,
            node_id: self.node_id.clone(),
            connections: self.registry.len(),
            cluster_enabled: self.coordinator.is_some(),
            degraded: self.is_degraded(),
            peers: self.coordinator.as_ref().map_or(0, |c| c.nodes().len()),
        })
    }

    fn live_coordinator(&self) -> Option<&Arc<ClusterCoordinator>> {
        self.coordinator.as_ref().filter(|c| !c.is_destroyed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::PathHandler;
    use crate::session::{ChannelTransport, Outbound};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use switchboard_core::HandlerError;
    use switchboard_store::MemoryStore;

    #[derive(Clone, Default)]
    struct Echo {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PathHandler for Echo {
        async fn on_open(&self, _cx: &HandlerContext, s: &Arc<Session>) -> Result<(), HandlerError> {
            self.log.lock().push(format!("open {}", s.id()));
            Ok(())
        }

        async fn on_message(&self, cx: &HandlerContext, _s: &Arc<Session>, text: &str) -> Result<(), HandlerError> {
            let _ = cx.broadcaster.broadcast("/chat", text).await;
            Ok(())
        }

        async fn on_close(&self, _cx: &HandlerContext, s: &Arc<Session>) -> Result<(), HandlerError> {
            self.log.lock().push(format!("close {}", s.id()));
            Ok(())
        }
    }

    fn hub(echo: &Echo, store: Option<MemoryStore>) -> Arc<Hub> {
        let dispatcher = MessageDispatcher::new().route("/chat", echo.clone());
        Hub::with_node_id(
            NodeId::from("a"),
            HubConfig {
                session_timeout: Duration::from_secs(2),
                heartbeat_interval: Duration::from_millis(500),
                ..HubConfig::default()
            },
            dispatcher,
            store.map(|s| Arc::new(s) as Arc<dyn CoordinationStore>),
        )
    }

    async fn connect(hub: &Hub, path: &str) -> Result<(Arc<Session>, Outbound), AcceptError> {
        let (t, out) = ChannelTransport::new(8);
        let s = hub.accept(path, HandshakeInfo::anonymous(), Arc::new(t)).await?;
        Ok((s, out))
    }

    #[tokio::test]
    async fn unknown_path_is_rejected() {
        let hub = hub(&Echo::default(), None);
        let Err(err) = connect(&hub, "/nope").await else {
            panic!("unknown path was accepted");
        };
        assert_eq!(err, AcceptError::UnknownPath("/nope".into()));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn message_broadcasts_to_path() {
        let hub = hub(&Echo::default(), None);
        let (s1, _o1) = connect(&hub, "/chat").await.unwrap();
        let (_s2, mut o2) = connect(&hub, "/chat").await.unwrap();
        hub.message(&s1, "hi").await;
        assert_eq!(&*o2.recv().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn disconnect_runs_on_close_once() {
        let echo = Echo::default();
        let hub = hub(&echo, None);
        let (s, _o) = connect(&hub, "/chat").await.unwrap();
        hub.disconnect(&s).await;
        hub.disconnect(&s).await;
        let log = echo.log.lock().clone();
        assert_eq!(log, vec![format!("open {}", s.id()), format!("close {}", s.id())]);
        assert_eq!(hub.connection_count(), 0);
        assert!(!s.is_active());
    }

    #[tokio::test]
    async fn clustered_accept_writes_route_and_disconnect_removes_it() {
        let store = MemoryStore::new();
        let hub = hub(&Echo::default(), Some(store.clone()));
        hub.start().await;
        let (s, _o) = connect(&hub, "/chat").await.unwrap();
        let key = format!("switchboard:route:/chat:{}", s.id());
        assert!(store.contains_key(&key));
        hub.disconnect(&s).await;
        assert!(!store.contains_key(&key));
        hub.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_evicted_and_closed() {
        let echo = Echo::default();
        let hub = hub(&echo, None);
        hub.start().await;
        let (s, _o) = connect(&hub, "/chat").await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hub.connection_count(), 0);
        assert!(echo.log.lock().contains(&format!("close {}", s.id())));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_rejects_new_sessions() {
        let echo = Echo::default();
        let store = MemoryStore::new();
        let hub = hub(&echo, Some(store.clone()));
        hub.start().await;
        let (s1, _o1) = connect(&hub, "/chat").await.unwrap();
        let (s2, _o2) = connect(&hub, "/chat").await.unwrap();

        hub.shutdown().await;
        assert_eq!(hub.connection_count(), 0);
        assert!(!s1.is_active() && !s2.is_active());
        assert_eq!(echo.log.lock().iter().filter(|l| l.starts_with("close")).count(), 2);
        assert!(!store.contains_key("switchboard:node:a"));
        assert!(matches!(connect(&hub, "/chat").await, Err(AcceptError::Rejected(_))));
    }

    #[tokio::test]
    async fn health_reports_node_state() {
        let hub = hub(&Echo::default(), None);
        let (_s, _o) = connect(&hub, "/chat").await.unwrap();
        let health = hub.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 1);
        assert!(!health.cluster_enabled);
        assert_eq!(health.node_id, NodeId::from("a"));
    }
}
