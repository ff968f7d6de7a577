//! Periodic liveness work.
//!
//! Every tick: refresh this node's record (route refresh continues in the
//! background), reap dead peers, then evict idle local sessions. Ticks never
//! overlap; a slow tick delays the next one instead of bunching.

use std::sync::Arc;
use std::time::Duration;

use switchboard_core::NodeId;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::ClusterCoordinator;
use crate::registry::SessionRegistry;
use crate::session::Session;

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Heartbeat result; `None` without a coordinator.
    pub heartbeat_ok: Option<bool>,
    /// Peers declared dead this tick.
    pub timed_out: Vec<NodeId>,
    /// Local sessions evicted as idle or inactive.
    pub evicted: Vec<Arc<Session>>,
}

/// Heartbeat, dead-node sweep and idle eviction on a fixed interval.
pub struct LivenessScheduler {
    registry: Arc<SessionRegistry>,
    coordinator: Option<Arc<ClusterCoordinator>>,
    session_timeout: Duration,
    interval: Duration,
}

impl LivenessScheduler {
    /// Scheduler over `registry`, with cluster work when `coordinator` is set.
    pub fn new(
        registry: Arc<SessionRegistry>,
        coordinator: Option<Arc<ClusterCoordinator>>,
        session_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            coordinator,
            session_timeout,
            interval,
        }
    }

    /// Tick period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one round of liveness work.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if let Some(coordinator) = self.coordinator.as_ref().filter(|c| !c.is_destroyed()) {
            report.heartbeat_ok = Some(coordinator.heartbeat().await);
            report.timed_out = coordinator.sweep_dead_nodes().await;
        }
        report.evicted = self.registry.sweep_idle(self.session_timeout);
        if !report.evicted.is_empty() {
            info!(evicted = report.evicted.len(), "idle sweep evicted sessions");
        }
        report
    }

    /// Tick until `cancel` fires, handing each tick's evictions to
    /// `on_evicted`. The first tick runs one interval after start.
    pub async fn run<F, Fut>(self, cancel: CancellationToken, mut on_evicted: F)
    where
        F: FnMut(Vec<Arc<Session>>) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX), "liveness scheduler started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if !report.evicted.is_empty() {
                        on_evicted(report.evicted).await;
                    }
                }
            }
        }
        debug!("liveness scheduler stopped");
    }
}
