//! Per-process table of live sessions.
//!
//! Keyed by [`SessionId`]; the per-path view is derived by filtering. All
//! mutations are single-key atomic operations on the underlying `DashMap`,
//! and no shard lock is held while a frame is handed to a transport.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use switchboard_core::{RegistryError, SessionId, TransportError};
use tracing::{debug, error, warn};

use crate::metrics::{IDLE_EVICTIONS_TOTAL, SEND_FAILURES_TOTAL};
use crate::session::Session;

/// Outcome of a [`SessionRegistry::broadcast_local`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the payload was enqueued to.
    pub delivered: usize,
    /// Sessions removed because they were inactive or the send failed.
    pub removed: Vec<SessionId>,
}

/// Concurrent session table for one node.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its own path.
    ///
    /// A duplicate id is a programming error: it is logged and rejected, and
    /// the existing entry is left untouched.
    pub fn add(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(_) => {
                error!(
                    session_id = %session.id(),
                    path = session.path(),
                    "duplicate session id, registration rejected"
                );
                Err(RegistryError::DuplicateSession {
                    session_id: session.id().clone(),
                })
            }
            Entry::Vacant(slot) => {
                debug!(session_id = %session.id(), path = session.path(), "session registered");
                let _ = slot.insert(session);
                Ok(())
            }
        }
    }

    /// Remove and close a session registered on `path`. Idempotent.
    pub fn remove(&self, path: &str, id: &SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove_if(id, |_, s| s.path() == path)?;
        session.close();
        debug!(session_id = %id, path, "session removed");
        Some(session)
    }

    /// Look up a session, only if it is registered on `path`.
    pub fn get(&self, path: &str, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .get(id)
            .filter(|s| s.path() == path)
            .map(|s| Arc::clone(s.value()))
    }

    /// Deliver `payload` to every active session on `path` matching
    /// `predicate`. Sessions that are inactive or whose send fails are
    /// removed; the rest still receive the payload.
    pub fn broadcast_local(
        &self,
        path: &str,
        payload: &str,
        predicate: impl Fn(&Session) -> bool,
    ) -> BroadcastReport {
        // Snapshot first so no shard lock is held during sends.
        let targets: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|e| e.path() == path && predicate(e.value().as_ref()))
            .map(|e| Arc::clone(e.value()))
            .collect();

        let frame: Arc<str> = Arc::from(payload);
        let mut report = BroadcastReport::default();
        for session in targets {
            let result = if session.is_active() {
                session.send(Arc::clone(&frame))
            } else {
                Err(TransportError::Closed)
            };
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    counter!(SEND_FAILURES_TOTAL, "reason" => err.to_string()).increment(1);
                    warn!(
                        session_id = %session.id(),
                        path,
                        error = %err,
                        "broadcast send failed, removing session"
                    );
                    let _ = self.remove(path, session.id());
                    report.removed.push(session.id().clone());
                }
            }
        }
        report
    }

    /// Send to one session on `path`. A failed send removes the session.
    pub fn send_to(&self, path: &str, id: &SessionId, payload: &str) -> bool {
        let Some(session) = self.get(path, id) else {
            return false;
        };
        match session.send(payload) {
            Ok(()) => true,
            Err(err) => {
                counter!(SEND_FAILURES_TOTAL, "reason" => err.to_string()).increment(1);
                warn!(session_id = %id, path, error = %err, "send failed, removing session");
                let _ = self.remove(path, id);
                false
            }
        }
    }

    /// Sessions registered on `path`.
    pub fn count(&self, path: &str) -> usize {
        self.sessions.iter().filter(|e| e.path() == path).count()
    }

    /// Total sessions on this node.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Remove sessions idle longer than `timeout` or no longer active.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<Arc<Session>> {
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|e| !e.is_active() || e.idle_for() > timeout)
            .map(|e| Arc::clone(e.value()))
            .collect();

        stale
            .into_iter()
            .filter_map(|s| {
                let removed = self.remove(s.path(), s.id())?;
                counter!(IDLE_EVICTIONS_TOTAL).increment(1);
                debug!(
                    session_id = %removed.id(),
                    path = removed.path(),
                    idle_ms = u64::try_from(removed.idle_for().as_millis()).unwrap_or(u64::MAX),
                    "evicted idle session"
                );
                Some(removed)
            })
            .collect()
    }

    /// Remove and close every session.
    pub fn close_all(&self) -> Vec<Arc<Session>> {
        self.sessions()
            .into_iter()
            .filter_map(|s| self.remove(s.path(), s.id()))
            .collect()
    }
}
