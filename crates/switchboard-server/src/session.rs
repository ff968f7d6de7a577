//! Live client connections.
//!
//! A [`Session`] pairs one bidirectional text connection ([`Transport`]) with
//! its identity and metadata. Transports are non-blocking: `send` enqueues and
//! returns immediately so a slow peer never stalls the caller.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use switchboard_core::{NodeId, SessionId, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The underlying network connection as seen by the registry.
pub trait Transport: Send + Sync {
    /// Whether frames can still be sent.
    fn is_active(&self) -> bool;

    /// Enqueue a text frame. Fails if the connection is closed or its
    /// outbound queue is full.
    fn send(&self, text: Arc<str>) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// Receiving half of a [`ChannelTransport`], owned by the connection's writer.
pub struct Outbound {
    /// Queued frames in send order.
    pub rx: mpsc::Receiver<Arc<str>>,
    /// Cancelled when the transport is closed from either side.
    pub closed: CancellationToken,
}

impl Outbound {
    /// Next queued frame, or `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            () = self.closed.cancelled() => None,
        }
    }
}

/// Transport backed by a bounded mpsc queue drained by a writer task.
pub struct ChannelTransport {
    tx: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
    dropped: AtomicU64,
}

impl ChannelTransport {
    /// New transport with room for `capacity` queued frames.
    pub fn new(capacity: usize) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let transport = Self {
            tx,
            closed: closed.clone(),
            dropped: AtomicU64::new(0),
        };
        (transport, Outbound { rx, closed })
    }

    /// Frames refused because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for ChannelTransport {
    fn is_active(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    fn send(&self, text: Arc<str>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                self.closed.cancel();
                Err(TransportError::Closed)
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// What the handshake established about a connecting client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Peer address, when the listener exposes it.
    pub remote_addr: Option<SocketAddr>,
    /// Authenticated user, if any.
    pub user_id: Option<String>,
}

impl HandshakeInfo {
    /// Anonymous handshake with no known peer address.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Set the authenticated user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// One registered client connection.
pub struct Session {
    id: SessionId,
    path: String,
    owner: NodeId,
    handshake: HandshakeInfo,
    attributes: RwLock<HashMap<String, Value>>,
    created_at: Instant,
    last_active: Mutex<Instant>,
    finished: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl Session {
    /// A new session with a fresh id, owned by `owner`.
    pub fn new(
        path: impl Into<String>,
        owner: NodeId,
        handshake: HandshakeInfo,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_id(SessionId::new(), path, owner, handshake, transport)
    }

    /// A new session with a caller-chosen id.
    pub fn with_id(
        id: SessionId,
        path: impl Into<String>,
        owner: NodeId,
        handshake: HandshakeInfo,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            path: path.into(),
            owner,
            handshake,
            attributes: RwLock::new(HashMap::new()),
            created_at: now,
            last_active: Mutex::new(now),
            finished: AtomicBool::new(false),
            transport,
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Logical path the session connected to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Node holding the connection.
    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    /// Peer address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.handshake.remote_addr
    }

    /// Authenticated user, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.handshake.user_id.as_deref()
    }

    /// Read an attribute.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.write().insert(key.into(), value)
    }

    /// Remove an attribute.
    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.write().remove(key)
    }

    /// Time since the session was accepted.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Record a successful transfer.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Time since the last successful transfer.
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Whether the underlying connection can still carry frames.
    pub fn is_active(&self) -> bool {
        self.transport.is_active()
    }

    /// Send a text frame; refreshes `last_active` on success.
    pub fn send(&self, text: impl Into<Arc<str>>) -> Result<(), TransportError> {
        self.transport.send(text.into())?;
        self.touch();
        Ok(())
    }

    /// Close the underlying connection.
    pub fn close(&self) {
        self.transport.close();
    }

    /// Claim the one-time close notification. Returns `true` exactly once.
    pub(crate) fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("user_id", &self.handshake.user_id)
            .finish_non_exhaustive()
    }
}
