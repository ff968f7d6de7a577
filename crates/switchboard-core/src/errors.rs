//! Error taxonomy for the session and broadcast layer.
//!
//! - [`TransportError`]: a send or close on a dead connection. Recovered
//!   locally by dropping the registry entry.
//! - [`RegistryError`]: programming-invariant violations in the session table.
//! - [`HandlerError`]: application callback failures, caught at the dispatcher.
//! - [`SessionFault`]: the cause handed to a path handler's `on_error`.
//! - [`AcceptError`]: reasons a connection is never registered.
//!
//! Coordination store failures live in `switchboard-store` as `StoreError`.

use std::time::Duration;

use thiserror::Error;

use crate::ids::SessionId;

/// Failure to hand a frame to the underlying connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection has been closed locally or by the peer.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is full; the frame was dropped.
    #[error("send queue full")]
    QueueFull,
}

/// Session table invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A session with the same id is already registered.
    #[error("session {session_id} already registered")]
    DuplicateSession {
        /// The colliding id.
        session_id: SessionId,
    },
}

/// An application handler invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Failed(String),
    /// The handler panicked; the panic was contained.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// The handler did not complete within the dispatch timeout.
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
            Self::TimedOut(_) => "timed_out",
        }
    }
}

/// Cause delivered to a path handler's `on_error` callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFault {
    /// The underlying connection failed.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// The peer sent something the transport adapter could not accept.
    #[error("protocol: {0}")]
    Protocol(String),
    /// A previous handler invocation on this session failed.
    #[error("handler: {0}")]
    Handler(#[from] HandlerError),
}

/// Reasons a connection is rejected at accept time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcceptError {
    /// No handler is registered for the requested path.
    #[error("no handler registered for path '{0}'")]
    UnknownPath(String),
    /// The handshake authorizer refused the connection.
    #[error("handshake rejected: {0}")]
    Rejected(String),
    /// Registration violated a table invariant.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
