//! # switchboard-core
//!
//! Foundation types shared by every Switchboard crate:
//!
//! - **Branded IDs**: `SessionId`, `NodeId` as newtypes for type safety
//! - **Errors**: transport, registry, handler and accept failures via `thiserror`
//! - **Cluster wire types**: `BroadcastEnvelope`, `NodeRecord`, `ControlMessage`, `ClusterEvent`
//! - **Logging**: `tracing` subscriber bootstrap and in-memory capture for tests

#![deny(unsafe_code)]

pub mod cluster;
pub mod errors;
pub mod ids;
pub mod logging;

pub use cluster::{BroadcastEnvelope, ClusterEvent, ControlMessage, NodeRecord, now_ms};
pub use errors::{AcceptError, HandlerError, RegistryError, SessionFault, TransportError};
pub use ids::{NodeId, SessionId};
