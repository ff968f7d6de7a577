//! # switchboard-server
//!
//! Session layer and WebSocket front end for one Switchboard node.
//!
//! - **Sessions**: [`Session`] wraps a non-blocking [`Transport`] with id,
//!   path, user and an attribute bag
//! - **Registry**: [`SessionRegistry`], the per-node concurrent session table
//!   with local fan-out and idle sweep
//! - **Dispatch**: [`MessageDispatcher`] routes lifecycle callbacks to one
//!   [`PathHandler`] per path under a timeout, with panics contained
//! - **Cluster**: [`ClusterCoordinator`] keeps node records, routes and the
//!   broadcast subscription in a [`CoordinationStore`](switchboard_store::CoordinationStore),
//!   degrading to local-only when the store fails
//! - **Liveness**: [`LivenessScheduler`] heartbeats, reaps dead peers and
//!   evicts idle sessions
//! - **Hub**: [`Hub`] owns every session's lifecycle and graceful shutdown
//! - **HTTP**: [`SwitchboardServer`] serves `/ws/{*path}`, `/health` and `/metrics`

#![deny(unsafe_code)]

pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod websocket;

pub use broadcast::{BroadcastOutcome, Broadcaster};
pub use cluster::{ClusterCoordinator, CoordinatorConfig};
pub use config::HubConfig;
pub use dispatcher::{HandlerContext, MessageDispatcher, PathHandler};
pub use health::HealthResponse;
pub use hub::Hub;
pub use registry::{BroadcastReport, SessionRegistry};
pub use scheduler::{LivenessScheduler, TickReport};
pub use server::{AppState, ServerError, SwitchboardServer};
pub use session::{ChannelTransport, HandshakeInfo, Outbound, Session, Transport};
pub use shutdown::ShutdownCoordinator;
pub use websocket::handshake::{AnonymousAuthorizer, HandshakeAuthorizer, RequireUserAuthorizer};
