//! # switchboard-store
//!
//! The coordination store is the only transport between cluster nodes. This
//! crate defines the contract ([`CoordinationStore`]) and ships two backends:
//!
//! - [`MemoryStore`]: in-process, shareable between simulated nodes, with TTL
//!   expiry on the tokio clock and switchable fault injection.
//! - [`RedisStore`]: Redis keys with `PX` expiry, `SCAN` for prefix listing,
//!   and `PSUBSCRIBE` subscriptions that reconnect with jittered backoff.
//!
//! [`KeySpace`] owns the key and channel layout so both backends agree.

#![deny(unsafe_code)]

pub mod backoff;
pub mod error;
pub mod glob;
pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{Result, StoreError};
pub use keys::KeySpace;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{CoordinationStore, StoreMessage, Subscription};
