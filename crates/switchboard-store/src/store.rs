//! The coordination store contract.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// A message received on a subscribed channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreMessage {
    /// Concrete channel the message was published on.
    pub channel: String,
    /// Raw message body.
    pub payload: String,
}

/// Stream of messages matching a subscription pattern.
///
/// Dropping the receiver ends the subscription.
pub type Subscription = mpsc::Receiver<StoreMessage>;

/// Shared key/value store with TTLs and pattern pub/sub.
///
/// Any call may fail or hang; callers bound each call with a timeout and
/// treat failures as a signal to degrade, never as fatal.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Write `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Read `key`; `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All live `(key, value)` pairs whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Publish `message` on `channel`.
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to every channel matching the glob `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;
}
