//! In-process coordination store.
//!
//! Clones share state, so several simulated nodes in one process can form a
//! cluster over the same [`MemoryStore`]. Expiry runs on the tokio clock,
//! which lets paused-time tests advance past TTLs deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::glob::glob_match;
use crate::store::{CoordinationStore, StoreMessage, Subscription};

const BUS_CAPACITY: usize = 4096;
const SUBSCRIPTION_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

struct Inner {
    entries: DashMap<String, Entry>,
    bus: broadcast::Sender<StoreMessage>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

/// Shared in-memory store with TTLs, glob pub/sub and fault injection.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty, available store.
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                bus,
                available: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Make every call fail with [`StoreError::Unavailable`] until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it runs.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present and unexpired.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner.entries.get(key).is_some_and(|e| e.is_live(now))
    }

    async fn gate(&self) -> Result<()> {
        let ms = self.inner.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".to_string()))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.gate().await?;
        let _ = self.inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.gate().await?;
        let now = Instant::now();
        let value = self
            .inner
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone());
        if value.is_none() {
            let _ = self.inner.entries.remove_if(key, |_, e| !e.is_live(now));
        }
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.gate().await?;
        let _ = self.inner.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.gate().await?;
        let now = Instant::now();
        self.inner.entries.retain(|_, e| e.is_live(now));
        let mut found: Vec<(String, String)> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect();
        found.sort();
        Ok(found)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.gate().await?;
        // No receivers is not an error: nobody is listening yet.
        let _ = self.inner.bus.send(StoreMessage {
            channel: channel.to_string(),
            payload: message.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        self.gate().await?;
        let mut bus = self.inner.bus.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let pattern = pattern.to_string();

        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    received = bus.recv() => match received {
                        Ok(msg) => {
                            if glob_match(&pattern, &msg.channel) && tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%pattern, skipped, "memory subscription lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(%pattern, "memory subscription ended");
        }));

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_get_expires_after_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(3)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(2_999)).await;
        assert!(store.contains_key("k"));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_refreshes_ttl() {
        let store = MemoryStore::new();
        store.set("k", "1", Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        store.set("k", "2", Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(5)).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_prefix_skips_expired_and_foreign() {
        let store = MemoryStore::new();
        store.set("sb:node:a", "A", Duration::from_secs(10)).await.unwrap();
        store.set("sb:node:b", "B", Duration::from_secs(1)).await.unwrap();
        store.set("sb:route:/x:s", "a", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let found = store.scan_prefix("sb:node:").await.unwrap();
        assert_eq!(found, vec![("sb:node:a".to_string(), "A".to_string())]);
    }

    #[tokio::test]
    async fn subscribe_filters_by_pattern() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("sb:broadcast:*").await.unwrap();

        store.publish("sb:control", "ignored").await.unwrap();
        store.publish("sb:broadcast:/chat", "hello").await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "sb:broadcast:/chat");
        assert_eq!(msg.payload, "hello");
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        let mut sub = b.subscribe("*").await.unwrap();
        a.set("k", "v", Duration::from_secs(5)).await.unwrap();
        a.publish("c", "m").await.unwrap();
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(sub.recv().await.unwrap().payload, "m");
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.set("k", "v", Duration::from_secs(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get("k").await.is_err());
        assert!(store.scan_prefix("").await.is_err());
        assert!(store.publish("c", "m").await.is_err());
        assert!(store.subscribe("*").await.is_err());

        store.set_available(true);
        assert!(store.set("k", "v", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_calls() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_secs(5));
        let started = Instant::now();
        store.delete("k").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
