//! Redis-backed coordination store.
//!
//! Key/value calls share one multiplexed connection. Each subscription owns
//! a dedicated pub/sub connection driven by a background task that
//! re-establishes `PSUBSCRIBE` with jittered backoff whenever the stream
//! ends. Messages published while a subscription is reconnecting are lost.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::{Result, StoreError};
use crate::glob;
use crate::store::{CoordinationStore, StoreMessage, Subscription};

const SCAN_COUNT: usize = 200;
const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Coordination store on a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to `url` (`redis://[:password@]host:port[/db]`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        info!(url = %redact(url), "connected to coordination store");
        Ok(Self { client, conn })
    }
}

/// Hide credentials embedded in a store URL.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

async fn open_pubsub(client: &redis::Client, pattern: &str) -> Result<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(pattern).await?;
    Ok(pubsub)
}

/// Forward messages until the stream ends (`Err`) or the receiver is gone (`Ok`).
async fn pump(pubsub: PubSub, tx: &mpsc::Sender<StoreMessage>) -> Result<()> {
    let mut stream = pubsub.into_on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload = match msg.get_payload::<String>() {
            Ok(p) => p,
            Err(err) => {
                warn!(%channel, error = %err, "non-text pub/sub payload, skipping");
                continue;
            }
        };
        if tx.send(StoreMessage { channel, payload }).await.is_err() {
            return Ok(());
        }
    }
    Err(StoreError::Unavailable("pub/sub stream ended".to_string()))
}

async fn run_subscription(
    client: redis::Client,
    pattern: String,
    first: PubSub,
    tx: mpsc::Sender<StoreMessage>,
) {
    let mut backoff = ExponentialBackoff::default();
    let mut next = Some(first);

    loop {
        let pubsub = match next.take() {
            Some(p) => p,
            None => match open_pubsub(&client, &pattern).await {
                Ok(p) => {
                    info!(%pattern, "pub/sub subscription re-established");
                    backoff.reset();
                    p
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(%pattern, error = %err, retry_in = ?delay, "pub/sub reconnect failed");
                    tokio::select! {
                        () = tx.closed() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };

        let outcome = tokio::select! {
            () = tx.closed() => Ok(()),
            result = pump(pubsub, &tx) => result,
        };
        match outcome {
            Ok(()) => break,
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(%pattern, error = %err, retry_in = ?delay, "pub/sub connection lost");
                tokio::select! {
                    () = tx.closed() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!(%pattern, "pub/sub subscription closed");
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", glob::escape(prefix));
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let first = open_pubsub(&self.client, pattern).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        drop(tokio::spawn(run_subscription(
            self.client.clone(),
            pattern.to_string(),
            first,
            tx,
        )));
        debug!(%pattern, "pub/sub subscription opened");
        Ok(rx)
    }
}
