//! Shared state store adapter.
//!
//! Every instance in the fleet shares one store holding the waiting queue,
//! the pair map, ban state and report logs, plus a publish/subscribe bus for
//! cross-instance delivery. [`RedisStore`] is the production adapter;
//! [`MemoryStore`] is a single-process implementation used by the test suite
//! and for running a standalone instance without Redis at hand.
//!
//! The adapter is deliberately thin: one store command per method, no
//! multi-key transactions. Correctness under racing instances comes from the
//! atomicity of the single commands (destructive LPOP, multi-field HSET and
//! HDEL) — see the queue and pair managers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};

/// A message received on a subscribed bus channel.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // Ordered lists (queue, report logs)
    async fn list_push(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>>;
    /// Remove every occurrence of `value`. Returns how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> StoreResult<u64>;
    async fn list_len(&self, key: &str) -> StoreResult<u64>;
    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>>;

    // Hashes (pair map, session records, ban metadata)
    /// Set all given fields in one atomic update.
    async fn hash_set_multi(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<()>;
    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    /// Delete all given fields in one atomic update.
    async fn hash_del_multi(&self, key: &str, fields: &[&str]) -> StoreResult<()>;
    async fn hash_exists(&self, key: &str, field: &str) -> StoreResult<bool>;
    async fn hash_len(&self, key: &str) -> StoreResult<u64>;
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    // Sets (banned IPs)
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    // Keys
    async fn expire(&self, key: &str, secs: u64) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;

    // Pub/sub bus
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    /// Subscribe to the given channels. Messages arrive on the returned
    /// receiver until it is dropped.
    async fn subscribe(&self, channels: &[&str]) -> StoreResult<mpsc::Receiver<BusMessage>>;

    /// Liveness probe for /healthz.
    async fn ping(&self) -> StoreResult<()>;
}

// ── Redis ──────────────────────────────────────────────────────────────

pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to the store. The connection manager reconnects and retries
    /// transparently, so transient store hiccups surface (at worst) as a
    /// failed individual operation.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn list_push(&self, key: &str, value: &str) -> StoreResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: u64 = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let popped: Option<String> = conn.lpop(key, None).await?;
        Ok(popped)
    }

    async fn list_remove(&self, key: &str, value: &str) -> StoreResult<u64> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let removed: u64 = conn.lrem(key, 0, value).await?;
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(items)
    }

    async fn hash_set_multi(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hash_del_multi(&self, key: &str, fields: &[&str]) -> StoreResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: u64 = conn.hdel(key, fields).await?;
        Ok(())
    }

    async fn hash_exists(&self, key: &str, field: &str) -> StoreResult<bool> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let exists: bool = conn.hexists(key, field).await?;
        Ok(exists)
    }

    async fn hash_len(&self, key: &str) -> StoreResult<u64> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let len: u64 = conn.hlen(key).await?;
        Ok(len)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: u64 = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: u64 = conn.srem(key, member).await?;
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let member_of: bool = conn.sismember(key, member).await?;
        Ok(member_of)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn expire(&self, key: &str, secs: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: u64 = conn.del(key).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: u64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(1024);
        let client = self.client.clone();
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();

        // Pub/sub needs its own connection; keep it alive with a
        // reconnect-and-resubscribe loop. Messages published while the
        // subscriber is down are lost, which the design tolerates: delivery
        // is best-effort and ban caches re-load on the next mutation.
        tokio::spawn(async move {
            loop {
                match pump_pubsub(&client, &channels, &tx).await {
                    Ok(()) => break, // receiver dropped
                    Err(e) => {
                        tracing::warn!("Bus subscription lost, reconnecting: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

/// Pump bus messages into `tx` until the receiver is dropped (Ok) or the
/// subscription connection dies (Err).
async fn pump_pubsub(
    client: &redis::Client,
    channels: &[String],
    tx: &mpsc::Sender<BusMessage>,
) -> Result<(), redis::RedisError> {
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    for channel in channels {
        pubsub.subscribe(channel).await?;
    }
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%channel, "Undecodable bus payload: {e}");
                continue;
            }
        };
        if tx.send(BusMessage { channel, payload }).await.is_err() {
            return Ok(());
        }
    }
    Err(redis::RedisError::from(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "pubsub stream ended",
    )))
}

// ── In-process store ───────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    expiries: HashMap<String, Instant>,
}

impl MemoryInner {
    /// Drop a key whose TTL has passed. Expiry is checked lazily on access,
    /// which is all the report-log TTL needs.
    fn purge_expired(&mut self, key: &str) {
        if self.expiries.get(key).is_some_and(|at| *at <= Instant::now()) {
            self.expiries.remove(key);
            self.lists.remove(key);
            self.hashes.remove(key);
            self.sets.remove(key);
        }
    }
}

/// Single-process [`Store`] with the same observable semantics as Redis.
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryInner>,
    bus: broadcast::Sender<BusMessage>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            inner: parking_lot::Mutex::new(MemoryInner::default()),
            bus,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_push(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.lists.get_mut(key).and_then(|l| l.pop_front()))
    }

    async fn list_remove(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok((before - list.len()) as u64)
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_set_multi(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hash_del_multi(&self, key: &str, fields: &[&str]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        if let Some(hash) = inner.hashes.get_mut(key) {
            for field in fields {
                hash.remove(*field);
            }
        }
        Ok(())
    }

    async fn hash_exists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.hashes.get(key).is_some_and(|h| h.contains_key(field)))
    }

    async fn hash_len(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.hashes.get(key).map_or(0, |h| h.len() as u64))
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired(key);
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, secs: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner
            .expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(secs));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.expiries.remove(key);
        inner.lists.remove(key);
        inner.hashes.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        // No subscribers is fine; broadcast returns Err only then.
        let _ = self.bus.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(1024);
        let mut bus_rx = self.bus.subscribe();
        let wanted: HashSet<String> = channels.iter().map(|c| c.to_string()).collect();
        tokio::spawn(async move {
            loop {
                let msg = match bus_rx.recv().await {
                    Ok(msg) => msg,
                    // Dropped messages match the lossy pub/sub contract.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !wanted.contains(&msg.channel) {
                    continue;
                }
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_is_fifo_and_remove_takes_all_occurrences() {
        let store = MemoryStore::new();
        store.list_push("q", "a").await.unwrap();
        store.list_push("q", "b").await.unwrap();
        store.list_push("q", "a").await.unwrap();
        assert_eq!(store.list_len("q").await.unwrap(), 3);

        assert_eq!(store.list_remove("q", "a").await.unwrap(), 2);
        assert_eq!(store.list_pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.list_pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_multi_set_and_multi_del() {
        let store = MemoryStore::new();
        store
            .hash_set_multi("pairs", &[("A", "B"), ("B", "A")])
            .await
            .unwrap();
        assert_eq!(store.hash_get("pairs", "A").await.unwrap().as_deref(), Some("B"));
        assert_eq!(store.hash_len("pairs").await.unwrap(), 2);

        store.hash_del_multi("pairs", &["A", "B"]).await.unwrap();
        assert_eq!(store.hash_get("pairs", "A").await.unwrap(), None);
        assert!(!store.hash_exists("pairs", "B").await.unwrap());
    }

    #[tokio::test]
    async fn expired_key_reads_as_empty() {
        let store = MemoryStore::new();
        store.list_push("reports:1.2.3.4", "r1").await.unwrap();
        store.expire("reports:1.2.3.4", 0).await.unwrap();
        assert_eq!(store.list_len("reports:1.2.3.4").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bus_delivers_only_subscribed_channels() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe(&["bans"]).await.unwrap();
        store.publish("deliver", "not for us").await.unwrap();
        store.publish("bans", "for us").await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "bans");
        assert_eq!(msg.payload, "for us");
    }
}
