//! In-process store.
//!
//! `MemoryStore` plays the shared server; each `MemoryStoreClient` is one
//! connection to it with its own connected flag and subscriptions, the way
//! separate cluster members each hold their own store connection.
//!
//! Semantics:
//! - once `subscribe()` returns, later publishes on that topic are delivered
//! - a publisher that is itself subscribed receives its own message
//! - delivery never blocks the publisher; a full subscriber queue drops the
//!   message with a warning
//! - removing the last field of a hash removes the hash

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use unified_core::error::{FabricError, Result};

use super::{Store, Subscription};

const SUBSCRIBER_QUEUE: usize = 1024;

struct Subscriber {
    client: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    hashes: DashMap<String, BTreeMap<String, String>>,
    topics: DashMap<String, Vec<Subscriber>>,
    unreachable: AtomicBool,
    next_client: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new connection.
    pub fn client(self: &Arc<Self>) -> MemoryStoreClient {
        MemoryStoreClient {
            server: Arc::clone(self),
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call from every client fails with
    /// `Transport` until reachability is restored.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::Release);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::Acquire) {
            Err(FabricError::Transport("store unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn drop_subscriptions(&self, client: u64, topic: Option<&str>) {
        let topics: Vec<String> = match topic {
            Some(t) => vec![t.to_string()],
            None => self.topics.iter().map(|e| e.key().clone()).collect(),
        };
        for t in topics {
            let now_empty = match self.topics.get_mut(&t) {
                Some(mut subs) => {
                    subs.retain(|s| s.client != client);
                    subs.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.topics.remove_if(&t, |_, subs| subs.is_empty());
            }
        }
    }
}

pub struct MemoryStoreClient {
    server: Arc<MemoryStore>,
    id: u64,
    connected: AtomicBool,
}

impl MemoryStoreClient {
    fn ready(&self) -> Result<&MemoryStore> {
        self.server.check_reachable()?;
        if !self.connected.load(Ordering::Acquire) {
            return Err(FabricError::Transport("store connection not open".into()));
        }
        Ok(self.server.as_ref())
    }
}

#[async_trait]
impl Store for MemoryStoreClient {
    async fn connect(&self) -> Result<()> {
        self.server.check_reachable()?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.server.drop_subscriptions(self.id, None);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<usize> {
        let server = self.ready()?;
        let Some(mut subs) = server.topics.get_mut(topic) else {
            return Ok(0);
        };
        let mut delivered = 0;
        subs.retain(|s| match s.tx.try_send(message.to_string()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(topic = %topic, "subscriber queue full; message dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let server = self.ready()?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        server
            .topics
            .entry(topic.to_string())
            .or_insert_with(Vec::new)
            .push(Subscriber { client: self.id, tx });
        Ok(Subscription { topic: topic.to_string(), rx })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let server = self.ready()?;
        server.drop_subscriptions(self.id, Some(topic));
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let server = self.ready()?;
        Ok(server.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let server = self.ready()?;
        server
            .hashes
            .entry(key.to_string())
            .or_insert_with(BTreeMap::new)
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_set_all(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        let server = self.ready()?;
        if fields.is_empty() {
            return Ok(());
        }
        server
            .hashes
            .entry(key.to_string())
            .or_insert_with(BTreeMap::new)
            .extend(fields);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let server = self.ready()?;
        Ok(server
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>> {
        let server = self.ready()?;
        Ok(server
            .hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_remove(&self, key: &str, field: &str) -> Result<bool> {
        let server = self.ready()?;
        let (removed, now_empty) = match server.hashes.get_mut(key) {
            Some(mut h) => (h.remove(field).is_some(), h.is_empty()),
            None => (false, false),
        };
        if now_empty {
            server.hashes.remove_if(key, |_, h| h.is_empty());
        }
        Ok(removed)
    }

    async fn hash_size(&self, key: &str) -> Result<usize> {
        let server = self.ready()?;
        Ok(server.hashes.get(key).map(|h| h.len()).unwrap_or(0))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let server = self.ready()?;
        Ok(server.hashes.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(store: &Arc<MemoryStore>) -> MemoryStoreClient {
        let c = store.client();
        c.connect().await.unwrap();
        c
    }

    #[tokio::test]
    async fn pubsub_reaches_every_subscriber_including_publisher() {
        let store = MemoryStore::new();
        let a = connected(&store).await;
        let b = connected(&store).await;

        let mut sa = a.subscribe("t").await.unwrap();
        let mut sb = b.subscribe("t").await.unwrap();

        assert_eq!(a.publish("t", "hello").await.unwrap(), 2);
        assert_eq!(sa.rx.recv().await.unwrap(), "hello");
        assert_eq!(sb.rx.recv().await.unwrap(), "hello");
        assert_eq!(a.publish("other", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_and_disconnect_close_subscriptions() {
        let store = MemoryStore::new();
        let a = connected(&store).await;
        let mut s1 = a.subscribe("t1").await.unwrap();
        let mut s2 = a.subscribe("t2").await.unwrap();

        a.unsubscribe("t1").await.unwrap();
        assert!(s1.rx.recv().await.is_none());
        assert_eq!(store.subscriber_count("t1"), 0);

        a.disconnect().await.unwrap();
        assert!(s2.rx.recv().await.is_none());
        assert_eq!(store.subscriber_count("t2"), 0);
    }

    #[tokio::test]
    async fn hashes() {
        let store = MemoryStore::new();
        let a = connected(&store).await;
        let b = connected(&store).await;

        a.hash_set("h", "x", "1").await.unwrap();
        a.hash_set_all("h", HashMap::from([("y".to_string(), "2".to_string())])).await.unwrap();
        assert_eq!(b.hash_get("h", "x").await.unwrap().as_deref(), Some("1"));
        assert_eq!(b.hash_size("h").await.unwrap(), 2);
        assert_eq!(b.hash_keys("h").await.unwrap(), vec!["x", "y"]);

        assert!(b.hash_remove("h", "x").await.unwrap());
        assert!(!b.hash_remove("h", "x").await.unwrap());
        assert!(b.hash_remove("h", "y").await.unwrap());
        assert!(b.hash_get_all("h").await.unwrap().is_empty());
        assert!(!a.delete("h").await.unwrap(), "last field removal dropped the key");
    }

    #[tokio::test]
    async fn unreachable_or_closed_is_transport_error() {
        let store = MemoryStore::new();
        let a = store.client();
        let err = a.hash_get("h", "x").await.unwrap_err();
        assert_eq!(err.kind().as_str(), "TRANSPORT");

        store.set_reachable(false);
        assert_eq!(a.connect().await.unwrap_err().kind().as_str(), "TRANSPORT");
        store.set_reachable(true);
        a.connect().await.unwrap();
        assert!(a.hash_get("h", "x").await.unwrap().is_none());
    }
}
