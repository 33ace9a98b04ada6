//! Heartbeat-based cluster membership over the shared store.
//!
//! There is no coordinator. Every member writes its own heartbeat and any
//! member may evict a peer whose heartbeat is older than the timeout.
//! Eviction is a plain field removal, so two members evicting the same peer
//! is harmless. A live member evicted by a race re-appears on its next beat.

use std::collections::HashMap;
use std::sync::Arc;

use unified_core::error::Result;

use super::{Keys, Store};

pub const FIELD_ONLINE: &str = "online";
pub const FIELD_LAST_HEARTBEAT: &str = "lastHeartbeat";
pub const FIELD_PLAYERS: &str = "players";

/// Ids in `entries` (id -> last heartbeat millis) that are past `timeout_ms`
/// at `now`. Unparseable heartbeats count as stale; `self_id` never does.
pub fn stale_members(
    entries: &HashMap<String, String>,
    now: u64,
    timeout_ms: u64,
    self_id: &str,
) -> Vec<String> {
    let mut stale: Vec<String> = entries
        .iter()
        .filter(|(id, _)| id.as_str() != self_id)
        .filter(|(_, hb)| match hb.parse::<u64>() {
            Ok(hb) => now.saturating_sub(hb) > timeout_ms,
            Err(_) => true,
        })
        .map(|(id, _)| id.clone())
        .collect();
    stale.sort();
    stale
}

/// One server's view of, and participation in, the membership set.
pub struct Membership {
    store: Arc<dyn Store>,
    keys: Keys,
    server_id: Arc<str>,
    timeout_ms: u64,
}

impl Membership {
    pub fn new(store: Arc<dyn Store>, keys: Keys, server_id: Arc<str>, timeout_ms: u64) -> Self {
        Self {
            store,
            keys,
            server_id,
            timeout_ms,
        }
    }

    /// Self-registration with zero clients.
    pub async fn register(&self, now: u64) -> Result<()> {
        self.beat(now, 0).await
    }

    /// Refresh the detail record and the membership entry.
    pub async fn beat(&self, now: u64, players: u32) -> Result<()> {
        let detail = HashMap::from([
            (FIELD_ONLINE.to_string(), "true".to_string()),
            (FIELD_LAST_HEARTBEAT.to_string(), now.to_string()),
            (FIELD_PLAYERS.to_string(), players.to_string()),
        ]);
        self.store
            .hash_set_all(&self.keys.server(&self.server_id), detail)
            .await?;
        self.store
            .hash_set(&self.keys.servers(), &self.server_id, &now.to_string())
            .await
    }

    /// Clients whose location entry points at this server.
    pub async fn owned_clients(&self) -> Result<u32> {
        let players = self.store.hash_get_all(&self.keys.players()).await?;
        let owned = players
            .values()
            .filter(|owner| owner.as_str() == &*self.server_id)
            .count();
        Ok(u32::try_from(owned).unwrap_or(u32::MAX))
    }

    /// Evict stale peers. Returns the ids this call actually removed.
    pub async fn sweep(&self, now: u64) -> Result<Vec<String>> {
        let entries = self.store.hash_get_all(&self.keys.servers()).await?;
        let mut evicted = Vec::new();
        for id in stale_members(&entries, now, self.timeout_ms, &self.server_id) {
            if self.store.hash_remove(&self.keys.servers(), &id).await? {
                self.store.delete(&self.keys.server(&id)).await?;
                evicted.push(id);
            }
        }
        Ok(evicted)
    }

    pub async fn deregister(&self) -> Result<()> {
        self.store
            .hash_remove(&self.keys.servers(), &self.server_id)
            .await?;
        self.store.delete(&self.keys.server(&self.server_id)).await?;
        Ok(())
    }

    pub async fn members(&self) -> Result<Vec<String>> {
        let mut ids = self.store.hash_keys(&self.keys.servers()).await?;
        ids.sort();
        Ok(ids)
    }

    pub async fn is_member(&self, id: &str) -> Result<bool> {
        Ok(self
            .store
            .hash_get(&self.keys.servers(), id)
            .await?
            .is_some())
    }
}
