//! In-process proxy broker.
//!
//! Routes frames between registered backend endpoints and answers the
//! server-list and player-count query frames the way the proxy plugin does.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use unified_core::error::{ClientId, FabricError, Result};
use unified_core::protocol::frame::Frame;

use super::ProxyBroker;

const ENDPOINT_QUEUE: usize = 1024;

type EndpointKey = (String, String);

#[derive(Default)]
pub struct LocalProxy {
    /// (server, channel) -> inbound queue
    endpoints: DashMap<EndpointKey, mpsc::Sender<Bytes>>,
    /// client -> server
    players: DashMap<ClientId, String>,
    unreachable: AtomicBool,
}

impl LocalProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the proxy going away: every call fails with `Transport`.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::Release);
    }

    /// Inject raw bytes on `server`'s endpoint, bypassing framing.
    pub fn inject(&self, server: &str, channel: &str, data: Bytes) -> bool {
        self.deliver(server, channel, data)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::Acquire) {
            Err(FabricError::Transport("proxy unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn known_servers(&self) -> BTreeSet<String> {
        self.endpoints.iter().map(|e| e.key().0.clone()).collect()
    }

    fn deliver(&self, server: &str, channel: &str, data: Bytes) -> bool {
        let key = (server.to_string(), channel.to_string());
        let Some(tx) = self.endpoints.get(&key).map(|t| t.clone()) else {
            return false;
        };
        match tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(server = %server, channel = %channel, "endpoint queue full; frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.endpoints.remove(&key);
                false
            }
        }
    }

    fn player_count(&self, server: &str) -> u32 {
        self.players.iter().filter(|p| p.value() == server).count() as u32
    }

    fn answer(&self, from: &str, channel: &str, frame: Frame) -> Result<()> {
        let reply = match frame {
            Frame::ServerListRequest { .. } => Frame::ServerListResponse {
                servers: self.known_servers().into_iter().collect(),
            },
            Frame::PlayerCountRequest { server, .. } => Frame::PlayerCountResponse {
                count: self.player_count(&server),
                server,
            },
            other => {
                debug!(from = %from, kind = ?other.kind(), "proxy ignores frame kind");
                return Ok(());
            }
        };
        if !self.deliver(from, channel, reply.encode()?) {
            debug!(from = %from, "query reply undeliverable");
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyBroker for LocalProxy {
    async fn register_channel(&self, server: &str, channel: &str) -> Result<mpsc::Receiver<Bytes>> {
        self.check_reachable()?;
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE);
        self.endpoints
            .insert((server.to_string(), channel.to_string()), tx);
        debug!(server = %server, channel = %channel, "endpoint registered");
        Ok(rx)
    }

    async fn unregister_channel(&self, server: &str, channel: &str) -> Result<()> {
        self.check_reachable()?;
        self.endpoints
            .remove(&(server.to_string(), channel.to_string()));
        Ok(())
    }

    async fn send_to_all(&self, from: &str, channel: &str, data: Bytes) -> Result<usize> {
        self.check_reachable()?;
        let targets: Vec<String> = self
            .endpoints
            .iter()
            .filter(|e| e.key().1 == channel && e.key().0 != from)
            .map(|e| e.key().0.clone())
            .collect();
        Ok(targets
            .iter()
            .filter(|server| self.deliver(server, channel, data.clone()))
            .count())
    }

    async fn send_to_server(&self, server: &str, channel: &str, data: Bytes) -> Result<bool> {
        self.check_reachable()?;
        Ok(self.deliver(server, channel, data))
    }

    async fn send_to_player(&self, client: ClientId, channel: &str, data: Bytes) -> Result<bool> {
        self.check_reachable()?;
        let Some(server) = self.players.get(&client).map(|s| s.clone()) else {
            return Ok(false);
        };
        Ok(self.deliver(&server, channel, data))
    }

    async fn send_to_proxy(&self, from: &str, channel: &str, data: Bytes) -> Result<()> {
        self.check_reachable()?;
        match Frame::decode(data) {
            Ok(frame) => self.answer(from, channel, frame),
            Err(e) => {
                warn!(from = %from, error = %e, "proxy dropped malformed frame");
                Ok(())
            }
        }
    }

    async fn get_player_server(&self, client: ClientId) -> Result<Option<String>> {
        self.check_reachable()?;
        Ok(self.players.get(&client).map(|s| s.clone()))
    }

    async fn connect_player(&self, client: ClientId, server: &str) -> Result<bool> {
        self.check_reachable()?;
        if !self.known_servers().contains(server) {
            return Ok(false);
        }
        self.players.insert(client, server.to_string());
        info!(client = %client, server = %server, "player connected");
        Ok(true)
    }

    async fn kick_player(&self, client: ClientId, reason: &str) -> Result<bool> {
        self.check_reachable()?;
        let kicked = self.players.remove(&client).is_some();
        if kicked {
            info!(client = %client, reason = %reason, "player kicked");
        }
        Ok(kicked)
    }

    async fn get_total_player_count(&self) -> Result<u32> {
        self.check_reachable()?;
        Ok(self.players.len() as u32)
    }

    async fn get_players_on(&self, server: &str) -> Result<Vec<ClientId>> {
        self.check_reachable()?;
        let mut clients: Vec<ClientId> = self
            .players
            .iter()
            .filter(|p| p.value() == server)
            .map(|p| *p.key())
            .collect();
        clients.sort();
        Ok(clients)
    }
}
