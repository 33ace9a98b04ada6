//! Proxy broker contract and the proxy-native adapter.
//!
//! The broker is the edge proxy's plugin-messaging surface as seen from one
//! backend server: named physical channels plus the proxy's own view of
//! players. `LocalProxy` implements it in-process.

pub mod adapter;
pub mod local;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use unified_core::error::{ClientId, Result};

pub use adapter::ProxyAdapter;
pub use local::LocalProxy;

#[async_trait]
pub trait ProxyBroker: Send + Sync {
    /// Open `channel` for `server`; frames addressed to it arrive on the
    /// returned receiver.
    async fn register_channel(&self, server: &str, channel: &str) -> Result<mpsc::Receiver<Bytes>>;
    async fn unregister_channel(&self, server: &str, channel: &str) -> Result<()>;

    /// Deliver to every server with `channel` open except `from`. Returns
    /// how many received it.
    async fn send_to_all(&self, from: &str, channel: &str, data: Bytes) -> Result<usize>;
    /// False when `server` is unknown or has not opened `channel`.
    async fn send_to_server(&self, server: &str, channel: &str, data: Bytes) -> Result<bool>;
    /// Deliver through the connection of `client`'s current server.
    async fn send_to_player(&self, client: ClientId, channel: &str, data: Bytes) -> Result<bool>;
    /// Hand a frame to the proxy itself (queries).
    async fn send_to_proxy(&self, from: &str, channel: &str, data: Bytes) -> Result<()>;

    async fn get_player_server(&self, client: ClientId) -> Result<Option<String>>;
    /// Move `client` to `server`. False when the server is unknown.
    async fn connect_player(&self, client: ClientId, server: &str) -> Result<bool>;
    /// False when the client is not connected.
    async fn kick_player(&self, client: ClientId, reason: &str) -> Result<bool>;
    async fn get_total_player_count(&self) -> Result<u32>;
    async fn get_players_on(&self, server: &str) -> Result<Vec<ClientId>>;
}
