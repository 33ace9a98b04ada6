//! Local cluster demo.
//!
//! Starts three store-backed servers on one in-memory store, then walks
//! through broadcast, client-addressed unicast, and request/reply.
//! Reads `unified.yaml` as the template config when present.
//! Run with `RUST_LOG=info` (or `debug` for per-message traffic).

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use unified_core::{Envelope, FabricError, FabricMessage, Result};
use unified_net::adapter::{build, Backend, ChannelAdapter, ChannelAdapterExt, ReceivedMessage};
use unified_net::config::{self, BackendKind, FabricConfig};
use unified_net::dispatch::{queue_listener, ChannelListener};
use unified_net::store::MemoryStore;

const CONFIG_PATH: &str = "unified.yaml";
const SERVERS: [&str; 3] = ["lobby-1", "lobby-2", "game-1"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatLine {
    from: String,
    text: String,
}

impl FabricMessage for ChatLine {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}

impl FabricMessage for Ping {}

/// Answers every `Ping` with the same sequence number.
struct Pong {
    adapter: Weak<dyn ChannelAdapter>,
}

#[async_trait]
impl ChannelListener for Pong {
    async fn on_message(&self, msg: ReceivedMessage) -> Result<()> {
        let Some(adapter) = self.adapter.upgrade() else {
            return Ok(());
        };
        let ping: Ping = msg.payload()?;
        let answer = msg.envelope.reply(&ping, adapter.server_id())?;
        adapter.reply(&msg, answer).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let template = if Path::new(CONFIG_PATH).exists() {
        config::load_from_file(CONFIG_PATH)?
    } else {
        FabricConfig::for_server(SERVERS[0])
    };
    if template.backend != BackendKind::Store {
        return Err(FabricError::Config("the demo runs on the store backend".into()));
    }

    let store = MemoryStore::new();
    let mut nodes = Vec::new();
    for id in SERVERS {
        let cfg = FabricConfig {
            server_id: id.to_string(),
            ..template.clone()
        };
        let adapter = build(&cfg, Backend::Store(Arc::new(store.client())))?;
        adapter.register_channel("chat").await?;
        adapter.register_channel("notify").await?;
        let (listener, rx) = queue_listener();
        adapter.add_listener("chat", listener.clone());
        adapter.add_listener("notify", listener);
        adapter.connect().await?;
        nodes.push((adapter, rx));
    }

    let game = Arc::clone(&nodes[2].0);
    game.add_listener("rpc", Arc::new(Pong { adapter: Arc::downgrade(&game) }));

    let lobby = Arc::clone(&nodes[0].0);
    tracing::info!(members = ?lobby.server_ids().await?, "cluster up");

    lobby
        .broadcast_msg("chat", &ChatLine { from: "lobby-1".into(), text: "hi".into() })
        .await?;

    let client = Uuid::new_v4();
    nodes[1].0.register_client(client).await?;
    lobby
        .send_msg_to_client("notify", client, &"you have mail".to_string())
        .await?;

    for (adapter, rx) in nodes.iter_mut() {
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            tracing::info!(
                server = %adapter.server_id(),
                channel = %msg.channel,
                source = %msg.source_server,
                client = ?msg.client,
                kind = %msg.envelope.payload_type(),
                "received"
            );
        }
    }

    let req = Envelope::wrap("rpc", &Ping { seq: 7 }, lobby.server_id())?;
    let resp = lobby.request("game-1", req, None).await?;
    let pong: Ping = resp.payload()?;
    tracing::info!(seq = pong.seq, from = %resp.source_server, "request answered");

    tracing::info!(
        clients = lobby.total_client_count().await?,
        on_lobby_2 = ?lobby.clients_on("lobby-2").await?,
        "client view"
    );
    println!("{}", lobby.metrics().render(&[]));

    for (adapter, _) in &nodes {
        adapter.disconnect().await?;
    }
    Ok(())
}
