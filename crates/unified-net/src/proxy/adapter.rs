//! Channel adapter over the proxy's forwarding channel.
//!
//! All traffic shares one physical channel (`proxy_channel`). Outbound
//! envelopes travel as JSON inside Forward / ForwardToClient frames;
//! server-list and player-count queries go to the proxy as request frames
//! and come back as response frames that resolve the oldest waiter with the
//! same key.
//!
//! The proxy owns player locations, so client registration is a no-op here
//! and transfer/kick call the broker directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use unified_core::error::{ClientId, FabricError, Result};
use unified_core::protocol::frame::{Frame, BROADCAST_TARGET};
use unified_core::Envelope;

use crate::adapter::{ChannelAdapter, ReceivedMessage, CLIENT_META_KEY};
use crate::config::{BackendKind, FabricConfig};
use crate::correlation::Reply;
use crate::dispatch::ChannelListener;
use crate::node::NodeCore;
use crate::obs::FabricMetrics;

use super::ProxyBroker;

const SERVERS_KEY: &str = "servers:";

fn player_count_key(server: &str) -> String {
    format!("playercount:{server}")
}

pub struct ProxyAdapter {
    node: Arc<NodeCore>,
    broker: Arc<dyn ProxyBroker>,
    physical: String,
    /// Serializes connect/disconnect; holds the receive task.
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyAdapter {
    pub fn new(cfg: &FabricConfig, broker: Arc<dyn ProxyBroker>) -> Self {
        Self {
            node: Arc::new(NodeCore::new(cfg.server_id.as_str(), cfg.request_timeout())),
            broker,
            physical: cfg.proxy_channel.clone(),
            lifecycle: Mutex::new(None),
        }
    }

    async fn forward(&self, target: &str, envelope: &Envelope) -> Result<bool> {
        let frame = Frame::Forward {
            target: target.to_string(),
            channel: envelope.channel().to_string(),
            source: self.node.server_id().to_string(),
            payload: envelope.to_json()?,
        }
        .encode()?;
        if target == BROADCAST_TARGET {
            let n = self
                .broker
                .send_to_all(self.node.server_id(), &self.physical, frame)
                .await?;
            Ok(n > 0)
        } else {
            self.broker.send_to_server(target, &self.physical, frame).await
        }
    }

    async fn query(&self, key: String, frame: Frame) -> Result<Reply> {
        self.node.ensure_connected()?;
        let waiter = self.node.begin_request(Uuid::new_v4(), key);
        self.broker
            .send_to_proxy(self.node.server_id(), &self.physical, frame.encode()?)
            .await?;
        self.node.finish_request(waiter, None).await
    }
}

impl Drop for ProxyAdapter {
    fn drop(&mut self) {
        if let Some(h) = self.lifecycle.get_mut().take() {
            h.abort();
        }
    }
}

async fn pump(node: Arc<NodeCore>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        match Frame::decode(data) {
            Ok(frame) => handle_frame(&node, frame),
            Err(e) => {
                // one bad frame must not end the loop
                warn!(server = %node.server_id(), error = %e, "dropping malformed frame");
                node.metrics().decode_errors.inc(&[("source", "frame")]);
            }
        }
    }
    debug!(server = %node.server_id(), "proxy channel closed");
}

fn handle_frame(node: &NodeCore, frame: Frame) {
    match frame {
        Frame::Forward { channel, payload, .. } => {
            if let Some(msg) = decode_envelope(node, &payload) {
                node.deliver(msg.on_channel(channel));
            }
        }
        Frame::ForwardToClient { client, channel, payload, .. } => {
            if let Some(msg) = decode_envelope(node, &payload) {
                node.deliver(msg.on_channel(channel).for_client(client));
            }
        }
        Frame::ServerListResponse { servers } => {
            node.pending().complete_oldest(SERVERS_KEY, Reply::ServerList(servers));
        }
        Frame::PlayerCountResponse { server, count } => {
            node.pending()
                .complete_oldest(&player_count_key(&server), Reply::PlayerCount(count));
        }
        other => {
            debug!(server = %node.server_id(), kind = ?other.kind(), "ignoring proxy-bound frame");
        }
    }
}

fn decode_envelope(node: &NodeCore, payload: &[u8]) -> Option<ReceivedMessage> {
    match Envelope::from_json(payload) {
        Ok(env) => Some(ReceivedMessage::new(env)),
        Err(e) => {
            warn!(server = %node.server_id(), error = %e, "dropping frame with undecodable envelope");
            node.metrics().decode_errors.inc(&[("source", "envelope")]);
            None
        }
    }
}

#[async_trait]
impl ChannelAdapter for ProxyAdapter {
    fn server_id(&self) -> &str {
        self.node.server_id()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Proxy
    }

    fn is_connected(&self) -> bool {
        self.node.is_connected()
    }

    fn metrics(&self) -> Arc<FabricMetrics> {
        self.node.metrics()
    }

    async fn connect(&self) -> Result<()> {
        let mut task = self.lifecycle.lock().await;
        if self.node.is_connected() {
            return Ok(());
        }
        let rx = self
            .broker
            .register_channel(self.node.server_id(), &self.physical)
            .await?;
        *task = Some(tokio::spawn(pump(Arc::clone(&self.node), rx)));
        self.node.mark_connected();
        info!(server = %self.node.server_id(), channel = %self.physical, "proxy adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut task = self.lifecycle.lock().await;
        if !self.node.mark_disconnected() {
            return Ok(());
        }
        if let Some(h) = task.take() {
            h.abort();
        }
        let cancelled = self.node.cancel_pending();
        self.node.stop_listeners();
        if let Err(e) = self
            .broker
            .unregister_channel(self.node.server_id(), &self.physical)
            .await
        {
            warn!(server = %self.node.server_id(), error = %e, "unregister channel failed");
        }
        info!(server = %self.node.server_id(), cancelled, "proxy adapter disconnected");
        Ok(())
    }

    async fn register_channel(&self, channel: &str) -> Result<()> {
        NodeCore::validate_channel(channel)?;
        if self.node.track_channel(channel) {
            debug!(server = %self.node.server_id(), channel = %channel, "channel registered");
        }
        Ok(())
    }

    async fn unregister_channel(&self, channel: &str) -> Result<()> {
        if self.node.untrack_channel(channel) {
            debug!(server = %self.node.server_id(), channel = %channel, "channel unregistered");
        }
        Ok(())
    }

    fn add_listener(&self, channel: &str, listener: Arc<dyn ChannelListener>) {
        self.node.add_listener(channel, listener);
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.node.ensure_connected()?;
        NodeCore::validate_channel(envelope.channel())?;
        let envelope = envelope.without_target();
        self.forward(BROADCAST_TARGET, &envelope).await?;
        self.node.metrics().messages_sent.inc(&[("route", "broadcast")]);
        Ok(())
    }

    async fn send_to(&self, target: &str, envelope: Envelope) -> Result<()> {
        self.node.ensure_connected()?;
        NodeCore::validate_channel(envelope.channel())?;
        let envelope = envelope.with_target(target);
        if self.forward(target, &envelope).await? {
            self.node.metrics().messages_sent.inc(&[("route", "unicast")]);
        } else {
            // no membership view here; the proxy decides routability
            debug!(server = %self.node.server_id(), target = %target, "proxy did not route unicast");
        }
        Ok(())
    }

    async fn send_to_client(&self, client: ClientId, envelope: Envelope) -> Result<()> {
        self.node.ensure_connected()?;
        NodeCore::validate_channel(envelope.channel())?;
        let server = self
            .broker
            .get_player_server(client)
            .await?
            .ok_or(FabricError::ClientNotFound(client))?;
        let envelope = envelope
            .with_target(server.as_str())
            .with_metadata(CLIENT_META_KEY, client.to_string());
        let frame = Frame::ForwardToClient {
            client,
            channel: envelope.channel().to_string(),
            source: self.node.server_id().to_string(),
            payload: envelope.to_json()?,
        }
        .encode()?;
        if self.broker.send_to_player(client, &self.physical, frame).await? {
            self.node.metrics().messages_sent.inc(&[("route", "client")]);
        } else {
            debug!(server = %self.node.server_id(), client = %client, "proxy did not route client message");
        }
        Ok(())
    }

    async fn request(
        &self,
        target: &str,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<ReceivedMessage> {
        self.node.ensure_connected()?;
        let waiter = self
            .node
            .begin_request(envelope.id(), format!("message:{target}"));
        self.send_to(target, envelope).await?;
        match self.node.finish_request(waiter, timeout).await? {
            Reply::Message(msg) => Ok(msg),
            other => Err(FabricError::Internal(format!(
                "unexpected reply to envelope request: {other:?}"
            ))),
        }
    }

    async fn server_ids(&self) -> Result<Vec<String>> {
        let frame = Frame::ServerListRequest {
            source: self.node.server_id().to_string(),
        };
        match self.query(SERVERS_KEY.to_string(), frame).await? {
            Reply::ServerList(servers) => Ok(servers),
            other => Err(FabricError::Internal(format!("unexpected server list reply: {other:?}"))),
        }
    }

    async fn find_client_server(&self, client: ClientId) -> Result<Option<String>> {
        self.node.ensure_connected()?;
        self.broker.get_player_server(client).await
    }

    async fn client_count(&self, server: &str) -> Result<u32> {
        let frame = Frame::PlayerCountRequest {
            source: self.node.server_id().to_string(),
            server: server.to_string(),
        };
        match self.query(player_count_key(server), frame).await? {
            Reply::PlayerCount(n) => Ok(n),
            other => Err(FabricError::Internal(format!("unexpected player count reply: {other:?}"))),
        }
    }

    async fn total_client_count(&self) -> Result<u32> {
        self.node.ensure_connected()?;
        self.broker.get_total_player_count().await
    }

    async fn clients_on(&self, server: &str) -> Result<Vec<ClientId>> {
        self.node.ensure_connected()?;
        self.broker.get_players_on(server).await
    }

    async fn register_client(&self, client: ClientId) -> Result<()> {
        self.node.ensure_connected()?;
        debug!(server = %self.node.server_id(), client = %client, "proxy tracks client locations");
        Ok(())
    }

    async fn unregister_client(&self, client: ClientId) -> Result<()> {
        self.node.ensure_connected()?;
        debug!(server = %self.node.server_id(), client = %client, "proxy tracks client locations");
        Ok(())
    }

    async fn transfer_client(&self, client: ClientId, target: &str) -> Result<()> {
        self.node.ensure_connected()?;
        if self.broker.get_player_server(client).await?.is_none() {
            return Err(FabricError::ClientNotFound(client));
        }
        if !self.broker.connect_player(client, target).await? {
            return Err(FabricError::ServerNotFound(target.to_string()));
        }
        info!(server = %self.node.server_id(), client = %client, target = %target, "client transferred");
        Ok(())
    }

    async fn kick_client(&self, client: ClientId, reason: &str) -> Result<()> {
        self.node.ensure_connected()?;
        if !self.broker.kick_player(client, reason).await? {
            return Err(FabricError::ClientNotFound(client));
        }
        info!(server = %self.node.server_id(), client = %client, reason = %reason, "client kicked");
        Ok(())
    }
}
