//! Channel adapter over the shared store.
//!
//! Topics:
//! - `{p}:channel:{name}` carries base64 envelopes for broadcast
//! - `{p}:server:{id}:inbox` carries `channel|base64` for unicast
//! - `{p}:control` carries JSON control commands for the proxy
//!
//! Each subscribed topic gets its own pump task. The heartbeat task beats
//! and sweeps membership once per interval; a failed cycle is logged and
//! the next one runs on schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use unified_core::error::{ClientId, FabricError, Result};
use unified_core::protocol::now_millis;
use unified_core::Envelope;

use crate::adapter::{ChannelAdapter, ControlCommand, ReceivedMessage, CLIENT_META_KEY};
use crate::config::{BackendKind, FabricConfig};
use crate::correlation::Reply;
use crate::dispatch::ChannelListener;
use crate::node::NodeCore;
use crate::obs::FabricMetrics;

use super::{Keys, Membership, Store, Subscription};

const INBOX_DELIMITER: char = '|';

#[derive(Clone, Copy)]
enum TopicKind {
    Channel,
    Inbox,
}

pub struct StoreAdapter {
    node: Arc<NodeCore>,
    store: Arc<dyn Store>,
    keys: Keys,
    membership: Arc<Membership>,
    heartbeat_interval: Duration,
    local_clients: DashSet<ClientId>,
    /// topic -> pump task
    pumps: DashMap<String, JoinHandle<()>>,
    /// Serializes lifecycle and channel changes; holds the heartbeat task.
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl StoreAdapter {
    pub fn new(cfg: &FabricConfig, store: Arc<dyn Store>) -> Self {
        let server_id: Arc<str> = Arc::from(cfg.server_id.as_str());
        let keys = Keys::new(cfg.key_prefix.clone());
        let membership = Membership::new(
            Arc::clone(&store),
            keys.clone(),
            Arc::clone(&server_id),
            cfg.heartbeat_timeout_ms,
        );
        Self {
            node: Arc::new(NodeCore::new(server_id, cfg.request_timeout())),
            store,
            keys,
            membership: Arc::new(membership),
            heartbeat_interval: cfg.heartbeat_interval(),
            local_clients: DashSet::new(),
            pumps: DashMap::new(),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Run one heartbeat cycle now, outside the schedule.
    pub async fn heartbeat_now(&self) -> Result<Vec<String>> {
        self.node.ensure_connected()?;
        heartbeat_cycle(&self.node, &self.membership).await
    }

    /// Stream of control commands published by any member. Meant for the
    /// proxy-side consumer. A second call replaces the first stream.
    pub async fn control_commands(&self) -> Result<mpsc::Receiver<ControlCommand>> {
        self.node.ensure_connected()?;
        let topic = self.keys.control();
        let mut sub = self.store.subscribe(&topic).await?;
        let (tx, rx) = mpsc::channel(256);
        let node = Arc::clone(&self.node);
        let handle = tokio::spawn(async move {
            while let Some(raw) = sub.rx.recv().await {
                match ControlCommand::from_json(&raw) {
                    Ok(cmd) => {
                        if tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(server = %node.server_id(), error = %e, "dropping malformed control command");
                        node.metrics().decode_errors.inc(&[("source", "control")]);
                    }
                }
            }
        });
        if let Some(old) = self.pumps.insert(topic, handle) {
            old.abort();
        }
        Ok(rx)
    }

    async fn subscribe_topic(&self, topic: String, kind: TopicKind) -> Result<()> {
        let sub = self.store.subscribe(&topic).await?;
        let handle = tokio::spawn(pump(Arc::clone(&self.node), sub, kind));
        if let Some(old) = self.pumps.insert(topic, handle) {
            old.abort();
        }
        Ok(())
    }

    async fn unsubscribe_topic(&self, topic: &str) {
        if let Some((_, handle)) = self.pumps.remove(topic) {
            handle.abort();
        }
        if let Err(e) = self.store.unsubscribe(topic).await {
            warn!(server = %self.node.server_id(), topic = %topic, error = %e, "unsubscribe failed");
        }
    }

    async fn publish(&self, topic: &str, message: &str, route: &str) -> Result<()> {
        let n = self.store.publish(topic, message).await?;
        self.node.metrics().messages_sent.inc(&[("route", route)]);
        debug!(server = %self.node.server_id(), topic = %topic, subscribers = n, route = %route, "published");
        Ok(())
    }

    async fn unicast(&self, target: &str, envelope: Envelope, route: &str) -> Result<()> {
        if !self.membership.is_member(target).await? {
            return Err(FabricError::ServerNotFound(target.to_string()));
        }
        let envelope = envelope.with_target(target);
        let line = format!("{}{}{}", envelope.channel(), INBOX_DELIMITER, envelope.to_base64()?);
        self.publish(&self.keys.inbox(target), &line, route).await
    }

    async fn locate(&self, client: ClientId) -> Result<Option<String>> {
        self.store
            .hash_get(&self.keys.players(), &client.to_string())
            .await
    }

    async fn send_control(&self, cmd: ControlCommand) -> Result<()> {
        info!(server = %self.node.server_id(), command = ?cmd, "publishing control command");
        self.publish(&self.keys.control(), &cmd.to_json()?, "control")
            .await
    }

    // shared by disconnect and a failed connect; caller holds the lifecycle lock
    async fn teardown(&self, heartbeat: &mut Option<JoinHandle<()>>) {
        if let Some(h) = heartbeat.take() {
            h.abort();
        }
        let cancelled = self.node.cancel_pending();
        if cancelled > 0 {
            debug!(server = %self.node.server_id(), cancelled, "cancelled pending requests");
        }

        let players = self.keys.players();
        let clients: Vec<ClientId> = self.local_clients.iter().map(|c| *c).collect();
        for client in clients {
            self.local_clients.remove(&client);
            let field = client.to_string();
            match self.store.hash_get(&players, &field).await {
                Ok(Some(owner)) if owner == self.node.server_id() => {
                    if let Err(e) = self.store.hash_remove(&players, &field).await {
                        warn!(server = %self.node.server_id(), client = %client, error = %e, "client cleanup failed");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(server = %self.node.server_id(), client = %client, error = %e, "client cleanup failed");
                }
            }
        }

        if let Err(e) = self.membership.deregister().await {
            warn!(server = %self.node.server_id(), error = %e, "deregister failed");
        }

        let topics: Vec<String> = self.pumps.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            self.unsubscribe_topic(&topic).await;
        }
        self.node.stop_listeners();

        if let Err(e) = self.store.disconnect().await {
            warn!(server = %self.node.server_id(), error = %e, "store disconnect failed");
        }
    }
}

impl Drop for StoreAdapter {
    fn drop(&mut self) {
        for e in self.pumps.iter() {
            e.value().abort();
        }
        if let Some(h) = self.lifecycle.get_mut().take() {
            h.abort();
        }
    }
}

async fn pump(node: Arc<NodeCore>, mut sub: Subscription, kind: TopicKind) {
    while let Some(raw) = sub.rx.recv().await {
        let decoded = match kind {
            TopicKind::Channel => Envelope::from_base64(&raw).map(ReceivedMessage::new),
            TopicKind::Inbox => decode_inbox(&raw),
        };
        match decoded {
            Ok(msg) => node.deliver(msg),
            Err(e) => {
                let source = match kind {
                    TopicKind::Channel => "envelope",
                    TopicKind::Inbox => "inbox",
                };
                warn!(server = %node.server_id(), topic = %sub.topic, error = %e, "dropping undecodable message");
                node.metrics().decode_errors.inc(&[("source", source)]);
            }
        }
    }
    debug!(server = %node.server_id(), topic = %sub.topic, "subscription closed");
}

fn decode_inbox(raw: &str) -> Result<ReceivedMessage> {
    let (channel, encoded) = raw
        .split_once(INBOX_DELIMITER)
        .ok_or_else(|| FabricError::Decode("inbox message without channel delimiter".into()))?;
    let env = Envelope::from_base64(encoded)?;
    Ok(ReceivedMessage::new(env).on_channel(channel))
}

async fn heartbeat_cycle(node: &NodeCore, membership: &Membership) -> Result<Vec<String>> {
    let metrics = node.metrics();
    // read from the shared location map; a proxy transfer rewrites it
    let beat = async { membership.beat(now_millis(), membership.owned_clients().await?).await };
    if let Err(e) = beat.await {
        metrics.heartbeat_failures.inc(&[]);
        return Err(e);
    }
    metrics.heartbeats.inc(&[]);

    let evicted = match membership.sweep(now_millis()).await {
        Ok(evicted) => evicted,
        Err(e) => {
            metrics.heartbeat_failures.inc(&[]);
            return Err(e);
        }
    };
    for id in &evicted {
        info!(server = %node.server_id(), evicted = %id, "evicted stale member");
    }
    metrics.evictions.add(&[], evicted.len() as u64);
    Ok(evicted)
}

fn spawn_heartbeat(node: Arc<NodeCore>, membership: Arc<Membership>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; registration just wrote a beat
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = heartbeat_cycle(&node, &membership).await {
                warn!(server = %node.server_id(), error = %e, "heartbeat cycle failed");
            }
        }
    })
}

#[async_trait]
impl ChannelAdapter for StoreAdapter {
    fn server_id(&self) -> &str {
        self.node.server_id()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Store
    }

    fn is_connected(&self) -> bool {
        self.node.is_connected()
    }

    fn metrics(&self) -> Arc<FabricMetrics> {
        self.node.metrics()
    }

    async fn connect(&self) -> Result<()> {
        let mut heartbeat = self.lifecycle.lock().await;
        if self.node.is_connected() {
            return Ok(());
        }

        self.store.connect().await?;

        let setup = async {
            self.membership.register(now_millis()).await?;
            self.subscribe_topic(self.keys.inbox(self.node.server_id()), TopicKind::Inbox)
                .await?;
            for channel in self.node.channels() {
                self.subscribe_topic(self.keys.channel(&channel), TopicKind::Channel)
                    .await?;
            }
            Ok::<(), FabricError>(())
        };
        if let Err(e) = setup.await {
            warn!(server = %self.node.server_id(), error = %e, "connect failed; rolling back");
            self.teardown(&mut heartbeat).await;
            return Err(e);
        }

        self.node.mark_connected();
        *heartbeat = Some(spawn_heartbeat(
            Arc::clone(&self.node),
            Arc::clone(&self.membership),
            self.heartbeat_interval,
        ));
        info!(
            server = %self.node.server_id(),
            channels = self.node.channels().len(),
            heartbeat_ms = self.heartbeat_interval.as_millis() as u64,
            "store adapter connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut heartbeat = self.lifecycle.lock().await;
        if !self.node.mark_disconnected() {
            return Ok(());
        }
        self.teardown(&mut heartbeat).await;
        info!(server = %self.node.server_id(), "store adapter disconnected");
        Ok(())
    }

    async fn register_channel(&self, channel: &str) -> Result<()> {
        NodeCore::validate_channel(channel)?;
        let _guard = self.lifecycle.lock().await;
        if !self.node.track_channel(channel) {
            return Ok(());
        }
        if self.node.is_connected() {
            if let Err(e) = self
                .subscribe_topic(self.keys.channel(channel), TopicKind::Channel)
                .await
            {
                self.node.untrack_channel(channel);
                return Err(e);
            }
        }
        debug!(server = %self.node.server_id(), channel = %channel, "channel registered");
        Ok(())
    }

    async fn unregister_channel(&self, channel: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.node.untrack_channel(channel) {
            return Ok(());
        }
        if self.node.is_connected() {
            self.unsubscribe_topic(&self.keys.channel(channel)).await;
        }
        debug!(server = %self.node.server_id(), channel = %channel, "channel unregistered");
        Ok(())
    }

    fn add_listener(&self, channel: &str, listener: Arc<dyn ChannelListener>) {
        self.node.add_listener(channel, listener);
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.node.ensure_connected()?;
        NodeCore::validate_channel(envelope.channel())?;
        let envelope = envelope.without_target();
        let topic = self.keys.channel(envelope.channel());
        self.publish(&topic, &envelope.to_base64()?, "broadcast").await
    }

    async fn send_to(&self, target: &str, envelope: Envelope) -> Result<()> {
        self.node.ensure_connected()?;
        NodeCore::validate_channel(envelope.channel())?;
        self.unicast(target, envelope, "unicast").await
    }

    async fn send_to_client(&self, client: ClientId, envelope: Envelope) -> Result<()> {
        self.node.ensure_connected()?;
        NodeCore::validate_channel(envelope.channel())?;
        let server = self
            .locate(client)
            .await?
            .ok_or(FabricError::ClientNotFound(client))?;
        let envelope = envelope.with_metadata(CLIENT_META_KEY, client.to_string());
        self.unicast(&server, envelope, "client").await
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
        self.node.ensure_connected()?;
        self.membership.members().await
    }

    async fn find_client_server(&self, client: ClientId) -> Result<Option<String>> {
        self.node.ensure_connected()?;
        self.locate(client).await
    }

    async fn client_count(&self, server: &str) -> Result<u32> {
        Ok(self.clients_on(server).await?.len() as u32)
    }

    async fn total_client_count(&self) -> Result<u32> {
        self.node.ensure_connected()?;
        Ok(self.store.hash_size(&self.keys.players()).await? as u32)
    }

    async fn clients_on(&self, server: &str) -> Result<Vec<ClientId>> {
        self.node.ensure_connected()?;
        let all = self.store.hash_get_all(&self.keys.players()).await?;
        let mut clients: Vec<ClientId> = all
            .into_iter()
            .filter(|(_, owner)| owner == server)
            .filter_map(|(client, _)| client.parse().ok())
            .collect();
        clients.sort();
        Ok(clients)
    }

    async fn register_client(&self, client: ClientId) -> Result<()> {
        self.node.ensure_connected()?;
        self.store
            .hash_set(&self.keys.players(), &client.to_string(), self.node.server_id())
            .await?;
        self.local_clients.insert(client);
        debug!(server = %self.node.server_id(), client = %client, "client registered");
        Ok(())
    }

    async fn unregister_client(&self, client: ClientId) -> Result<()> {
        self.node.ensure_connected()?;
        self.local_clients.remove(&client);
        let players = self.keys.players();
        let field = client.to_string();
        // a transfer may already have pointed the entry elsewhere
        if self.store.hash_get(&players, &field).await?.as_deref() == Some(self.node.server_id()) {
            self.store.hash_remove(&players, &field).await?;
        }
        debug!(server = %self.node.server_id(), client = %client, "client unregistered");
        Ok(())
    }

    async fn transfer_client(&self, client: ClientId, target: &str) -> Result<()> {
        self.node.ensure_connected()?;
        if self.locate(client).await?.is_none() {
            return Err(FabricError::ClientNotFound(client));
        }
        if !self.membership.is_member(target).await? {
            return Err(FabricError::ServerNotFound(target.to_string()));
        }
        self.send_control(ControlCommand::Transfer {
            client,
            target: target.to_string(),
        })
        .await
    }

    async fn kick_client(&self, client: ClientId, reason: &str) -> Result<()> {
        self.node.ensure_connected()?;
        if self.locate(client).await?.is_none() {
            return Err(FabricError::ClientNotFound(client));
        }
        self.send_control(ControlCommand::Kick {
            client,
            reason: reason.to_string(),
        })
        .await
    }
}
