//! Channel adapter contract.
//!
//! A `ChannelAdapter` is one server's handle on the cluster fabric. Two
//! implementations exist: [`StoreAdapter`](crate::store::StoreAdapter) over
//! a shared hash + pub/sub store, and
//! [`ProxyAdapter`](crate::proxy::ProxyAdapter) over the edge proxy's
//! forwarding channel. [`build`] picks one from config.
//!
//! Every operation that touches the transport fails fast with
//! `NotConnected` before `connect()` and after `disconnect()`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use unified_core::error::{ClientId, FabricError, Result};
use unified_core::{Envelope, FabricMessage};

use crate::config::{BackendKind, FabricConfig};
use crate::dispatch::ChannelListener;
use crate::obs::FabricMetrics;
use crate::proxy::{ProxyAdapter, ProxyBroker};
use crate::store::{Store, StoreAdapter};

/// Envelope metadata key naming the client a unicast was addressed to.
pub const CLIENT_META_KEY: &str = "unified-client";

/// Receiver-side view of one delivered envelope.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub channel: String,
    pub source_server: String,
    /// Set when the sender addressed a client rather than a server.
    pub client: Option<ClientId>,
    pub envelope: Envelope,
}

impl ReceivedMessage {
    pub fn new(envelope: Envelope) -> Self {
        let client = envelope
            .meta(CLIENT_META_KEY)
            .and_then(|v| v.parse::<ClientId>().ok());
        Self {
            channel: envelope.channel().to_string(),
            source_server: envelope.source_server().to_string(),
            client,
            envelope,
        }
    }

    /// Override the channel with the one the transport delivered on.
    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn for_client(mut self, client: ClientId) -> Self {
        self.client = Some(client);
        self
    }

    pub fn payload<M: FabricMessage>(&self) -> Result<M> {
        self.envelope.payload()
    }
}

/// Privileged client operations, carried to whoever owns client
/// connections (the proxy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum ControlCommand {
    Transfer { client: ClientId, target: String },
    Kick { client: ClientId, reason: String },
}

impl ControlCommand {
    pub fn client(&self) -> ClientId {
        match self {
            ControlCommand::Transfer { client, .. } | ControlCommand::Kick { client, .. } => *client,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| FabricError::Encode(format!("control command encode failed: {e}")))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| FabricError::Decode(format!("invalid control command: {e}")))
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn server_id(&self) -> &str;
    fn backend(&self) -> BackendKind;
    fn is_connected(&self) -> bool;
    fn metrics(&self) -> Arc<FabricMetrics>;

    /// Bring up the transport, register this server, start background
    /// tasks. Connecting twice is a no-op.
    async fn connect(&self) -> Result<()>;

    /// Best-effort teardown. Idempotent; fine without a prior connect.
    async fn disconnect(&self) -> Result<()>;

    /// Subscribe a logical channel. Before `connect()` the channel is
    /// remembered and subscribed on connect. Registering twice is a no-op.
    async fn register_channel(&self, channel: &str) -> Result<()>;

    /// Unsubscribe; unknown channels are a no-op.
    async fn unregister_channel(&self, channel: &str) -> Result<()>;

    fn add_listener(&self, channel: &str, listener: Arc<dyn ChannelListener>);

    /// Fan out to every server subscribed to the envelope's channel.
    async fn broadcast(&self, envelope: Envelope) -> Result<()>;

    async fn send_to(&self, target: &str, envelope: Envelope) -> Result<()>;

    /// Resolve the client's server, then unicast.
    async fn send_to_client(&self, client: ClientId, envelope: Envelope) -> Result<()>;

    /// Unicast and wait for the envelope correlated to `envelope.id()`.
    /// `None` uses the configured request timeout.
    async fn request(
        &self,
        target: &str,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<ReceivedMessage>;

    /// Answer `to`: correlates `envelope` to it and unicasts it back.
    async fn reply(&self, to: &ReceivedMessage, envelope: Envelope) -> Result<()> {
        let envelope = envelope.with_correlation(to.envelope.id());
        self.send_to(&to.source_server, envelope).await
    }

    async fn server_ids(&self) -> Result<Vec<String>>;
    async fn find_client_server(&self, client: ClientId) -> Result<Option<String>>;
    async fn client_count(&self, server: &str) -> Result<u32>;
    async fn total_client_count(&self) -> Result<u32>;
    async fn clients_on(&self, server: &str) -> Result<Vec<ClientId>>;

    /// Record that `client` is connected to this server.
    async fn register_client(&self, client: ClientId) -> Result<()>;
    async fn unregister_client(&self, client: ClientId) -> Result<()>;

    async fn transfer_client(&self, client: ClientId, target: &str) -> Result<()>;
    async fn kick_client(&self, client: ClientId, reason: &str) -> Result<()>;
}

/// Typed-payload helpers over any adapter.
#[async_trait]
pub trait ChannelAdapterExt: ChannelAdapter {
    async fn broadcast_msg<M: FabricMessage>(&self, channel: &str, msg: &M) -> Result<()> {
        let env = Envelope::wrap(channel, msg, self.server_id())?;
        self.broadcast(env).await
    }

    async fn send_msg<M: FabricMessage>(&self, channel: &str, target: &str, msg: &M) -> Result<()> {
        let env = Envelope::wrap(channel, msg, self.server_id())?;
        self.send_to(target, env).await
    }

    async fn send_msg_to_client<M: FabricMessage>(
        &self,
        channel: &str,
        client: ClientId,
        msg: &M,
    ) -> Result<()> {
        let env = Envelope::wrap(channel, msg, self.server_id())?;
        self.send_to_client(client, env).await
    }
}

impl<T: ChannelAdapter + ?Sized> ChannelAdapterExt for T {}

/// Transport handle for [`build`].
#[derive(Clone)]
pub enum Backend {
    Store(Arc<dyn Store>),
    Proxy(Arc<dyn ProxyBroker>),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Store(_) => BackendKind::Store,
            Backend::Proxy(_) => BackendKind::Proxy,
        }
    }
}

/// Construct the adapter selected by `cfg.backend`.
pub fn build(cfg: &FabricConfig, backend: Backend) -> Result<Arc<dyn ChannelAdapter>> {
    cfg.validate()?;
    match (cfg.backend, backend) {
        (BackendKind::Store, Backend::Store(store)) => Ok(Arc::new(StoreAdapter::new(cfg, store))),
        (BackendKind::Proxy, Backend::Proxy(broker)) => Ok(Arc::new(ProxyAdapter::new(cfg, broker))),
        (want, got) => Err(FabricError::Config(format!(
            "backend mismatch: config selects {}, handle is {}",
            want.as_str(),
            got.kind().as_str()
        ))),
    }
}
