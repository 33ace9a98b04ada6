use std::time::Duration;

use serde::Deserialize;
use unified_core::error::{FabricError, Result};

/// Which transport strategy an adapter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared hash + pub/sub store.
    Store,
    /// The edge proxy's native forwarding channel.
    Proxy,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Store => "store",
            BackendKind::Proxy => "proxy",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FabricConfig {
    pub version: u32,

    /// This server's identity in the cluster.
    pub server_id: String,

    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_proxy_channel")]
    pub proxy_channel: String,
}

impl FabricConfig {
    /// Defaults for `server_id`, store backend.
    pub fn for_server(server_id: impl Into<String>) -> Self {
        Self {
            version: 1,
            server_id: server_id.into(),
            backend: default_backend(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            key_prefix: default_key_prefix(),
            proxy_channel: default_proxy_channel(),
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_heartbeat(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_timeout_ms = timeout_ms;
        self
    }

    pub fn with_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(FabricError::Config(format!("unsupported config version: {}", self.version)));
        }
        if self.server_id.trim().is_empty() {
            return Err(FabricError::Config("server_id must not be empty".into()));
        }
        // '|' splits inbox messages, ':' separates key segments
        if self.server_id.contains(|c: char| c == '|' || c == ':') {
            return Err(FabricError::Config("server_id must not contain '|' or ':'".into()));
        }
        if !(1000..=60000).contains(&self.heartbeat_interval_ms) {
            return Err(FabricError::Config(
                "heartbeat_interval_ms must be between 1000 and 60000".into(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms || self.heartbeat_timeout_ms > 600000 {
            return Err(FabricError::Config(
                "heartbeat_timeout_ms must be greater than heartbeat_interval_ms and at most 600000".into(),
            ));
        }
        if !(100..=60000).contains(&self.request_timeout_ms) {
            return Err(FabricError::Config(
                "request_timeout_ms must be between 100 and 60000".into(),
            ));
        }
        if self.key_prefix.is_empty() || self.proxy_channel.is_empty() {
            return Err(FabricError::Config("key_prefix and proxy_channel must not be empty".into()));
        }
        Ok(())
    }
}

fn default_backend() -> BackendKind {
    BackendKind::Store
}
fn default_heartbeat_interval_ms() -> u64 {
    5000
}
fn default_heartbeat_timeout_ms() -> u64 {
    15000
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_key_prefix() -> String {
    "unified".into()
}
fn default_proxy_channel() -> String {
    "unified:main".into()
}
