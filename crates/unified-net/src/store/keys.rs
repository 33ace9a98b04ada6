//! Store key namespace.

/// Builds every key and topic name under one prefix (`unified` by default).
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Membership hash: server id -> last heartbeat millis.
    pub fn servers(&self) -> String {
        format!("{}:servers", self.prefix)
    }

    /// Detail hash of one server: online, lastHeartbeat, players.
    pub fn server(&self, id: &str) -> String {
        format!("{}:server:{}", self.prefix, id)
    }

    /// Client location hash: client id -> server id.
    pub fn players(&self) -> String {
        format!("{}:players", self.prefix)
    }

    pub fn channel(&self, name: &str) -> String {
        format!("{}:channel:{}", self.prefix, name)
    }

    pub fn inbox(&self, id: &str) -> String {
        format!("{}:server:{}:inbox", self.prefix, id)
    }

    pub fn control(&self) -> String {
        format!("{}:control", self.prefix)
    }
}
