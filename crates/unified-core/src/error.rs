//! Shared error type across the unified crates.

use thiserror::Error;
use uuid::Uuid;

/// Client (player connection) identifier, 128 bits.
pub type ClientId = Uuid;

/// Stable error codes, used in log fields and by callers that branch on
/// the failure class without matching payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation attempted before connect or after disconnect.
    NotConnected,
    /// Backing store or proxy unreachable.
    Transport,
    /// Unicast target not in the membership view.
    ServerNotFound,
    /// No location entry for the client.
    ClientNotFound,
    /// Correlated request unanswered in time.
    Timeout,
    /// Pending request discarded by disconnect.
    Cancelled,
    /// Malformed frame, envelope, or payload.
    Decode,
    /// Outbound value cannot be represented on the wire.
    Encode,
    /// Invalid configuration.
    Config,
    /// Internal invariant broken.
    Internal,
}

impl ErrorKind {
    /// String representation used in logs and assertions.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotConnected => "NOT_CONNECTED",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::ServerNotFound => "SERVER_NOT_FOUND",
            ErrorKind::ClientNotFound => "CLIENT_NOT_FOUND",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Decode => "DECODE",
            ErrorKind::Encode => "ENCODE",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Whether a caller can reasonably recover (pick a fallback, retry later).
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::ServerNotFound | ErrorKind::ClientNotFound | ErrorKind::Timeout
        )
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, FabricError>;

/// Unified error type used by core and the adapters.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("not connected")]
    NotConnected,
    #[error("transport: {0}")]
    Transport(String),
    #[error("server not found: {0}")]
    ServerNotFound(String),
    #[error("client not found: {0}")]
    ClientNotFound(ClientId),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("decode: {0}")]
    Decode(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("config: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl FabricError {
    /// Map to a stable error code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FabricError::NotConnected => ErrorKind::NotConnected,
            FabricError::Transport(_) => ErrorKind::Transport,
            FabricError::ServerNotFound(_) => ErrorKind::ServerNotFound,
            FabricError::ClientNotFound(_) => ErrorKind::ClientNotFound,
            FabricError::Timeout => ErrorKind::Timeout,
            FabricError::Cancelled => ErrorKind::Cancelled,
            FabricError::Decode(_) => ErrorKind::Decode,
            FabricError::Encode(_) => ErrorKind::Encode,
            FabricError::Config(_) => ErrorKind::Config,
            FabricError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        FabricError::Decode(msg.into())
    }

    pub(crate) fn encode(msg: impl Into<String>) -> Self {
        FabricError::Encode(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(FabricError::Timeout.kind().is_recoverable());
        assert!(FabricError::ServerNotFound("b".into()).kind().is_recoverable());
        assert!(!FabricError::NotConnected.kind().is_recoverable());
        assert!(!FabricError::Cancelled.kind().is_recoverable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(FabricError::NotConnected.kind().as_str(), "NOT_CONNECTED");
        assert_eq!(
            FabricError::ClientNotFound(Uuid::from_u128(42)).kind().as_str(),
            "CLIENT_NOT_FOUND"
        );
    }
}
