//! Message envelope: network metadata wrapped around an opaque payload.
//!
//! An envelope is immutable once built. The addressing fields (target,
//! correlation id, ttl, metadata) are set through consuming `with_*`
//! builders that return a new envelope, so a shared envelope can never be
//! re-addressed underneath another holder.
//!
//! Wire form is JSON with the payload as a base64 string. The store adapter
//! base64-encodes that JSON once more before publishing; the proxy adapter
//! carries the JSON bytes as a length-prefixed frame payload.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FabricError, Result};
use crate::protocol::now_millis;

/// A payload type that can travel inside an [`Envelope`].
///
/// The type tag replaces runtime class lookups: receivers check the tag
/// before decoding, and the [`CodecRegistry`](crate::protocol::codec::CodecRegistry)
/// maps tags back to decoders.
pub trait FabricMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Short discriminator carried in the envelope `type` field.
    ///
    /// Defaults to the unqualified Rust type name.
    fn type_tag() -> &'static str
    where
        Self: Sized,
    {
        short_type_name(std::any::type_name::<Self>())
    }
}

impl FabricMessage for String {
    fn type_tag() -> &'static str {
        "string"
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Immutable transmission unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    id: Uuid,
    channel: String,
    #[serde(rename = "type")]
    msg_type: String,
    timestamp: u64,
    source_server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
    #[serde(default)]
    ttl: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
    #[serde(with = "payload_b64")]
    payload: Bytes,
}

impl Envelope {
    /// Wrap raw payload bytes under an explicit type tag.
    pub fn new(
        channel: impl Into<String>,
        msg_type: impl Into<String>,
        payload: impl Into<Bytes>,
        source_server: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            msg_type: msg_type.into(),
            timestamp: now_millis(),
            source_server: source_server.into(),
            target_server: None,
            correlation_id: None,
            ttl: 0,
            metadata: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    /// Serialize a typed message and wrap it, tagged with `M::type_tag()`.
    pub fn wrap<M: FabricMessage>(
        channel: impl Into<String>,
        msg: &M,
        source_server: impl Into<String>,
    ) -> Result<Self> {
        let payload = serde_json::to_vec(msg)
            .map_err(|e| FabricError::encode(format!("payload json encode failed: {e}")))?;
        Ok(Self::new(channel, M::type_tag(), payload, source_server))
    }

    /// Decode the payload as `M`. Fails if the type tag does not match.
    pub fn payload<M: FabricMessage>(&self) -> Result<M> {
        if self.msg_type != M::type_tag() {
            return Err(FabricError::decode(format!(
                "payload type mismatch: envelope carries {}, asked for {}",
                self.msg_type,
                M::type_tag()
            )));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| FabricError::decode(format!("payload json decode failed: {e}")))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn channel(&self) -> &str {
        &self.channel
    }
    /// Payload type tag.
    pub fn payload_type(&self) -> &str {
        &self.msg_type
    }
    /// Creation instant, wall-clock millis.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
    pub fn source_server(&self) -> &str {
        &self.source_server
    }
    pub fn target_server(&self) -> Option<&str> {
        self.target_server.as_deref()
    }
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }
    /// Time-to-live in millis; 0 means no expiry.
    pub fn ttl(&self) -> u64 {
        self.ttl
    }
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
    pub fn payload_bytes(&self) -> &Bytes {
        &self.payload
    }

    /// No target: fan-out to every subscriber of the channel.
    pub fn is_broadcast(&self) -> bool {
        self.target_server.is_none()
    }

    /// Carries a correlation id, i.e. answers an earlier request.
    pub fn is_response(&self) -> bool {
        self.correlation_id.is_some()
    }

    /// Whether the ttl has elapsed at wall-clock `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl > 0 && now.saturating_sub(self.timestamp) > self.ttl
    }

    pub fn with_target(mut self, server: impl Into<String>) -> Self {
        self.target_server = Some(server.into());
        self
    }

    pub fn without_target(mut self) -> Self {
        self.target_server = None;
        self
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = ttl_ms;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build an answer to `self`: same channel, correlated to this id,
    /// addressed back to the original sender.
    pub fn reply<M: FabricMessage>(&self, msg: &M, source_server: impl Into<String>) -> Result<Self> {
        Ok(Envelope::wrap(self.channel.clone(), msg, source_server)?
            .with_correlation(self.id)
            .with_target(self.source_server.clone()))
    }

    /// JSON bytes (the proxy frame payload).
    pub fn to_json(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| FabricError::encode(format!("envelope json encode failed: {e}")))
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| FabricError::decode(format!("invalid envelope json: {e}")))
    }

    /// Base64 of the JSON form (the store publish payload).
    pub fn to_base64(&self) -> Result<String> {
        Ok(B64.encode(self.to_json()?))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = B64
            .decode(encoded.trim())
            .map_err(|e| FabricError::decode(format!("invalid base64 envelope: {e}")))?;
        Self::from_json(&raw)
    }
}

mod payload_b64 {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(d)?;
        B64.decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
