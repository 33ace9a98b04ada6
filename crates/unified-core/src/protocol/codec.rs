//! Type-tag registry: decode envelope payloads without knowing the
//! concrete type at the call site.
//!
//! Built once at startup (`register::<M>()` per payload type) and then
//! shared read-only.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::error::{FabricError, Result};
use crate::protocol::envelope::{Envelope, FabricMessage};

type DecodeFn = Box<dyn Fn(&Envelope) -> Result<Box<dyn Any + Send>> + Send + Sync>;

/// A payload decoded through the registry.
pub struct DecodedPayload {
    tag: String,
    value: Box<dyn Any + Send>,
}

impl DecodedPayload {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is<M: FabricMessage>(&self) -> bool {
        self.value.is::<M>()
    }

    /// Take the concrete value back; returns `self` unchanged on a type miss.
    pub fn downcast<M: FabricMessage>(self) -> std::result::Result<M, Self> {
        let Self { tag, value } = self;
        match value.downcast::<M>() {
            Ok(v) => Ok(*v),
            Err(value) => Err(Self { tag, value }),
        }
    }
}

impl fmt::Debug for DecodedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedPayload").field("tag", &self.tag).finish_non_exhaustive()
    }
}

/// `type tag -> decoder` mapping.
#[derive(Default)]
pub struct CodecRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M` under its type tag. A second registration of the same
    /// tag replaces the first and returns `false`.
    pub fn register<M: FabricMessage>(&mut self) -> bool {
        let decode: DecodeFn =
            Box::new(|env: &Envelope| env.payload::<M>().map(|m| Box::new(m) as Box<dyn Any + Send>));
        self.decoders.insert(M::type_tag(), decode).is_none()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Decode `env` using the decoder registered for its type tag.
    pub fn decode(&self, env: &Envelope) -> Result<DecodedPayload> {
        let tag = env.payload_type();
        let decode = self
            .decoders
            .get(tag)
            .ok_or_else(|| FabricError::Decode(format!("no codec registered for type: {tag}")))?;
        Ok(DecodedPayload {
            tag: tag.to_string(),
            value: decode(env)?,
        })
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry").field("tags", &self.tags()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Transfer {
        player: String,
        to: String,
    }
    impl FabricMessage for Transfer {}

    #[test]
    fn decode_by_tag() {
        let mut reg = CodecRegistry::new();
        assert!(reg.register::<Transfer>());
        assert!(reg.register::<String>());
        assert!(!reg.register::<String>());
        assert_eq!(reg.tags(), vec!["Transfer", "string"]);

        let env = Envelope::wrap("ops", &Transfer { player: "p".into(), to: "s2".into() }, "s1").unwrap();
        let decoded = reg.decode(&env).unwrap();
        assert_eq!(decoded.tag(), "Transfer");
        assert!(decoded.is::<Transfer>());
        assert!(!decoded.is::<String>());

        let decoded = decoded.downcast::<String>().unwrap_err();
        let t = decoded.downcast::<Transfer>().unwrap();
        assert_eq!(t.to, "s2");
    }

    #[test]
    fn unknown_tag_is_decode_error() {
        let reg = CodecRegistry::new();
        let env = Envelope::wrap("c", &"x".to_string(), "a").unwrap();
        assert_eq!(reg.decode(&env).unwrap_err().kind().as_str(), "DECODE");
    }
}
