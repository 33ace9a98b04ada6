//! Protocol modules (envelope model + proxy wire framing).
//!
//! - `envelope`: the metadata wrapper every adapter transmits, with its JSON
//!   and base64 text encodings.
//! - `codec`: type-tag registry for decoding payloads at runtime.
//! - `varint` / `frame`: the length/varint-prefixed binary frames carried
//!   over the proxy's forwarding channel.
//!
//! All parsers are panic-free: malformed input is reported as
//! `FabricError::Decode` instead of panicking or indexing raw buffers.

pub mod codec;
pub mod envelope;
pub mod frame;
pub mod varint;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
///
/// A clock set before 1970 reads as 0 rather than failing.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
