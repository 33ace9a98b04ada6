//! Proxy channel frames (panic-free).
//!
//! One physical plugin channel multiplexes several logical message kinds.
//! Layout: `[varint kind][kind-specific body]`, with big-endian fixed-width
//! integers and `u16`-length-prefixed UTF-8 strings.
//!
//! | kind | frame | body |
//! |---|---|---|
//! | 0 | Forward | target, channel, source, `i32` len, bytes |
//! | 1 | ServerListResponse | varint count, count x name |
//! | 2 | PlayerCountResponse | server, varint count |
//! | 3 | ForwardToClient | `i64` id high, `i64` id low, channel, source, `i32` len, bytes |
//! | 4 | ServerListRequest | source |
//! | 5 | PlayerCountRequest | source, server |
//!
//! Parsing rules:
//! - Never index (`buf[0]`); use `Buf` and `remaining()` checks.
//! - Never `unwrap()` / `expect()` / `panic!()` in production paths.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{FabricError, Result};
use crate::protocol::varint::{get_varint, put_varint, varint_len};

/// Forward target meaning "every backend server".
pub const BROADCAST_TARGET: &str = "ALL";

/// Largest payload a Forward / ForwardToClient frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Longest encodable string (u16 length prefix).
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Leading discriminator of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Forward,
    ServerListResponse,
    PlayerCountResponse,
    ForwardToClient,
    ServerListRequest,
    PlayerCountRequest,
}

impl FrameKind {
    pub fn id(self) -> u32 {
        match self {
            FrameKind::Forward => 0,
            FrameKind::ServerListResponse => 1,
            FrameKind::PlayerCountResponse => 2,
            FrameKind::ForwardToClient => 3,
            FrameKind::ServerListRequest => 4,
            FrameKind::PlayerCountRequest => 5,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            0 => FrameKind::Forward,
            1 => FrameKind::ServerListResponse,
            2 => FrameKind::PlayerCountResponse,
            3 => FrameKind::ForwardToClient,
            4 => FrameKind::ServerListRequest,
            5 => FrameKind::PlayerCountRequest,
            _ => return None,
        })
    }
}

/// Decoded proxy frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Forward {
        /// Backend name, or [`BROADCAST_TARGET`].
        target: String,
        channel: String,
        source: String,
        payload: Bytes,
    },
    ServerListResponse {
        servers: Vec<String>,
    },
    PlayerCountResponse {
        server: String,
        count: u32,
    },
    ForwardToClient {
        client: Uuid,
        channel: String,
        source: String,
        payload: Bytes,
    },
    ServerListRequest {
        source: String,
    },
    PlayerCountRequest {
        source: String,
        server: String,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Forward { .. } => FrameKind::Forward,
            Frame::ServerListResponse { .. } => FrameKind::ServerListResponse,
            Frame::PlayerCountResponse { .. } => FrameKind::PlayerCountResponse,
            Frame::ForwardToClient { .. } => FrameKind::ForwardToClient,
            Frame::ServerListRequest { .. } => FrameKind::ServerListRequest,
            Frame::PlayerCountRequest { .. } => FrameKind::PlayerCountRequest,
        }
    }

    /// Encode to a standalone buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size_hint());
        put_varint(&mut buf, self.kind().id());

        match self {
            Frame::Forward { target, channel, source, payload } => {
                put_utf(&mut buf, target)?;
                put_utf(&mut buf, channel)?;
                put_utf(&mut buf, source)?;
                put_payload(&mut buf, payload)?;
            }
            Frame::ServerListResponse { servers } => {
                let count = u32::try_from(servers.len())
                    .map_err(|_| FabricError::encode("server list too long"))?;
                put_varint(&mut buf, count);
                for s in servers {
                    put_utf(&mut buf, s)?;
                }
            }
            Frame::PlayerCountResponse { server, count } => {
                put_utf(&mut buf, server)?;
                put_varint(&mut buf, *count);
            }
            Frame::ForwardToClient { client, channel, source, payload } => {
                let (high, low) = client.as_u64_pair();
                buf.put_i64(high as i64);
                buf.put_i64(low as i64);
                put_utf(&mut buf, channel)?;
                put_utf(&mut buf, source)?;
                put_payload(&mut buf, payload)?;
            }
            Frame::ServerListRequest { source } => {
                put_utf(&mut buf, source)?;
            }
            Frame::PlayerCountRequest { source, server } => {
                put_utf(&mut buf, source)?;
                put_utf(&mut buf, server)?;
            }
        }

        Ok(buf.freeze())
    }

    /// Decode one complete frame. Trailing bytes are rejected.
    pub fn decode(mut buf: Bytes) -> Result<Frame> {
        let kind_id = get_varint(&mut buf)?;
        let kind = FrameKind::from_id(kind_id)
            .ok_or_else(|| FabricError::Decode(format!("unknown frame kind: {kind_id}")))?;

        let frame = match kind {
            FrameKind::Forward => Frame::Forward {
                target: get_utf(&mut buf)?,
                channel: get_utf(&mut buf)?,
                source: get_utf(&mut buf)?,
                payload: get_payload(&mut buf)?,
            },
            FrameKind::ServerListResponse => {
                let count = get_varint(&mut buf)? as usize;
                // each name needs at least its 2-byte length prefix
                if count > buf.remaining() / 2 {
                    return Err(FabricError::decode("server list count exceeds frame"));
                }
                let mut servers = Vec::with_capacity(count);
                for _ in 0..count {
                    servers.push(get_utf(&mut buf)?);
                }
                Frame::ServerListResponse { servers }
            }
            FrameKind::PlayerCountResponse => Frame::PlayerCountResponse {
                server: get_utf(&mut buf)?,
                count: get_varint(&mut buf)?,
            },
            FrameKind::ForwardToClient => {
                if buf.remaining() < 16 {
                    return Err(FabricError::decode("client id truncated"));
                }
                let high = buf.get_i64() as u64;
                let low = buf.get_i64() as u64;
                Frame::ForwardToClient {
                    client: Uuid::from_u64_pair(high, low),
                    channel: get_utf(&mut buf)?,
                    source: get_utf(&mut buf)?,
                    payload: get_payload(&mut buf)?,
                }
            }
            FrameKind::ServerListRequest => Frame::ServerListRequest {
                source: get_utf(&mut buf)?,
            },
            FrameKind::PlayerCountRequest => Frame::PlayerCountRequest {
                source: get_utf(&mut buf)?,
                server: get_utf(&mut buf)?,
            },
        };

        if buf.has_remaining() {
            return Err(FabricError::Decode(format!(
                "{} trailing bytes after {:?} frame",
                buf.remaining(),
                kind
            )));
        }
        Ok(frame)
    }

    fn size_hint(&self) -> usize {
        let strings: usize = match self {
            Frame::Forward { target, channel, source, payload } => {
                target.len() + channel.len() + source.len() + 6 + 4 + payload.len()
            }
            Frame::ServerListResponse { servers } => {
                servers.iter().map(|s| s.len() + 2).sum::<usize>() + varint_len(servers.len() as u32)
            }
            Frame::PlayerCountResponse { server, count } => server.len() + 2 + varint_len(*count),
            Frame::ForwardToClient { channel, source, payload, .. } => {
                16 + channel.len() + source.len() + 4 + 4 + payload.len()
            }
            Frame::ServerListRequest { source } => source.len() + 2,
            Frame::PlayerCountRequest { source, server } => source.len() + server.len() + 4,
        };
        varint_len(self.kind().id()) + strings
    }
}

fn put_utf(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| FabricError::Encode(format!("string of {} bytes exceeds {MAX_STRING_LEN}", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_utf(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(FabricError::decode("string length truncated"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(FabricError::Decode(format!(
            "string body truncated: need {len}, have {}",
            buf.remaining()
        )));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|e| FabricError::Decode(format!("utf8 invalid: {e}")))
}

fn put_payload(buf: &mut BytesMut, payload: &Bytes) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FabricError::Encode(format!(
            "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
            payload.len()
        )));
    }
    buf.put_i32(payload.len() as i32);
    buf.put_slice(payload);
    Ok(())
}

fn get_payload(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(FabricError::decode("payload length truncated"));
    }
    let len = buf.get_i32();
    let len = usize::try_from(len)
        .map_err(|_| FabricError::Decode(format!("negative payload length: {len}")))?;
    if len > MAX_PAYLOAD_LEN {
        return Err(FabricError::Decode(format!("payload length {len} exceeds {MAX_PAYLOAD_LEN}")));
    }
    if buf.remaining() < len {
        return Err(FabricError::Decode(format!(
            "payload truncated: need {len}, have {}",
            buf.remaining()
        )));
    }
    // zero-copy slice of the inbound buffer
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(payload: Bytes) -> Frame {
        Frame::Forward {
            target: "survival-2".into(),
            channel: "chat".into(),
            source: "lobby-1".into(),
            payload,
        }
    }

    #[test]
    fn forward_round_trip_edges() {
        for payload in [
            Bytes::new(),
            Bytes::from_static(b"hi"),
            Bytes::from(vec![0xAB; MAX_PAYLOAD_LEN]),
        ] {
            let f = forward(payload);
            assert_eq!(Frame::decode(f.encode().unwrap()).unwrap(), f);
        }
    }

    #[test]
    fn forward_layout() {
        let f = Frame::Forward {
            target: "b".into(),
            channel: "c".into(),
            source: "a".into(),
            payload: Bytes::from_static(&[9, 8]),
        };
        let raw = f.encode().unwrap();
        assert_eq!(
            raw.as_ref(),
            &[0x00, 0, 1, b'b', 0, 1, b'c', 0, 1, b'a', 0, 0, 0, 2, 9, 8]
        );
    }

    #[test]
    fn forward_to_client_splits_id() {
        let client = Uuid::from_u64_pair(0x0102_0304_0506_0708, u64::MAX);
        let f = Frame::ForwardToClient {
            client,
            channel: "notify".into(),
            source: "a".into(),
            payload: Bytes::from_static(b"data"),
        };
        let raw = f.encode().unwrap();
        assert_eq!(&raw[..9], &[0x03, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&raw[9..17], &[0xFF; 8]);
        assert_eq!(Frame::decode(raw).unwrap(), f);
    }

    #[test]
    fn control_frames_round_trip() {
        let frames = [
            Frame::ServerListResponse { servers: vec![] },
            Frame::ServerListResponse { servers: vec!["lobby".into(), "pvp".into(), "ünï".into()] },
            Frame::PlayerCountResponse { server: "pvp".into(), count: 300 },
            Frame::ServerListRequest { source: "lobby".into() },
            Frame::PlayerCountRequest { source: "lobby".into(), server: "pvp".into() },
        ];
        for f in frames {
            assert_eq!(Frame::decode(f.encode().unwrap()).unwrap(), f, "{:?}", f.kind());
        }
    }

    #[test]
    fn oversized_values_do_not_encode() {
        let f = forward(Bytes::from(vec![0; MAX_PAYLOAD_LEN + 1]));
        assert_eq!(f.encode().unwrap_err().kind().as_str(), "ENCODE");

        let f = Frame::ServerListRequest { source: "x".repeat(MAX_STRING_LEN + 1) };
        assert!(f.encode().is_err());
    }

    #[test]
    fn malformed_frames_are_errors() {
        let cases: [&[u8]; 7] = [
            &[],                          // no kind
            &[0x07],                      // unknown kind
            &[0x00, 0x00],                // string length cut
            &[0x00, 0x00, 0x05, b'a'],    // string body cut
            &[0x02, 0x00, 0x01, b's'],    // count missing
            &[0x03, 0, 0, 0],             // client id cut
            &[0x04, 0x00, 0x00, 0xEE],    // trailing byte
        ];
        for raw in cases {
            let err = Frame::decode(Bytes::copy_from_slice(raw)).unwrap_err();
            assert_eq!(err.kind().as_str(), "DECODE", "input={raw:?}");
        }
    }

    #[test]
    fn negative_payload_length_rejected() {
        let raw = [0x00, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(Frame::decode(Bytes::copy_from_slice(&raw)).is_err());
    }

    #[test]
    fn absurd_server_count_rejected_without_allocating() {
        let raw = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x07];
        assert!(Frame::decode(Bytes::copy_from_slice(&raw)).is_err());
    }
}
