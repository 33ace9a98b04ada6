//! Variable-length integers: 7 data bits per byte, high bit = continuation,
//! least significant group first.
//!
//! Values are `u32`; a non-negative `i32` maps onto the same bytes, so the
//! encoding matches the varints used by common binary game protocols.

use bytes::{Buf, BufMut};

use crate::error::{FabricError, Result};

/// Longest encoding of a 32-bit value.
pub const MAX_VARINT_LEN: usize = 5;

const SEGMENT_BITS: u32 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Append `value` to `buf`.
pub fn put_varint<B: BufMut>(buf: &mut B, mut value: u32) {
    loop {
        if value & !SEGMENT_BITS == 0 {
            buf.put_u8(value as u8);
            return;
        }
        buf.put_u8((value & SEGMENT_BITS) as u8 | CONTINUE_BIT);
        value >>= 7;
    }
}

/// Number of bytes `put_varint` writes for `value`.
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => MAX_VARINT_LEN,
    }
}

/// Read one varint from the front of `buf`.
///
/// Fails on truncated input, on more than five bytes, and on a fifth byte
/// carrying bits beyond the 32nd.
pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u32> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(FabricError::decode("varint truncated"));
        }
        let byte = buf.get_u8();
        if i == MAX_VARINT_LEN - 1 && byte > 0x0F {
            return Err(FabricError::decode("varint overflows 32 bits"));
        }
        value |= ((byte & SEGMENT_BITS as u8) as u32) << (7 * i);
        if byte & CONTINUE_BIT == 0 {
            return Ok(value);
        }
    }
    Err(FabricError::decode("varint too long"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};

    fn encode(v: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, v);
        buf.to_vec()
    }

    #[test]
    fn known_encodings() {
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(1), [0x01]);
        assert_eq!(encode(127), [0x7F]);
        assert_eq!(encode(128), [0x80, 0x01]);
        assert_eq!(encode(255), [0xFF, 0x01]);
        assert_eq!(encode(25565), [0xDD, 0xC7, 0x01]);
        assert_eq!(encode(i32::MAX as u32), [0xFF, 0xFF, 0xFF, 0xFF, 0x07]);
    }

    #[test]
    fn len_matches_encoding() {
        for v in [0, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, 268_435_455, 268_435_456, u32::MAX] {
            assert_eq!(varint_len(v), encode(v).len(), "value={v}");
        }
    }

    #[test]
    fn decode_inverts_encode_at_boundaries() {
        let mut samples = vec![0u32, 1, 127, 128, 300, 16_383, 16_384, i32::MAX as u32];
        // every power of two and its neighbours up to i32::MAX
        for shift in 0..31 {
            let p = 1u32 << shift;
            samples.extend([p - 1, p, p + 1]);
        }
        for v in samples {
            let mut bytes = Bytes::from(encode(v));
            assert_eq!(get_varint(&mut bytes).unwrap(), v, "value={v}");
            assert!(!bytes.has_remaining(), "value={v} left trailing bytes");
        }
    }

    #[test]
    fn rejects_truncated() {
        let mut b = Bytes::from_static(&[0x80, 0x80]);
        assert!(get_varint(&mut b).is_err());
        let mut empty = Bytes::new();
        assert!(get_varint(&mut empty).is_err());
    }

    #[test]
    fn rejects_overlong() {
        let mut b = Bytes::from_static(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(get_varint(&mut b).is_err());
        let mut b = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);
        assert!(get_varint(&mut b).is_err());
    }
}
