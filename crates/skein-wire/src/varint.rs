//! Unsigned base-128 little-endian varints with MSB continuation.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{VarintError, WireError};

/// Longest encoding of a 64-bit value.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the varint encoding of `x` to `buf`.
///
/// Emits 7-bit groups least-significant first; every group except the last
/// has the high bit set. Zero encodes as the single byte `0x00`.
pub fn put_uvarint(buf: &mut Vec<u8>, mut x: u64) {
    while x > 0x7F {
        buf.push(0x80 | (x as u8 & 0x7F));
        x >>= 7;
    }
    buf.push(x as u8);
}

/// Decode a varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed.
pub fn uvarint(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut x = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let Some(&b) = buf.get(i) else {
            return Err(VarintError::Truncated);
        };
        x |= u64::from(b & 0x7F) << (7 * i as u32);
        if b & 0x80 == 0 {
            return Ok((x, i + 1));
        }
    }
    Err(VarintError::Overflow)
}

/// Decode a varint from an async reader, one byte at a time.
///
/// A clean EOF before the first byte is [`WireError::Eof`]; an EOF after it
/// is [`WireError::UnexpectedEof`]. Callers should hand in a buffered reader,
/// this sits on the per-frame hot path.
pub async fn read_uvarint<R>(r: &mut R) -> Result<u64, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut x = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let b = match r.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(if i == 0 {
                    WireError::Eof
                } else {
                    WireError::UnexpectedEof
                });
            }
            Err(e) => return Err(WireError::Io(e)),
        };
        x |= u64::from(b & 0x7F) << (7 * i as u32);
        if b & 0x80 == 0 {
            return Ok(x);
        }
    }
    Err(WireError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(x: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, x);
        buf
    }

    #[test]
    fn roundtrip_boundary_values() {
        for x in [
            0u64,
            1,
            127,
            128,
            16383,
            16384,
            u64::from(u32::MAX),
            1 << 63,
            u64::MAX,
        ] {
            let buf = encoded(x);
            assert!(buf.len() <= MAX_VARINT_LEN, "encoding of {x} too long");
            assert_eq!(uvarint(&buf), Ok((x, buf.len())), "roundtrip of {x}");
        }
    }

    #[test]
    fn known_encodings() {
        assert_eq!(encoded(0), [0x00]);
        assert_eq!(encoded(127), [0x7F]);
        assert_eq!(encoded(128), [0x80, 0x01]);
        assert_eq!(encoded(300), [0xAC, 0x02]);
        assert_eq!(encoded(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn decode_counts_trailing_bytes_once() {
        // Decoder must stop at the terminator, not consume the whole slice.
        let mut buf = encoded(300);
        buf.extend_from_slice(&[0xFF, 0xFF]);
        assert_eq!(uvarint(&buf), Ok((300, 2)));
    }

    #[test]
    fn ten_continuation_bytes_overflow() {
        assert_eq!(uvarint(&[0x80; 10]), Err(VarintError::Overflow));
    }

    #[test]
    fn truncated_input() {
        assert_eq!(uvarint(&[]), Err(VarintError::Truncated));
        assert_eq!(uvarint(&[0x80]), Err(VarintError::Truncated));
        assert_eq!(uvarint(&[0x80, 0x80, 0x80]), Err(VarintError::Truncated));
    }

    #[tokio::test]
    async fn async_decode_matches_sync() {
        for x in [0u64, 1, 127, 128, 16384, u64::MAX] {
            let buf = encoded(x);
            let mut r = buf.as_slice();
            assert_eq!(read_uvarint(&mut r).await.unwrap(), x);
        }
    }

    #[tokio::test]
    async fn async_decode_eof_kinds() {
        let mut empty: &[u8] = &[];
        assert!(matches!(read_uvarint(&mut empty).await, Err(WireError::Eof)));

        let mut cut: &[u8] = &[0x80, 0x80];
        assert!(matches!(
            read_uvarint(&mut cut).await,
            Err(WireError::UnexpectedEof)
        ));

        let mut long: &[u8] = &[0x80; 10];
        assert!(matches!(
            read_uvarint(&mut long).await,
            Err(WireError::Overflow)
        ));
    }
}
