//! Frame codec: `varint(header) ‖ varint(length) ‖ payload`.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::varint::{put_uvarint, read_uvarint, MAX_VARINT_LEN};
use crate::WireError;

/// Frame kind, carried in the low 3 bits of the wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Opens a stream; the payload is the UTF-8 stream name.
    NewStream,
    /// Data toward the non-initiating side.
    Receiver,
    /// Data toward the initiating side.
    Initiator,
    /// Unassigned tag value; delivered as data.
    Unknown,
    /// Closes a stream; the payload is empty.
    Close,
}

impl Tag {
    /// Wire value of this tag.
    pub const fn to_wire(self) -> u64 {
        match self {
            Tag::NewStream => 0,
            Tag::Receiver => 1,
            Tag::Initiator => 2,
            Tag::Unknown => 3,
            Tag::Close => 5,
        }
    }

    /// Map a wire value to a tag.
    ///
    /// Every unassigned value (3, 4, 6, 7) maps to [`Tag::Unknown`], which is
    /// treated as a data frame on receipt.
    pub const fn from_wire(bits: u64) -> Tag {
        match bits {
            0 => Tag::NewStream,
            1 => Tag::Receiver,
            2 => Tag::Initiator,
            5 => Tag::Close,
            _ => Tag::Unknown,
        }
    }

    /// Whether a frame with this tag carries stream data.
    pub const fn is_data(self) -> bool {
        !matches!(self, Tag::NewStream | Tag::Close)
    }
}

/// Pack a stream id and tag into a wire header.
pub const fn header(stream_id: u64, tag: Tag) -> u64 {
    (stream_id << 3) | tag.to_wire()
}

/// Stream id half of a wire header.
pub const fn header_stream_id(header: u64) -> u64 {
    header >> 3
}

/// Tag half of a wire header.
pub const fn header_tag(header: u64) -> Tag {
    Tag::from_wire(header & 7)
}

/// One wire-level unit: a packed header and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packed `(stream_id << 3) | tag`.
    pub header: u64,
    /// Payload bytes; may be empty.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from its parts.
    pub fn new(stream_id: u64, tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self {
            header: header(stream_id, tag),
            payload: payload.into(),
        }
    }

    /// Stream id this frame belongs to.
    pub fn stream_id(&self) -> u64 {
        header_stream_id(self.header)
    }

    /// Frame kind.
    pub fn tag(&self) -> Tag {
        header_tag(self.header)
    }
}

/// Reads frames off a transport.
///
/// Buffers the underlying reader, the varint decode is byte-at-a-time.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap a transport read half.
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames. EOF anywhere inside
    /// a frame is an error: [`WireError::UnexpectedEof`] in the header or
    /// length varint, [`WireError::ShortRead`] in the payload.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, WireError> {
        let header = match read_uvarint(&mut self.inner).await {
            Ok(h) => h,
            Err(WireError::Eof) => return Ok(None),
            Err(e) => return Err(e),
        };
        let len = match read_uvarint(&mut self.inner).await {
            Ok(l) => l as usize,
            Err(WireError::Eof) => return Err(WireError::UnexpectedEof),
            Err(e) => return Err(e),
        };

        let mut payload = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.inner.read(&mut payload[filled..]).await?;
            if n == 0 {
                return Err(WireError::ShortRead {
                    expected: len,
                    got: filled,
                });
            }
            filled += n;
        }

        Ok(Some(Frame {
            header,
            payload: Bytes::from(payload),
        }))
    }
}

/// Write one frame: header varint, length varint, payload bytes.
///
/// The three writes are not atomic; non-interleaving across frames is the
/// serializer task's job.
pub async fn write_frame<W>(w: &mut W, header: u64, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut prefix = Vec::with_capacity(2 * MAX_VARINT_LEN);
    put_uvarint(&mut prefix, header);
    put_uvarint(&mut prefix, payload.len() as u64);
    w.write_all(&prefix).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    async fn wire_bytes(header: u64, payload: &[u8]) -> Vec<u8> {
        let (mut tx, mut rx) = duplex(1024);
        write_frame(&mut tx, header, payload).await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);
        let mut got = Vec::new();
        rx.read_to_end(&mut got).await.unwrap();
        got
    }

    #[test]
    fn tag_wire_values() {
        assert_eq!(Tag::NewStream.to_wire(), 0);
        assert_eq!(Tag::Receiver.to_wire(), 1);
        assert_eq!(Tag::Initiator.to_wire(), 2);
        assert_eq!(Tag::Unknown.to_wire(), 3);
        assert_eq!(Tag::Close.to_wire(), 5);

        // Unassigned values all come back as data.
        for bits in [3, 4, 6, 7] {
            assert_eq!(Tag::from_wire(bits), Tag::Unknown);
            assert!(Tag::from_wire(bits).is_data());
        }
        assert!(!Tag::from_wire(0).is_data());
        assert!(!Tag::from_wire(5).is_data());
    }

    #[test]
    fn header_math() {
        assert_eq!(header(42, Tag::Close), 341);
        assert_eq!(header_stream_id(341), 42);
        assert_eq!(header_tag(341), Tag::Close);

        // One varint byte up to id 15, two from id 16.
        let mut buf = Vec::new();
        put_uvarint(&mut buf, header(15, Tag::Initiator));
        assert_eq!(buf, [0x7A]);
        buf.clear();
        put_uvarint(&mut buf, header(16, Tag::Initiator));
        assert_eq!(buf, [0x82, 0x01]);
    }

    #[tokio::test]
    async fn hello_exchange_wire_bytes() {
        let open = wire_bytes(header(1, Tag::NewStream), b"greet").await;
        assert_eq!(open, [0x08, 0x05, b'g', b'r', b'e', b'e', b't']);

        let data = wire_bytes(header(1, Tag::Initiator), b"hi").await;
        assert_eq!(data, [0x0A, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut tx, rx) = duplex(1024);
        write_frame(&mut tx, header(7, Tag::Receiver), b"abc")
            .await
            .unwrap();
        write_frame(&mut tx, header(2, Tag::Close), b"").await.unwrap();
        drop(tx);

        let mut frames = FrameReader::new(rx);
        let first = frames.read_frame().await.unwrap().unwrap();
        assert_eq!(first.stream_id(), 7);
        assert_eq!(first.tag(), Tag::Receiver);
        assert_eq!(&first.payload[..], b"abc");

        let second = frames.read_frame().await.unwrap().unwrap();
        assert_eq!(second.stream_id(), 2);
        assert_eq!(second.tag(), Tag::Close);
        assert!(second.payload.is_empty());

        assert!(frames.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_transport_is_clean_eof() {
        let (tx, rx) = duplex(16);
        drop(tx);
        let mut frames = FrameReader::new(rx);
        assert!(frames.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_header_varint() {
        let (mut tx, rx) = duplex(16);
        tx.write_all(&[0x80]).await.unwrap();
        drop(tx);
        let mut frames = FrameReader::new(rx);
        assert!(matches!(
            frames.read_frame().await,
            Err(WireError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn eof_before_length_varint() {
        let (mut tx, rx) = duplex(16);
        tx.write_all(&[0x0A]).await.unwrap();
        drop(tx);
        let mut frames = FrameReader::new(rx);
        assert!(matches!(
            frames.read_frame().await,
            Err(WireError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn eof_inside_payload_is_short_read() {
        let (mut tx, rx) = duplex(16);
        tx.write_all(&[0x0A, 0x05, b'h', b'i']).await.unwrap();
        drop(tx);
        let mut frames = FrameReader::new(rx);
        match frames.read_frame().await {
            Err(WireError::ShortRead { expected: 5, got: 2 }) => {}
            other => panic!("expected short read, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_header_varint_overflows() {
        let (mut tx, rx) = duplex(16);
        tx.write_all(&[0x80; 10]).await.unwrap();
        drop(tx);
        let mut frames = FrameReader::new(rx);
        assert!(matches!(
            frames.read_frame().await,
            Err(WireError::Overflow)
        ));
    }
}
