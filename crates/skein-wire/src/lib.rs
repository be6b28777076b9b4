#![deny(unsafe_code)]

//! Wire format for the skein stream multiplexer.
//!
//! A frame on the wire is `varint(header) ‖ varint(length) ‖ payload`, where
//! `header = (stream_id << 3) | tag`. Varints are unsigned base-128
//! little-endian with MSB continuation, at most 10 bytes.
//!
//! This crate is transport-agnostic: [`FrameReader`] and [`write_frame`] work
//! with any `AsyncRead` / `AsyncWrite`.

mod frame;
mod varint;

pub use frame::{header, header_stream_id, header_tag, write_frame, Frame, FrameReader, Tag};
pub use varint::{put_uvarint, read_uvarint, uvarint, MAX_VARINT_LEN};

use std::fmt;
use std::io;

/// Error from the synchronous varint decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// No terminator within the 10-byte limit of a 64-bit varint.
    Overflow,
    /// The input slice ended mid-varint.
    Truncated,
}

impl fmt::Display for VarintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarintError::Overflow => write!(f, "varint overflows 64 bits"),
            VarintError::Truncated => write!(f, "input ended mid-varint"),
        }
    }
}

impl std::error::Error for VarintError {}

/// Error while reading wire data from a transport.
#[derive(Debug)]
pub enum WireError {
    /// Clean end of stream at a frame boundary.
    ///
    /// Only produced by [`read_uvarint`] when the transport ends before the
    /// first byte; [`FrameReader::read_frame`] turns it into `Ok(None)`.
    Eof,
    /// The transport ended inside a header or length varint.
    UnexpectedEof,
    /// A varint had no terminator within the 10-byte limit.
    Overflow,
    /// The transport ended inside a payload.
    ShortRead {
        /// Payload length announced by the frame.
        expected: usize,
        /// Bytes actually read before EOF.
        got: usize,
    },
    /// Transport-level I/O failure.
    Io(io::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Eof => write!(f, "end of stream"),
            WireError::UnexpectedEof => write!(f, "stream ended mid-frame"),
            WireError::Overflow => write!(f, "varint overflows 64 bits"),
            WireError::ShortRead { expected, got } => {
                write!(f, "payload cut short: expected {expected} bytes, got {got}")
            }
            WireError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        WireError::Io(e)
    }
}
