use std::fmt;
use std::io;

use skein_wire::WireError;

/// Error from a single stream's read/write/close surface.
///
/// Stream errors never terminate the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The stream was closed, locally or by the peer.
    Closed,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Closed => write!(f, "stream closed"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Multiplexer-fatal error.
///
/// Anything at the transport boundary terminates the multiplexer; `serve`
/// returns the first such failure after closing every stream.
#[derive(Debug)]
pub enum MuxError {
    /// The multiplexer was closed.
    Closed,
    /// Reading from the transport failed.
    TransportRead(io::Error),
    /// Writing to the transport failed.
    TransportWrite(io::Error),
    /// The peer sent bytes that do not parse as a frame.
    Wire(WireError),
    /// `serve` was called a second time; the transport is already taken.
    ServeAlreadyRunning,
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::Closed => write!(f, "multiplex closed"),
            MuxError::TransportRead(e) => write!(f, "transport read: {e}"),
            MuxError::TransportWrite(e) => write!(f, "transport write: {e}"),
            MuxError::Wire(e) => write!(f, "frame decode: {e}"),
            MuxError::ServeAlreadyRunning => write!(f, "serve is already running"),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MuxError::TransportRead(e) | MuxError::TransportWrite(e) => Some(e),
            MuxError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for MuxError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io_err) => MuxError::TransportRead(io_err),
            other => MuxError::Wire(other),
        }
    }
}
