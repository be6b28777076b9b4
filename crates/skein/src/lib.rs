#![deny(unsafe_code)]

//! mplex-style stream multiplexing.
//!
//! A [`Multiplex`] layers many independent bidirectional byte streams onto a
//! single reliable ordered transport (anything `AsyncRead + AsyncWrite`).
//! Frames are varint-framed ([`skein_wire`]); stream ids are assigned with
//! role-based parity so both sides can open streams without coordination.
//!
//! ```ignore
//! let mux = Multiplex::new(transport, Role::Initiator);
//! let serving = tokio::spawn({
//!     let mux = mux.clone();
//!     async move { mux.serve(|stream| async move { /* accepted stream */ }).await }
//! });
//! let mut stream = mux.new_named_stream("greet").await?;
//! stream.write(b"hi").await?;
//! ```
//!
//! One task owns all transport writes (frame atomicity), one loop owns all
//! transport reads (per-stream delivery order equals wire order). Per-stream
//! inboxes are bounded; a stalled consumer stalls the inbound direction,
//! which is the only back-pressure mechanism.

mod errors;
mod mux;
mod stream;
mod types;

pub use errors::{MuxError, StreamError};
pub use mux::Multiplex;
pub use stream::Stream;
pub use types::{Role, StreamIdAllocator};

pub use skein_wire as wire;

/// Payload slices buffered per stream before the dispatch loop blocks.
pub(crate) const INBOX_CAPACITY: usize = 8;

/// Outbound queue depth between stream writers and the serializer task.
/// Bounded for writer-side back-pressure, but deep enough that the
/// non-blocking Close enqueue is not dropped whenever a data frame is still
/// queued.
pub(crate) const OUTBOUND_CAPACITY: usize = 8;
