//! One multiplexed stream: inbox, residual buffer, write path, close state.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use skein_wire::{header, Frame, Tag};

use crate::errors::StreamError;
use crate::mux::MuxShared;

/// State shared between a [`Stream`] handle and the multiplexer's entry for
/// it: identity, the precomputed data-frame header, and the close latch.
pub(crate) struct StreamState {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) header: u64,
    pub(crate) closed: CancellationToken,
    close_sent: AtomicBool,
}

impl StreamState {
    pub(crate) fn new(id: u64, name: String, local: bool) -> Self {
        // Data we send flows toward the peer: tag 2 if we opened the stream,
        // tag 1 if the peer did.
        let tag = if local { Tag::Initiator } else { Tag::Receiver };
        Self {
            id,
            name,
            header: header(id, tag),
            closed: CancellationToken::new(),
            close_sent: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close once: latch the token and best-effort enqueue a Close frame.
    ///
    /// The frame is dropped if the serializer is not ready to take it.
    pub(crate) fn close(&self, outbound: &mpsc::Sender<Frame>) {
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        let _ = outbound.try_send(Frame::new(self.id, Tag::Close, Bytes::new()));
    }
}

type PendingWrite = Pin<Box<dyn Future<Output = Result<usize, StreamError>> + Send + 'static>>;

/// A bidirectional byte stream multiplexed over the parent connection.
///
/// Reads drain payload frames delivered by the dispatch loop; writes forward
/// whole buffers to the connection serializer, one frame per call. Dropping
/// the stream closes it.
pub struct Stream {
    state: Arc<StreamState>,
    mux: Arc<MuxShared>,
    inbox: mpsc::Receiver<Bytes>,
    residual: Bytes,
    closed_wait: Pin<Box<WaitForCancellationFutureOwned>>,
    pending_write: Option<PendingWrite>,
}

impl Stream {
    pub(crate) fn new(
        state: Arc<StreamState>,
        mux: Arc<MuxShared>,
        inbox: mpsc::Receiver<Bytes>,
    ) -> Self {
        let closed_wait = Box::pin(state.closed.clone().cancelled_owned());
        Self {
            state,
            mux,
            inbox,
            residual: Bytes::new(),
            closed_wait,
            pending_write: None,
        }
    }

    /// Stream id, unique within the multiplexer for its lifetime.
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Stream name. Defaults to the decimal id for unnamed local streams and
    /// to the empty string for peer streams opened without a NewStream frame.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether the stream has been closed, locally or by the peer.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Read into `buf`, blocking until it is full or the stream closes.
    ///
    /// Leftover bytes from a payload larger than the remaining window are
    /// kept and drained by the next call. Once the stream is closed and
    /// everything buffered has been drained, returns whatever was read so
    /// far; `Ok(0)` is end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut filled = self.drain_residual(buf);
        if filled == buf.len() {
            return Ok(filled);
        }
        loop {
            // Payloads queued before the close are still delivered.
            match self.inbox.try_recv() {
                Ok(payload) => {
                    filled += self.accept_payload(payload, buf, filled);
                    if filled == buf.len() {
                        return Ok(filled);
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => return Ok(filled),
                Err(TryRecvError::Empty) => {}
            }
            if self.state.is_closed() {
                return Ok(filled);
            }
            let next = tokio::select! {
                payload = self.inbox.recv() => payload,
                _ = self.state.closed.cancelled() => None,
            };
            match next {
                Some(payload) => {
                    filled += self.accept_payload(payload, buf, filled);
                    if filled == buf.len() {
                        return Ok(filled);
                    }
                }
                None => return Ok(filled),
            }
        }
    }

    /// Send `buf` to the peer as a single frame.
    ///
    /// Blocks until the serializer accepts the frame or the stream closes.
    /// The payload is forwarded whole; a large buffer becomes one large
    /// frame.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        if self.state.is_closed() {
            return Err(StreamError::Closed);
        }
        let frame = Frame {
            header: self.state.header,
            payload: Bytes::copy_from_slice(buf),
        };
        let sent = tokio::select! {
            res = self.mux.outbound.send(frame) => res.is_ok(),
            _ = self.state.closed.cancelled() => false,
        };
        if sent {
            Ok(buf.len())
        } else {
            Err(StreamError::Closed)
        }
    }

    /// Close the stream. Idempotent.
    ///
    /// Signals the close latch (pending reads drain and hit end-of-stream,
    /// pending and future writes fail), best-effort enqueues a Close frame
    /// for the peer, and unregisters the stream from the multiplexer.
    pub fn close(&mut self) -> Result<(), StreamError> {
        self.mux.close_stream(&self.state);
        Ok(())
    }

    fn drain_residual(&mut self, buf: &mut [u8]) -> usize {
        if self.residual.is_empty() {
            return 0;
        }
        let n = self.residual.len().min(buf.len());
        buf[..n].copy_from_slice(&self.residual.split_to(n));
        n
    }

    /// Copy a payload into `buf[filled..]`, stashing any leftover as the
    /// residual. Only called with an empty residual.
    fn accept_payload(&mut self, mut payload: Bytes, buf: &mut [u8], filled: usize) -> usize {
        debug_assert!(self.residual.is_empty());
        let window = &mut buf[filled..];
        let n = payload.len().min(window.len());
        window[..n].copy_from_slice(&payload.split_to(n));
        if !payload.is_empty() {
            self.residual = payload;
        }
        n
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.mux.close_stream(&self.state);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .field("closed", &self.state.is_closed())
            .finish_non_exhaustive()
    }
}

fn closed_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, StreamError::Closed)
}

/// `AsyncRead` delivers per-chunk (it does not wait for a full buffer the
/// way [`Stream::read`] does); zero bytes read means end-of-stream.
impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.residual.is_empty() {
            let n = this.residual.len().min(buf.remaining());
            buf.put_slice(&this.residual.split_to(n));
            return Poll::Ready(Ok(()));
        }

        match this.inbox.poll_recv(cx) {
            Poll::Ready(Some(mut payload)) => {
                let n = payload.len().min(buf.remaining());
                buf.put_slice(&payload.split_to(n));
                if !payload.is_empty() {
                    this.residual = payload;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => {
                if this.state.is_closed() {
                    return Poll::Ready(Ok(()));
                }
                // Register for the close latch as well, so a close with an
                // idle inbox still wakes the reader for its end-of-stream.
                match this.closed_wait.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Ok(())),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Some(fut) = this.pending_write.as_mut() {
            return match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(n)) => {
                    this.pending_write = None;
                    Poll::Ready(Ok(n))
                }
                Poll::Ready(Err(_)) => {
                    this.pending_write = None;
                    Poll::Ready(Err(closed_io_error()))
                }
                Poll::Pending => Poll::Pending,
            };
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.state.is_closed() {
            return Poll::Ready(Err(closed_io_error()));
        }

        let frame = Frame {
            header: this.state.header,
            payload: Bytes::copy_from_slice(data),
        };
        let len = data.len();
        let outbound = this.mux.outbound.clone();
        let closed = this.state.closed.clone();
        let mut fut: PendingWrite = Box::pin(async move {
            tokio::select! {
                res = outbound.send(frame) => match res {
                    Ok(()) => Ok(len),
                    Err(_) => Err(StreamError::Closed),
                },
                _ = closed.cancelled() => Err(StreamError::Closed),
            }
        });

        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed_io_error())),
            Poll::Pending => {
                this.pending_write = Some(fut);
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.pending_write.as_mut() {
            Some(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(_)) => {
                    this.pending_write = None;
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Err(_)) => {
                    this.pending_write = None;
                    Poll::Ready(Err(closed_io_error()))
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        let this = self.get_mut();
        this.mux.close_stream(&this.state);
        Poll::Ready(Ok(()))
    }
}
