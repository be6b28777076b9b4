//! Connection-level demultiplexer and serializer.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use skein_wire::{write_frame, Frame, FrameReader, Tag};

use crate::errors::MuxError;
use crate::stream::{Stream, StreamState};
use crate::types::{Role, StreamIdAllocator};
use crate::{INBOX_CAPACITY, OUTBOUND_CAPACITY};

/// The multiplexer's half of a stream: delivery target for inbound payloads
/// plus the shared close state.
#[derive(Clone)]
struct StreamEntry {
    state: Arc<StreamState>,
    inbox_tx: mpsc::Sender<Bytes>,
}

/// State shared between the [`Multiplex`] handle, its streams, the dispatch
/// loop and the serializer task.
pub(crate) struct MuxShared {
    role: Role,
    ids: StreamIdAllocator,
    streams: Mutex<HashMap<u64, StreamEntry>>,
    pub(crate) outbound: mpsc::Sender<Frame>,
    pub(crate) closed: CancellationToken,
    write_error: Mutex<Option<io::Error>>,
}

impl MuxShared {
    /// Build a stream plus its map entry. The caller inserts the entry; the
    /// map lock is never taken here.
    fn make_stream(self: &Arc<Self>, id: u64, name: String, local: bool) -> (Stream, StreamEntry) {
        let state = Arc::new(StreamState::new(id, name, local));
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let entry = StreamEntry {
            state: state.clone(),
            inbox_tx,
        };
        (Stream::new(state, self.clone(), inbox_rx), entry)
    }

    /// Close one stream and drop its map entry.
    pub(crate) fn close_stream(&self, state: &StreamState) {
        state.close(&self.outbound);
        self.streams.lock().unwrap().remove(&state.id);
    }

    /// Close every stream. The lock is released before the per-stream close,
    /// which enqueues on the outbound channel.
    fn close_all(&self) {
        let entries: Vec<StreamEntry> = {
            let mut streams = self.streams.lock().unwrap();
            streams.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.state.close(&self.outbound);
        }
    }

    fn store_write_error(&self, e: io::Error) {
        let mut slot = self.write_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}

/// Read and write halves of the transport plus the serializer's inlet,
/// claimed once by `serve`.
struct MuxIo<T> {
    read: ReadHalf<T>,
    write: WriteHalf<T>,
    outbound_rx: mpsc::Receiver<Frame>,
}

/// A stream multiplexer over one reliable ordered byte transport.
///
/// Cloning yields another handle to the same connection; [`serve`] may be
/// called on exactly one of them. No concurrent work starts before `serve`.
///
/// [`serve`]: Multiplex::serve
pub struct Multiplex<T> {
    shared: Arc<MuxShared>,
    io: Arc<Mutex<Option<MuxIo<T>>>>,
}

impl<T> Clone for Multiplex<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            io: self.io.clone(),
        }
    }
}

impl<T> Multiplex<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a transport. `role` fixes stream id parity: the side that opened
    /// the connection is the [`Role::Initiator`].
    pub fn new(transport: T, role: Role) -> Self {
        let (read, write) = tokio::io::split(transport);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Self {
            shared: Arc::new(MuxShared {
                role,
                ids: StreamIdAllocator::new(role),
                streams: Mutex::new(HashMap::new()),
                outbound: outbound_tx,
                closed: CancellationToken::new(),
                write_error: Mutex::new(None),
            }),
            io: Arc::new(Mutex::new(Some(MuxIo {
                read,
                write,
                outbound_rx,
            }))),
        }
    }

    /// This side's role.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Open a stream named after its id.
    pub async fn new_stream(&self) -> Result<Stream, MuxError> {
        self.new_named_stream("").await
    }

    /// Open a stream with the given name; an empty name becomes the decimal
    /// id. Waits until the serializer accepts the opening NewStream frame,
    /// so the peer can never see data for the stream before its name.
    pub async fn new_named_stream(&self, name: &str) -> Result<Stream, MuxError> {
        if self.shared.closed.is_cancelled() {
            return Err(MuxError::Closed);
        }

        let id = self.shared.ids.next();
        let name = if name.is_empty() {
            id.to_string()
        } else {
            name.to_owned()
        };

        let (stream, entry) = self.shared.make_stream(id, name.clone(), true);
        self.shared.streams.lock().unwrap().insert(id, entry);
        debug!(id, name = %name, "opening stream");

        let open = Frame::new(id, Tag::NewStream, Bytes::from(name.into_bytes()));
        let sent = tokio::select! {
            res = self.shared.outbound.send(open) => res.is_ok(),
            _ = self.shared.closed.cancelled() => false,
        };
        if !sent {
            self.shared.streams.lock().unwrap().remove(&id);
            return Err(MuxError::Closed);
        }
        Ok(stream)
    }

    /// Run the connection: spawn the serializer task, then dispatch inbound
    /// frames until the transport ends, a transport error fires, or the
    /// multiplexer is closed.
    ///
    /// `handler` is invoked in its own task for every stream the peer opens;
    /// handlers run concurrently with each other and with this loop, and a
    /// handler panic stays in its task. On return every stream has been
    /// closed. A clean peer EOF is `Ok(())`; a transport write failure in
    /// the serializer surfaces here as [`MuxError::TransportWrite`].
    pub async fn serve<H, F>(&self, handler: H) -> Result<(), MuxError>
    where
        H: Fn(Stream) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shared.closed.is_cancelled() {
            return Err(MuxError::Closed);
        }
        let MuxIo {
            read,
            write,
            outbound_rx,
        } = self
            .io
            .lock()
            .unwrap()
            .take()
            .ok_or(MuxError::ServeAlreadyRunning)?;

        let serializer = tokio::spawn(run_serializer(write, outbound_rx, self.shared.clone()));

        let served = dispatch_loop(read, &handler, &self.shared).await;

        // Tear down: wake the serializer so the write half is reclaimed,
        // then fan the close out to every stream.
        self.shared.closed.cancel();
        self.shared.close_all();
        let _ = serializer.await;

        let write_error = self.shared.write_error.lock().unwrap().take();
        match served {
            Err(e) => Err(e),
            Ok(()) => match write_error {
                Some(e) => Err(MuxError::TransportWrite(e)),
                None => Ok(()),
            },
        }
    }

    /// Close the multiplexer and every stream on it. Idempotent.
    pub fn close(&self) -> Result<(), MuxError> {
        if self.shared.closed.is_cancelled() {
            return Ok(());
        }
        debug!("closing multiplex");
        self.shared.closed.cancel();
        self.shared.close_all();
        Ok(())
    }

    /// Whether [`close`](Multiplex::close) has run or the connection ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

/// Single owner of transport writes. Frames leave the outbound channel one
/// at a time, so header, length and payload of different frames never
/// interleave. A write error is fatal: it is stored for `serve` to report
/// and the whole multiplexer is cancelled.
async fn run_serializer<T>(
    mut write: WriteHalf<T>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    shared: Arc<MuxShared>,
) where
    T: AsyncWrite,
{
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        trace!(
            stream_id = frame.stream_id(),
            tag = ?frame.tag(),
            len = frame.payload.len(),
            "frame out"
        );
        if let Err(e) = write_frame(&mut write, frame.header, &frame.payload).await {
            warn!(error = %e, "transport write failed");
            shared.store_write_error(e);
            shared.closed.cancel();
            break;
        }
    }
    let _ = write.shutdown().await;
}

/// Inbound loop: read a frame, find or create its stream, deliver.
///
/// Single-threaded by construction, so per-stream delivery order equals wire
/// order. The map lock is only ever held for lookup/insert/remove, never
/// across an await.
async fn dispatch_loop<T, H, F>(
    read: ReadHalf<T>,
    handler: &H,
    shared: &Arc<MuxShared>,
) -> Result<(), MuxError>
where
    T: AsyncRead,
    H: Fn(Stream) -> F,
    F: Future<Output = ()> + Send + 'static,
{
    let mut frames = FrameReader::new(read);
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => return Ok(()),
            next = frames.read_frame() => match next {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    trace!("transport eof");
                    return Ok(());
                }
                Err(e) => return Err(MuxError::from(e)),
            },
        };

        let id = frame.stream_id();
        let tag = frame.tag();
        trace!(stream_id = id, tag = ?tag, len = frame.payload.len(), "frame in");

        let known = shared.streams.lock().unwrap().get(&id).cloned();
        let entry = match known {
            Some(entry) => entry,
            None => {
                let name = if tag == Tag::NewStream {
                    String::from_utf8_lossy(&frame.payload).into_owned()
                } else {
                    String::new()
                };
                debug!(stream_id = id, name = %name, "peer opened stream");
                let (stream, entry) = shared.make_stream(id, name, false);
                shared.streams.lock().unwrap().insert(id, entry.clone());
                tokio::spawn(handler(stream));
                if tag == Tag::NewStream {
                    // The payload was the name; no body to deliver.
                    continue;
                }
                entry
            }
        };

        if tag == Tag::Close {
            debug!(stream_id = id, "peer closed stream");
            shared.close_stream(&entry.state);
            continue;
        }

        // Deliver into the bounded inbox. A full inbox blocks this loop —
        // and with it the whole inbound direction — until the stream's
        // consumer catches up or the stream closes.
        tokio::select! {
            res = entry.inbox_tx.send(frame.payload) => {
                let _ = res;
            }
            _ = entry.state.closed.cancelled() => {}
        }
    }
}
