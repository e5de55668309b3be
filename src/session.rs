use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::addr::{PeerAddr, Transport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::{read_frame, split_header, FrameKind, StreamId, Tag};
use crate::pool::BufferPool;
use crate::stream::Stream;
use crate::writer::{spawn_writer, WriterHandle};

/// Which side of the transport this session is.
///
/// Both endpoints number their own streams independently and the initiator
/// flag in each stream id keeps the spaces apart, so the role does not
/// affect id allocation; it feeds logging and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// State shared between the session handle, its streams, and its tasks.
pub(crate) struct SessionShared {
    pub(crate) config: Config,
    pub(crate) writer: WriterHandle,
    pub(crate) shutdown: CancellationToken,
    pub(crate) pool: BufferPool,
    pub(crate) local_addr: PeerAddr,
    pub(crate) remote_addr: PeerAddr,
    role: Role,
    channels: Mutex<HashMap<StreamId, Stream>>,
    next_id: AtomicU64,
}

impl SessionShared {
    fn insert_stream(&self, stream: Stream) {
        self.channels.lock().insert(stream.id(), stream);
    }

    fn lookup_stream(&self, id: StreamId) -> Option<Stream> {
        self.channels.lock().get(&id).cloned()
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        self.channels.lock().remove(&id);
    }

    /// Emit a reset frame without blocking the caller.
    ///
    /// Bounded by the reset-stream timeout; a failure outside shutdown
    /// kills the session, since the peer would otherwise keep the stream
    /// open forever.
    pub(crate) fn send_reset_frame(&self, id: StreamId) {
        let header = id.header(Tag::Reset);
        let writer = self.writer.clone();
        let shutdown = self.shutdown.clone();
        let timeout = self.config.reset_stream_timeout;
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let send = writer.send(header, Bytes::new(), cancel.clone());
            let failed = match tokio::time::timeout(timeout, send).await {
                Ok(Ok(())) => false,
                Ok(Err(_)) => true,
                Err(_) => {
                    cancel.cancel();
                    true
                }
            };
            if failed && !shutdown.is_cancelled() {
                error!(
                    "could not send reset frame for stream {}; shutting down session",
                    id.num
                );
                shutdown.cancel();
            }
        });
    }
}

/// A multiplexed session over one reliable byte transport.
///
/// Owns the transport, the stream table, and the read-loop and writer
/// tasks. Dropping the session shuts it down; `close` does so gracefully
/// and waits for the tasks to finish.
pub struct Session {
    shared: Arc<SessionShared>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    tasks: tokio::sync::Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Session {
    /// Create a session with default tunables.
    pub fn new<T: Transport + 'static>(transport: T, role: Role) -> Self {
        Self::with_config(transport, role, Config::default())
    }

    /// Create a session with explicit tunables.
    pub fn with_config<T: Transport + 'static>(transport: T, role: Role, config: Config) -> Self {
        let local_addr = transport
            .local_addr()
            .map(PeerAddr::Socket)
            .unwrap_or(PeerAddr::Virtual("local"));
        let remote_addr = transport
            .remote_addr()
            .map(PeerAddr::Socket)
            .unwrap_or(PeerAddr::Virtual("remote"));

        let (read_half, write_half) = tokio::io::split(transport);
        let shutdown = CancellationToken::new();
        let (writer, writer_task) =
            spawn_writer(write_half, config.write_queue_depth, shutdown.clone());
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_queue_depth);
        let pool = BufferPool::new(config.pool_buffer_size);

        let shared = Arc::new(SessionShared {
            config,
            writer,
            shutdown,
            pool,
            local_addr,
            remote_addr,
            role,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });

        let read_task = tokio::spawn(read_loop(read_half, shared.clone(), incoming_tx));
        debug!("session started, role {:?}", role);

        Self {
            shared,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            tasks: tokio::sync::Mutex::new(Some((read_task, writer_task))),
        }
    }

    /// Open a new stream with no name.
    pub async fn open(&self) -> Result<Stream> {
        self.open_inner(None).await
    }

    /// Open a new stream, carrying `name` to the peer.
    pub async fn open_named(&self, name: impl Into<String>) -> Result<Stream> {
        self.open_inner(Some(name.into())).await
    }

    async fn open_inner(&self, name: Option<String>) -> Result<Stream> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(Error::SessionClosed);
        }

        let id = StreamId {
            num: shared.next_id.fetch_add(1, Ordering::Relaxed),
            initiator: true,
        };
        let stream = Stream::new(id, name.clone(), shared.clone());
        shared.insert_stream(stream.clone());

        let payload = name
            .map(|name| Bytes::from(name.into_bytes()))
            .unwrap_or_else(Bytes::new);
        let cancel = CancellationToken::new();
        let send = shared
            .writer
            .send(id.header(Tag::NewStream), payload, cancel.clone());
        tokio::pin!(send);
        let sent = tokio::select! {
            result = &mut send => result,
            _ = shared.shutdown.cancelled() => {
                cancel.cancel();
                Err(Error::SessionClosed)
            }
        };
        if let Err(e) = sent {
            shared.remove_stream(id);
            return Err(e);
        }
        debug!("opened stream {}", id.num);
        Ok(stream)
    }

    /// Accept the next stream opened by the peer.
    pub async fn accept(&self) -> Result<Stream> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream.ok_or(Error::SessionClosed),
            _ = self.shared.shutdown.cancelled() => Err(Error::SessionClosed),
        }
    }

    /// Shut the session down: reset every stream, stop both tasks, and
    /// close the transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shared.shutdown.cancel();
        let tasks = self.tasks.lock().await.take();
        if let Some((read_task, writer_task)) = tasks {
            let _ = read_task.await;
            let _ = writer_task.await;
            debug!("session closed");
        }
        Ok(())
    }

    /// Whether the session has shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Streams currently tracked in the channel table.
    pub fn stream_count(&self) -> usize {
        self.shared.channels.lock().len()
    }

    /// The session's buffer pool, exposed for accounting.
    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Local address of the transport, or `bytemux:local`.
    pub fn local_addr(&self) -> PeerAddr {
        self.shared.local_addr
    }

    /// Remote address of the transport, or `bytemux:remote`.
    pub fn remote_addr(&self) -> PeerAddr {
        self.shared.remote_addr
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

enum ShutdownReason {
    /// Peer closed the transport.
    Eof,
    /// Codec or transport failure; framing integrity is gone.
    Fatal,
    /// Local shutdown request.
    Closed,
}

/// The session's read loop: decodes inbound frames and dispatches them to
/// streams. Runs until EOF, a fatal error, or shutdown, then performs the
/// shutdown cascade exactly once.
async fn read_loop<R>(mut reader: R, shared: Arc<SessionShared>, incoming: mpsc::Sender<Stream>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let reason = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, &shared.pool, shared.config.max_message_size) => frame,
            _ = shared.shutdown.cancelled() => break ShutdownReason::Closed,
        };
        let (header, payload) = match frame {
            Ok(frame) => frame,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                break ShutdownReason::Eof;
            }
            Err(e) => {
                error!("failed to read frame: {}", e);
                break ShutdownReason::Fatal;
            }
        };
        let (id, kind) = match split_header(header) {
            Ok(split) => split,
            Err(e) => {
                error!("{}", e);
                break ShutdownReason::Fatal;
            }
        };
        trace!("frame {:?} for stream {}", kind, id.num);

        match kind {
            FrameKind::NewStream => {
                let name = if payload.is_empty() {
                    None
                } else {
                    match std::str::from_utf8(&payload) {
                        Ok(name) => Some(name.to_string()),
                        Err(_) => {
                            error!("new-stream name for {} is not valid UTF-8", id.num);
                            break ShutdownReason::Fatal;
                        }
                    }
                };
                drop(payload);
                if shared.lookup_stream(id).is_some() {
                    error!("duplicate stream id {} from peer", id.num);
                    break ShutdownReason::Fatal;
                }
                let stream = Stream::new(id, name, shared.clone());
                shared.insert_stream(stream.clone());
                match incoming.try_send(stream) {
                    Ok(()) => trace!("queued incoming stream {}", id.num),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("accept queue full, resetting incoming stream {}", id.num);
                        shared.remove_stream(id);
                        shared.send_reset_frame(id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break ShutdownReason::Closed,
                }
            }
            FrameKind::Message => {
                let Some(stream) = shared.lookup_stream(id) else {
                    // Stream already closed or reset locally.
                    trace!(
                        "dropping {} bytes for unknown stream {}",
                        payload.len(),
                        id.num
                    );
                    continue;
                };
                if payload.is_empty() {
                    continue;
                }
                // Blocks when the stream's queue is full: the transport is
                // not drained until the application catches up.
                if !stream.shared.push_data(payload, &shared.shutdown).await {
                    trace!("discarded message for stream {}", id.num);
                }
            }
            FrameKind::Close => {
                drop(payload);
                match shared.lookup_stream(id) {
                    Some(stream) => stream.shared.handle_remote_close(),
                    None => trace!("close for unknown stream {}", id.num),
                }
            }
            FrameKind::Reset => {
                drop(payload);
                match shared.lookup_stream(id) {
                    Some(stream) => stream.shared.handle_remote_reset(),
                    None => trace!("reset for unknown stream {}", id.num),
                }
            }
        }
    };

    // Shutdown cascade. Runs once, whatever ended the loop: every live
    // stream is reset (buffers back to the pool, waiters woken) and the
    // accept queue closes when `incoming` drops.
    shared.shutdown.cancel();
    let streams: Vec<Stream> = {
        let mut channels = shared.channels.lock();
        channels.drain().map(|(_, stream)| stream).collect()
    };
    for stream in &streams {
        stream.shared.reset_inner(false);
    }
    match reason {
        ShutdownReason::Eof => debug!("transport closed by peer, session shut down"),
        ShutdownReason::Fatal => error!("session shut down after protocol or I/O failure"),
        ShutdownReason::Closed => debug!("session shutdown requested"),
    }
}

#[cfg(test)]
impl SessionShared {
    /// Minimal shared state for driving a stream without a peer session:
    /// a live writer task over one end of a duplex pipe, no read loop.
    /// The returned peer end keeps the transport alive.
    pub(crate) fn stub() -> (Arc<Self>, tokio::io::DuplexStream) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let shutdown = CancellationToken::new();
        let (_read_half, write_half) = tokio::io::split(local);
        let config = Config::default();
        let (writer, _task) = spawn_writer(write_half, config.write_queue_depth, shutdown.clone());
        let shared = Arc::new(SessionShared {
            config,
            writer,
            shutdown,
            pool: BufferPool::new(1024),
            local_addr: PeerAddr::Virtual("local"),
            remote_addr: PeerAddr::Virtual("remote"),
            role: Role::Client,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });
        (shared, peer)
    }
}
