use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::addr::PeerAddr;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::frame::{StreamId, Tag};
use crate::pool::PooledBuf;
use crate::session::SessionShared;

/// Inbound buffer queue: single producer (the session's read loop), single
/// consumer (the task inside `Stream::read`).
struct Inbound {
    queue: VecDeque<PooledBuf>,
    /// Remote sent Close: EOF once the queue drains.
    closed: bool,
}

/// Consumer-side cursor over the front inbound buffer.
struct ReadState {
    /// Partially-consumed front buffer; storage returns to the pool when
    /// it is dropped.
    extra: Option<PooledBuf>,
    pos: usize,
}

/// Close/remote-close bookkeeping. Held only for short critical sections,
/// never across I/O.
struct ClState {
    remote_closed: bool,
}

pub(crate) struct StreamShared {
    id: StreamId,
    name: Option<String>,
    session: Arc<SessionShared>,

    inbound: Mutex<Inbound>,
    data_avail: Notify,
    space_avail: Notify,
    read_state: tokio::sync::Mutex<ReadState>,

    cl: Mutex<ClState>,
    /// Fired on reset, local or remote.
    reset: CancellationToken,
    /// Fired when the local write side closes; reset fires this too.
    closed_local: CancellationToken,

    read_deadline: Deadline,
    write_deadline: Deadline,
}

/// A logical, ordered, reliable byte channel within a session.
///
/// Handles are cheap to clone and share state; concurrent `read` calls are
/// serialized against each other, everything else may run concurrently.
#[derive(Clone)]
pub struct Stream {
    pub(crate) shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn new(id: StreamId, name: Option<String>, session: Arc<SessionShared>) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                id,
                name,
                session,
                inbound: Mutex::new(Inbound {
                    queue: VecDeque::new(),
                    closed: false,
                }),
                data_avail: Notify::new(),
                space_avail: Notify::new(),
                read_state: tokio::sync::Mutex::new(ReadState {
                    extra: None,
                    pos: 0,
                }),
                cl: Mutex::new(ClState {
                    remote_closed: false,
                }),
                reset: CancellationToken::new(),
                closed_local: CancellationToken::new(),
                read_deadline: Deadline::new(),
                write_deadline: Deadline::new(),
            }),
        }
    }

    /// Stream identity within the session.
    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Name carried in the `NewStream` frame, if any.
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Whether the stream has reached a terminal state (fully closed or
    /// reset).
    pub fn is_closed(&self) -> bool {
        let shared = &self.shared;
        shared.reset.is_cancelled()
            || (shared.closed_local.is_cancelled() && shared.cl.lock().remote_closed)
    }

    pub fn local_addr(&self) -> PeerAddr {
        self.shared.session.local_addr
    }

    pub fn remote_addr(&self) -> PeerAddr {
        self.shared.session.remote_addr
    }

    /// Read at least one byte into `buf`.
    ///
    /// Blocks until data is available, the read deadline expires
    /// (`Timeout`), the remote half-close drains (`Eof`), or the stream is
    /// reset (`Reset`). Never returns `Ok(0)` for a non-empty `buf`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let shared = &self.shared;
        let mut state = shared.read_state.lock().await;
        if shared.reset.is_cancelled() {
            // Late buffer returns: anything half-consumed or still queued
            // goes back to the pool before the error surfaces.
            state.extra = None;
            state.pos = 0;
            shared.drain_inbound();
            return Err(Error::Reset);
        }
        if state.extra.is_none() {
            state.extra = Some(shared.wait_for_data().await?);
            state.pos = 0;
        }
        let mut n = 0;
        while n < buf.len() {
            let Some(extra) = state.extra.take() else {
                break;
            };
            let take = (extra.len() - state.pos).min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&extra[state.pos..state.pos + take]);
            n += take;
            state.pos += take;
            if state.pos == extra.len() {
                // Fully consumed: the storage returns to the pool and the
                // next queued buffer is preloaded without blocking.
                drop(extra);
                state.extra = shared.preload();
                state.pos = 0;
            } else {
                state.extra = Some(extra);
            }
        }
        trace!("stream {} read {} bytes", shared.id.num, n);
        Ok(n)
    }

    /// Write all of `buf`, fragmenting into frames of at most the
    /// configured maximum message size.
    ///
    /// A short count signals an error on a later fragment; the next call
    /// surfaces it. An error on the first fragment is returned directly:
    /// `ClosedLocal` after a local close, `Timeout` on the write deadline,
    /// `Reset` when the stream or session went down mid-write.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let shared = &self.shared;
        let max = shared.session.config.max_message_size;
        let mut written = 0;
        while written < buf.len() {
            let end = usize::min(written + max, buf.len());
            if let Err(e) = shared.write_chunk(&buf[written..end]).await {
                if written == 0 {
                    return Err(e);
                }
                debug!(
                    "short write on stream {}: {} of {} bytes before {}",
                    shared.id.num,
                    written,
                    buf.len(),
                    e
                );
                return Ok(written);
            }
            written = end;
        }
        Ok(written)
    }

    /// Close the write side gracefully.
    ///
    /// Sends a `Close` frame (bounded by the reset-stream timeout) and
    /// blocks further writes; reads keep draining until `Eof`. Idempotent.
    /// A send failure outside session shutdown kills the session, since a
    /// half-written control frame would desynchronize the peer.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed_local.is_cancelled() {
            return Ok(());
        }

        let header = shared.id.header(Tag::Close);
        let cancel = CancellationToken::new();
        let send = shared
            .session
            .writer
            .send(header, Bytes::new(), cancel.clone());
        tokio::pin!(send);
        let sent = tokio::select! {
            result = &mut send => result,
            _ = tokio::time::sleep(shared.session.config.reset_stream_timeout) => {
                cancel.cancel();
                Err(Error::Timeout)
            }
            _ = shared.session.shutdown.cancelled() => {
                cancel.cancel();
                Err(Error::SessionClosed)
            }
        };

        if shared.closed_local.is_cancelled() {
            // Lost the race against a concurrent close or reset.
            return Ok(());
        }
        let remote = shared.cl.lock().remote_closed;
        shared.closed_local.cancel();
        if remote {
            shared.cancel_deadlines();
            shared.session.remove_stream(shared.id);
        }
        debug!("stream {} closed locally", shared.id.num);

        if let Err(e) = sent {
            if !shared.session.shutdown.is_cancelled() {
                tracing::error!(
                    "closing stream {} failed: {}; shutting down session",
                    shared.id.num,
                    e
                );
                shared.session.shutdown.cancel();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Terminate the stream immediately in both directions.
    ///
    /// Pending and future operations return `Reset`; queued inbound
    /// buffers return to the pool. The `Reset` frame is emitted
    /// fire-and-forget so this never blocks on the transport. Idempotent,
    /// and a no-op on a fully closed stream.
    pub fn reset(&self) -> Result<()> {
        self.shared.reset_inner(true);
        Ok(())
    }

    /// Set both deadlines. `None` disables them.
    ///
    /// Rejected with `StreamClosed` once the stream is fully closed; a
    /// half-closed side is skipped.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let shared = &self.shared;
        let cl = shared.cl.lock();
        let local_closed = shared.closed_local.is_cancelled();
        if cl.remote_closed && local_closed {
            return Err(Error::StreamClosed);
        }
        if !cl.remote_closed {
            shared.read_deadline.set(deadline);
        }
        if !local_closed {
            shared.write_deadline.set(deadline);
        }
        Ok(())
    }

    /// Set the read deadline; `StreamClosed` once the remote side closed.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let shared = &self.shared;
        let cl = shared.cl.lock();
        if cl.remote_closed {
            return Err(Error::StreamClosed);
        }
        shared.read_deadline.set(deadline);
        Ok(())
    }

    /// Set the write deadline; `StreamClosed` once the local side closed.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let shared = &self.shared;
        let _cl = shared.cl.lock();
        if shared.closed_local.is_cancelled() {
            return Err(Error::StreamClosed);
        }
        shared.write_deadline.set(deadline);
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("num", &self.shared.id.num)
            .field("initiator", &self.shared.id.initiator)
            .field("name", &self.shared.name)
            .finish()
    }
}

impl StreamShared {
    /// Pop the next inbound buffer, blocking until data, EOF, deadline, or
    /// reset.
    async fn wait_for_data(&self) -> Result<PooledBuf> {
        loop {
            let notified = self.data_avail.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inbound = self.inbound.lock();
                if let Some(buf) = inbound.queue.pop_front() {
                    drop(inbound);
                    self.space_avail.notify_one();
                    return Ok(buf);
                }
                if inbound.closed {
                    return Err(Error::Eof);
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.reset.cancelled() => {
                    self.drain_inbound();
                    return Err(Error::Reset);
                }
                _ = self.read_deadline.expired() => return Err(Error::Timeout),
            }
        }
    }

    /// Pop the next inbound buffer without blocking.
    fn preload(&self) -> Option<PooledBuf> {
        let buf = self.inbound.lock().queue.pop_front();
        if buf.is_some() {
            self.space_avail.notify_one();
        }
        buf
    }

    /// Return every queued inbound buffer to the pool.
    fn drain_inbound(&self) {
        let mut inbound = self.inbound.lock();
        if !inbound.queue.is_empty() {
            trace!(
                "stream {} dropping {} undelivered buffers",
                self.id.num,
                inbound.queue.len()
            );
            inbound.queue.clear();
        }
    }

    async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
        if self.closed_local.is_cancelled() {
            return Err(self.write_closed_error());
        }
        let header = self.id.header(Tag::Message);
        let cancel = CancellationToken::new();
        let send = self
            .session
            .writer
            .send(header, Bytes::copy_from_slice(chunk), cancel.clone());
        tokio::pin!(send);
        tokio::select! {
            result = &mut send => result,
            _ = self.write_deadline.expired() => {
                cancel.cancel();
                Err(Error::Timeout)
            }
            _ = self.closed_local.cancelled() => {
                cancel.cancel();
                Err(self.write_closed_error())
            }
            _ = self.session.shutdown.cancelled() => {
                cancel.cancel();
                Err(Error::Reset)
            }
        }
    }

    fn write_closed_error(&self) -> Error {
        if self.reset.is_cancelled() {
            Error::Reset
        } else {
            Error::ClosedLocal
        }
    }

    fn cancel_deadlines(&self) {
        self.read_deadline.set(None);
        self.write_deadline.set(None);
    }

    /// Common reset path for local resets, remote resets, and session
    /// teardown. Returns whether this call performed the transition.
    pub(crate) fn reset_inner(&self, send_frame: bool) -> bool {
        {
            let mut cl = self.cl.lock();
            if self.reset.is_cancelled() {
                return false;
            }
            if send_frame && cl.remote_closed && self.closed_local.is_cancelled() {
                // Fully closed streams have nothing left to reset.
                return false;
            }
            cl.remote_closed = true;
            self.reset.cancel();
            self.closed_local.cancel();
        }
        self.cancel_deadlines();
        self.drain_inbound();
        self.session.remove_stream(self.id);
        if send_frame {
            self.session.send_reset_frame(self.id);
        }
        debug!("stream {} reset", self.id.num);
        true
    }

    /// Queue an inbound data buffer, waiting for space (backpressure).
    ///
    /// Returns `false` when the buffer was discarded because the stream
    /// reset, the remote side had already closed, or the session shut down.
    pub(crate) async fn push_data(&self, buf: PooledBuf, shutdown: &CancellationToken) -> bool {
        loop {
            let notified = self.space_avail.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inbound = self.inbound.lock();
                if self.reset.is_cancelled() || inbound.closed {
                    return false;
                }
                if inbound.queue.len() < self.session.config.inbound_queue_depth {
                    inbound.queue.push_back(buf);
                    drop(inbound);
                    self.data_avail.notify_one();
                    return true;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.reset.cancelled() => return false,
                _ = shutdown.cancelled() => return false,
            }
        }
    }

    /// Remote half-close: EOF once the queue drains; drop the table entry
    /// when the local side is closed too.
    pub(crate) fn handle_remote_close(&self) {
        self.inbound.lock().closed = true;
        self.data_avail.notify_waiters();
        let remove = {
            let mut cl = self.cl.lock();
            cl.remote_closed = true;
            self.closed_local.is_cancelled()
        };
        if remove {
            self.cancel_deadlines();
            self.session.remove_stream(self.id);
        }
        debug!("stream {} closed by peer", self.id.num);
    }

    pub(crate) fn handle_remote_reset(&self) {
        self.reset_inner(false);
    }
}
