//! Single-writer discipline over the transport.
//!
//! All outbound frames funnel through one dedicated task that owns the
//! transport's write half, so frames are never interleaved on the wire.
//! Submitters wait on a completion channel and can abandon the wait; a
//! request is only skipped if its cancel token fires before emission
//! starts. Once emission has begun, submitter cancellation cannot tear
//! the frame: the write runs to completion. The one exception is session
//! shutdown, which abandons an in-flight frame, possibly mid-write; that
//! is safe only because a shut-down transport is never written again.
//!
//! A transport-level write error likewise kills the session: after a
//! partial frame the transport cannot be reused.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::frame::encode_frame;

/// One frame queued for emission.
struct WriteRequest {
    header: u64,
    payload: Bytes,
    /// Fulfilled once the frame is fully on the wire.
    done: Option<oneshot::Sender<Result<()>>>,
    /// Checked before emission starts; a fired token drops the request.
    cancel: CancellationToken,
}

/// Cheaply cloneable handle for submitting frames to the writer task.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Submit a frame and wait until it has been written.
    ///
    /// Cancelling `cancel` lets the writer drop the request if emission has
    /// not started; callers race this future against their own deadline and
    /// closure signals and fire the token when abandoning the wait.
    pub async fn send(&self, header: u64, payload: Bytes, cancel: CancellationToken) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let request = WriteRequest {
            header,
            payload,
            done: Some(done_tx),
            cancel,
        };
        if self.tx.send(request).await.is_err() {
            return Err(Error::SessionClosed);
        }
        match done_rx.await {
            Ok(result) => result,
            // The writer dropped the request: it shut down, or the request
            // was cancelled and nobody is left to care about the outcome.
            Err(_) => Err(Error::SessionClosed),
        }
    }
}

/// Spawn the writer task over the transport's write half.
pub(crate) fn spawn_writer<W>(
    writer: W,
    queue_depth: usize,
    shutdown: CancellationToken,
) -> (WriterHandle, JoinHandle<()>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(queue_depth);
    let task = tokio::spawn(writer_loop(rx, writer, shutdown));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<WriteRequest>,
    mut writer: W,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let mut request = tokio::select! {
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        if request.cancel.is_cancelled() {
            trace!("dropping cancelled frame, header={}", request.header);
            continue;
        }

        let frame = encode_frame(request.header, &request.payload);
        let emit = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        tokio::pin!(emit);
        let result = tokio::select! {
            result = &mut emit => result,
            // A frame abandoned here may be torn, but shutdown means the
            // transport is never used again.
            _ = shutdown.cancelled() => {
                if let Some(done) = request.done.take() {
                    let _ = done.send(Err(Error::SessionClosed));
                }
                break;
            }
        };

        match result {
            Ok(()) => {
                if let Some(done) = request.done.take() {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                error!("transport write failed: {}; shutting down session", e);
                if let Some(done) = request.done.take() {
                    let _ = done.send(Err(Error::Io(e)));
                }
                shutdown.cancel();
                break;
            }
        }
    }

    // Fail pending submitters instead of leaving them parked.
    rx.close();
    while let Ok(request) = rx.try_recv() {
        if let Some(done) = request.done {
            let _ = done.send(Err(Error::SessionClosed));
        }
    }
    let _ = writer.shutdown().await;
}
