// Integration tests over in-memory duplex transports

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytemux::frame::{read_frame, split_header};
use bytemux::{BufferPool, Config, Error, FrameKind, Role, Session};
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::timeout;

/// Upper bound on any single wait in these tests.
const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info,bytemux=trace")
        .try_init();
}

fn session_pair_with(config: Config) -> (Session, Session) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        Session::with_config(a, Role::Client, config.clone()),
        Session::with_config(b, Role::Server, config),
    )
}

fn session_pair() -> (Session, Session) {
    session_pair_with(Config::default())
}

/// Poll until `cond` holds or the wait budget runs out.
async fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_echo_roundtrip() {
    init_tracing();
    let (client, server) = session_pair();

    let outbound = client.open_named("echo").await.unwrap();
    outbound.write(b"hello world").await.unwrap();

    let inbound = timeout(WAIT, server.accept()).await.unwrap().unwrap();
    assert_eq!(inbound.name(), Some("echo"));

    let mut buf = [0u8; 32];
    let n = timeout(WAIT, inbound.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"hello world");
    inbound.write(&buf[..n]).await.unwrap();

    let n = timeout(WAIT, outbound.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"hello world");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_write_fragmentation_on_wire() {
    init_tracing();
    let config = Config {
        max_message_size: 16,
        ..Config::default()
    };
    let (a, mut raw) = tokio::io::duplex(64 * 1024);
    let session = Session::with_config(a, Role::Client, config);

    let stream = session.open_named("frag").await.unwrap();
    let data: Vec<u8> = (0u8..50).collect();
    assert_eq!(stream.write(&data).await.unwrap(), 50);

    let pool = BufferPool::new(64);
    // First the NewStream frame...
    let (header, payload) = read_frame(&mut raw, &pool, 1024).await.unwrap();
    let (id, kind) = split_header(header).unwrap();
    assert_eq!(kind, FrameKind::NewStream);
    assert_eq!(id.num, 0);
    assert_eq!(&payload[..], b"frag");

    // ...then exactly ceil(50/16) = 4 message frames of 16/16/16/2 bytes.
    let mut received = Vec::new();
    for expected in [16usize, 16, 16, 2] {
        let (header, payload) = read_frame(&mut raw, &pool, 1024).await.unwrap();
        let (_, kind) = split_header(header).unwrap();
        assert_eq!(kind, FrameKind::Message);
        assert_eq!(payload.len(), expected);
        received.extend_from_slice(&payload);
    }
    assert_eq!(received, data);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_fragmented_transfer_roundtrip() {
    init_tracing();
    let config = Config {
        max_message_size: 16,
        ..Config::default()
    };
    let (client, server) = session_pair_with(config);

    let outbound = client.open().await.unwrap();
    let inbound = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    let data: Vec<u8> = (0u8..50).collect();
    assert_eq!(outbound.write(&data).await.unwrap(), 50);

    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    while received.len() < data.len() {
        let n = timeout(WAIT, inbound.read(&mut buf)).await.unwrap().unwrap();
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, data);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_read_deadline_timeout_and_recovery() {
    init_tracing();
    let (client, server) = session_pair();
    let outbound = client.open().await.unwrap();
    let inbound = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    outbound
        .set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(50)))
        .unwrap();
    let start = std::time::Instant::now();
    let mut buf = [0u8; 8];
    let result = timeout(WAIT, outbound.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Err(Error::Timeout)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");

    // The stream stays usable once the deadline is cleared.
    outbound.set_read_deadline(None).unwrap();
    inbound.write(&[7u8]).await.unwrap();
    let n = timeout(WAIT, outbound.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], &[7u8]);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_write_deadline_times_out() {
    init_tracing();
    // A tiny pipe with no reader: the writer task stalls mid-frame and the
    // submitter's deadline fires.
    let (a, raw) = tokio::io::duplex(64);
    let client = Session::new(a, Role::Client);
    let stream = client.open().await.unwrap();

    stream
        .set_write_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(50)))
        .unwrap();
    let result = timeout(WAIT, stream.write(&vec![0u8; 512 * 1024]))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Timeout)));

    drop(raw);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_reset_drops_pending_data() {
    init_tracing();
    let (client, server) = session_pair();
    let outbound = client.open().await.unwrap();
    let inbound = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    outbound.write(&[1u8; 10]).await.unwrap();
    // Let the data land in the acceptor's queue before resetting.
    wait_for(|| server.pool().outstanding() > 0).await;

    inbound.reset().unwrap();
    let mut buf = [0u8; 16];
    let result = timeout(WAIT, inbound.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Err(Error::Reset)));

    // The initiator learns about the reset within one round trip.
    let result = timeout(WAIT, outbound.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Err(Error::Reset)));

    // Every enqueued buffer went back to the pool, and both tables are empty.
    assert_eq!(server.pool().outstanding(), 0);
    assert_eq!(server.stream_count(), 0);
    wait_for(|| client.stream_count() == 0).await;

    // Anything after a reset is a no-op or another Reset.
    assert!(inbound.reset().is_ok());
    assert!(matches!(inbound.write(b"x").await, Err(Error::Reset)));
    assert!(matches!(outbound.write(b"x").await, Err(Error::Reset)));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_close_converges_in_either_order() {
    init_tracing();
    for initiator_first in [true, false] {
        let (client, server) = session_pair();
        let outbound = client.open().await.unwrap();
        let inbound = timeout(WAIT, server.accept()).await.unwrap().unwrap();

        let mut buf = [0u8; 4];
        if initiator_first {
            outbound.close().await.unwrap();
            assert!(matches!(outbound.write(b"x").await, Err(Error::ClosedLocal)));
            let result = timeout(WAIT, inbound.read(&mut buf)).await.unwrap();
            assert!(matches!(result, Err(Error::Eof)));
            inbound.close().await.unwrap();
        } else {
            inbound.close().await.unwrap();
            let result = timeout(WAIT, outbound.read(&mut buf)).await.unwrap();
            assert!(matches!(result, Err(Error::Eof)));
            outbound.close().await.unwrap();
        }

        // Close twice is a no-op.
        outbound.close().await.unwrap();
        inbound.close().await.unwrap();

        wait_for(|| client.stream_count() == 0 && server.stream_count() == 0).await;
        assert!(outbound.is_closed());
        assert!(inbound.is_closed());

        client.close().await.unwrap();
        server.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_half_close_drains_pending_data() {
    init_tracing();
    let (client, server) = session_pair();
    let outbound = client.open().await.unwrap();
    let inbound = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    outbound.write(b"parting words").await.unwrap();
    outbound.close().await.unwrap();

    // The acceptor still drains everything queued before EOF.
    let mut buf = [0u8; 32];
    let n = timeout(WAIT, inbound.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"parting words");
    let result = timeout(WAIT, inbound.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Err(Error::Eof)));

    // The half-closed stream still carries data the other way.
    inbound.write(b"reply").await.unwrap();
    let n = timeout(WAIT, outbound.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"reply");

    inbound.close().await.unwrap();
    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_streams() {
    init_tracing();
    const STREAMS: usize = 200;
    const PAYLOAD: usize = 1024;

    let (client, server) = session_pair();
    let (client, server) = (Arc::new(client), Arc::new(server));

    let acceptor = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut tasks = Vec::new();
            for _ in 0..STREAMS {
                let stream = server.accept().await.unwrap();
                tasks.push(tokio::spawn(async move {
                    let mut buf = vec![0u8; PAYLOAD];
                    let mut n = 0;
                    while n < PAYLOAD {
                        n += stream.read(&mut buf[n..]).await.unwrap();
                    }
                    stream.write(&buf).await.unwrap();
                    let mut scratch = [0u8; 1];
                    match stream.read(&mut scratch).await {
                        Err(Error::Eof) => {}
                        other => panic!("expected EOF, got {other:?}"),
                    }
                    stream.close().await.unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
        })
    };

    let mut tasks = Vec::new();
    for i in 0..STREAMS {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let stream = client.open_named(format!("s{i}")).await.unwrap();
            let payload = vec![i as u8; PAYLOAD];
            stream.write(&payload).await.unwrap();
            let mut buf = vec![0u8; PAYLOAD];
            let mut n = 0;
            while n < PAYLOAD {
                n += stream.read(&mut buf[n..]).await.unwrap();
            }
            assert_eq!(buf, payload);
            stream.close().await.unwrap();
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
    }
    timeout(Duration::from_secs(30), acceptor)
        .await
        .unwrap()
        .unwrap();

    wait_for(|| client.stream_count() == 0 && server.stream_count() == 0).await;
    assert_eq!(client.pool().outstanding(), 0);
    assert_eq!(server.pool().outstanding(), 0);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_random_chunk_concatenation() {
    init_tracing();
    let (client, server) = session_pair();
    let outbound = client.open().await.unwrap();
    let inbound = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    let mut rng = rand::thread_rng();
    let total: usize = 64 * 1024;
    let data: Vec<u8> = (0..total).map(|_| rng.gen()).collect();
    let chunks: Vec<usize> = {
        let mut chunks = Vec::new();
        let mut left = total;
        while left > 0 {
            let chunk = rng.gen_range(1..=4096usize.min(left));
            chunks.push(chunk);
            left -= chunk;
        }
        chunks
    };

    let writer = {
        let data = data.clone();
        tokio::spawn(async move {
            let mut off = 0;
            for chunk in chunks {
                assert_eq!(outbound.write(&data[off..off + chunk]).await.unwrap(), chunk);
                off += chunk;
            }
            outbound.close().await.unwrap();
        })
    };

    let mut received = Vec::with_capacity(total);
    let mut buf = vec![0u8; 8192];
    loop {
        match timeout(WAIT, inbound.read(&mut buf)).await.unwrap() {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(Error::Eof) => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(received, data);
    writer.await.unwrap();

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_oversized_frame_kills_session() {
    init_tracing();
    let (a, mut raw) = tokio::io::duplex(64 * 1024);
    let session = Session::new(a, Role::Client);

    let stream = session.open_named("victim").await.unwrap();

    // Drain the NewStream frame, then inject a frame whose claimed length
    // exceeds the limit.
    let pool = BufferPool::new(64);
    let _ = read_frame(&mut raw, &pool, 1 << 20).await.unwrap();
    let mut poisoned = test_varint(2);
    poisoned.extend(test_varint(1024 * 1024 + 1));
    raw.write_all(&poisoned).await.unwrap();

    let mut buf = [0u8; 4];
    let result = timeout(WAIT, stream.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Err(Error::Reset)));
    assert!(matches!(session.open().await, Err(Error::SessionClosed)));
    assert!(matches!(session.accept().await, Err(Error::SessionClosed)));
    assert!(session.is_closed());
    assert_eq!(session.stream_count(), 0);
}

#[tokio::test]
async fn test_transport_eof_resets_streams() {
    init_tracing();
    let (a, raw) = tokio::io::duplex(64 * 1024);
    let session = Session::new(a, Role::Client);
    let stream = session.open().await.unwrap();

    drop(raw);

    let mut buf = [0u8; 4];
    let result = timeout(WAIT, stream.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Err(Error::Reset)));
    wait_for(|| session.is_closed()).await;
    assert!(matches!(session.accept().await, Err(Error::SessionClosed)));
}

#[tokio::test]
async fn test_accept_queue_overflow_resets_stream() {
    init_tracing();
    let config = Config {
        accept_queue_depth: 1,
        ..Config::default()
    };
    let (client, server) = session_pair_with(config);

    let first = client.open().await.unwrap();
    let second = client.open().await.unwrap();

    // The second stream overflows the accept queue and is reset remotely.
    let mut buf = [0u8; 4];
    let result = timeout(WAIT, second.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Err(Error::Reset)));

    // The first one is still deliverable.
    let accepted = timeout(WAIT, server.accept()).await.unwrap().unwrap();
    assert_eq!(accepted.id().num, first.id().num);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_deadline_rejected_on_closed_side() {
    init_tracing();
    let (client, server) = session_pair();
    let outbound = client.open().await.unwrap();
    let inbound = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    outbound.close().await.unwrap();
    assert!(matches!(
        outbound.set_write_deadline(Some(tokio::time::Instant::now())),
        Err(Error::StreamClosed)
    ));
    // The read side is still open on the closing end.
    outbound.set_read_deadline(None).unwrap();

    // Once the close arrives, the acceptor's read side rejects deadlines.
    wait_for(|| matches!(inbound.set_read_deadline(None), Err(Error::StreamClosed))).await;
    inbound.set_write_deadline(None).unwrap();

    inbound.close().await.unwrap();
    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_session_close_idempotent() {
    init_tracing();
    let (client, server) = session_pair();
    let stream = client.open().await.unwrap();

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert!(matches!(client.open().await, Err(Error::SessionClosed)));
    let mut buf = [0u8; 1];
    assert!(matches!(stream.read(&mut buf).await, Err(Error::Reset)));
    assert!(matches!(stream.write(b"x").await, Err(Error::Reset)));
    assert_eq!(client.stream_count(), 0);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_virtual_addresses_over_duplex() {
    init_tracing();
    let (client, server) = session_pair();
    assert_eq!(client.local_addr().to_string(), "bytemux:local");
    assert_eq!(client.remote_addr().to_string(), "bytemux:remote");
    assert_eq!(server.local_addr().to_string(), "bytemux:local");

    let stream = client.open().await.unwrap();
    assert_eq!(stream.local_addr().to_string(), "bytemux:local");
    assert_eq!(stream.remote_addr().to_string(), "bytemux:remote");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Frame atomicity: no frame is ever interleaved with another on the wire.
// ---------------------------------------------------------------------------

/// Transport wrapper that records the byte chunks of every write call.
struct RecordingTransport {
    inner: DuplexStream,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl AsyncRead for RecordingTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RecordingTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.writes.lock().push(buf[..*n].to_vec());
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl bytemux::Transport for RecordingTransport {}

fn test_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn parse_test_varint(buf: &[u8]) -> (u64, usize) {
    let mut value = 0u64;
    let mut shift = 0;
    for (i, byte) in buf.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return (value, i + 1);
        }
        shift += 7;
    }
    panic!("truncated varint");
}

/// Every recorded write call must contain exactly one complete frame.
fn assert_one_frame(chunk: &[u8]) {
    let (_, header_len) = parse_test_varint(chunk);
    let (payload_len, len_len) = parse_test_varint(&chunk[header_len..]);
    assert_eq!(
        chunk.len(),
        header_len + len_len + payload_len as usize,
        "write does not align with a frame boundary"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_frames_never_interleave_on_wire() {
    init_tracing();
    let (a, b) = tokio::io::duplex(1024 * 1024);
    let writes = Arc::new(Mutex::new(Vec::new()));
    let recording = RecordingTransport {
        inner: a,
        writes: writes.clone(),
    };
    let client = Session::new(recording, Role::Client);
    let server = Session::new(b, Role::Server);

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let stream = client.open_named(format!("w{i}")).await.unwrap();
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                stream.write(&vec![i; 100]).await.unwrap();
            }
        }));
    }
    for task in tasks {
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    let writes = writes.lock();
    assert!(writes.len() >= 8 * 21, "expected one write per frame");
    for chunk in writes.iter() {
        assert_one_frame(chunk);
    }
    drop(writes);

    client.close().await.unwrap();
    server.close().await.unwrap();
}
