use std::time::Duration;

/// Default maximum payload size per frame (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default bound on emitting close and reset frames.
pub const DEFAULT_RESET_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-stream inbound queue depth, in buffers.
pub const DEFAULT_INBOUND_QUEUE_DEPTH: usize = 8;

/// Default depth of the queue of inbound streams awaiting `accept`.
pub const DEFAULT_ACCEPT_QUEUE_DEPTH: usize = 1024;

/// Default depth of the outbound frame queue feeding the writer task.
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 64;

/// Default capacity of pooled payload buffers.
pub const DEFAULT_POOL_BUFFER_SIZE: usize = 16 * 1024;

/// Session tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum payload bytes in one frame. Larger inbound frames are a
    /// protocol error; larger writes are fragmented.
    pub max_message_size: usize,

    /// How long close and reset frame emission may block before the
    /// stream gives up on the transport.
    pub reset_stream_timeout: Duration,

    /// Buffers queued per stream before the read loop stops draining the
    /// transport (backpressure).
    pub inbound_queue_depth: usize,

    /// Inbound streams held for `accept` before further `NewStream` frames
    /// are answered with a reset.
    pub accept_queue_depth: usize,

    /// Outbound frames queued to the writer task before submitters wait.
    pub write_queue_depth: usize,

    /// Capacity of recycled payload buffers.
    pub pool_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reset_stream_timeout: DEFAULT_RESET_STREAM_TIMEOUT,
            inbound_queue_depth: DEFAULT_INBOUND_QUEUE_DEPTH,
            accept_queue_depth: DEFAULT_ACCEPT_QUEUE_DEPTH,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            pool_buffer_size: DEFAULT_POOL_BUFFER_SIZE,
        }
    }
}
