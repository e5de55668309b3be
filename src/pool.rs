//! Pooled payload buffers with leak accounting.
//!
//! The inbound path hands buffers from the frame decoder through a stream's
//! queue to the reading task; ownership ends when the buffer is dropped and
//! its storage returns to the free list. Release is exactly-once by
//! construction, and the acquire/release counters make leak assertions
//! cheap in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// How many idle buffers the free list retains.
const MAX_FREE_BUFFERS: usize = 128;

/// A thread-safe pool of reusable payload buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl BufferPool {
    /// Create a pool whose recycled buffers hold at least `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buffer_size,
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        }
    }

    /// Hand out a zeroed buffer of exactly `len` bytes.
    pub fn acquire(&self, len: usize) -> PooledBuf {
        let mut storage = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buffer_size.max(len)));
        storage.clear();
        storage.resize(len, 0);
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            storage,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Buffers handed out over the pool's lifetime.
    pub fn acquired(&self) -> usize {
        self.inner.acquired.load(Ordering::Relaxed)
    }

    /// Buffers returned over the pool's lifetime.
    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::Relaxed)
    }

    /// Buffers currently held outside the pool.
    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released()
    }
}

/// A buffer borrowed from a [`BufferPool`].
///
/// Returns its storage to the pool when dropped.
pub struct PooledBuf {
    storage: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let storage = std::mem::take(&mut self.storage);
        self.pool.released.fetch_add(1, Ordering::Relaxed);
        let mut free = self.pool.free.lock();
        if free.len() < MAX_FREE_BUFFERS {
            free.push(storage);
        }
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.storage
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.storage
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.storage.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_counters() {
        let pool = BufferPool::new(1024);
        assert_eq!(pool.outstanding(), 0);

        let a = pool.acquire(10);
        let b = pool.acquire(20);
        assert_eq!(pool.acquired(), 2);
        assert_eq!(pool.released(), 0);
        assert_eq!(pool.outstanding(), 2);

        drop(a);
        assert_eq!(pool.outstanding(), 1);
        drop(b);
        assert_eq!(pool.released(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_buffer_contents() {
        let pool = BufferPool::new(16);
        let mut buf = pool.acquire(5);
        assert_eq!(&buf[..], &[0u8; 5]);
        buf.copy_from_slice(b"hello");
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn test_storage_reuse() {
        let pool = BufferPool::new(64);
        {
            let mut buf = pool.acquire(8);
            buf.copy_from_slice(b"reusable");
        }
        // The recycled buffer comes back cleared and resized.
        let buf = pool.acquire(3);
        assert_eq!(&buf[..], &[0u8; 3]);
        assert!(buf.storage.capacity() >= 64);
    }

    #[test]
    fn test_oversized_acquire() {
        let pool = BufferPool::new(16);
        let buf = pool.acquire(1000);
        assert_eq!(buf.len(), 1000);
        drop(buf);
        assert_eq!(pool.outstanding(), 0);
    }
}
