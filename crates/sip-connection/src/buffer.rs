//! Pooled I/O buffers
//!
//! Buffers are leased from a [`BufferPool`] as [`PooledBuffer`] values. A lease
//! is released exactly once, when the `PooledBuffer` is dropped, and the
//! backing `BytesMut` goes back to the pool's idle list for reuse. Ownership
//! moves with the value (writer → envelope → substrate write → completion), so
//! a released buffer cannot be touched again.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Leases handed out since the pool was created
    pub acquired: u64,
    /// Leases returned since the pool was created
    pub released: u64,
    /// Leases currently held by callers
    pub outstanding: u64,
    /// Buffers sitting in the idle list
    pub idle: usize,
}

struct PoolInner {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<BytesMut>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// A shared pool of I/O buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool handing out buffers of at least `buffer_size` bytes and
    /// keeping at most `max_idle` released buffers for reuse
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_idle,
                idle: Mutex::new(Vec::with_capacity(max_idle)),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Lease an empty buffer with room for at least `min_capacity` bytes
    pub fn acquire(&self, min_capacity: usize) -> PooledBuffer {
        let wanted = min_capacity.max(self.inner.buffer_size);
        let recycled = {
            let mut idle = self.inner.idle.lock();
            match idle.iter().position(|b| b.capacity() >= wanted) {
                Some(pos) => Some(idle.swap_remove(pos)),
                None => None,
            }
        };
        let buf = recycled.unwrap_or_else(|| BytesMut::with_capacity(wanted));
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }

    /// Default buffer size of this pool
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Current pool counters
    pub fn stats(&self) -> PoolStats {
        let acquired = self.inner.acquired.load(Ordering::Acquire);
        let released = self.inner.released.load(Ordering::Acquire);
        PoolStats {
            acquired,
            released,
            outstanding: acquired.saturating_sub(released),
            idle: self.inner.idle.lock().len(),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A leased buffer; dropping it returns the buffer to its pool
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Zero-fill the buffer up to its capacity, for APIs that read into `&mut [u8]`
    pub fn fill_to_capacity(&mut self) {
        let buf = self.deref_mut();
        let cap = buf.capacity();
        buf.resize(cap, 0);
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        // Only `Drop` takes the buffer out.
        self.buf.as_ref().unwrap_or_else(|| unreachable!("pooled buffer used after release"))
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap_or_else(|| unreachable!("pooled buffer used after release"))
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            self.pool.released.fetch_add(1, Ordering::AcqRel);
            buf.clear();
            if buf.capacity() >= self.pool.buffer_size {
                let mut idle = self.pool.idle.lock();
                if idle.len() < self.pool.max_idle {
                    idle.push(buf);
                    return;
                }
            }
            trace!("Discarding released buffer of {} bytes", buf.capacity());
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
