//! Reusable read buffers for the FUSE device.

use rofuse_kernel::FUSE_MIN_READ_BUFFER;
use std::{
    ops::Deref,
    sync::{Arc, Mutex},
};

/// Extra room beyond `max_write` and the request header, so that a
/// request body never outgrows its buffer.
pub(crate) const BUFFER_SLACK: usize = 4096;

/// A pool of byte buffers, each large enough to hold one kernel
/// request.
///
/// Every buffer handed out has exactly `buffer_size()` bytes of
/// capacity. A buffer whose capacity no longer matches the pool size
/// is dropped on return instead of being pooled again.
#[derive(Debug)]
pub(crate) struct BufferPool {
    size: usize,
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool whose buffers hold `size` bytes, clamped to the
    /// kernel minimum read size.
    pub(crate) fn new(size: usize) -> Self {
        Self {
            size: size.max(FUSE_MIN_READ_BUFFER as usize),
            bufs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.size
    }

    /// Draw a buffer from the pool, allocating a fresh one when the
    /// pool is empty.
    pub(crate) fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .bufs
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuf {
            buf: Some(buf),
            len: 0,
            pool: Arc::clone(self),
        }
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.capacity() == self.size {
            self.bufs
                .lock()
                .expect("buffer pool lock poisoned")
                .push(buf);
        }
    }
}

/// An owned buffer drawn from a [`BufferPool`].
///
/// The underlying storage keeps its full pool-size length; `len`
/// tracks how many bytes of it were filled by the last device read.
/// Dropping the value returns the storage to its pool.
#[derive(Debug)]
pub(crate) struct PooledBuf {
    buf: Option<Vec<u8>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// The whole writable area, regardless of the current length.
    pub(crate) fn as_full_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer already released")
    }

    /// Record how many bytes of the buffer are valid.
    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.pool.buffer_size());
        self.len = len;
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf.as_ref().expect("buffer already released")[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
