//! Reusable byte buffers for responses that may never cross the
//! compression threshold.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::DEFAULT_MIN_SIZE;

/// Maximum number of idle buffers kept for reuse.
const DEFAULT_MAX_IDLE: usize = 256;

/// A shared pool of byte buffers.
///
/// Cloning the pool is cheap; all clones share the same idle list.
#[derive(Clone)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_capacity: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Creates a pool handing out buffers sized for the default threshold.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MIN_SIZE)
    }

    /// Creates a pool whose fresh buffers reserve `buffer_capacity` bytes.
    pub fn with_capacity(buffer_capacity: usize) -> Self {
        Self {
            idle: Arc::new(Mutex::new(Vec::new())),
            buffer_capacity,
            max_idle: DEFAULT_MAX_IDLE,
        }
    }

    /// Sets how many idle buffers the pool retains.
    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Takes an empty buffer from the pool, allocating one if none is idle.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity));
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Number of buffers currently waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        // Length, not contents: the next borrower must not see stale bytes.
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle_count())
            .field("buffer_capacity", &self.buffer_capacity)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`], returned to it on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}
