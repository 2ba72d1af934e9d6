//! Bounded pool of reusable byte buffers.
//!
//! The buffered shared-tier read path and the write path's single
//! serialization pass both rent from here. A rented buffer goes back to the
//! pool when the guard drops, unless it grew past `max_buffer_bytes` or the
//! pool already retains `max_retained` buffers.

use std::ops::{Deref, DerefMut};

use bytes::BytesMut;
use parking_lot::Mutex;

/// Default number of idle buffers kept.
pub const DEFAULT_MAX_RETAINED: usize = 64;

/// Default capacity above which a buffer is dropped instead of pooled.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 256 * 1024;

const INITIAL_CAPACITY: usize = 1024;

pub struct BufferPool {
    idle: Mutex<Vec<BytesMut>>,
    max_retained: usize,
    max_buffer_bytes: usize,
}

impl BufferPool {
    pub fn new(max_retained: usize, max_buffer_bytes: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_retained.min(DEFAULT_MAX_RETAINED))),
            max_retained,
            max_buffer_bytes,
        }
    }

    /// Takes an empty buffer from the pool, allocating if none is idle.
    pub fn rent(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_CAPACITY));
        PooledBuffer { pool: self, buf }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() > self.max_buffer_bytes {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_retained {
            idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETAINED, DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle())
            .field("max_retained", &self.max_retained)
            .field("max_buffer_bytes", &self.max_buffer_bytes)
            .finish()
    }
}

/// A buffer rented from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: BytesMut,
}

impl Deref for PooledBuffer<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_buffer_is_reused() {
        let pool = BufferPool::new(4, 1 << 20);
        {
            let mut buf = pool.rent();
            buf.put_slice(b"hello");
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.rent();
        assert!(buf.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_oversized_buffer_is_dropped() {
        let pool = BufferPool::new(4, 16);
        {
            let mut buf = pool.rent();
            buf.put_slice(&[0u8; 2048]);
        }
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_retention_is_bounded() {
        let pool = BufferPool::new(1, 1 << 20);
        let first = pool.rent();
        let second = pool.rent();
        drop(first);
        drop(second);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_split_freeze_keeps_remainder_pooled() {
        let pool = BufferPool::new(4, 1 << 20);
        let frozen = {
            let mut buf = pool.rent();
            buf.put_slice(b"payload");
            buf.split().freeze()
        };
        assert_eq!(&frozen[..], b"payload");
        assert_eq!(pool.idle(), 1);
    }
}
