//! C1 — size-bucketed reusable byte buffers for I/O.
//!
//! The pool is process-wide and lazily initialized (see `shared()`), matching
//! the "global state" design note: everything else lives on `GatewayState`,
//! but the buffer pool is the one value cheap enough and hot enough on the
//! I/O path to warrant a process-wide singleton. Tests construct their own
//! `BufferPool` instance instead of going through `shared()` to stay hermetic.

use bytes::BytesMut;
use std::sync::{Mutex, OnceLock};

/// Buckets sized as powers of two from 4 KiB to 256 KiB.
const BUCKET_SIZES: &[usize] = &[4096, 16384, 65536, 262144];

pub struct BufferPool {
    buckets: Vec<Mutex<Vec<BytesMut>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buckets: BUCKET_SIZES.iter().map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Process-wide singleton, lazily initialized on first use.
    pub fn shared() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(BufferPool::new)
    }

    fn bucket_index(&self, min_capacity: usize) -> Option<usize> {
        BUCKET_SIZES.iter().position(|&size| size >= min_capacity)
    }

    /// Take a buffer with at least `min_capacity` bytes of spare capacity.
    /// Falls back to a fresh allocation when no bucket is large enough or
    /// the matching bucket is empty.
    pub fn acquire(&self, min_capacity: usize) -> BytesMut {
        if let Some(idx) = self.bucket_index(min_capacity) {
            if let Ok(mut bucket) = self.buckets[idx].lock() {
                if let Some(mut buf) = bucket.pop() {
                    buf.clear();
                    return buf;
                }
            }
            return BytesMut::with_capacity(BUCKET_SIZES[idx]);
        }
        BytesMut::with_capacity(min_capacity)
    }

    /// Return a buffer to the pool for reuse. Buffers whose capacity doesn't
    /// match a bucket exactly are dropped rather than mis-filed.
    pub fn release(&self, buf: BytesMut) {
        if let Some(idx) = BUCKET_SIZES.iter().position(|&size| size == buf.capacity()) {
            if let Ok(mut bucket) = self.buckets[idx].lock() {
                if bucket.len() < 256 {
                    bucket.push(buf);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_picks_smallest_fitting_bucket() {
        let pool = BufferPool::new();
        let buf = pool.acquire(1000);
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn release_then_acquire_reuses_buffer() {
        let pool = BufferPool::new();
        let buf = pool.acquire(4096);
        let ptr = buf.as_ptr();
        pool.release(buf);
        let buf2 = pool.acquire(4096);
        assert_eq!(buf2.as_ptr(), ptr);
    }

    #[test]
    fn oversized_request_falls_back_to_direct_allocation() {
        let pool = BufferPool::new();
        let buf = pool.acquire(10_000_000);
        assert!(buf.capacity() >= 10_000_000);
    }

    #[test]
    fn shared_returns_same_instance() {
        let a = BufferPool::shared() as *const _;
        let b = BufferPool::shared() as *const _;
        assert_eq!(a, b);
    }
}
