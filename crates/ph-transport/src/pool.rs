//! Shared byte-buffer pool.
//!
//! Write batching and frame encoding borrow scratch buffers here instead of
//! allocating per flush. Buffers keep their capacity across uses; oversized
//! ones (a huge frame passed through) are dropped on recycle rather than
//! pinned in the pool.

use std::sync::Mutex;

use bytes::BytesMut;

pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        BufferPool { free: Mutex::new(Vec::new()), buffer_capacity, max_pooled }
    }

    /// Provides a cleared buffer, reusing a pooled one when available.
    pub fn acquire(&self) -> BytesMut {
        match self.free.lock().expect("pool lock").pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(self.buffer_capacity),
        }
    }

    /// Reclaim a buffer into the pool.
    pub fn recycle(&self, mut buf: BytesMut) {
        if buf.capacity() > self.buffer_capacity * 4 {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().expect("pool lock");
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().expect("pool lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_recycled_buffers() {
        let pool = BufferPool::new(1024, 8);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"scratch");
        let ptr = buf.as_ptr();
        pool.recycle(buf);
        assert_eq!(pool.pooled(), 1);

        let buf = pool.acquire();
        assert_eq!(buf.as_ptr(), ptr, "same backing storage comes back");
        assert!(buf.is_empty(), "recycled buffers are cleared");
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn pool_is_bounded_and_sheds_oversized_buffers() {
        let pool = BufferPool::new(64, 1);
        pool.recycle(BytesMut::with_capacity(64));
        pool.recycle(BytesMut::with_capacity(64));
        assert_eq!(pool.pooled(), 1, "beyond max_pooled is dropped");

        let pool = BufferPool::new(64, 8);
        pool.recycle(BytesMut::with_capacity(64 * 8));
        assert_eq!(pool.pooled(), 0, "grossly grown buffers are not pinned");
    }
}
