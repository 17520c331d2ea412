//! Buffer pool for the UDP read path.
//!
//! Every datagram needs a full-size scratch buffer; recycling them
//! across reads keeps the hot path free of large allocations.

use std::sync::Arc;

use parking_lot::Mutex;

/// Buffer size for one datagram: the 2-byte length prefix used by the
/// stream transports plus the largest possible DNS message, so the same
/// pool serves every listener.
pub const POOL_BUFFER_SIZE: usize = 2 + u16::MAX as usize;

/// A reusable buffer, returned to its pool on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PooledBuffer {
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.data);
        self.pool.lock().push(buffer);
    }
}

/// A pool of fixed-size datagram buffers.
#[derive(Clone)]
pub struct BufferPool {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    /// Create a pool with `pool_size` pre-allocated buffers.
    pub fn new(pool_size: usize) -> Self {
        let buffers = (0..pool_size).map(|_| vec![0u8; POOL_BUFFER_SIZE]).collect();
        Self {
            buffers: Arc::new(Mutex::new(buffers)),
        }
    }

    /// Get a full-size buffer, allocating when the pool ran dry.
    pub fn get(&self) -> PooledBuffer {
        let mut data = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; POOL_BUFFER_SIZE]);
        data.resize(POOL_BUFFER_SIZE, 0);

        PooledBuffer {
            data,
            pool: Arc::clone(&self.buffers),
        }
    }

    /// Currently parked buffers.
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_get_and_return_buffers_to_pool() {
        let pool = BufferPool::new(2);
        assert_eq!(pool.available(), 2);

        let buf1 = pool.get();
        let buf2 = pool.get();
        assert_eq!(pool.available(), 0);

        drop(buf1);
        assert_eq!(pool.available(), 1);
        drop(buf2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn should_allocate_when_pool_is_exhausted() {
        let pool = BufferPool::new(1);
        let _a = pool.get();
        let b = pool.get();
        assert_eq!(b.as_slice().len(), POOL_BUFFER_SIZE);
    }

    #[test]
    fn should_hand_out_full_size_buffers() {
        let pool = BufferPool::new(1);
        let mut buf = pool.get();
        assert_eq!(buf.as_slice().len(), POOL_BUFFER_SIZE);
        buf.as_mut_slice()[0] = 42;
        drop(buf);

        // Recycled buffers come back zero-capable and full-size.
        let buf = pool.get();
        assert_eq!(buf.as_slice().len(), POOL_BUFFER_SIZE);
    }
}
