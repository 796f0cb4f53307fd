//! Workspace buffer pool
//!
//! Pre-allocated `f32` scratch storage with a rent/return lifecycle. A
//! buffer is exclusively owned between rent and return: the only handle to
//! rented storage is the [`PooledBuffer`] guard, which hands the allocation
//! back when it goes out of scope. Early returns and error paths therefore
//! cannot leak buffers.
//!
//! Rented buffers are zeroed before being handed out, so a new owner never
//! observes a previous owner's data.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Pool of reusable `f32` scratch buffers
///
/// # Example
///
/// ```
/// use inferir::pool::BufferPool;
///
/// let pool = BufferPool::new();
/// {
///     let mut buf = pool.rent(64);
///     buf[0] = 1.0;
///     assert_eq!(buf.len(), 64);
/// } // buffer returned here
/// assert_eq!(pool.available(), 1);
/// ```
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<f32>>>,
}

impl BufferPool {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Rent a zeroed buffer of exactly `len` elements
    ///
    /// Reuses the largest-capacity free buffer when one exists, otherwise
    /// allocates. The returned guard gives the pool its storage back on drop.
    pub fn rent(&self, len: usize) -> PooledBuffer<'_> {
        let mut buf = {
            let mut free = self.free.lock().expect("pool mutex poisoned");
            free.pop().unwrap_or_default()
        };
        buf.clear();
        buf.resize(len, 0.0);
        PooledBuffer { buf, pool: self }
    }

    /// Number of buffers currently sitting in the free list
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().expect("pool mutex poisoned").len()
    }

    fn give_back(&self, buf: Vec<f32>) {
        let mut free = self.free.lock().expect("pool mutex poisoned");
        free.push(buf);
    }
}

/// Scope guard for a rented buffer
///
/// Dereferences to `[f32]`. Returning the storage happens in `Drop`, so the
/// pool is restored no matter how the owning scope exits.
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    buf: Vec<f32>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
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

    #[test]
    fn test_rent_and_return() {
        let pool = BufferPool::new();
        assert_eq!(pool.available(), 0);
        {
            let buf = pool.rent(32);
            assert_eq!(buf.len(), 32);
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_reuse_allocation() {
        let pool = BufferPool::new();
        {
            let _buf = pool.rent(128);
        }
        {
            let buf = pool.rent(64);
            assert_eq!(buf.len(), 64);
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_rented_buffer_is_zeroed() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.rent(16);
            for v in buf.iter_mut() {
                *v = 7.0;
            }
        }
        let buf = pool.rent(16);
        assert!(buf.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_return_on_early_exit() {
        let pool = BufferPool::new();
        let compute = |fail: bool| -> Result<f32, &'static str> {
            let mut buf = pool.rent(8);
            buf[0] = 2.0;
            if fail {
                return Err("boom");
            }
            Ok(buf[0])
        };
        assert!(compute(true).is_err());
        assert_eq!(pool.available(), 1);
        assert_eq!(compute(false), Ok(2.0));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_multiple_outstanding_buffers() {
        let pool = BufferPool::new();
        let a = pool.rent(4);
        let b = pool.rent(4);
        assert_eq!(a.len(), 4);
        assert_eq!(b.len(), 4);
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 2);
    }
}
