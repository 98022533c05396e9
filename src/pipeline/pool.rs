//! ObjectPool: recycled scratch storage for derived batches.
//!
//! Transform nodes draw a buffer of at least some minimum size, fill it and
//! publish it. The buffer goes back to the pool when the last view into it
//! is dropped, so steady-state operation allocates nothing.
//!
//! With `recycle_smaller` set, idle entries that turn out too small for a
//! request are freed instead of kept, which lets the pool converge on the
//! largest size actually in use.

use crate::pipeline::packet::RawBuffer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Something an [`ObjectPool`] can hand out.
pub trait PoolItem: Send + 'static {
    /// Allocate a fresh item able to hold `size` units.
    fn allocate(size: usize) -> Self;

    /// How many units the item can hold without reallocating.
    fn size(&self) -> usize;

    /// Prepare an idle item for reuse.
    fn recycle(&mut self);
}

impl PoolItem for Vec<u8> {
    fn allocate(size: usize) -> Self {
        Vec::with_capacity(size)
    }

    fn size(&self) -> usize {
        self.capacity()
    }

    fn recycle(&mut self) {
        self.clear();
    }
}

struct PoolShared<T> {
    idle: Mutex<VecDeque<T>>,
    in_use: AtomicUsize,
    recycle_smaller: bool,
}

/// Thread-safe pool of reusable items. Cloning shares the pool.
pub struct ObjectPool<T: PoolItem> {
    shared: Arc<PoolShared<T>>,
}

impl<T: PoolItem> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: PoolItem> ObjectPool<T> {
    pub fn new(recycle_smaller: bool) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                idle: Mutex::new(VecDeque::new()),
                in_use: AtomicUsize::new(0),
                recycle_smaller,
            }),
        }
    }

    /// Take an item holding at least `min_size` units, allocating if no
    /// idle item fits. The item returns to the pool on drop.
    pub fn get(&self, min_size: usize) -> Pooled<T> {
        let reused = {
            let mut idle = self.shared.idle.lock();
            if self.shared.recycle_smaller {
                let mut found = None;
                while let Some(item) = idle.pop_front() {
                    if item.size() >= min_size {
                        found = Some(item);
                        break;
                    }
                    // too small, freed here
                }
                found
            } else {
                idle.iter()
                    .position(|item| item.size() >= min_size)
                    .and_then(|pos| idle.remove(pos))
            }
        };

        let item = reused.unwrap_or_else(|| T::allocate(min_size));
        self.shared.in_use.fetch_add(1, Ordering::Relaxed);
        Pooled {
            item: Some(item),
            pool: Arc::clone(&self.shared),
        }
    }

    /// Items currently handed out.
    pub fn size(&self) -> usize {
        self.shared.in_use.load(Ordering::Relaxed)
    }

    /// Items handed out plus idle items kept for reuse.
    pub fn capacity(&self) -> usize {
        self.size() + self.shared.idle.lock().len()
    }
}

impl<T: PoolItem> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new(true)
    }
}

/// An item on loan from an [`ObjectPool`].
pub struct Pooled<T: PoolItem> {
    item: Option<T>,
    pool: Arc<PoolShared<T>>,
}

impl<T: PoolItem> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only None during drop
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: PoolItem> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: PoolItem> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut item) = self.item.take() {
            item.recycle();
            self.pool.idle.lock().push_back(item);
            self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl AsRef<[u8]> for Pooled<Vec<u8>> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Pooled<Vec<u8>> {
    /// Freeze the filled buffer into an immutable raw region. The buffer
    /// returns to its pool once every view into the region is gone.
    pub fn publish(self) -> RawBuffer {
        RawBuffer::from_owner(self)
    }
}

/// Byte-buffer pool used by transform nodes.
pub type BufferPool = ObjectPool<Vec<u8>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_reuses_returned_item() {
        let pool = BufferPool::new(false);
        let ptr = {
            let mut buf = pool.get(128);
            buf.extend_from_slice(&[1, 2, 3]);
            assert_eq!(pool.size(), 1);
            buf.as_ptr()
        };
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.capacity(), 1);

        let buf = pool.get(64);
        assert_eq!(buf.as_ptr(), ptr);
        assert!(buf.is_empty());
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_keeps_smaller_without_recycle() {
        let pool = BufferPool::new(false);
        drop(pool.get(16));
        let _big = pool.get(1024);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_recycle_smaller_frees_undersized() {
        let pool = BufferPool::new(true);
        drop(pool.get(16));
        drop(pool.get(32));
        assert_eq!(pool.capacity(), 1);

        let big = pool.get(1024);
        assert!(big.capacity() >= 1024);
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_published_buffer_returns_when_views_drop() {
        let pool = BufferPool::new(true);
        let mut buf = pool.get(8);
        buf.extend_from_slice(&[9u8; 8]);
        let raw = buf.publish();
        let view = raw.slice(2..6);
        drop(raw);
        assert_eq!(pool.size(), 1);
        assert_eq!(&view[..], &[9, 9, 9, 9]);
        drop(view);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_pool_shared_across_threads() {
        let pool = BufferPool::new(false);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.get(256);
                        buf.push(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.size(), 0);
        assert!(pool.capacity() <= 4);
    }
}
