//! Size-classed buffer pooling for message reads.
//!
//! Pooling only cuts allocation churn; [`HeapAlloc`] and [`BytePool`] are
//! interchangeable behind [`BufferAlloc`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

/// Source of zero-filled read buffers.
pub trait BufferAlloc: Send + Sync + fmt::Debug {
    /// Return a buffer whose length is exactly `len`.
    fn alloc(&self, len: usize) -> Vec<u8>;

    /// Give a buffer back once its contents are no longer needed.
    fn recycle(&self, buf: Vec<u8>);
}

/// Plain allocation, nothing is reused.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAlloc;

impl BufferAlloc for HeapAlloc {
    fn alloc(&self, len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    fn recycle(&self, _buf: Vec<u8>) {}
}

/// Default class sizes: 256 B up to 1 MiB, growing by 4x.
pub const DEFAULT_CLASSES: [usize; 7] = [
    256,
    1024,
    4 * 1024,
    16 * 1024,
    64 * 1024 + 8,
    256 * 1024,
    1024 * 1024,
];

/// Default number of idle buffers kept per class.
pub const DEFAULT_PER_CLASS: usize = 64;

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations served from a pooled buffer.
    pub hits: u64,
    /// Allocations that had to hit the heap.
    pub misses: u64,
    /// Buffers accepted back into the pool.
    pub recycled: u64,
}

struct SizeClass {
    size: usize,
    free: ArrayQueue<Vec<u8>>,
}

/// Thread-safe pool with one lock-free free list per size class.
///
/// Every buffer stored in a class has a capacity of at least the class size.
/// Requests larger than the biggest class bypass the pool.
pub struct BytePool {
    classes: Vec<SizeClass>,
    hits: AtomicU64,
    misses: AtomicU64,
    recycled: AtomicU64,
}

impl fmt::Debug for BytePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytePool")
            .field("classes", &self.classes.iter().map(|c| c.size).collect::<Vec<_>>())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

impl BytePool {
    /// Pool with [`DEFAULT_CLASSES`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_classes(&DEFAULT_CLASSES, DEFAULT_PER_CLASS)
    }

    /// Pool with custom class sizes (sorted ascending here) and per-class
    /// capacity.
    #[must_use]
    pub fn with_classes(sizes: &[usize], per_class: usize) -> Self {
        let mut sizes = sizes.to_vec();
        sizes.sort_unstable();
        sizes.dedup();

        Self {
            classes: sizes
                .into_iter()
                .map(|size| SizeClass {
                    size,
                    free: ArrayQueue::new(per_class.max(1)),
                })
                .collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        }
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }

    /// Smallest class that fits `len`.
    fn class_for_alloc(&self, len: usize) -> Option<&SizeClass> {
        self.classes.iter().find(|c| c.size >= len)
    }

    /// Largest class a buffer of `capacity` can serve.
    fn class_for_recycle(&self, capacity: usize) -> Option<&SizeClass> {
        self.classes.iter().rev().find(|c| c.size <= capacity)
    }
}

impl BufferAlloc for BytePool {
    fn alloc(&self, len: usize) -> Vec<u8> {
        let Some(class) = self.class_for_alloc(len) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return vec![0u8; len];
        };

        match class.free.pop() {
            Some(mut buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let mut buf = Vec::with_capacity(class.size);
                buf.resize(len, 0);
                buf
            }
        }
    }

    fn recycle(&self, buf: Vec<u8>) {
        if let Some(class) = self.class_for_recycle(buf.capacity()) {
            if class.free.push(buf).is_ok() {
                self.recycled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_exact_length() {
        let pool = BytePool::new();
        for len in [0, 1, 300, 70_000, 2 * 1024 * 1024] {
            let buf = pool.alloc(len);
            assert_eq!(buf.len(), len);
            assert!(buf.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_reuse_after_recycle() {
        let pool = BytePool::new();

        let mut buf = pool.alloc(1000);
        buf.iter_mut().for_each(|b| *b = 9);
        pool.recycle(buf);

        let again = pool.alloc(800);
        assert_eq!(again.len(), 800);
        assert!(again.iter().all(|b| *b == 0));

        let stats = pool.stats();
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_small_buffers_are_dropped() {
        let pool = BytePool::new();
        pool.recycle(Vec::with_capacity(16));
        assert_eq!(pool.stats().recycled, 0);
    }

    #[test]
    fn test_class_is_bounded() {
        let pool = BytePool::with_classes(&[64], 2);
        for _ in 0..5 {
            pool.recycle(Vec::with_capacity(64));
        }
        assert_eq!(pool.stats().recycled, 2);
    }

    #[test]
    fn test_heap_alloc() {
        let buf = HeapAlloc.alloc(12);
        assert_eq!(buf, vec![0u8; 12]);
        HeapAlloc.recycle(buf);
    }
}
