use log::info;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const PAGE_SIZE: usize = 4096;

/// 固定容量的缓冲池，创建时一次性分配全部槽位，之后不再增长。
///
/// 在绑定 NUMA 节点之后创建，页面会落在该节点上。
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Box<[u8]>>>,
    capacity: usize,
    slot_size: usize,
    stats: PoolStats,
}

#[derive(Default)]
struct PoolStats {
    acquisitions: AtomicU64,
    releases: AtomicU64,
    exhausted: AtomicU64,
}

/// 缓冲池统计快照
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub capacity: usize,
    pub slot_size: usize,
    pub available: usize,
    pub in_use: usize,
    pub acquisitions: u64,
    pub releases: u64,
    pub exhausted: u64,
}

impl BufferPool {
    pub fn new(slots: usize, slot_size: usize) -> Self {
        let mut free = Vec::with_capacity(slots);
        for _ in 0..slots {
            let mut buf = vec![0u8; slot_size].into_boxed_slice();
            // 逐页写一次，让页面在当前节点上真正分配出来
            for page in buf.chunks_mut(PAGE_SIZE) {
                page[0] = std::hint::black_box(0);
            }
            free.push(buf);
        }

        info!(
            "缓冲池已创建: {} 个槽位, 每个 {} 字节, 共 {:.1} MB",
            slots,
            slot_size,
            slots as f64 * slot_size as f64 / (1024.0 * 1024.0)
        );

        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity: slots,
                slot_size,
                stats: PoolStats::default(),
            }),
        }
    }

    /// 取一个空闲槽位，池耗尽时返回 None
    pub fn try_acquire(&self) -> Option<BufferSlot> {
        let buf = self.inner.lock_free().pop();
        match buf {
            Some(buf) => {
                self.inner.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
                Some(BufferSlot {
                    buf: Some(buf),
                    pool: Arc::clone(&self.inner),
                })
            }
            None => {
                self.inner.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 一次取 n 个槽位，不够时全部归还并返回 None
    pub fn try_acquire_many(&self, n: usize) -> Option<Vec<BufferSlot>> {
        let mut slots = Vec::with_capacity(n);
        for _ in 0..n {
            slots.push(self.try_acquire()?);
        }
        Some(slots)
    }

    pub fn slot_size(&self) -> usize {
        self.inner.slot_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.lock_free().len()
    }

    pub fn stats(&self) -> BufferPoolStats {
        let available = self.available();
        BufferPoolStats {
            capacity: self.inner.capacity,
            slot_size: self.inner.slot_size,
            available,
            in_use: self.inner.capacity - available,
            acquisitions: self.inner.stats.acquisitions.load(Ordering::Relaxed),
            releases: self.inner.stats.releases.load(Ordering::Relaxed),
            exhausted: self.inner.stats.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    fn lock_free(&self) -> std::sync::MutexGuard<'_, Vec<Box<[u8]>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 从池中借出的槽位，drop 时归还
pub struct BufferSlot {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for BufferSlot {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for BufferSlot {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.lock_free().push(buf);
            self.pool.stats.releases.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_never_grows() {
        let pool = BufferPool::new(2, 1024);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_eq!(a.len(), 1024);
        assert!(pool.try_acquire().is_none());

        let stats = pool.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.exhausted, 1);

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.try_acquire().unwrap();
        drop(b);
        drop(c);

        let stats = pool.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.acquisitions, 3);
        assert_eq!(stats.releases, 3);
    }

    #[test]
    fn test_acquire_many_is_all_or_nothing() {
        let pool = BufferPool::new(3, 64);
        let held = pool.try_acquire().unwrap();
        let pair = pool.try_acquire_many(2).unwrap();
        assert_eq!(pair.len(), 2);
        assert!(pool.try_acquire_many(2).is_none());
        drop(pair);
        assert_eq!(pool.available(), 2);
        drop(held);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_slot_is_writable_and_exclusive() {
        let pool = BufferPool::new(2, 16);
        let mut a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        a[..4].copy_from_slice(b"ping");
        assert_eq!(&a[..4], b"ping");
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_release() {
        let pool = BufferPool::new(8, 256);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    if let Some(mut slot) = pool.try_acquire() {
                        slot[0] = 1;
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.available, 8);
        assert_eq!(stats.acquisitions, stats.releases);
    }
}
