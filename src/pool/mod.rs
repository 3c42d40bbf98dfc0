//! Fixed-capacity recycling pool for frame buffers

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    #[error("no buffer became free before the timeout")]
    TimedOut,
    #[error("pool closed for shutdown")]
    Stopping,
    #[error("no free buffer")]
    Exhausted,
}

/// Pool of pre-allocated items for one pipeline port.
///
/// Items are created once at construction and recycled until the pool is
/// dropped. A loaned item is returned when its [`Pooled`] guard is dropped or
/// explicitly [released](Pooled::release). Free items are handed out in no
/// particular order.
pub struct BufferPool<T: Send + 'static> {
    name: String,
    capacity: usize,
    inner: Mutex<PoolInner<T>>,
    freed: Condvar,
    /// Signalled when the last loan comes back.
    drained: Condvar,
    stats: CachePadded<Stats>,
}

struct PoolInner<T> {
    free: Vec<T>,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time view of a pool's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub name: String,
    pub capacity: usize,
    pub outstanding: usize,
    pub acquired: u64,
    pub released: u64,
    pub timeouts: u64,
}

impl<T: Send + 'static> BufferPool<T> {
    /// Allocate `capacity` items with `factory`.
    pub fn new<F>(name: impl Into<String>, capacity: usize, mut factory: F) -> Arc<Self>
    where
        F: FnMut() -> T,
    {
        let free = (0..capacity).map(|_| factory()).collect();
        Arc::new(Self {
            name: name.into(),
            capacity,
            inner: Mutex::new(PoolInner {
                free,
                closed: false,
            }),
            freed: Condvar::new(),
            drained: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Block until an item is free, the timeout expires, or the pool closes.
    ///
    /// `None` waits indefinitely.
    pub fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Pooled<T>, AcquireError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(AcquireError::Stopping);
            }
            if let Some(item) = inner.free.pop() {
                return Ok(self.loan(item));
            }
            match deadline {
                None => self.freed.wait(&mut inner),
                Some(deadline) => {
                    if self.freed.wait_until(&mut inner, deadline).timed_out() {
                        if inner.closed {
                            return Err(AcquireError::Stopping);
                        }
                        if let Some(item) = inner.free.pop() {
                            return Ok(self.loan(item));
                        }
                        self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("ipp_pool_acquire_timeouts_total", "pool" => self.name.clone())
                            .increment(1);
                        warn!(
                            pool = %self.name,
                            timeout_ms = timeout.map(|t| t.as_millis()).unwrap_or_default(),
                            outstanding = self.capacity - inner.free.len(),
                            capacity = self.capacity,
                            "Pool acquire timeout - all buffers checked out"
                        );
                        return Err(AcquireError::TimedOut);
                    }
                }
            }
        }
    }

    /// Take a free item without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Pooled<T>, AcquireError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(AcquireError::Stopping);
        }
        match inner.free.pop() {
            Some(item) => Ok(self.loan(item)),
            None => Err(AcquireError::Exhausted),
        }
    }

    fn loan(self: &Arc<Self>, item: T) -> Pooled<T> {
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        Pooled {
            item: Some(item),
            pool: Arc::clone(self),
        }
    }

    fn put_back(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.free.len() >= self.capacity {
            // Only reachable if an item was smuggled in from elsewhere.
            error!(
                pool = %self.name,
                capacity = self.capacity,
                "Buffer returned to a full pool; discarding"
            );
            return;
        }
        inner.free.push(item);
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        let idle = inner.free.len() == self.capacity;
        drop(inner);
        self.freed.notify_one();
        if idle {
            self.drained.notify_all();
        }
    }

    /// Block until every loan is back. False on timeout or close.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.free.len() < self.capacity {
            if inner.closed || self.drained.wait_until(&mut inner, deadline).timed_out() {
                return inner.free.len() == self.capacity;
            }
        }
        true
    }

    /// Wake every waiter with [`AcquireError::Stopping`] and refuse new loans.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.freed.notify_all();
        self.drained.notify_all();
    }

    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            name: self.name.clone(),
            capacity: self.capacity,
            outstanding: self.outstanding(),
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for BufferPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// Type-erased pool handle used by the pipeline for lifecycle and diagnostics.
pub trait PoolControl: Send + Sync {
    fn name(&self) -> &str;
    fn capacity(&self) -> usize;
    fn outstanding(&self) -> usize;
    fn close(&self);
    fn reopen(&self);
    fn snapshot(&self) -> PoolSnapshot;
}

impl<T: Send + 'static> PoolControl for BufferPool<T> {
    fn name(&self) -> &str {
        BufferPool::name(self)
    }

    fn capacity(&self) -> usize {
        BufferPool::capacity(self)
    }

    fn outstanding(&self) -> usize {
        BufferPool::outstanding(self)
    }

    fn close(&self) {
        BufferPool::close(self)
    }

    fn reopen(&self) {
        BufferPool::reopen(self)
    }

    fn snapshot(&self) -> PoolSnapshot {
        BufferPool::snapshot(self)
    }
}

/// An item checked out of a [`BufferPool`]; returns itself on drop.
pub struct Pooled<T: Send + 'static> {
    item: Option<T>,
    pool: Arc<BufferPool<T>>,
}

impl<T: Send + 'static> Pooled<T> {
    /// Return the item to its pool now.
    pub fn release(self) {
        drop(self)
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item taken before drop"),
        }
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item taken before drop"),
        }
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put_back(item);
        }
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.pool.name())
            .field("item", &self.item)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool(capacity: usize) -> Arc<BufferPool<Vec<u8>>> {
        BufferPool::new("test", capacity, || vec![0u8; 16])
    }

    #[test]
    fn outstanding_never_exceeds_capacity() {
        let pool = pool(3);
        let loans: Vec<_> = (0..3)
            .map(|_| pool.acquire(Some(Duration::from_millis(10))).unwrap())
            .collect();
        assert_eq!(pool.outstanding(), 3);
        assert_eq!(pool.try_acquire().unwrap_err(), AcquireError::Exhausted);
        assert_eq!(
            pool.acquire(Some(Duration::from_millis(20))).unwrap_err(),
            AcquireError::TimedOut
        );
        drop(loans);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.snapshot().timeouts, 1);
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let pool = pool(1);
        let held = pool.acquire(None).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(Some(Duration::from_secs(5))).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(30));
        held.release();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn close_wakes_infinite_waiters() {
        let pool = pool(1);
        let _held = pool.acquire(None).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(None).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(30));
        pool.close();
        assert_eq!(waiter.join().unwrap(), Err(AcquireError::Stopping));

        pool.reopen();
        drop(_held);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn wait_idle_returns_once_every_loan_is_back() {
        let pool = pool(2);
        assert!(pool.wait_idle(Duration::ZERO));

        let a = pool.acquire(None).unwrap();
        let b = pool.acquire(None).unwrap();
        assert!(!pool.wait_idle(Duration::from_millis(10)));

        let returner = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(a);
            thread::sleep(Duration::from_millis(20));
            drop(b);
        });
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(pool.outstanding(), 0);
        returner.join().unwrap();
    }

    #[test]
    fn items_are_recycled_not_reallocated() {
        let pool = BufferPool::new("tagged", 2, {
            let mut next = 0u32;
            move || {
                next += 1;
                next
            }
        });
        let mut seen = Vec::new();
        for _ in 0..6 {
            let item = pool.try_acquire().unwrap();
            seen.push(*item);
        }
        assert!(seen.iter().all(|v| *v == 1 || *v == 2));
        let snap = pool.snapshot();
        assert_eq!(snap.acquired, 6);
        assert_eq!(snap.released, 6);
    }
}
