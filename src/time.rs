//! Process-local timestamp source shared by every pipeline of a manager.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Capture timestamps attached to each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTimestamps {
    /// Nanoseconds since the owning manager's epoch.
    pub monotonic_ns: u64,
    /// Monotonic time shifted onto the client's global time base, if one is set.
    pub global_ns: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TimeSource {
    inner: Arc<TimeInner>,
}

#[derive(Debug)]
struct TimeInner {
    epoch: Instant,
    global_offset_ns: AtomicI64,
    global_set: AtomicBool,
}

impl TimeSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimeInner {
                epoch: Instant::now(),
                global_offset_ns: AtomicI64::new(0),
                global_set: AtomicBool::new(false),
            }),
        }
    }

    pub fn monotonic_ns(&self) -> u64 {
        self.inner.epoch.elapsed().as_nanos() as u64
    }

    /// Anchor the global clock: "now" on the monotonic clock equals `global_now_ns`.
    pub fn set_global_base(&self, global_now_ns: u64) {
        let offset = global_now_ns as i64 - self.monotonic_ns() as i64;
        self.inner.global_offset_ns.store(offset, Ordering::Release);
        self.inner.global_set.store(true, Ordering::Release);
    }

    pub fn clear_global_base(&self) {
        self.inner.global_set.store(false, Ordering::Release);
    }

    pub fn to_global(&self, monotonic_ns: u64) -> Option<u64> {
        if !self.inner.global_set.load(Ordering::Acquire) {
            return None;
        }
        let offset = self.inner.global_offset_ns.load(Ordering::Acquire);
        Some((monotonic_ns as i64).saturating_add(offset).max(0) as u64)
    }

    pub fn stamp(&self) -> FrameTimestamps {
        let monotonic_ns = self.monotonic_ns();
        FrameTimestamps {
            monotonic_ns,
            global_ns: self.to_global(monotonic_ns),
        }
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_time_follows_base() {
        let time = TimeSource::new();
        assert_eq!(time.stamp().global_ns, None);

        time.set_global_base(1_000_000_000_000);
        let stamp = time.stamp();
        let global = stamp.global_ns.unwrap();
        assert!(global >= 1_000_000_000_000);
        assert!(global - 1_000_000_000_000 < 1_000_000_000);

        time.clear_global_base();
        assert_eq!(time.stamp().global_ns, None);
    }

    #[test]
    fn monotonic_is_non_decreasing() {
        let time = TimeSource::new();
        let a = time.monotonic_ns();
        let b = time.monotonic_ns();
        assert!(b >= a);
    }
}
