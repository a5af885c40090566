//! CPU interrupt line.
//!
//! The interrupt controller drives a single level-triggered line into the
//! CPU. Instead of calling into the CPU, the controller only changes the
//! line level; the dispatch loop observes it between steps, either by
//! polling [`IrqLine::is_asserted`] or by parking in [`IrqLine::wait`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct IrqLine {
    /// Authoritative level, paired with `cond` for waiters.
    level: Mutex<bool>,
    cond: Condvar,

    /// Cache of `level` for the per-step poll.
    level_cache: AtomicBool,

    /// Number of times the line was driven high (including re-drives).
    raise_count: AtomicU64,
}

impl IrqLine {
    pub fn new() -> Self {
        Self {
            level: Mutex::new(false),
            cond: Condvar::new(),
            level_cache: AtomicBool::new(false),
            raise_count: AtomicU64::new(0),
        }
    }

    /// Drive the line high. Driving an already high line is not an error.
    pub fn raise(&self) {
        self.set_level(true);
    }

    /// Drive the line low.
    pub fn lower(&self) {
        self.set_level(false);
    }

    pub fn set_level(&self, high: bool) {
        let mut level = self.level.lock().unwrap_or_else(|e| e.into_inner());
        *level = high;
        self.level_cache.store(high, Ordering::Release);
        if high {
            self.raise_count.fetch_add(1, Ordering::Relaxed);
            self.cond.notify_all();
        }
    }

    #[inline]
    pub fn is_asserted(&self) -> bool {
        self.level_cache.load(Ordering::Acquire)
    }

    pub fn raise_count(&self) -> u64 {
        self.raise_count.load(Ordering::Relaxed)
    }

    /// Block until the line is high or `timeout` elapses.
    ///
    /// Returns the level observed on return.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut level = self.level.lock().unwrap_or_else(|e| e.into_inner());
        while !*level {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            level = match self.cond.wait_timeout(level, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        *level
    }
}

impl Default for IrqLine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_level_follows_raise_and_lower() {
        let line = IrqLine::new();
        assert!(!line.is_asserted());
        line.raise();
        assert!(line.is_asserted());
        line.raise();
        assert!(line.is_asserted());
        assert_eq!(line.raise_count(), 2);
        line.lower();
        assert!(!line.is_asserted());
    }

    #[test]
    fn test_wait_times_out_when_low() {
        let line = IrqLine::new();
        let start = Instant::now();
        assert!(!line.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_returns_immediately_when_high() {
        let line = IrqLine::new();
        line.raise();
        assert!(line.wait(Duration::from_secs(5)));
    }

    #[test]
    fn test_wait_woken_by_other_thread() {
        let line = Arc::new(IrqLine::new());
        let producer = Arc::clone(&line);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.raise();
        });

        assert!(line.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
