//! Host countdown timer.
//!
//! A `CountdownTimer` counts down from `count` at `freq_hz` ticks per second.
//! On reaching zero it invokes its expiry callback and, unless started in
//! one-shot mode, reloads `limit` and keeps going.
//!
//! Configuration changes are made inside a transaction ([`CountdownTimer::begin`]).
//! The transaction holds the timer lock, so the timing thread never sees a
//! half-applied configuration. The deadline is recomputed once, on commit,
//! and only if the transaction changed something; a transaction that leaves
//! the configuration as it found it keeps the armed deadline.
//!
//! Time comes from a [`Clock`]. `HostClock` follows wall time and is paired
//! with a [`TimerThread`]; `ManualClock` lets tests step simulated time and
//! deliver expiries with [`CountdownTimer::poll`].

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Shortest period a periodic timer is allowed to run at.
///
/// Guests programming a smaller period would otherwise flood the timing
/// thread with expiries.
pub const MIN_PERIOD_NS: u64 = 10_000;

/// How long the timing thread sleeps when the timer is not armed.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Source of monotonic time in nanoseconds.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Wall-clock time since the clock was created.
pub struct HostClock {
    start: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// Simulated time that only moves when told to.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::AcqRel);
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::Release);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

pub type ExpiryCallback = Box<dyn Fn() + Send + Sync>;

/// Duration of `ticks` ticks at `freq_hz`, rounded down.
fn ticks_to_ns(ticks: u64, freq_hz: u32) -> u64 {
    if freq_hz == 0 {
        return 0;
    }
    let ns = ticks as u128 * NANOS_PER_SEC / freq_hz as u128;
    ns.min(u64::MAX as u128) as u64
}

/// Ticks remaining in `ns` nanoseconds at `freq_hz`, rounded up.
fn ns_to_ticks(ns: u64, freq_hz: u32) -> u64 {
    let scaled = ns as u128 * freq_hz as u128;
    scaled.div_ceil(NANOS_PER_SEC).min(u64::MAX as u128) as u64
}

/// Register-visible timer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PtimerSnapshot {
    pub freq_hz: u32,
    pub limit: u64,
    pub count: u64,
    pub running: bool,
    pub oneshot: bool,
}

struct PtimerState {
    freq_hz: u32,
    limit: u64,
    /// Frozen count. While armed this is only meaningful inside a
    /// transaction; outside one the live count is derived from `deadline`.
    count: u64,
    running: bool,
    oneshot: bool,
    /// Clock time of the next expiry, when armed.
    deadline: Option<u64>,
    /// Set when the owning `TimerThread` is going away.
    shutdown: bool,
}

impl PtimerState {
    fn live_count(&self, now: u64) -> u64 {
        match self.deadline {
            Some(deadline) => ns_to_ticks(deadline.saturating_sub(now), self.freq_hz),
            None => self.count,
        }
    }

    fn period_ns(&self) -> u64 {
        ticks_to_ns(self.limit, self.freq_hz).max(MIN_PERIOD_NS)
    }

    /// Consume every expiry due at `now`, reloading as it goes.
    fn collect_expiries(&mut self, now: u64) -> u32 {
        let mut fired = 0u32;
        while let Some(deadline) = self.deadline {
            if now < deadline {
                break;
            }
            fired = fired.saturating_add(1);
            if self.oneshot || self.limit == 0 || self.freq_hz == 0 {
                self.running = false;
                self.count = 0;
                self.deadline = None;
                break;
            }
            self.count = self.limit;
            self.deadline = Some(deadline.saturating_add(self.period_ns()));
        }
        fired
    }
}

pub struct CountdownTimer {
    state: Mutex<PtimerState>,
    /// Wakes the timing thread after a commit or shutdown.
    cond: Condvar,
    clock: Arc<dyn Clock>,
    callback: ExpiryCallback,
}

impl CountdownTimer {
    pub fn new(clock: Arc<dyn Clock>, callback: ExpiryCallback) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PtimerState {
                freq_hz: 0,
                limit: 0,
                count: 0,
                running: false,
                oneshot: false,
                deadline: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
            clock,
            callback,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PtimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a configuration transaction.
    ///
    /// While the transaction is alive no expiry is processed. The running
    /// count is frozen at the time of `begin`; if the transaction changes
    /// the configuration, counting resumes from it on commit (or drop).
    pub fn begin(&self) -> PtimerTransaction<'_> {
        let mut state = self.lock();
        let now = self.clock.now_ns();
        let armed = state.deadline.take();
        if let Some(deadline) = armed {
            state.count = ns_to_ticks(deadline.saturating_sub(now), state.freq_hz);
        }
        PtimerTransaction {
            timer: self,
            state,
            armed,
            dirty: false,
        }
    }

    /// Current count; live while running, frozen otherwise.
    pub fn count(&self) -> u64 {
        let state = self.lock();
        state.live_count(self.clock.now_ns())
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn freq(&self) -> u32 {
        self.lock().freq_hz
    }

    pub fn limit(&self) -> u64 {
        self.lock().limit
    }

    /// Clock time of the next expiry, if armed.
    pub fn next_deadline(&self) -> Option<u64> {
        self.lock().deadline
    }

    /// Deliver every expiry that is due. Returns how many fired.
    ///
    /// The callback runs with the timer lock released, so it may read the
    /// timer or open a transaction of its own.
    pub fn poll(&self) -> u32 {
        let fired = {
            let mut state = self.lock();
            let now = self.clock.now_ns();
            state.collect_expiries(now)
        };
        for _ in 0..fired {
            (self.callback)();
        }
        fired
    }

    pub fn snapshot(&self) -> PtimerSnapshot {
        let state = self.lock();
        PtimerSnapshot {
            freq_hz: state.freq_hz,
            limit: state.limit,
            count: state.live_count(self.clock.now_ns()),
            running: state.running,
            oneshot: state.oneshot,
        }
    }

    pub fn restore(&self, snap: &PtimerSnapshot) {
        let mut tx = self.begin();
        tx.stop();
        tx.set_freq(snap.freq_hz);
        tx.set_limit(snap.limit, false);
        tx.set_count(snap.count);
        if snap.running {
            tx.run(snap.oneshot);
        }
        tx.commit();
    }
}

/// An open configuration transaction on a [`CountdownTimer`].
///
/// Dropping the transaction commits it.
pub struct PtimerTransaction<'a> {
    timer: &'a CountdownTimer,
    state: MutexGuard<'a, PtimerState>,
    /// Deadline armed when the transaction was opened.
    armed: Option<u64>,
    /// Set by any setter that changed the configuration.
    dirty: bool,
}

impl PtimerTransaction<'_> {
    pub fn set_freq(&mut self, freq_hz: u32) {
        if self.state.freq_hz != freq_hz {
            self.state.freq_hz = freq_hz;
            self.dirty = true;
        }
    }

    /// Load the counter. Always re-arms, even with the value it already has.
    pub fn set_count(&mut self, count: u64) {
        self.state.count = count;
        self.dirty = true;
    }

    /// Set the reload value; with `reload` the current count follows it.
    pub fn set_limit(&mut self, limit: u64, reload: bool) {
        self.state.limit = limit;
        if reload {
            self.state.count = limit;
        }
        self.dirty = true;
    }

    /// Start counting. A timer already running in the same mode keeps its
    /// deadline.
    pub fn run(&mut self, oneshot: bool) {
        if !self.state.running || self.state.oneshot != oneshot {
            self.state.running = true;
            self.state.oneshot = oneshot;
            self.dirty = true;
        }
    }

    pub fn stop(&mut self) {
        if self.state.running {
            self.state.running = false;
            self.dirty = true;
        }
    }

    pub fn commit(self) {}
}

impl Drop for PtimerTransaction<'_> {
    fn drop(&mut self) {
        let now = self.timer.clock.now_ns();
        let state = &mut *self.state;
        if !self.dirty {
            state.deadline = self.armed;
            return;
        }
        state.deadline = None;
        if !state.running {
            return;
        }
        if state.freq_hz == 0 {
            log::warn!("[ptimer] running with frequency 0, timer is inert");
            return;
        }
        if state.count == 0 && state.limit == 0 {
            log::warn!("[ptimer] running with count and limit 0, timer is inert");
            return;
        }
        // A zero count expires immediately and reloads from the limit.
        let delta = if state.count == 0 {
            0
        } else {
            ticks_to_ns(state.count, state.freq_hz).max(1)
        };
        state.deadline = Some(now.saturating_add(delta));
        self.timer.cond.notify_all();
    }
}

/// Background thread that delivers expiries of a wall-clock timer.
pub struct TimerThread {
    timer: Arc<CountdownTimer>,
    handle: Option<JoinHandle<()>>,
}

impl TimerThread {
    pub fn spawn(timer: Arc<CountdownTimer>) -> io::Result<Self> {
        let worker = Arc::clone(&timer);
        let handle = thread::Builder::new()
            .name("ptimer".to_string())
            .spawn(move || Self::run(&worker))?;
        Ok(Self {
            timer,
            handle: Some(handle),
        })
    }

    fn run(timer: &CountdownTimer) {
        log::debug!("[ptimer] timing thread started");
        loop {
            let fired = {
                let mut state = timer.lock();
                loop {
                    if state.shutdown {
                        log::debug!("[ptimer] timing thread shutting down");
                        return;
                    }
                    let now = timer.clock.now_ns();
                    let fired = state.collect_expiries(now);
                    if fired > 0 {
                        break fired;
                    }
                    let wait = match state.deadline {
                        Some(deadline) => Duration::from_nanos(deadline - now),
                        None => IDLE_WAIT,
                    };
                    state = match timer.cond.wait_timeout(state, wait) {
                        Ok((guard, _)) => guard,
                        Err(e) => e.into_inner().0,
                    };
                }
            };
            for _ in 0..fired {
                (timer.callback)();
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        {
            let mut state = self.timer.lock();
            state.shutdown = true;
            self.timer.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
