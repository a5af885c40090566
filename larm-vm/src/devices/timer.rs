use crate::bus::MmioDevice;
use crate::devices::intc::{IRQ_TIMER, InterruptController};
use crate::dram::MemoryError;
use crate::ptimer::{Clock, CountdownTimer, PtimerSnapshot, TimerThread};
use std::io;
use std::sync::Arc;

pub const TIMER_BASE: u64 = 0xFF02_0000;
pub const TIMER_SIZE: u64 = 0x400;

// Registers (offset)
pub const ENABLE: u64 = 0x0; // Non-zero starts the countdown, zero stops it
pub const FREQ: u64 = 0x4; // Tick frequency in Hz
pub const COUNTER: u64 = 0x8; // Write: count and reload limit; read: live count

/// Periodic countdown timer peripheral.
///
/// Each expiry raises `IRQ_TIMER` on the interrupt controller when that
/// source is enabled at the moment of expiry. Expiries are delivered by
/// the host timing thread (or by [`Timer::poll`] under a manual clock).
pub struct Timer {
    ptimer: Arc<CountdownTimer>,
    thread: Option<TimerThread>,
}

impl Timer {
    pub fn new(intc: Arc<InterruptController>, clock: Arc<dyn Clock>) -> Self {
        let ptimer = CountdownTimer::new(
            clock,
            Box::new(move || {
                if intc.source_enabled(IRQ_TIMER) {
                    intc.raise(IRQ_TIMER);
                } else {
                    log::trace!("[Timer] expiry with IRQ_TIMER masked");
                }
            }),
        );
        Self {
            ptimer,
            thread: None,
        }
    }

    /// Hand expiry delivery to a dedicated timing thread.
    pub fn spawn_thread(&mut self) -> io::Result<()> {
        if self.thread.is_none() {
            self.thread = Some(TimerThread::spawn(Arc::clone(&self.ptimer))?);
        }
        Ok(())
    }

    /// Deliver due expiries on the calling thread. Returns how many fired.
    pub fn poll(&self) -> u32 {
        self.ptimer.poll()
    }

    pub fn is_running(&self) -> bool {
        self.ptimer.is_running()
    }

    pub fn read(&self, offset: u64) -> u32 {
        match offset {
            COUNTER => self.ptimer.count().min(u32::MAX as u64) as u32,
            _ => 0,
        }
    }

    pub fn write(&self, offset: u64, value: u32) {
        if !matches!(offset, ENABLE | FREQ | COUNTER) {
            return;
        }
        let mut tx = self.ptimer.begin();
        match offset {
            ENABLE => {
                if value != 0 {
                    log::debug!("[Timer] start");
                    tx.run(false);
                } else {
                    log::debug!("[Timer] stop");
                    tx.stop();
                }
            }
            FREQ => {
                log::debug!("[Timer] frequency {} Hz", value);
                tx.set_freq(value);
            }
            COUNTER => {
                log::debug!("[Timer] counter {}", value);
                tx.set_count(value as u64);
                tx.set_limit(value as u64, true);
            }
            _ => {}
        }
        tx.commit();
    }

    pub fn snapshot(&self) -> PtimerSnapshot {
        self.ptimer.snapshot()
    }

    pub fn restore(&self, snap: &PtimerSnapshot) {
        self.ptimer.restore(snap);
    }
}

impl MmioDevice for Timer {
    fn load(&self, offset: u64, _size: u64) -> Result<u64, MemoryError> {
        Ok(self.read(offset) as u64)
    }

    fn store(&self, offset: u64, _size: u64, value: u64) -> Result<(), MemoryError> {
        self.write(offset, value as u32);
        Ok(())
    }
}
