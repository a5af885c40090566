//! Dispatch loop between a CPU engine and the SoC.
//!
//! The CPU engine itself lives outside this crate and plugs in through the
//! [`Hart`] trait. The loop samples the interrupt line once per step: while
//! it is asserted the hart is asked to take the interrupt before executing
//! anything else, which mirrors a level-triggered IRQ input.

use crate::Trap;
use crate::bus::{Bus, SystemBus};
use crate::devices::intc::{self, INTC_BASE, IRQ_TIMER, IRQ_UART};
use crate::devices::timer::{self, TIMER_BASE, Timer};
use crate::devices::uart::{self, UART_BASE};
use crate::irq::IrqLine;
use crate::soc::LarmSoc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Longest a waiting hart sleeps on the line before the loop rechecks the
/// stop flag and the timer.
const WFI_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// Nothing to do until the next interrupt.
    WaitForInterrupt,
    Halt,
}

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Halted,
    Stopped,
    StepLimit,
}

/// A CPU core driven by the dispatch loop.
///
/// Architectural traps are the hart's business; an `Err` from either method
/// is fatal and ends the run.
pub trait Hart {
    fn step(&mut self, bus: &dyn Bus) -> Result<StepOutcome, Trap>;

    /// Called instead of `step` while the interrupt line is asserted.
    fn take_interrupt(&mut self, bus: &dyn Bus) -> Result<(), Trap>;
}

pub struct Machine<H: Hart> {
    hart: H,
    bus: Arc<SystemBus>,
    line: Arc<IrqLine>,
    timer: Option<Arc<Timer>>,
    stop: Arc<AtomicBool>,
    steps: u64,
    interrupts: u64,
}

impl<H: Hart> Machine<H> {
    pub fn new(hart: H, soc: &LarmSoc) -> Self {
        Self {
            hart,
            bus: Arc::clone(soc.bus()),
            line: Arc::clone(soc.line()),
            timer: None,
            stop: Arc::new(AtomicBool::new(false)),
            steps: 0,
            interrupts: 0,
        }
    }

    /// Deliver timer expiries from the dispatch loop, for boards built
    /// without a timing thread.
    pub fn with_timer_polling(mut self, soc: &LarmSoc) -> Self {
        self.timer = Some(Arc::clone(soc.timer()));
        self
    }

    /// Use `flag` as the external stop request.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = flag;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn hart(&self) -> &H {
        &self.hart
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn interrupts_taken(&self) -> u64 {
        self.interrupts
    }

    fn poll_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.poll();
        }
    }

    /// Run until the hart halts, the stop flag is raised, or `max_steps`
    /// steps have executed.
    pub fn run(&mut self, max_steps: Option<u64>) -> Result<RunExit, Trap> {
        let bus: &dyn Bus = self.bus.as_ref();
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(RunExit::Stopped);
            }
            if max_steps.is_some_and(|max| self.steps >= max) {
                return Ok(RunExit::StepLimit);
            }
            self.poll_timer();

            if self.line.is_asserted() {
                self.interrupts += 1;
                self.hart.take_interrupt(bus)?;
                continue;
            }

            self.steps += 1;
            match self.hart.step(bus)? {
                StepOutcome::Continue => {}
                StepOutcome::Halt => {
                    log::info!("[Machine] hart halted after {} steps", self.steps);
                    return Ok(RunExit::Halted);
                }
                StepOutcome::WaitForInterrupt => {
                    self.line.wait(WFI_TIMEOUT);
                }
            }
        }
    }
}

/// End-of-transmission: the echo guest halts when it receives this byte.
pub const ECHO_HALT_BYTE: u8 = 0x04;

/// Built-in guest that echoes UART input back to the UART.
///
/// On its first step it unmasks the UART (and the timer, when a tick
/// frequency is given) and programs a periodic tick. Afterwards it sleeps
/// until interrupted. Each interrupt acknowledges by writing `SOURCE`, then
/// drains the receive mailbox into the transmitter.
pub struct EchoHart {
    tick_hz: Option<u32>,
    configured: bool,
    halt: bool,
    ticks: u64,
    echoed: u64,
}

impl EchoHart {
    pub fn new(tick_hz: Option<u32>) -> Self {
        Self {
            tick_hz,
            configured: false,
            halt: false,
            ticks: 0,
            echoed: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    fn configure(&mut self, bus: &dyn Bus) -> Result<(), Trap> {
        let mut mask = IRQ_UART;
        if let Some(hz) = self.tick_hz {
            mask |= IRQ_TIMER;
            bus.write32(TIMER_BASE + timer::FREQ, hz)?;
            bus.write32(TIMER_BASE + timer::COUNTER, hz)?;
            bus.write32(TIMER_BASE + timer::ENABLE, 1)?;
        }
        bus.write8(INTC_BASE + intc::ENABLE, mask)?;
        self.configured = true;
        Ok(())
    }
}

impl Hart for EchoHart {
    fn step(&mut self, bus: &dyn Bus) -> Result<StepOutcome, Trap> {
        if self.halt {
            return Ok(StepOutcome::Halt);
        }
        if !self.configured {
            self.configure(bus)?;
        }
        Ok(StepOutcome::WaitForInterrupt)
    }

    fn take_interrupt(&mut self, bus: &dyn Bus) -> Result<(), Trap> {
        let source = bus.read8(INTC_BASE + intc::SOURCE)?;
        bus.write8(INTC_BASE + intc::SOURCE, 0)?;

        if source & IRQ_TIMER != 0 {
            self.ticks += 1;
            log::debug!("[Echo] tick {}", self.ticks);
        }
        // The mailbox is polled whatever SOURCE said: a byte that raced the
        // acknowledge above would otherwise sit unnoticed
        while bus.read8(UART_BASE + uart::RX_READY)? != 0 {
            let byte = bus.read8(UART_BASE + uart::DATA)?;
            if byte == ECHO_HALT_BYTE {
                self.halt = true;
                break;
            }
            while bus.read8(UART_BASE + uart::TX_READY)? == 0 {
                std::hint::spin_loop();
            }
            bus.write8(UART_BASE + uart::DATA, byte)?;
            self.echoed += 1;
        }
        Ok(())
    }
}
