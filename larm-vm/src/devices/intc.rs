use crate::bus::MmioDevice;
use crate::dram::MemoryError;
use crate::irq::IrqLine;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub const INTC_BASE: u64 = 0xFF0F_0000;
pub const INTC_SIZE: u64 = 0x400;

// Registers (offset)
pub const SOURCE: u64 = 0x0; // Asserted sources (R), acknowledge (W)
pub const ENABLE: u64 = 0x4; // Per-source enable mask

/// Interrupt source bits.
pub const IRQ_TIMER: u8 = 1 << 0;
pub const IRQ_UART: u8 = 1 << 1;

/// Register-visible controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntcSnapshot {
    pub source: u8,
    pub enable: u8,
    pub line: bool,
}

struct IntcState {
    source: u8,
    enable: u8,
}

/// Interrupt line aggregator.
///
/// Any number of producers OR their source bit in with [`raise`], which
/// drives the CPU line high every time. The line only goes low when the
/// guest writes `SOURCE`, whatever value it writes.
///
/// The enable mask is not applied here. Producers check
/// [`source_enabled`] before raising; a masked source that raises anyway
/// still asserts the line.
///
/// [`raise`]: InterruptController::raise
/// [`source_enabled`]: InterruptController::source_enabled
pub struct InterruptController {
    state: Mutex<IntcState>,
    line: Arc<IrqLine>,
}

impl InterruptController {
    pub fn new(line: Arc<IrqLine>) -> Self {
        Self {
            state: Mutex::new(IntcState {
                source: 0,
                enable: 0,
            }),
            line,
        }
    }

    /// The CPU-facing line this controller drives.
    pub fn line(&self) -> &Arc<IrqLine> {
        &self.line
    }

    pub fn raise(&self, source: u8) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.source |= source;
        // Driven while the lock is held so a concurrent acknowledge cannot
        // interleave between the bit update and the line update.
        self.line.raise();
        log::debug!(
            "[INTC] raise {:#04x}, sources now {:#04x}",
            source,
            state.source
        );
    }

    /// Whether `source` is unmasked in the enable register.
    pub fn source_enabled(&self, source: u8) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).enable & source != 0
    }

    pub fn read(&self, offset: u64) -> u8 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match offset {
            SOURCE => state.source,
            ENABLE => state.enable,
            _ => 0,
        }
    }

    pub fn write(&self, offset: u64, value: u8) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match offset {
            SOURCE => {
                state.source = value;
                self.line.lower();
                log::debug!("[INTC] acknowledge, sources now {:#04x}", value);
            }
            ENABLE => {
                state.enable = value;
                log::debug!("[INTC] enable mask {:#04x}", value);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> IntcSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        IntcSnapshot {
            source: state.source,
            enable: state.enable,
            line: self.line.is_asserted(),
        }
    }

    pub fn restore(&self, snap: &IntcSnapshot) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.source = snap.source;
        state.enable = snap.enable;
        self.line.set_level(snap.line);
    }
}

impl MmioDevice for InterruptController {
    fn load(&self, offset: u64, _size: u64) -> Result<u64, MemoryError> {
        Ok(self.read(offset) as u64)
    }

    fn store(&self, offset: u64, _size: u64, value: u64) -> Result<(), MemoryError> {
        self.write(offset, value as u8);
        Ok(())
    }
}
