//! LARM SoC assembly.
//!
//! Builds the fixed address map of the board around a shared system bus:
//!
//! | Region               | Base          | Size       |
//! |----------------------|---------------|------------|
//! | RAM                  | `0x0000_0000` | configured |
//! | UART                 | `0xFF01_0000` | `0x400`    |
//! | Timer                | `0xFF02_0000` | `0x400`    |
//! | Interrupt controller | `0xFF0F_0000` | `0x400`    |
//!
//! plus any number of raw devices at their configured ranges.

use crate::bus::{BusError, SystemBus};
use crate::chardev::CharBackend;
use crate::devices::intc::{INTC_BASE, INTC_SIZE, InterruptController};
use crate::devices::raw::{PluginLoader, RawDevice, RawDeviceConfig, RawDeviceError};
use crate::devices::timer::{TIMER_BASE, TIMER_SIZE, Timer};
use crate::devices::uart::{UART_BASE, UART_SIZE, Uart};
use crate::dram::DRAM_BASE;
use crate::irq::IrqLine;
use crate::ptimer::{Clock, HostClock};
use crate::snapshot::{SNAPSHOT_VERSION, SnapshotError, SocSnapshot};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_RAM_SIZE: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocConfig {
    pub ram_size: usize,
    #[serde(default)]
    pub raw_devices: Vec<RawDeviceConfig>,
}

impl SocConfig {
    /// Board with `mib` MiB of RAM and no raw devices.
    pub fn with_ram_mib(mib: usize) -> Result<Self, SocError> {
        let ram_size = mib
            .checked_mul(1024 * 1024)
            .ok_or_else(|| SocError::Config(format!("{} MiB of RAM is too large", mib)))?;
        Ok(Self {
            ram_size,
            raw_devices: Vec::new(),
        })
    }
}

impl Default for SocConfig {
    fn default() -> Self {
        Self {
            ram_size: DEFAULT_RAM_SIZE,
            raw_devices: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SocError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    RawDevice(#[from] RawDeviceError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("invalid board configuration: {0}")]
    Config(String),

    #[error("failed to start host thread: {0}")]
    Io(#[from] io::Error),
}

/// How timer expiries reach the interrupt controller.
pub enum TimerDriver {
    /// A host thread follows the given clock and delivers expiries itself.
    Thread(Arc<dyn Clock>),
    /// Expiries are delivered by [`LarmSoc::poll_timer`].
    Polled(Arc<dyn Clock>),
}

impl TimerDriver {
    pub fn host() -> Self {
        Self::Thread(Arc::new(HostClock::new()))
    }
}

pub struct LarmSoc {
    bus: Arc<SystemBus>,
    intc: Arc<InterruptController>,
    timer: Arc<Timer>,
    uart: Arc<Uart>,
    raw_devices: Vec<Arc<RawDevice>>,
}

impl LarmSoc {
    /// Build the board and realize every configured raw device.
    ///
    /// Any realize failure is returned and leaves nothing half-mapped: the
    /// partially built board is torn down on the error path.
    pub fn new(
        config: &SocConfig,
        backend: Arc<dyn CharBackend>,
        timing: TimerDriver,
        loader: &dyn PluginLoader,
    ) -> Result<Self, SocError> {
        let bus = Arc::new(SystemBus::new(DRAM_BASE, config.ram_size));
        let line = Arc::new(IrqLine::new());
        let intc = Arc::new(InterruptController::new(line));

        let timer = match timing {
            TimerDriver::Thread(clock) => {
                let mut timer = Timer::new(Arc::clone(&intc), clock);
                timer.spawn_thread()?;
                timer
            }
            TimerDriver::Polled(clock) => Timer::new(Arc::clone(&intc), clock),
        };
        let timer = Arc::new(timer);
        let uart = Uart::attach(backend, Arc::clone(&intc))?;

        bus.map("uart", UART_BASE, UART_SIZE, uart.clone())?;
        bus.map("timer", TIMER_BASE, TIMER_SIZE, timer.clone())?;
        bus.map("intc", INTC_BASE, INTC_SIZE, intc.clone())?;

        let mut soc = Self {
            bus,
            intc,
            timer,
            uart,
            raw_devices: Vec::new(),
        };
        for raw in &config.raw_devices {
            soc.add_raw_device(raw.clone(), loader)?;
        }
        Ok(soc)
    }

    /// Realize one more raw device on the running board.
    pub fn add_raw_device(
        &mut self,
        config: RawDeviceConfig,
        loader: &dyn PluginLoader,
    ) -> Result<Arc<RawDevice>, SocError> {
        let device = RawDevice::realize(config, loader, &self.bus)?;
        self.raw_devices.push(Arc::clone(&device));
        Ok(device)
    }

    pub fn bus(&self) -> &Arc<SystemBus> {
        &self.bus
    }

    pub fn intc(&self) -> &Arc<InterruptController> {
        &self.intc
    }

    pub fn line(&self) -> &Arc<IrqLine> {
        self.intc.line()
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub fn uart(&self) -> &Arc<Uart> {
        &self.uart
    }

    pub fn raw_devices(&self) -> &[Arc<RawDevice>] {
        &self.raw_devices
    }

    /// Deliver due timer expiries on the calling thread.
    pub fn poll_timer(&self) -> u32 {
        self.timer.poll()
    }

    pub fn snapshot(&self) -> SocSnapshot {
        SocSnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            intc: self.intc.snapshot(),
            timer: self.timer.snapshot(),
            uart: self.uart.snapshot(),
        }
    }

    pub fn restore(&self, snap: &SocSnapshot) -> Result<(), SocError> {
        snap.check_version()?;
        self.intc.restore(&snap.intc);
        self.timer.restore(&snap.timer);
        self.uart.restore(&snap.uart);
        log::info!("[SoC] restored peripheral state");
        Ok(())
    }

    /// Unmap every raw device and release its plugin.
    pub fn teardown(&mut self) {
        for device in self.raw_devices.drain(..) {
            device.unrealize(&self.bus);
        }
    }
}

impl Drop for LarmSoc {
    fn drop(&mut self) {
        self.teardown();
    }
}
