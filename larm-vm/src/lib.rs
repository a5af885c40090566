//! Peripheral models for the LARM single-core SoC.
//!
//! The crate provides the memory-mapped interrupt controller, timer and UART
//! of the board, the raw device bridge that forwards an address range to a
//! dynamically loaded plugin, and the glue a CPU engine needs to drive them:
//! a system bus, a level-triggered interrupt line and a dispatch loop.

pub mod bus;
pub mod chardev;
pub mod devices;
pub mod dram;
pub mod irq;
pub mod loader;
pub mod machine;
pub mod ptimer;
pub mod snapshot;
pub mod soc;

/// Faults reported to the CPU engine by the system bus.
///
/// Peripherals never produce these for register-level misuse; they only
/// surface when an access misses every mapped region or is malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    LoadAccessFault(u64),
    StoreAccessFault(u64),

    // Custom internal errors
    Fatal(String),
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Trap {}
