pub mod intc;
pub mod raw;
pub mod timer;
pub mod uart;
