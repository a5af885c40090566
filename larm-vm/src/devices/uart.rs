use crate::bus::MmioDevice;
use crate::chardev::{CharBackend, CharFrontend};
use crate::devices::intc::{IRQ_UART, InterruptController};
use crate::dram::MemoryError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub const UART_BASE: u64 = 0xFF01_0000;
pub const UART_SIZE: u64 = 0x400;

// Registers (offset)
pub const DATA: u64 = 0x0; // Read: received byte; write: transmit byte
pub const RX_READY: u64 = 0x4; // 1 when a received byte is waiting (R)
pub const TX_READY: u64 = 0x8; // 1 when a transmit write is accepted (R)
pub const BAUDRATE: u64 = 0xC; // Accepted and ignored (W)

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartSnapshot {
    pub rx_data: u8,
    pub rx_ready: bool,
    pub tx_ready: bool,
}

struct UartRegs {
    rx_data: u8,
    rx_ready: bool,
    tx_ready: bool,
}

/// Byte-wide UART with a one-deep receive mailbox.
///
/// A byte arriving while the previous one is still unread is dropped.
/// Transmit is synchronous: `TX_READY` reads 0 only while a write to the
/// backend is in progress, and a `DATA` write issued during that window is
/// dropped.
pub struct Uart {
    regs: Mutex<UartRegs>,
    backend: Arc<dyn CharBackend>,
    intc: Arc<InterruptController>,
}

impl Uart {
    pub fn new(backend: Arc<dyn CharBackend>, intc: Arc<InterruptController>) -> Self {
        Self {
            regs: Mutex::new(UartRegs {
                rx_data: 0,
                rx_ready: false,
                tx_ready: true,
            }),
            backend,
            intc,
        }
    }

    /// Create the UART and register it as the receiver of `backend`.
    pub fn attach(
        backend: Arc<dyn CharBackend>,
        intc: Arc<InterruptController>,
    ) -> std::io::Result<Arc<Self>> {
        let uart = Arc::new(Self::new(Arc::clone(&backend), intc));
        let frontend: Arc<dyn CharFrontend> = uart.clone();
        backend.attach(Arc::downgrade(&frontend))?;
        Ok(uart)
    }

    fn regs(&self) -> std::sync::MutexGuard<'_, UartRegs> {
        self.regs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn rx_ready(&self) -> bool {
        self.regs().rx_ready
    }

    pub fn tx_ready(&self) -> bool {
        self.regs().tx_ready
    }

    pub fn read(&self, offset: u64) -> u8 {
        let mut regs = self.regs();
        match offset {
            DATA => {
                regs.rx_ready = false;
                regs.rx_data
            }
            RX_READY => regs.rx_ready as u8,
            TX_READY => regs.tx_ready as u8,
            _ => 0,
        }
    }

    pub fn write(&self, offset: u64, value: u8) {
        match offset {
            DATA => self.transmit(value),
            BAUDRATE => log::debug!("[UART] baudrate write {:#x} ignored", value),
            _ => {}
        }
    }

    fn transmit(&self, byte: u8) {
        {
            let mut regs = self.regs();
            if !regs.tx_ready {
                log::warn!("[UART] transmitter busy, dropped {:#04x}", byte);
                return;
            }
            regs.tx_ready = false;
        }

        log::trace!("[UART] tx {:#04x}", byte);
        if let Err(e) = self.backend.write_all(&[byte]) {
            log::warn!("[UART] backend write failed: {}", e);
        }

        self.regs().tx_ready = true;
    }

    pub fn snapshot(&self) -> UartSnapshot {
        let regs = self.regs();
        UartSnapshot {
            rx_data: regs.rx_data,
            rx_ready: regs.rx_ready,
            tx_ready: regs.tx_ready,
        }
    }

    pub fn restore(&self, snap: &UartSnapshot) {
        let mut regs = self.regs();
        regs.rx_data = snap.rx_data;
        regs.rx_ready = snap.rx_ready;
        regs.tx_ready = snap.tx_ready;
    }
}

impl CharFrontend for Uart {
    fn can_receive(&self) -> usize {
        1
    }

    fn receive(&self, buf: &[u8]) {
        let Some(&byte) = buf.first() else {
            return;
        };
        let mut regs = self.regs();
        if regs.rx_ready {
            log::warn!("[UART] overrun, dropped {:#04x}", byte);
            return;
        }
        log::trace!("[UART] rx {:#04x}", byte);
        regs.rx_data = byte;
        regs.rx_ready = true;
        drop(regs);

        if self.intc.source_enabled(IRQ_UART) {
            self.intc.raise(IRQ_UART);
        }
    }
}

impl MmioDevice for Uart {
    fn load(&self, offset: u64, _size: u64) -> Result<u64, MemoryError> {
        Ok(self.read(offset) as u64)
    }

    fn store(&self, offset: u64, _size: u64, value: u64) -> Result<(), MemoryError> {
        self.write(offset, value as u8);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chardev::CaptureBackend;
    use crate::devices::intc::{self, IRQ_TIMER};
    use crate::irq::IrqLine;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup() -> (Arc<Uart>, Arc<CaptureBackend>, Arc<InterruptController>) {
        let intc = Arc::new(InterruptController::new(Arc::new(IrqLine::new())));
        let backend = Arc::new(CaptureBackend::new());
        let uart = Uart::attach(backend.clone(), Arc::clone(&intc)).unwrap();
        (uart, backend, intc)
    }

    #[test]
    fn test_reset_state() {
        let (uart, _backend, _intc) = setup();
        assert_eq!(uart.read(RX_READY), 0);
        assert_eq!(uart.read(TX_READY), 1);
    }

    #[test]
    fn test_receive_read_once() {
        let (uart, backend, _intc) = setup();
        assert_eq!(backend.inject(b"A"), 1);
        assert_eq!(uart.read(RX_READY), 1);
        assert_eq!(uart.read(DATA), b'A');
        assert_eq!(uart.read(RX_READY), 0);
    }

    #[test]
    fn test_overrun_drops_new_byte() {
        let (uart, backend, _intc) = setup();
        backend.inject(b"A");
        backend.inject(b"B");
        assert_eq!(uart.read(DATA), b'A');
        assert_eq!(uart.read(RX_READY), 0);

        // The mailbox is free again
        backend.inject(b"C");
        assert_eq!(uart.read(DATA), b'C');
    }

    #[test]
    fn test_receive_raises_when_enabled() {
        let (uart, backend, intc) = setup();
        intc.write(intc::ENABLE, IRQ_UART);
        backend.inject(b"x");
        assert!(intc.line().is_asserted());
        assert_eq!(intc.read(intc::SOURCE), IRQ_UART);

        // Reading DATA does not acknowledge; only SOURCE does
        uart.read(DATA);
        assert!(intc.line().is_asserted());
        intc.write(intc::SOURCE, 0);
        assert!(!intc.line().is_asserted());
    }

    #[test]
    fn test_receive_masked_does_not_raise() {
        let (uart, backend, intc) = setup();
        intc.write(intc::ENABLE, IRQ_TIMER);
        backend.inject(b"x");
        assert!(!intc.line().is_asserted());
        assert_eq!(intc.read(intc::SOURCE), 0);
        assert_eq!(uart.read(RX_READY), 1);
    }

    #[test]
    fn test_overrun_does_not_raise_again() {
        let (_uart, backend, intc) = setup();
        intc.write(intc::ENABLE, IRQ_UART);
        backend.inject(b"a");
        backend.inject(b"b");
        assert_eq!(intc.line().raise_count(), 1);
    }

    #[test]
    fn test_transmit() {
        let (uart, backend, _intc) = setup();
        uart.write(DATA, b'h');
        assert_eq!(uart.read(TX_READY), 1);
        uart.write(DATA, b'i');
        assert_eq!(backend.output(), b"hi".to_vec());
    }

    #[test]
    fn test_transmit_while_busy_is_dropped() {
        let (uart, backend, _intc) = setup();
        uart.regs().tx_ready = false;
        uart.write(DATA, b'!');
        assert!(backend.output().is_empty());
    }

    /// Backend that observes the UART while a write is in flight.
    struct Observer {
        uart: Mutex<Option<Arc<Uart>>>,
        saw_busy: AtomicBool,
    }

    impl CharBackend for Observer {
        fn write_all(&self, _buf: &[u8]) -> io::Result<()> {
            if let Some(uart) = self.uart.lock().unwrap().as_ref() {
                self.saw_busy.store(uart.read(TX_READY) == 0, Ordering::SeqCst);
                // A nested transmit during the window is dropped
                uart.write(DATA, b'?');
            }
            Ok(())
        }
    }

    #[test]
    fn test_tx_busy_visible_during_write() {
        let intc = Arc::new(InterruptController::new(Arc::new(IrqLine::new())));
        let observer = Arc::new(Observer {
            uart: Mutex::new(None),
            saw_busy: AtomicBool::new(false),
        });
        let uart = Uart::attach(observer.clone(), intc).unwrap();
        *observer.uart.lock().unwrap() = Some(Arc::clone(&uart));

        uart.write(DATA, b'x');
        assert!(observer.saw_busy.load(Ordering::SeqCst));
        assert_eq!(uart.read(TX_READY), 1);
        *observer.uart.lock().unwrap() = None;
    }

    #[test]
    fn test_baudrate_and_readonly_writes_ignored() {
        let (uart, backend, _intc) = setup();
        uart.write(BAUDRATE, 0x55);
        uart.write(RX_READY, 1);
        uart.write(TX_READY, 0);
        assert_eq!(uart.read(RX_READY), 0);
        assert_eq!(uart.read(TX_READY), 1);
        assert_eq!(uart.read(BAUDRATE), 0);
        assert!(backend.output().is_empty());
    }

    #[test]
    fn test_mmio_access() {
        let (uart, backend, _intc) = setup();
        uart.store(DATA, 4, 0x141).unwrap();
        assert_eq!(backend.output(), vec![0x41]);
        assert_eq!(uart.load(TX_READY, 4).unwrap(), 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let (uart, backend, _intc) = setup();
        backend.inject(b"Z");
        let snap = uart.snapshot();

        let (uart2, _backend2, _intc2) = setup();
        uart2.restore(&snap);
        assert_eq!(uart2.read(RX_READY), 1);
        assert_eq!(uart2.read(DATA), b'Z');
    }
}
