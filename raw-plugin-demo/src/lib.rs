//! Sample raw device: a bank of 64-bit scratch registers.
//!
//! Build as a shared object and hand it to the emulator with
//! `--device raw,addr=0x40000000,size=0x100,file=libraw_plugin_demo.so,arg=--fill 0x55`.
//!
//! | Offset | Register | Access                                   |
//! |--------|----------|------------------------------------------|
//! | `0x0`  | ID       | R, always [`DEVICE_ID`]                  |
//! | `0x8`  | WRITES   | R, number of accepted writes             |
//! | `0x10`.. | SCRATCH | R/W, little-endian, any access size     |

use clap::Parser;
use std::ffi::{CStr, c_char, c_int};
use std::sync::Mutex;

/// "LARMSCR\0"
pub const DEVICE_ID: u64 = 0x0052_4353_4D52_414C;

const REG_ID: u64 = 0x0;
const REG_WRITES: u64 = 0x8;
const SCRATCH_BASE: u64 = 0x10;

#[derive(Parser, Debug)]
struct DemoArgs {
    #[arg(long, value_parser = parse_hex)]
    addr: u64,

    #[arg(long, value_parser = parse_hex)]
    size: u64,

    /// Initial value of every scratch byte
    #[arg(long, default_value = "0", value_parser = parse_hex)]
    fill: u64,
}

/// Accepts the `0X`-prefixed form the host passes, plus `0x` and decimal.
fn parse_hex(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0X").or_else(|| s.strip_prefix("0x")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

struct ScratchDevice {
    scratch: Vec<u8>,
    writes: u64,
}

impl ScratchDevice {
    fn new(size: u64, fill: u8) -> Self {
        let len = size.saturating_sub(SCRATCH_BASE) as usize;
        Self {
            scratch: vec![fill; len],
            writes: 0,
        }
    }

    fn scratch_range(&self, offset: u64, size: u32) -> Option<std::ops::Range<usize>> {
        let start = offset.checked_sub(SCRATCH_BASE)? as usize;
        let end = start.checked_add(size as usize)?;
        (matches!(size, 1 | 2 | 4 | 8) && end <= self.scratch.len()).then_some(start..end)
    }

    fn read(&self, offset: u64, size: u32) -> u64 {
        match offset {
            REG_ID => DEVICE_ID,
            REG_WRITES => self.writes,
            _ => match self.scratch_range(offset, size) {
                Some(range) => {
                    let mut bytes = [0u8; 8];
                    bytes[..range.len()].copy_from_slice(&self.scratch[range]);
                    u64::from_le_bytes(bytes)
                }
                None => 0,
            },
        }
    }

    fn write(&mut self, offset: u64, value: u64, size: u32) {
        if let Some(range) = self.scratch_range(offset, size) {
            let len = range.len();
            self.scratch[range].copy_from_slice(&value.to_le_bytes()[..len]);
            self.writes += 1;
        }
    }
}

static DEVICE: Mutex<Option<ScratchDevice>> = Mutex::new(None);

fn device() -> std::sync::MutexGuard<'static, Option<ScratchDevice>> {
    DEVICE.lock().unwrap_or_else(|e| e.into_inner())
}

/// # Safety
///
/// `args` must be NULL or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plugin_init(args: *const c_char) -> c_int {
    if args.is_null() {
        return -1;
    }
    // SAFETY: checked for NULL above; NUL termination is the caller's contract.
    let args = unsafe { CStr::from_ptr(args) }.to_string_lossy();
    let parsed = match DemoArgs::try_parse_from(args.split_whitespace()) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("raw-plugin-demo: {}", e);
            return -1;
        }
    };
    if parsed.addr % 8 != 0 {
        eprintln!("raw-plugin-demo: base {:#x} is not 8-byte aligned", parsed.addr);
        return -1;
    }
    if parsed.size <= SCRATCH_BASE {
        eprintln!("raw-plugin-demo: region of {:#x} bytes has no scratch space", parsed.size);
        return -1;
    }
    *device() = Some(ScratchDevice::new(parsed.size, parsed.fill as u8));
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn plugin_read(offset: u64, size: u32) -> u64 {
    device().as_ref().map_or(0, |dev| dev.read(offset, size))
}

#[unsafe(no_mangle)]
pub extern "C" fn plugin_write(offset: u64, value: u64, size: u32) {
    if let Some(dev) = device().as_mut() {
        dev.write(offset, value, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_scratch_registers() {
        let mut dev = ScratchDevice::new(0x40, 0xAA);
        assert_eq!(dev.read(REG_ID, 8), DEVICE_ID);
        assert_eq!(dev.read(SCRATCH_BASE, 2), 0xAAAA);

        dev.write(SCRATCH_BASE + 4, 0x1122_3344, 4);
        assert_eq!(dev.read(SCRATCH_BASE + 4, 4), 0x1122_3344);
        assert_eq!(dev.read(SCRATCH_BASE + 5, 1), 0x33);
        assert_eq!(dev.read(REG_WRITES, 8), 1);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut dev = ScratchDevice::new(0x18, 0);
        dev.write(SCRATCH_BASE + 4, u64::MAX, 8);
        dev.write(REG_ID, 5, 8);
        assert_eq!(dev.read(REG_WRITES, 8), 0);
        assert_eq!(dev.read(SCRATCH_BASE + 4, 8), 0);
        assert_eq!(dev.read(REG_ID, 8), DEVICE_ID);
    }

    #[test]
    fn test_entry_points() {
        let bad = CString::new("libdemo.so --addr 0X40000000").unwrap();
        assert_ne!(unsafe { plugin_init(bad.as_ptr()) }, 0);

        let args = CString::new("libdemo.so --addr 0X40000000 --size 0X100 --fill 0x7").unwrap();
        assert_eq!(unsafe { plugin_init(args.as_ptr()) }, 0);
        assert_eq!(plugin_read(REG_ID, 4), DEVICE_ID);
        assert_eq!(plugin_read(SCRATCH_BASE, 1), 0x07);
        plugin_write(SCRATCH_BASE + 8, 0xBEEF, 2);
        assert_eq!(plugin_read(SCRATCH_BASE + 8, 2), 0xBEEF);
    }
}
