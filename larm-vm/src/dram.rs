use std::sync::RwLock;
use thiserror::Error;

/// Base physical address of RAM on the LARM board.
pub const DRAM_BASE: u64 = 0x0000_0000;

/// Device-local memory access errors.
///
/// These are mapped into `Trap`s by the system bus.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Out-of-bounds memory access at {0:#x}")]
    OutOfBounds(u64),

    #[error("Unsupported access size {0}")]
    InvalidSize(u64),
}

/// RAM backing store.
///
/// Offsets passed to the load/store helpers are offsets from `base`, not
/// guest physical addresses. Use [`Dram::offset`] to translate.
pub struct Dram {
    pub base: u64,
    size: usize,
    data: RwLock<Vec<u8>>,
}

impl Dram {
    /// Create a new RAM image of `size` bytes, zero-initialised.
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            size,
            data: RwLock::new(vec![0; size]),
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn offset(&self, addr: u64) -> Option<usize> {
        let off = addr.wrapping_sub(self.base) as usize;
        if addr >= self.base && off < self.size {
            Some(off)
        } else {
            None
        }
    }

    fn check(&self, offset: u64, len: u64) -> Result<usize, MemoryError> {
        let end = offset
            .checked_add(len)
            .ok_or(MemoryError::OutOfBounds(offset))?;
        if end > self.size as u64 {
            return Err(MemoryError::OutOfBounds(offset));
        }
        Ok(offset as usize)
    }

    /// Copy an image into RAM at the given offset.
    pub fn load(&self, image: &[u8], offset: u64) -> Result<(), MemoryError> {
        let off = self.check(offset, image.len() as u64)?;
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data[off..off + image.len()].copy_from_slice(image);
        Ok(())
    }

    pub fn zero_range(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        let off = self.check(offset as u64, len as u64)?;
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data[off..off + len].fill(0);
        Ok(())
    }

    /// Little-endian read of `size` bytes (1, 2, 4 or 8).
    pub fn read(&self, offset: u64, size: u64) -> Result<u64, MemoryError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(MemoryError::InvalidSize(size));
        }
        let off = self.check(offset, size)?;
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let mut buf = [0u8; 8];
        buf[..size as usize].copy_from_slice(&data[off..off + size as usize]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Little-endian write of the low `size` bytes of `value`.
    pub fn write(&self, offset: u64, size: u64, value: u64) -> Result<(), MemoryError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(MemoryError::InvalidSize(size));
        }
        let off = self.check(offset, size)?;
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data[off..off + size as usize].copy_from_slice(&value.to_le_bytes()[..size as usize]);
        Ok(())
    }

    /// Copy `len` bytes out of RAM (loader verification, debugging).
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let off = self.check(offset, len as u64)?;
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data[off..off + len].to_vec())
    }
}
