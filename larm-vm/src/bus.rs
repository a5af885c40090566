use crate::Trap;
use crate::dram::{Dram, MemoryError};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// A device exposing a block of memory-mapped registers.
///
/// Offsets are relative to the base the device was mapped at. All methods
/// take `&self`: devices are reached from the CPU thread and from host
/// callbacks, so any mutable state lives behind interior mutability.
pub trait MmioDevice: Send + Sync {
    fn load(&self, offset: u64, size: u64) -> Result<u64, MemoryError>;
    fn store(&self, offset: u64, size: u64, value: u64) -> Result<(), MemoryError>;
}

/// Errors raised while building the address map.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("region '{name}' at {base:#x} has zero size")]
    EmptyRegion { name: String, base: u64 },

    #[error("region '{name}' at {base:#x} wraps the address space")]
    AddressOverflow { name: String, base: u64 },

    #[error("region '{name}' [{base:#x}, {end:#x}) overlaps '{existing}'")]
    Overlap {
        name: String,
        base: u64,
        end: u64,
        existing: String,
    },
}

/// Placement of one mapped region, as reported by [`SystemBus::regions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
}

struct MmioRegion {
    info: RegionInfo,
    device: Arc<dyn MmioDevice>,
}

impl MmioRegion {
    #[inline]
    fn contains(&self, addr: u64) -> bool {
        addr >= self.info.base && addr - self.info.base < self.info.size
    }
}

/// System bus trait for memory and MMIO access.
///
/// All methods take `&self` so that the bus can be shared between the CPU
/// thread and the host threads that feed devices.
pub trait Bus: Send + Sync {
    fn load(&self, addr: u64, size: u64) -> Result<u64, Trap>;
    fn store(&self, addr: u64, size: u64, value: u64) -> Result<(), Trap>;

    fn read8(&self, addr: u64) -> Result<u8, Trap> {
        self.load(addr, 1).map(|v| v as u8)
    }
    fn read16(&self, addr: u64) -> Result<u16, Trap> {
        self.load(addr, 2).map(|v| v as u16)
    }
    fn read32(&self, addr: u64) -> Result<u32, Trap> {
        self.load(addr, 4).map(|v| v as u32)
    }
    fn read64(&self, addr: u64) -> Result<u64, Trap> {
        self.load(addr, 8)
    }

    fn write8(&self, addr: u64, val: u8) -> Result<(), Trap> {
        self.store(addr, 1, val as u64)
    }
    fn write16(&self, addr: u64, val: u16) -> Result<(), Trap> {
        self.store(addr, 2, val as u64)
    }
    fn write32(&self, addr: u64, val: u32) -> Result<(), Trap> {
        self.store(addr, 4, val as u64)
    }
    fn write64(&self, addr: u64, val: u64) -> Result<(), Trap> {
        self.store(addr, 8, val)
    }
}

/// RAM plus a table of MMIO regions.
///
/// RAM is checked first; everything else goes through the region table.
/// Accesses that hit nothing fault.
pub struct SystemBus {
    pub dram: Dram,
    regions: RwLock<Vec<MmioRegion>>,
}

impl SystemBus {
    pub fn new(dram_base: u64, dram_size: usize) -> Self {
        Self {
            dram: Dram::new(dram_base, dram_size),
            regions: RwLock::new(Vec::new()),
        }
    }

    pub fn dram_base(&self) -> u64 {
        self.dram.base
    }

    pub fn dram_size(&self) -> usize {
        self.dram.size()
    }

    /// Check that `[base, base + size)` is a valid, free range.
    ///
    /// The range must not intersect RAM or any region already mapped.
    pub fn check_free(&self, name: &str, base: u64, size: u64) -> Result<(), BusError> {
        if size == 0 {
            return Err(BusError::EmptyRegion {
                name: name.to_string(),
                base,
            });
        }
        let end = base
            .checked_add(size)
            .ok_or_else(|| BusError::AddressOverflow {
                name: name.to_string(),
                base,
            })?;

        let dram_end = self.dram.base + self.dram.size() as u64;
        if self.dram.size() > 0 && base < dram_end && self.dram.base < end {
            return Err(BusError::Overlap {
                name: name.to_string(),
                base,
                end,
                existing: "ram".to_string(),
            });
        }

        let regions = self.regions.read().unwrap_or_else(|e| e.into_inner());
        Self::check_regions(&regions, name, base, end)
    }

    fn check_regions(
        regions: &[MmioRegion],
        name: &str,
        base: u64,
        end: u64,
    ) -> Result<(), BusError> {
        match regions
            .iter()
            .find(|r| base < r.info.base + r.info.size && r.info.base < end)
        {
            Some(existing) => Err(BusError::Overlap {
                name: name.to_string(),
                base,
                end,
                existing: existing.info.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Install `device` at `[base, base + size)`.
    pub fn map(
        &self,
        name: impl Into<String>,
        base: u64,
        size: u64,
        device: Arc<dyn MmioDevice>,
    ) -> Result<(), BusError> {
        let name = name.into();
        self.check_free(&name, base, size)?;
        let end = base + size;

        // Re-checked under the write lock against a racing map()
        let mut regions = self.regions.write().unwrap_or_else(|e| e.into_inner());
        Self::check_regions(&regions, &name, base, end)?;

        log::debug!("[Bus] map '{}' at {:#010x}..{:#010x}", name, base, end);
        regions.push(MmioRegion {
            info: RegionInfo { name, base, size },
            device,
        });
        regions.sort_by_key(|r| r.info.base);
        Ok(())
    }

    /// Remove the region starting at `base`, returning its device.
    pub fn unmap(&self, base: u64) -> Option<Arc<dyn MmioDevice>> {
        let mut regions = self.regions.write().unwrap_or_else(|e| e.into_inner());
        let idx = regions.iter().position(|r| r.info.base == base)?;
        let region = regions.remove(idx);
        log::debug!("[Bus] unmap '{}' at {:#010x}", region.info.name, base);
        Some(region.device)
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.dram.offset(addr).is_some() || self.find(addr).is_some()
    }

    /// Snapshot of the current MMIO map, sorted by base address.
    pub fn regions(&self) -> Vec<RegionInfo> {
        let regions = self.regions.read().unwrap_or_else(|e| e.into_inner());
        regions.iter().map(|r| r.info.clone()).collect()
    }

    fn find(&self, addr: u64) -> Option<(Arc<dyn MmioDevice>, u64, u64)> {
        let regions = self.regions.read().unwrap_or_else(|e| e.into_inner());
        regions
            .iter()
            .find(|r| r.contains(addr))
            .map(|r| (Arc::clone(&r.device), addr - r.info.base, r.info.size))
    }

    fn check_size(size: u64) -> Result<(), Trap> {
        match size {
            1 | 2 | 4 | 8 => Ok(()),
            _ => Err(Trap::Fatal(format!("Unsupported bus access size: {}", size))),
        }
    }
}

impl Bus for SystemBus {
    fn load(&self, addr: u64, size: u64) -> Result<u64, Trap> {
        Self::check_size(size)?;

        // Fast path: RAM
        if let Some(off) = self.dram.offset(addr) {
            return self
                .dram
                .read(off as u64, size)
                .map_err(|_| Trap::LoadAccessFault(addr));
        }

        // The device lock is not held across the call: a device may be
        // unmapped concurrently, in which case it finishes this access.
        let (device, offset, region_size) =
            self.find(addr).ok_or(Trap::LoadAccessFault(addr))?;
        if offset + size > region_size {
            return Err(Trap::LoadAccessFault(addr));
        }
        device
            .load(offset, size)
            .map_err(|_| Trap::LoadAccessFault(addr))
    }

    fn store(&self, addr: u64, size: u64, value: u64) -> Result<(), Trap> {
        Self::check_size(size)?;

        if let Some(off) = self.dram.offset(addr) {
            return self
                .dram
                .write(off as u64, size, value)
                .map_err(|_| Trap::StoreAccessFault(addr));
        }

        let (device, offset, region_size) =
            self.find(addr).ok_or(Trap::StoreAccessFault(addr))?;
        if offset + size > region_size {
            return Err(Trap::StoreAccessFault(addr));
        }
        device
            .store(offset, size, value)
            .map_err(|_| Trap::StoreAccessFault(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every access and answers loads with the offset.
    struct Recorder {
        stores: Mutex<Vec<(u64, u64, u64)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                stores: Mutex::new(Vec::new()),
            })
        }
    }

    impl MmioDevice for Recorder {
        fn load(&self, offset: u64, _size: u64) -> Result<u64, MemoryError> {
            Ok(offset)
        }

        fn store(&self, offset: u64, size: u64, value: u64) -> Result<(), MemoryError> {
            self.stores.lock().unwrap().push((offset, size, value));
            Ok(())
        }
    }

    #[test]
    fn test_bus_is_thread_safe() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SystemBus>();
    }

    #[test]
    fn test_dispatch_to_region() {
        let bus = SystemBus::new(0, 0x1000);
        let recorder = Recorder::new();
        bus.map("recorder", 0xF000_0000, 0x100, recorder.clone()).unwrap();

        assert_eq!(bus.read32(0xF000_0010).unwrap(), 0x10);
        bus.write16(0xF000_0004, 0xBEEF).unwrap();
        assert_eq!(*recorder.stores.lock().unwrap(), vec![(4, 2, 0xBEEF)]);
    }

    #[test]
    fn test_ram_fast_path() {
        let bus = SystemBus::new(0, 0x1000);
        bus.write32(0x100, 0x1234_5678).unwrap();
        assert_eq!(bus.read32(0x100).unwrap(), 0x1234_5678);
        assert_eq!(bus.read8(0x103).unwrap(), 0x12);
    }

    #[test]
    fn test_unmapped_access_faults() {
        let bus = SystemBus::new(0, 0x1000);
        assert_eq!(bus.read32(0x2000), Err(Trap::LoadAccessFault(0x2000)));
        assert_eq!(bus.write8(0x2000, 1), Err(Trap::StoreAccessFault(0x2000)));
        assert!(!bus.is_mapped(0x2000));
    }

    #[test]
    fn test_access_straddling_region_end_faults() {
        let bus = SystemBus::new(0, 0);
        bus.map("recorder", 0x1000, 0x10, Recorder::new()).unwrap();
        assert_eq!(bus.read32(0x100E), Err(Trap::LoadAccessFault(0x100E)));
        assert!(bus.read16(0x100E).is_ok());
    }

    #[test]
    fn test_overlap_rejected() {
        let bus = SystemBus::new(0, 0x1000);
        bus.map("a", 0x1_0000, 0x100, Recorder::new()).unwrap();

        let err = bus.map("b", 0x1_00F0, 0x100, Recorder::new()).unwrap_err();
        assert!(matches!(err, BusError::Overlap { ref existing, .. } if existing == "a"));

        let err = bus.map("c", 0x800, 0x1000, Recorder::new()).unwrap_err();
        assert!(matches!(err, BusError::Overlap { ref existing, .. } if existing == "ram"));

        // Adjacent is fine
        bus.map("d", 0x1_0100, 0x100, Recorder::new()).unwrap();
    }

    #[test]
    fn test_invalid_regions() {
        let bus = SystemBus::new(0, 0);
        assert!(matches!(
            bus.map("z", 0x10, 0, Recorder::new()),
            Err(BusError::EmptyRegion { .. })
        ));
        assert!(matches!(
            bus.map("w", u64::MAX - 4, 0x10, Recorder::new()),
            Err(BusError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn test_unmap() {
        let bus = SystemBus::new(0, 0);
        bus.map("recorder", 0x4000, 0x10, Recorder::new()).unwrap();
        assert!(bus.is_mapped(0x4008));
        assert!(bus.unmap(0x4000).is_some());
        assert!(!bus.is_mapped(0x4008));
        assert!(bus.unmap(0x4000).is_none());
    }

    #[test]
    fn test_unsupported_size() {
        let bus = SystemBus::new(0, 0x100);
        assert!(matches!(bus.load(0, 3), Err(Trap::Fatal(_))));
    }

    #[test]
    fn test_regions_sorted() {
        let bus = SystemBus::new(0, 0);
        bus.map("hi", 0x9000, 0x10, Recorder::new()).unwrap();
        bus.map("lo", 0x1000, 0x10, Recorder::new()).unwrap();
        let names: Vec<_> = bus.regions().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["lo", "hi"]);
    }
}
