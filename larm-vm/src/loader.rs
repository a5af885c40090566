//! Boot image loading.
//!
//! An image starting with the ELF magic is parsed with `goblin` and its
//! `PT_LOAD` segments are copied to their physical addresses. Anything else
//! is treated as a flat binary and copied to the requested load address.

use crate::bus::SystemBus;
use crate::dram::MemoryError;
use goblin::elf::{Elf, program_header::PT_LOAD};
use thiserror::Error;

const ELF_MAGIC: &[u8] = b"\x7FELF";

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("ELF parse error: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("ELF segment exceeds file bounds (offset {offset:#x})")]
    SegmentTruncated { offset: u64 },

    #[error("segment {start:#x}-{end:#x} lies outside RAM")]
    SegmentOutOfRange { start: u64, end: u64 },

    #[error("failed to write image to RAM: {0}")]
    Memory(#[from] MemoryError),
}

/// Format of a loaded image, with its entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootImage {
    Elf { entry: u64 },
    Raw { entry: u64, len: usize },
}

impl BootImage {
    pub fn entry(&self) -> u64 {
        match *self {
            BootImage::Elf { entry } | BootImage::Raw { entry, .. } => entry,
        }
    }
}

/// Load `buffer` into RAM, picking ELF or flat binary by magic.
pub fn load_image(buffer: &[u8], load_addr: u64, bus: &SystemBus) -> Result<BootImage, LoaderError> {
    if buffer.starts_with(ELF_MAGIC) {
        let entry = load_elf_into_dram(buffer, bus)?;
        Ok(BootImage::Elf { entry })
    } else {
        load_raw_into_dram(buffer, load_addr, bus)?;
        Ok(BootImage::Raw {
            entry: load_addr,
            len: buffer.len(),
        })
    }
}

fn ram_range(bus: &SystemBus, start: u64, len: u64) -> Result<u64, LoaderError> {
    let base = bus.dram_base();
    let dram_end = base + bus.dram_size() as u64;
    let end = start
        .checked_add(len)
        .ok_or(LoaderError::SegmentOutOfRange { start, end: u64::MAX })?;
    if start < base || end > dram_end {
        return Err(LoaderError::SegmentOutOfRange { start, end });
    }
    Ok(start - base)
}

pub fn load_raw_into_dram(buffer: &[u8], load_addr: u64, bus: &SystemBus) -> Result<(), LoaderError> {
    let offset = ram_range(bus, load_addr, buffer.len() as u64)?;
    bus.dram.load(buffer, offset)?;
    log::debug!(
        "Raw image loaded: addr=0x{:x}, len=0x{:x}",
        load_addr,
        buffer.len()
    );
    Ok(())
}

/// Copy every `PT_LOAD` segment of an ELF image into RAM and zero its BSS.
///
/// Returns the entry point.
pub fn load_elf_into_dram(buffer: &[u8], bus: &SystemBus) -> Result<u64, LoaderError> {
    let elf = Elf::parse(buffer)?;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let mem_size = ph.p_memsz as usize;
        let file_offset = ph.p_offset as usize;
        if file_offset
            .checked_add(file_size)
            .is_none_or(|end| end > buffer.len())
        {
            return Err(LoaderError::SegmentTruncated {
                offset: ph.p_offset,
            });
        }

        let target_addr = if ph.p_paddr != 0 {
            ph.p_paddr
        } else {
            ph.p_vaddr
        };
        let dram_offset = ram_range(bus, target_addr, mem_size as u64)?;

        if file_size > 0 {
            bus.dram
                .load(&buffer[file_offset..file_offset + file_size], dram_offset)?;
        }
        if mem_size > file_size {
            bus.dram
                .zero_range(dram_offset as usize + file_size, mem_size - file_size)?;
        }
        log::debug!(
            "Loaded segment: addr=0x{:x}, filesz=0x{:x}, memsz=0x{:x}",
            target_addr,
            file_size,
            mem_size
        );
    }

    log::debug!("ELF loaded: entry=0x{:x}", elf.entry);
    Ok(elf.entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    /// Minimal little-endian ELF64 with one PT_LOAD segment.
    fn tiny_elf(vaddr: u64, code: &[u8], memsz: u64, entry: u64) -> Vec<u8> {
        const EHDR: usize = 64;
        const PHDR: usize = 56;
        let mut out = Vec::new();
        out.extend_from_slice(b"\x7FELF");
        out.extend_from_slice(&[2, 1, 1, 0]); // 64-bit, LE, version, SysV
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&0xF3u16.to_le_bytes()); // e_machine
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&(EHDR as u64).to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR as u16).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(out.len(), EHDR);

        let data_off = (EHDR + PHDR) as u64;
        out.extend_from_slice(&PT_LOAD.to_le_bytes());
        out.extend_from_slice(&5u32.to_le_bytes()); // R+X
        out.extend_from_slice(&data_off.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes());
        out.extend_from_slice(&(code.len() as u64).to_le_bytes());
        out.extend_from_slice(&memsz.to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes());
        assert_eq!(out.len(), EHDR + PHDR);

        out.extend_from_slice(code);
        out
    }

    #[test]
    fn test_load_raw() {
        let bus = SystemBus::new(0, 0x1000);
        let image = load_image(&[1, 2, 3, 4], 0x200, &bus).unwrap();
        assert_eq!(image, BootImage::Raw { entry: 0x200, len: 4 });
        assert_eq!(bus.read32(0x200).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_load_raw_out_of_range() {
        let bus = SystemBus::new(0, 0x100);
        assert!(matches!(
            load_image(&[0; 16], 0xF8, &bus),
            Err(LoaderError::SegmentOutOfRange { start: 0xF8, end: 0x108 })
        ));
    }

    #[test]
    fn test_load_elf_with_bss() {
        let bus = SystemBus::new(0, 0x1000);
        bus.write32(0x104, 0xFFFF_FFFF).unwrap();

        let elf = tiny_elf(0x100, &[0xAA, 0xBB, 0xCC, 0xDD], 8, 0x100);
        let image = load_image(&elf, 0, &bus).unwrap();
        assert_eq!(image, BootImage::Elf { entry: 0x100 });
        assert_eq!(image.entry(), 0x100);
        assert_eq!(bus.read32(0x100).unwrap(), 0xDDCC_BBAA);
        assert_eq!(bus.read32(0x104).unwrap(), 0);
    }

    #[test]
    fn test_load_elf_segment_outside_ram() {
        let bus = SystemBus::new(0, 0x1000);
        let elf = tiny_elf(0xFF01_0000, &[0; 4], 4, 0xFF01_0000);
        assert!(matches!(
            load_image(&elf, 0, &bus),
            Err(LoaderError::SegmentOutOfRange { start: 0xFF01_0000, .. })
        ));
    }

    #[test]
    fn test_bad_elf_header() {
        let bus = SystemBus::new(0, 0x1000);
        let mut junk = b"\x7FELF".to_vec();
        junk.extend_from_slice(&[0xFF; 12]);
        assert!(matches!(
            load_image(&junk, 0, &bus),
            Err(LoaderError::Parse(_))
        ));
    }
}
