//! # Bus memory seen by the DMA controller
//!
//! Two flat regions can be the source of a VIF1 transfer:
//!
//! ```text
//! 0x0000_0000 ─ 0x01FF_FFFF   main RAM (32 MiB)
//! 0x8000_0000 | offset        scratchpad RAM (16 KiB), selected by bit 31
//! ```
//!
//! Addresses are folded into their region, a transfer that would run past
//! the end of its region is reported as an error instead of being wrapped.

use thiserror::Error;

pub const EE_RAM_SIZE: usize = 0x0200_0000;
pub const EE_SPR_SIZE: usize = 0x0000_4000;

/// Bit 31 of a DMA address selects the scratchpad.
const SPR_SELECT: u32 = 0x8000_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("{region} access at {address:#010x} of {size:#x} bytes crosses the end of the region")]
    OutOfBounds {
        region: Region,
        address: u32,
        size: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Main,
    Scratchpad,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => f.write_str("main RAM"),
            Self::Scratchpad => f.write_str("scratchpad"),
        }
    }
}

pub struct BusMemory {
    /// Main RAM, addressed with bit 31 clear.
    ram: Vec<u8>,

    /// Scratchpad, addressed with bit 31 set.
    spr: Vec<u8>,
}

impl Default for BusMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl BusMemory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ram: vec![0; EE_RAM_SIZE],
            spr: vec![0; EE_SPR_SIZE],
        }
    }

    fn locate(address: u32) -> (Region, usize) {
        if address & SPR_SELECT == 0 {
            (Region::Main, address as usize & (EE_RAM_SIZE - 1))
        } else {
            (Region::Scratchpad, address as usize & (EE_SPR_SIZE - 1))
        }
    }

    const fn region_len(region: Region) -> usize {
        match region {
            Region::Main => EE_RAM_SIZE,
            Region::Scratchpad => EE_SPR_SIZE,
        }
    }

    fn bounds(address: u32, size: usize) -> Result<(Region, std::ops::Range<usize>), MemoryError> {
        let (region, offset) = Self::locate(address);
        let end = offset + size;
        if end > Self::region_len(region) {
            return Err(MemoryError::OutOfBounds {
                region,
                address,
                size,
            });
        }

        Ok((region, offset..end))
    }

    /// Borrows `size` bytes starting at the DMA address `address`.
    pub fn slice(&self, address: u32, size: usize) -> Result<&[u8], MemoryError> {
        let (region, range) = Self::bounds(address, size)?;
        Ok(match region {
            Region::Main => &self.ram[range],
            Region::Scratchpad => &self.spr[range],
        })
    }

    pub fn slice_mut(&mut self, address: u32, size: usize) -> Result<&mut [u8], MemoryError> {
        let (region, range) = Self::bounds(address, size)?;
        Ok(match region {
            Region::Main => &mut self.ram[range],
            Region::Scratchpad => &mut self.spr[range],
        })
    }

    /// Copies `data` into memory at the DMA address `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.slice_mut(address, data.len())?.copy_from_slice(data);
        Ok(())
    }
}
