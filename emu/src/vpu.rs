//! VU1 as seen from the VIF1.
//!
//! The VIF1 never touches VU1 state directly: micro-program starts, micro
//! code uploads and UNPACK transforms all go through [`VectorUnit`].

/// VU1 data memory, in bytes.
pub const VUMEM1SIZE: usize = 0x4000;

/// VU1 micro memory, in bytes.
pub const MICROMEM1SIZE: usize = 0x4000;

/// Write cycle set by STCYCL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cycle {
    /// Cycle length.
    pub cl: u8,
    /// Write length.
    pub wl: u8,
}

/// Everything a VU needs to expand one UNPACK command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackDescriptor {
    /// Components per vector minus one (0..=3).
    pub vn: u8,
    /// Component width selector: 32 >> vl bits (vl = 3 is the 5:5:5:1 format).
    pub vl: u8,
    /// Zero extension instead of sign extension.
    pub unsigned: bool,
    /// Apply the STMASK write mask.
    pub masked: bool,
    /// Destination in VU1 data memory, in quadwords, `TOPS` already added.
    pub address: u32,
    /// Vectors to write, 256 when the command carried 0.
    pub num: u32,
    pub cycle: Cycle,
    pub mode: u32,
    pub mask: u32,
    pub row: [u32; 4],
    pub col: [u32; 4],
}

impl UnpackDescriptor {
    /// Bits taken from the stream by one vector.
    #[must_use]
    pub const fn vector_bits(&self) -> usize {
        if self.vl == 3 {
            16
        } else {
            (32 >> self.vl) * (self.vn as usize + 1)
        }
    }

    /// Size of the packed input, rounded up to a whole word.
    #[must_use]
    pub const fn input_size(&self) -> usize {
        (self.vector_bits() * self.num as usize).div_ceil(32) * 4
    }
}

pub trait VectorUnit: Send + Sync {
    fn is_running(&self) -> bool;

    /// Starts a micro program at `address` (bytes in micro memory).
    fn execute_micro_program(&self, address: u32, top: u32, itop: u32);

    /// Starts a micro program where the last one stopped (MSCNT).
    fn continue_micro_program(&self, top: u32, itop: u32);

    fn write_micro_memory(&self, address: u32, data: &[u8]);

    /// Expands `data`, which starts `offset` bytes into the packed input of
    /// the UNPACK described by `descriptor`.
    fn unpack(&self, descriptor: &UnpackDescriptor, offset: usize, data: &[u8]);
}

/// A VU that is never busy and drops everything it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullVectorUnit;

impl VectorUnit for NullVectorUnit {
    fn is_running(&self) -> bool {
        false
    }

    fn execute_micro_program(&self, address: u32, _top: u32, _itop: u32) {
        tracing::trace!("VU1 micro program at {address:#06x} ignored");
    }

    fn continue_micro_program(&self, _top: u32, _itop: u32) {}

    fn write_micro_memory(&self, _address: u32, _data: &[u8]) {}

    fn unpack(&self, _descriptor: &UnpackDescriptor, _offset: usize, _data: &[u8]) {}
}
