//! # VIF1 registers and command words
//!
//! A VIFcode is one 32-bit word:
//!
//! ```text
//! 31 30        24 23      16 15                0
//! ┌──┬───────────┬──────────┬───────────────────┐
//! │I │    CMD    │   NUM    │        IMM        │
//! └──┴───────────┴──────────┴───────────────────┘
//! ```
//!
//! STAT layout (only the bits the channel drives):
//!
//! ```text
//! 28   24        13  12  11  10  9   8   7   6      3   2   1  0
//! ┌──────┬──...──┬───┬───┬───┬───┬───┬───┬───┬─...─┬───┬───┬────┐
//! │ FQC  │       │ER1│ER0│INT│VIS│VFS│VSS│DBF│MRK  │VGW│VEW│VPS │
//! └──────┴──...──┴───┴───┴───┴───┴───┴───┴───┴─...─┴───┴───┴────┘
//! ```

use std::fmt;

use crate::bitwise::Bits;

pub const VIF1_STAT: u32 = 0x1000_3C00;
pub const VIF1_FBRST: u32 = 0x1000_3C10;
pub const VIF1_ERR: u32 = 0x1000_3C20;
pub const VIF1_MARK: u32 = 0x1000_3C30;
pub const VIF1_CYCLE: u32 = 0x1000_3C40;
pub const VIF1_MODE: u32 = 0x1000_3C50;
pub const VIF1_NUM: u32 = 0x1000_3C60;
pub const VIF1_MASK: u32 = 0x1000_3C70;
pub const VIF1_CODE: u32 = 0x1000_3C80;
pub const VIF1_ITOPS: u32 = 0x1000_3C90;
pub const VIF1_BASE: u32 = 0x1000_3CA0;
pub const VIF1_OFST: u32 = 0x1000_3CB0;
pub const VIF1_TOPS: u32 = 0x1000_3CC0;
pub const VIF1_ITOP: u32 = 0x1000_3CD0;
pub const VIF1_TOP: u32 = 0x1000_3CE0;
pub const VIF1_R0: u32 = 0x1000_3D00;
pub const VIF1_R3: u32 = 0x1000_3D30;
pub const VIF1_C0: u32 = 0x1000_3D40;
pub const VIF1_C3: u32 = 0x1000_3D70;

/// Start of the 16-byte FIFO write window.
pub const VIF1_FIFO: u32 = 0x1000_5000;

pub const FBRST_RST: u32 = 0x01;
pub const FBRST_FBK: u32 = 0x02;
pub const FBRST_STP: u32 = 0x04;
pub const FBRST_STC: u32 = 0x08;

/// STAT.FQC as reported while the ring holds data.
pub const STAT_FQC_BUSY: u32 = 0x0F00_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Nop,
    Stcycl,
    Offset,
    Base,
    Itop,
    Stmod,
    Mskpath3,
    Mark,
    Flushe,
    Flush,
    Flusha,
    Mscal,
    Mscalf,
    Mscnt,
    Stmask,
    Strow,
    Stcol,
    Mpg,
    Direct,
    Directhl,
    Unpack { vn: u8, vl: u8, masked: bool },
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(cmd: u8) -> Result<Self, Self::Error> {
        Ok(match cmd {
            0x00 => Self::Nop,
            0x01 => Self::Stcycl,
            0x02 => Self::Offset,
            0x03 => Self::Base,
            0x04 => Self::Itop,
            0x05 => Self::Stmod,
            0x06 => Self::Mskpath3,
            0x07 => Self::Mark,
            0x10 => Self::Flushe,
            0x11 => Self::Flush,
            0x13 => Self::Flusha,
            0x14 => Self::Mscal,
            0x15 => Self::Mscalf,
            0x17 => Self::Mscnt,
            0x20 => Self::Stmask,
            0x30 => Self::Strow,
            0x31 => Self::Stcol,
            0x4A => Self::Mpg,
            0x50 => Self::Direct,
            0x51 => Self::Directhl,
            0x60..=0x7F => Self::Unpack {
                vn: (cmd >> 2) & 0b11,
                vl: cmd & 0b11,
                masked: cmd & 0x10 != 0,
            },
            _ => return Err(cmd),
        })
    }
}

/// The VIFcode currently being executed.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Code(u32);

impl From<u32> for Code {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Code> for u32 {
    fn from(code: Code) -> Self {
        code.0
    }
}

impl Code {
    #[must_use]
    pub fn new(cmd: u8, num: u8, imm: u16) -> Self {
        let mut value = 0_u32;
        value.set_bits(0..=15, u32::from(imm));
        value.set_bits(16..=23, u32::from(num));
        value.set_bits(24..=31, u32::from(cmd));
        Self(value)
    }

    #[must_use]
    pub fn imm(self) -> u16 {
        self.0.get_bits(0..=15) as u16
    }

    pub fn set_imm(&mut self, imm: u16) {
        self.0.set_bits(0..=15, u32::from(imm));
    }

    #[must_use]
    pub fn num(self) -> u8 {
        self.0.get_bits(16..=23) as u8
    }

    #[must_use]
    pub fn cmd(self) -> u8 {
        self.0.get_bits(24..=30) as u8
    }

    /// I => Bit 31, stall and interrupt once the command is done.
    #[must_use]
    pub fn interrupt(self) -> bool {
        self.0.get_bit(31)
    }

    #[must_use]
    pub fn command(self) -> Result<Command, u8> {
        Command::try_from(self.cmd())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({:#010x})", self.0)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let imm = self.imm();
        match self.command() {
            Ok(Command::Unpack { vn, vl, masked }) => write!(
                f,
                "UNPACK V{}-{}{} num={} addr={:#x}{}",
                vn + 1,
                32 >> vl,
                if masked { " masked" } else { "" },
                self.num(),
                imm & 0x3FF,
                if imm & 0x8000 != 0 { " +TOPS" } else { "" },
            ),
            Ok(Command::Mpg) => write!(f, "MPG num={} addr={:#x}", self.num(), imm),
            Ok(command) => write!(f, "{command:?} imm={imm:#06x}"),
            Err(cmd) => write!(f, "??? cmd={cmd:#04x}"),
        }?;
        if self.interrupt() {
            f.write_str(" [I]")?;
        }
        Ok(())
    }
}

/// VIF1_STAT
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Stat(u32);

impl From<u32> for Stat {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Stat> for u32 {
    fn from(stat: Stat) -> Self {
        stat.0
    }
}

impl fmt::Debug for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stat({:#010x})", self.0)
    }
}

impl Stat {
    /// VPS => Bits 0-1, 0 = idle, non-zero = a command waits for more data.
    #[must_use]
    pub fn vps(self) -> u32 {
        self.0.get_bits(0..=1)
    }

    pub fn set_vps(&mut self, value: u32) {
        self.0.set_bits(0..=1, value);
    }

    /// VEW => Bit 2, waiting for VU1 to end.
    #[must_use]
    pub fn vew(self) -> bool {
        self.0.get_bit(2)
    }

    pub fn set_vew(&mut self, value: bool) {
        self.0.set_bit(2, value);
    }

    /// VGW => Bit 3, waiting for the GIF (deferred XGKICK outstanding).
    #[must_use]
    pub fn vgw(self) -> bool {
        self.0.get_bit(3)
    }

    pub fn set_vgw(&mut self, value: bool) {
        self.0.set_bit(3, value);
    }

    /// MRK => Bit 6
    #[must_use]
    pub fn mrk(self) -> bool {
        self.0.get_bit(6)
    }

    pub fn set_mrk(&mut self, value: bool) {
        self.0.set_bit(6, value);
    }

    /// DBF => Bit 7, which half of the double buffer TOPS points at.
    #[must_use]
    pub fn dbf(self) -> bool {
        self.0.get_bit(7)
    }

    pub fn set_dbf(&mut self, value: bool) {
        self.0.set_bit(7, value);
    }

    /// VIS => Bit 10, stalled on an interrupt VIFcode.
    #[must_use]
    pub fn vis(self) -> bool {
        self.0.get_bit(10)
    }

    pub fn set_vis(&mut self, value: bool) {
        self.0.set_bit(10, value);
    }

    /// INT => Bit 11
    #[must_use]
    pub fn int(self) -> bool {
        self.0.get_bit(11)
    }

    pub fn set_int(&mut self, value: bool) {
        self.0.set_bit(11, value);
    }

    /// Clears VSS, VFS, VIS, INT, ER0 and ER1 (FBRST.STC).
    pub fn clear_stall_bits(&mut self) {
        self.0.set_bits(8..=13, 0);
    }
}
