//! # GIF (Graphics Interface) arbitration
//!
//! The GIF is the funnel in front of the GS. Three producers compete for it:
//!
//! ```text
//! PATH1  VU1 XGKICK ──┐
//! PATH2  VIF1 DIRECT ─┼──► GIF ──► GS
//! PATH3  GIF DMA ─────┘
//! ```
//!
//! Only one path owns the GIF at a time. A path keeps ownership from the
//! first tag of a packet until the tag carrying EOP has been fully consumed,
//! then the GIF is free again. A producer that cannot get its path is not in
//! error, it just has to retry later.
//!
//! [`GifArbiter`] is the contract the VIF1 relies on. [`Gif`] is a small
//! implementation that walks tags and records what went through, enough to
//! drive the channel without a GS behind it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::bitwise::Bits;

pub const QWORD_SIZE: usize = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GifPath {
    Path1 = 1,
    Path2 = 2,
    Path3 = 3,
}

/// Diagnostics attached to every packet handed to the GIF.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketMetadata {
    pub path_index: u32,
    /// Byte address of the packet inside VU1 data memory (PATH1 only).
    pub vu_mem_packet_address: u32,
    pub vpu1_top: u32,
    pub vpu1_itop: u32,
}

impl PacketMetadata {
    #[must_use]
    pub fn for_path(path: GifPath) -> Self {
        Self {
            path_index: path as u32,
            ..Self::default()
        }
    }
}

/// What the VIF1 needs from the GIF.
///
/// Implementations are shared between the VIF1 consumer thread and the
/// thread running VU1, so every method takes `&self` and arbitration of the
/// active path must be serialized internally.
pub trait GifArbiter: Send + Sync {
    /// Takes `path` if the GIF is idle or already owned by `path`.
    fn try_acquire_path(&self, path: GifPath) -> bool;

    fn active_path(&self) -> Option<GifPath>;

    fn set_path3_masked(&self, masked: bool);

    /// Consumes tags from `memory[address..end]` until one packet ends.
    /// Returns the number of bytes consumed.
    fn process_single_packet(
        &self,
        memory: &[u8],
        address: usize,
        end: usize,
        metadata: &PacketMetadata,
    ) -> usize;

    /// Consumes as many packets from `memory[address..end]` as the path can
    /// get. Stops early when another path takes the GIF between packets.
    fn process_multiple_packets(
        &self,
        memory: &[u8],
        address: usize,
        end: usize,
        metadata: &PacketMetadata,
    ) -> usize;

    /// Fills `buffer` with image data read back from the GS (VIF1 "to
    /// memory" transfers).
    fn read_image_data(&self, buffer: &mut [u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagFormat {
    Packed,
    Reglist,
    Image,
}

/// A decoded GIFtag.
///
/// ```text
/// 63   60 59 58 57    47 46 45      16 15 14          0
/// ┌──────┬─────┬────────┬──┬──────────┬──┬─────────────┐
/// │ NREG │ FLG │  PRIM  │PRE│  unused │EOP│   NLOOP     │
/// └──────┴─────┴────────┴──┴──────────┴──┴─────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GifTag {
    nloop: usize,
    eop: bool,
    format: TagFormat,
    nreg: usize,
}

impl GifTag {
    fn decode(qword: &[u8]) -> Self {
        let mut low = [0_u8; 8];
        low.copy_from_slice(&qword[..8]);
        let low = u64::from_le_bytes(low);

        let nreg = match low.get_bits(60..=63) {
            0 => 16,
            n => n as usize,
        };
        let format = match low.get_bits(58..=59) {
            0 => TagFormat::Packed,
            1 => TagFormat::Reglist,
            _ => TagFormat::Image,
        };

        Self {
            nloop: low.get_bits(0..=14) as usize,
            eop: low.get_bit(15),
            format,
            nreg,
        }
    }

    /// Size of the data following the tag, in quadwords.
    const fn data_qwords(&self) -> usize {
        match self.format {
            TagFormat::Packed => self.nloop * self.nreg,
            TagFormat::Reglist => (self.nloop * self.nreg).div_ceil(2),
            TagFormat::Image => self.nloop,
        }
    }
}

/// One quadword forwarded to the GS, tag or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GifTransfer {
    pub path: GifPath,
    pub qword: [u8; QWORD_SIZE],
}

#[derive(Default)]
struct GifState {
    active_path: Option<GifPath>,
    path3_masked: bool,

    /// Data quadwords left under the current tag.
    remaining: usize,

    /// The current tag is the last one of its packet.
    eop: bool,

    transfers: Vec<GifTransfer>,
    image_data: VecDeque<u8>,
}

impl GifState {
    fn try_acquire(&mut self, path: GifPath) -> bool {
        if path == GifPath::Path3 && self.path3_masked {
            return false;
        }
        match self.active_path {
            None => {
                self.active_path = Some(path);
                true
            }
            Some(active) => active == path,
        }
    }

    fn record(&mut self, path: GifPath, qwords: &[u8]) {
        for qword in qwords.chunks_exact(QWORD_SIZE) {
            let mut value = [0_u8; QWORD_SIZE];
            value.copy_from_slice(qword);
            self.transfers.push(GifTransfer { path, qword: value });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Bytes consumed, packet still open.
    Progress(usize),
    /// Bytes consumed, the packet ended with this step.
    PacketEnd(usize),
    /// Nothing could be consumed.
    Blocked,
}

#[derive(Default)]
pub struct Gif {
    state: Mutex<GifState>,
}

impl Gif {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GifState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drains everything forwarded to the GS so far.
    pub fn take_transfers(&self) -> Vec<GifTransfer> {
        std::mem::take(&mut self.lock().transfers)
    }

    /// Makes `data` available to the next `read_image_data` calls.
    pub fn queue_image_data(&self, data: &[u8]) {
        self.lock().image_data.extend(data);
    }

    #[must_use]
    pub fn is_path3_masked(&self) -> bool {
        self.lock().path3_masked
    }

    /// Advances by one tag or one run of tag data.
    fn step(&self, memory: &[u8], address: usize, end: usize, path: GifPath) -> Step {
        let mut state = self.lock();
        if state.active_path.is_some_and(|owner| owner != path) {
            return Step::Blocked;
        }

        if state.remaining == 0 {
            if end - address < QWORD_SIZE || !state.try_acquire(path) {
                return Step::Blocked;
            }

            let tag = GifTag::decode(&memory[address..address + QWORD_SIZE]);
            tracing::trace!("GIF {path:?} tag {tag:?}");
            state.record(path, &memory[address..address + QWORD_SIZE]);
            state.remaining = tag.data_qwords();
            state.eop = tag.eop;
            if state.remaining == 0 && tag.eop {
                state.active_path = None;
                return Step::PacketEnd(QWORD_SIZE);
            }
            return Step::Progress(QWORD_SIZE);
        }

        let qwords = state.remaining.min((end - address) / QWORD_SIZE);
        if qwords == 0 {
            return Step::Blocked;
        }
        let size = qwords * QWORD_SIZE;
        state.record(path, &memory[address..address + size]);
        state.remaining -= qwords;
        if state.remaining == 0 && state.eop {
            state.active_path = None;
            return Step::PacketEnd(size);
        }
        Step::Progress(size)
    }

    fn process(
        &self,
        memory: &[u8],
        address: usize,
        end: usize,
        metadata: &PacketMetadata,
        single: bool,
    ) -> usize {
        let path = match metadata.path_index {
            1 => GifPath::Path1,
            2 => GifPath::Path2,
            3 => GifPath::Path3,
            other => panic!("GIF packet submitted on unknown path {other}"),
        };
        assert!(end <= memory.len());

        let start = address;
        let mut address = address;
        while address < end {
            match self.step(memory, address, end, path) {
                Step::Progress(size) => address += size,
                Step::PacketEnd(size) => {
                    address += size;
                    if single {
                        break;
                    }
                }
                Step::Blocked => break,
            }
        }
        address - start
    }
}

impl GifArbiter for Gif {
    fn try_acquire_path(&self, path: GifPath) -> bool {
        self.lock().try_acquire(path)
    }

    fn active_path(&self) -> Option<GifPath> {
        self.lock().active_path
    }

    fn set_path3_masked(&self, masked: bool) {
        tracing::debug!("PATH3 mask {masked}");
        self.lock().path3_masked = masked;
    }

    fn process_single_packet(
        &self,
        memory: &[u8],
        address: usize,
        end: usize,
        metadata: &PacketMetadata,
    ) -> usize {
        self.process(memory, address, end, metadata, true)
    }

    fn process_multiple_packets(
        &self,
        memory: &[u8],
        address: usize,
        end: usize,
        metadata: &PacketMetadata,
    ) -> usize {
        self.process(memory, address, end, metadata, false)
    }

    fn read_image_data(&self, buffer: &mut [u8]) {
        let mut state = self.lock();
        for byte in buffer.iter_mut() {
            *byte = state.image_data.pop_front().unwrap_or(0);
        }
    }
}

/// Builds a GIFtag quadword. Handy for tests and tools.
#[must_use]
pub fn make_tag(nloop: u16, eop: bool, flg: u8, nreg: u8) -> [u8; QWORD_SIZE] {
    let mut low = 0_u64;
    low.set_bits(0..=14, u64::from(nloop));
    low.set_bit(15, eop);
    low.set_bits(58..=59, u64::from(flg));
    low.set_bits(60..=63, u64::from(nreg));

    let mut qword = [0_u8; QWORD_SIZE];
    qword[..8].copy_from_slice(&low.to_le_bytes());
    qword
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn image_packet(qwords: u16, fill: u8) -> Vec<u8> {
        let mut packet = make_tag(qwords, true, 2, 0).to_vec();
        packet.extend(std::iter::repeat_n(fill, usize::from(qwords) * QWORD_SIZE));
        packet
    }

    #[test]
    fn decode_tag_fields() {
        let tag = GifTag::decode(&make_tag(3, true, 0, 2));
        assert_eq!(
            tag,
            GifTag {
                nloop: 3,
                eop: true,
                format: TagFormat::Packed,
                nreg: 2,
            }
        );
        assert_eq!(tag.data_qwords(), 6);

        let reglist = GifTag::decode(&make_tag(3, false, 1, 1));
        assert_eq!(reglist.data_qwords(), 2);

        // NREG = 0 means 16 registers.
        assert_eq!(GifTag::decode(&make_tag(1, true, 0, 0)).nreg, 16);
    }

    #[test]
    fn single_packet_releases_path_on_eop() {
        let gif = Gif::new();
        let packet = image_packet(2, 0x11);

        assert!(gif.try_acquire_path(GifPath::Path1));
        let consumed = gif.process_single_packet(
            &packet,
            0,
            packet.len(),
            &PacketMetadata::for_path(GifPath::Path1),
        );

        assert_eq!(consumed, 48);
        assert_eq!(gif.active_path(), None);
        assert_eq!(gif.take_transfers().len(), 3);
    }

    #[test]
    fn busy_path_blocks_other_paths() {
        let gif = Gif::new();
        let packet = image_packet(4, 0x22);
        let metadata = PacketMetadata::for_path(GifPath::Path2);

        // Only the tag and one data quadword: the packet stays open.
        let consumed = gif.process_multiple_packets(&packet, 0, 32, &metadata);
        assert_eq!(consumed, 32);
        assert_eq!(gif.active_path(), Some(GifPath::Path2));
        assert!(!gif.try_acquire_path(GifPath::Path1));

        let consumed = gif.process_multiple_packets(&packet, 32, packet.len(), &metadata);
        assert_eq!(consumed, 48);
        assert_eq!(gif.active_path(), None);
        assert!(gif.try_acquire_path(GifPath::Path1));
    }

    #[test]
    fn open_packet_is_not_continued_by_another_path() {
        let gif = Gif::new();
        let path3 = image_packet(4, 0x55);
        let consumed = gif.process_multiple_packets(
            &path3,
            0,
            QWORD_SIZE,
            &PacketMetadata::for_path(GifPath::Path3),
        );
        assert_eq!(consumed, QWORD_SIZE);

        let path2 = vec![0x99; 2 * QWORD_SIZE];
        for single in [true, false] {
            let metadata = PacketMetadata::for_path(GifPath::Path2);
            let consumed = if single {
                gif.process_single_packet(&path2, 0, path2.len(), &metadata)
            } else {
                gif.process_multiple_packets(&path2, 0, path2.len(), &metadata)
            };
            assert_eq!(consumed, 0);
        }

        assert_eq!(gif.active_path(), Some(GifPath::Path3));
        let paths: Vec<GifPath> = gif.take_transfers().iter().map(|t| t.path).collect();
        assert_eq!(paths, vec![GifPath::Path3]);
    }

    #[test]
    fn multiple_packets_stop_when_path_is_taken() {
        let gif = Gif::new();
        let mut stream = image_packet(1, 0x33);
        stream.extend(image_packet(1, 0x44));

        assert!(gif.try_acquire_path(GifPath::Path1));
        let consumed = gif.process_multiple_packets(
            &stream,
            0,
            stream.len(),
            &PacketMetadata::for_path(GifPath::Path2),
        );
        assert_eq!(consumed, 0);
    }

    #[test]
    fn masked_path3_is_refused() {
        let gif = Gif::new();
        gif.set_path3_masked(true);
        assert!(!gif.try_acquire_path(GifPath::Path3));

        gif.set_path3_masked(false);
        assert!(gif.try_acquire_path(GifPath::Path3));
    }

    #[test]
    fn image_data_is_read_back_in_order() {
        let gif = Gif::new();
        gif.queue_image_data(&[1, 2, 3]);

        let mut buffer = [0xFF_u8; 4];
        gif.read_image_data(&mut buffer);
        assert_eq!(buffer, [1, 2, 3, 0]);
    }
}
