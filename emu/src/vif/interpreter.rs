//! # VIFcode interpreter
//!
//! Runs on the VIF1 consumer thread, one [`CommandStream`] (one ring run) at
//! a time. Commands may need more data than the run holds (DIRECT, MPG,
//! UNPACK, STROW...) or may have to wait on VU1 or on the GIF. In both cases
//! the command word stays in `CODE` and the progress in the registers, and
//! the next run picks it up where it stopped:
//!
//! - `STAT.VPS != 0`: the command waits for more data.
//! - `STAT.VEW`: the command waits for VU1 to finish its micro program.
//! - `STAT.VGW`: deferred XGKICKs must reach the GIF before anything new is
//!   decoded.
//! - `STAT.VIS`: a command with the interrupt bit completed, the stream is
//!   stalled until FBRST.STC.

use crate::gif::{GifArbiter, GifPath, PacketMetadata};
use crate::ring_buffer::QWORD_SIZE;
use crate::savestate::{self, RegisterStateFile, StateArchive};
use crate::vpu::{Cycle, MICROMEM1SIZE, UnpackDescriptor, VectorUnit};

use super::registers::{Code, Command, Stat};
use super::stream::CommandStream;
use super::xgkick::XgKickQueue;

const STATE_REGS_CODE: &str = "CODE";
const STATE_REGS_STAT: &str = "STAT";
const STATE_REGS_NUM: &str = "NUM";
const STATE_REGS_ERR: &str = "ERR";
const STATE_REGS_MARK: &str = "MARK";
const STATE_REGS_CYCLE: &str = "CYCLE";
const STATE_REGS_MODE: &str = "MODE";
const STATE_REGS_MASK: &str = "MASK";
const STATE_REGS_ITOP: &str = "ITOP";
const STATE_REGS_ITOPS: &str = "ITOPS";
const STATE_REGS_WRITE_INDEX: &str = "writeIndex";
const STATE_REGS_MPG_ADDRESS: &str = "mpgAddress";
const STATE_REGS_MPG_REMAINING: &str = "mpgRemaining";
const STATE_REGS_UNPACK_OFFSET: &str = "unpackOffset";
const STATE_REGS_BASE: &str = "BASE";
const STATE_REGS_TOP: &str = "TOP";
const STATE_REGS_TOPS: &str = "TOPS";
const STATE_REGS_OFST: &str = "OFST";
const STATE_REGS_DIRECT_QWORD_BUFFER: &str = "directQwordBuffer";
const STATE_REGS_DIRECT_QWORD_BUFFER_INDEX: &str = "directQwordBufferIndex";

/// The collaborators a command can reach.
pub struct Links<'a> {
    pub gif: &'a dyn GifArbiter,
    pub vpu: &'a dyn VectorUnit,
    pub xgkicks: &'a XgKickQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterState {
    /// Between two commands.
    Idle,
    /// A command is decoded and waits for the rest of its data.
    Decoding,
    /// Deferred XGKICKs hold the stream back.
    StalledOnDownstream,
    /// VU1 must finish before the current command can go on.
    WaitingOnVu,
    /// DIRECT collected less than a quadword so far.
    AssemblingPartialUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MicroProgram {
    At(u32),
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UnpackProgress {
    descriptor: UnpackDescriptor,
    offset: usize,
    size: usize,
}

#[derive(Debug, Default)]
pub struct Interpreter {
    pub code: Code,
    pub stat: Stat,
    pub num: u32,
    pub err: u32,
    pub mark: u32,
    pub cycle: Cycle,
    pub mode: u32,
    pub mask: u32,
    pub itop: u32,
    pub itops: u32,
    pub base: u32,
    pub ofst: u32,
    pub top: u32,
    pub tops: u32,
    pub row: [u32; 4],
    pub col: [u32; 4],

    /// DIRECT data that doesn't make a whole quadword yet.
    pub direct_qword_buffer: [u8; QWORD_SIZE],
    pub direct_qword_buffer_index: usize,

    /// Words already stored by STROW/STCOL.
    write_index: usize,
    mpg_address: u32,
    mpg_remaining: usize,
    unpack: Option<UnpackProgress>,

    /// MSCAL/MSCNT that came in while VU1 was still busy.
    pending_micro_program: Option<MicroProgram>,
}

impl Interpreter {
    #[must_use]
    pub fn state(&self) -> InterpreterState {
        if self.stat.vgw() {
            InterpreterState::StalledOnDownstream
        } else if self.stat.vew() {
            InterpreterState::WaitingOnVu
        } else if self.direct_qword_buffer_index != 0 {
            InterpreterState::AssemblingPartialUnit
        } else if self.stat.vps() != 0 {
            InterpreterState::Decoding
        } else {
            InterpreterState::Idle
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// FBRST.RST: drops the command in flight, keeps the double buffer setup.
    pub fn reset_command(&mut self) {
        self.code = Code::default();
        self.stat = Stat::default();
        self.num = 0;
        self.direct_qword_buffer = [0; QWORD_SIZE];
        self.direct_qword_buffer_index = 0;
        self.write_index = 0;
        self.mpg_remaining = 0;
        self.unpack = None;
        self.pending_micro_program = None;
    }

    /// Interprets as much of `stream` as possible.
    pub fn process_packet(&mut self, stream: &mut CommandStream<'_>, links: &Links<'_>) {
        while stream.available() != 0 {
            if self.stat.vis() {
                break;
            }

            let mut redispatch = self.stat.vps() != 0 || self.stat.vgw();
            if self.stat.vew() {
                if links.vpu.is_running() {
                    break;
                }
                self.stat.set_vew(false);
                redispatch = true;
            }

            if !redispatch {
                if stream.available() < 4 {
                    break;
                }
                self.code = Code::from(stream.read_u32());
                #[cfg(feature = "disassembler")]
                tracing::trace!("VIF1 {}", self.code);
            }

            let before = stream.available();
            self.execute_command(stream, links);

            if self.stat.vgw() || self.stat.vew() {
                break;
            }
            if self.stat.vps() != 0 {
                if stream.available() == before {
                    break;
                }
                continue;
            }
            if self.code.interrupt() {
                self.stat.set_int(true);
                self.stat.set_vis(true);
            }
        }
    }

    fn execute_command(&mut self, stream: &mut CommandStream<'_>, links: &Links<'_>) {
        if self.stat.vps() == 0 {
            // Nothing new reaches the GIF before the deferred XGKICKs.
            let waiting = links.xgkicks.flush(links.gif);
            self.stat.set_vgw(waiting != 0);
            if waiting != 0 {
                return;
            }
        }

        let command = match self.code.command() {
            Ok(command) => command,
            Err(cmd) => panic!("unknown VIFcode command {cmd:#04x} in {:?}", self.code),
        };
        let imm = self.code.imm();

        match command {
            Command::Nop => {}
            Command::Stcycl => {
                self.cycle = Cycle {
                    cl: (imm & 0xFF) as u8,
                    wl: (imm >> 8) as u8,
                };
            }
            Command::Offset => {
                self.ofst = u32::from(imm);
                self.stat.set_dbf(false);
                self.tops = self.base;
            }
            Command::Base => self.base = u32::from(imm),
            Command::Itop => self.itops = u32::from(imm & 0x3FF),
            Command::Stmod => self.mode = u32::from(imm & 0b11),
            Command::Mskpath3 => links.gif.set_path3_masked(imm & 0x8000 != 0),
            Command::Mark => {
                self.mark = u32::from(imm);
                self.stat.set_mrk(true);
            }
            Command::Flushe | Command::Flush | Command::Flusha => self.cmd_flush(links),
            Command::Mscal | Command::Mscalf => {
                self.cmd_mscal(MicroProgram::At(u32::from(imm) * 8), links);
            }
            Command::Mscnt => self.cmd_mscal(MicroProgram::Continue, links),
            Command::Stmask => self.cmd_stmask(stream),
            Command::Strow => self.cmd_store_vector(stream, true),
            Command::Stcol => self.cmd_store_vector(stream, false),
            Command::Mpg => self.cmd_mpg(stream, links),
            Command::Direct | Command::Directhl => self.cmd_direct(stream, links),
            Command::Unpack { vn, vl, masked } => {
                self.cmd_unpack(stream, links, vn, vl, masked);
            }
        }
    }

    fn unpack_descriptor(&self, vn: u8, vl: u8, masked: bool) -> UnpackDescriptor {
        let imm = self.code.imm();
        let mut address = u32::from(imm & 0x3FF);
        if imm & 0x8000 != 0 {
            address += self.tops;
        }
        UnpackDescriptor {
            vn,
            vl,
            unsigned: imm & 0x4000 != 0,
            masked,
            address,
            num: match self.code.num() {
                0 => 256,
                n => u32::from(n),
            },
            cycle: self.cycle,
            mode: self.mode,
            mask: self.mask,
            row: self.row,
            col: self.col,
        }
    }

    /// Writes the registers into `vpu/vif_{number}` (state shared by both
    /// VIFs) and `vpu/vif1_{number}` (double buffering and DIRECT assembly).
    pub fn save_state(&self, archive: &mut StateArchive, number: u32) {
        let mut file = RegisterStateFile::new();
        file.set_register32(STATE_REGS_CODE, self.code.into());
        file.set_register32(STATE_REGS_STAT, self.stat.into());
        file.set_register32(STATE_REGS_NUM, self.num);
        file.set_register32(STATE_REGS_ERR, self.err);
        file.set_register32(STATE_REGS_MARK, self.mark);
        file.set_register32(
            STATE_REGS_CYCLE,
            u32::from(self.cycle.cl) | (u32::from(self.cycle.wl) << 8),
        );
        file.set_register32(STATE_REGS_MODE, self.mode);
        file.set_register32(STATE_REGS_MASK, self.mask);
        file.set_register32(STATE_REGS_ITOP, self.itop);
        file.set_register32(STATE_REGS_ITOPS, self.itops);
        for (i, (row, col)) in self.row.iter().zip(&self.col).enumerate() {
            file.set_register32(&format!("R{i}"), *row);
            file.set_register32(&format!("C{i}"), *col);
        }
        file.set_register32(STATE_REGS_WRITE_INDEX, self.write_index as u32);
        file.set_register32(STATE_REGS_MPG_ADDRESS, self.mpg_address);
        file.set_register32(STATE_REGS_MPG_REMAINING, self.mpg_remaining as u32);
        file.set_register32(
            STATE_REGS_UNPACK_OFFSET,
            self.unpack.as_ref().map_or(0, |progress| progress.offset as u32),
        );
        archive.insert(format!("vpu/vif_{number}"), file);

        let mut file = RegisterStateFile::new();
        file.set_register32(STATE_REGS_BASE, self.base);
        file.set_register32(STATE_REGS_TOP, self.top);
        file.set_register32(STATE_REGS_TOPS, self.tops);
        file.set_register32(STATE_REGS_OFST, self.ofst);
        file.set_register128(
            STATE_REGS_DIRECT_QWORD_BUFFER,
            u128::from_le_bytes(self.direct_qword_buffer),
        );
        file.set_register32(
            STATE_REGS_DIRECT_QWORD_BUFFER_INDEX,
            self.direct_qword_buffer_index as u32,
        );
        archive.insert(format!("vpu/vif1_{number}"), file);
    }

    /// Replaces every register with the archived ones. On error nothing is
    /// changed.
    pub fn load_state(&mut self, archive: &StateArchive, number: u32) -> savestate::Result<()> {
        let mut state = Self::default();

        let file = archive.file(&format!("vpu/vif_{number}"))?;
        state.code = Code::from(file.register32(STATE_REGS_CODE)?);
        state.stat = Stat::from(file.register32(STATE_REGS_STAT)?);
        state.num = file.register32(STATE_REGS_NUM)?;
        state.err = file.register32(STATE_REGS_ERR)?;
        state.mark = file.register32(STATE_REGS_MARK)?;
        let cycle = file.register32(STATE_REGS_CYCLE)?;
        state.cycle = Cycle {
            cl: (cycle & 0xFF) as u8,
            wl: ((cycle >> 8) & 0xFF) as u8,
        };
        state.mode = file.register32(STATE_REGS_MODE)?;
        state.mask = file.register32(STATE_REGS_MASK)?;
        state.itop = file.register32(STATE_REGS_ITOP)?;
        state.itops = file.register32(STATE_REGS_ITOPS)?;
        for i in 0..4 {
            state.row[i] = file.register32(&format!("R{i}"))?;
            state.col[i] = file.register32(&format!("C{i}"))?;
        }
        state.write_index = file.register32(STATE_REGS_WRITE_INDEX)? as usize;
        state.mpg_address = file.register32(STATE_REGS_MPG_ADDRESS)?;
        state.mpg_remaining = file.register32(STATE_REGS_MPG_REMAINING)? as usize;
        let unpack_offset = file.register32(STATE_REGS_UNPACK_OFFSET)? as usize;

        let file = archive.file(&format!("vpu/vif1_{number}"))?;
        state.base = file.register32(STATE_REGS_BASE)?;
        state.top = file.register32(STATE_REGS_TOP)?;
        state.tops = file.register32(STATE_REGS_TOPS)?;
        state.ofst = file.register32(STATE_REGS_OFST)?;
        state.direct_qword_buffer =
            file.register128(STATE_REGS_DIRECT_QWORD_BUFFER)?.to_le_bytes();
        state.direct_qword_buffer_index =
            (file.register32(STATE_REGS_DIRECT_QWORD_BUFFER_INDEX)? as usize).min(QWORD_SIZE);

        // An UNPACK cut in half picks up with the same descriptor, none of
        // its inputs can change before it ends.
        if state.stat.vps() != 0 {
            if let Ok(Command::Unpack { vn, vl, masked }) = state.code.command() {
                let descriptor = state.unpack_descriptor(vn, vl, masked);
                let size = descriptor.input_size();
                state.unpack = Some(UnpackProgress {
                    descriptor,
                    offset: unpack_offset.min(size),
                    size,
                });
            }
        }

        *self = state;
        Ok(())
    }

    fn cmd_flush(&mut self, links: &Links<'_>) {
        if links.vpu.is_running() {
            self.stat.set_vew(true);
            return;
        }
        self.stat.set_vew(false);
        if self.resume_delayed_micro_program(links) {
            self.stat.set_vew(true);
        }
    }

    fn cmd_mscal(&mut self, program: MicroProgram, links: &Links<'_>) {
        if self.resume_delayed_micro_program(links) {
            return;
        }
        if links.vpu.is_running() {
            self.pending_micro_program = Some(program);
            self.stat.set_vew(true);
            return;
        }
        self.start_micro_program(program, links);
    }

    fn resume_delayed_micro_program(&mut self, links: &Links<'_>) -> bool {
        let Some(program) = self.pending_micro_program.take() else {
            return false;
        };
        assert!(!links.vpu.is_running());
        self.start_micro_program(program, links);
        true
    }

    fn start_micro_program(&mut self, program: MicroProgram, links: &Links<'_>) {
        self.prepare_micro_program();
        match program {
            MicroProgram::At(address) => {
                links
                    .vpu
                    .execute_micro_program(address, self.top, self.itop);
            }
            MicroProgram::Continue => links.vpu.continue_micro_program(self.top, self.itop),
        }
    }

    /// Double buffering: the program gets the current TOPS, TOPS flips to the
    /// other half.
    fn prepare_micro_program(&mut self) {
        self.itop = self.itops;
        self.top = self.tops;
        self.tops = if self.stat.dbf() {
            self.base
        } else {
            self.base + self.ofst
        };
        self.stat.set_dbf(!self.stat.dbf());
    }

    fn cmd_stmask(&mut self, stream: &mut CommandStream<'_>) {
        if stream.available() < 4 {
            self.stat.set_vps(1);
            return;
        }
        self.mask = stream.read_u32();
        self.stat.set_vps(0);
    }

    fn cmd_store_vector(&mut self, stream: &mut CommandStream<'_>, row: bool) {
        if self.stat.vps() == 0 {
            self.write_index = 0;
        }
        let registers = if row { &mut self.row } else { &mut self.col };
        while self.write_index < registers.len() && stream.available() >= 4 {
            registers[self.write_index] = stream.read_u32();
            self.write_index += 1;
        }
        self.stat.set_vps(u32::from(self.write_index < 4));
    }

    fn cmd_mpg(&mut self, stream: &mut CommandStream<'_>, links: &Links<'_>) {
        if self.stat.vps() == 0 {
            // Micro memory can't change under a running program.
            if links.vpu.is_running() {
                self.stat.set_vew(true);
                return;
            }
            let num = match self.code.num() {
                0 => 256,
                n => usize::from(n),
            };
            self.mpg_address = (u32::from(self.code.imm()) * 8) & (MICROMEM1SIZE as u32 - 1);
            self.mpg_remaining = num * 8;
        }

        let size = self.mpg_remaining.min(stream.available() & !7);
        if size != 0 {
            let mut code = vec![0_u8; size];
            stream.read(&mut code);
            links.vpu.write_micro_memory(self.mpg_address, &code);
            self.mpg_address = (self.mpg_address + size as u32) & (MICROMEM1SIZE as u32 - 1);
            self.mpg_remaining -= size;
        }
        self.num = (self.mpg_remaining / 8) as u32;
        self.stat.set_vps(u32::from(self.mpg_remaining != 0));
    }

    fn cmd_direct(&mut self, stream: &mut CommandStream<'_>, links: &Links<'_>) {
        let metadata = PacketMetadata::for_path(GifPath::Path2);
        let available = stream.available();

        if self.code.imm() != 0 && available != 0 {
            // Less than a quadword to go on, or the data isn't quadword
            // aligned: collect it byte by byte.
            let has_partial_qword = self.direct_qword_buffer_index != 0
                || available < QWORD_SIZE
                || stream.buffered() != 0;
            if has_partial_qword {
                let index = self.direct_qword_buffer_index;
                let read_amount = available.min(QWORD_SIZE - index);
                stream.read(&mut self.direct_qword_buffer[index..index + read_amount]);
                self.direct_qword_buffer_index += read_amount;

                if self.direct_qword_buffer_index == QWORD_SIZE {
                    let processed = links.gif.process_multiple_packets(
                        &self.direct_qword_buffer,
                        0,
                        QWORD_SIZE,
                        &metadata,
                    );
                    // A refused quadword stays assembled for the next try.
                    if processed == QWORD_SIZE {
                        self.code.set_imm(self.code.imm() - 1);
                        self.direct_qword_buffer_index = 0;
                    }
                }
            }

            if self.direct_qword_buffer_index == 0 && stream.buffered() == 0 {
                let size = (usize::from(self.code.imm()) * QWORD_SIZE)
                    .min(stream.available() & !(QWORD_SIZE - 1));
                if size != 0 {
                    let packet = stream.direct();
                    let processed = links.gif.process_multiple_packets(packet, 0, size, &metadata);
                    assert!(processed <= size);
                    debug_assert_eq!(processed % QWORD_SIZE, 0);
                    stream.advance(processed);
                    self.code
                        .set_imm(self.code.imm() - (processed / QWORD_SIZE) as u16);
                }
            }
        }

        self.stat.set_vps(u32::from(self.code.imm() != 0));
    }

    fn cmd_unpack(
        &mut self,
        stream: &mut CommandStream<'_>,
        links: &Links<'_>,
        vn: u8,
        vl: u8,
        masked: bool,
    ) {
        if self.stat.vps() == 0 {
            let descriptor = self.unpack_descriptor(vn, vl, masked);
            let size = descriptor.input_size();
            self.num = descriptor.num;
            self.unpack = Some(UnpackProgress {
                descriptor,
                offset: 0,
                size,
            });
        }

        let Some(progress) = self.unpack.as_mut() else {
            self.stat.set_vps(0);
            return;
        };
        let size = (progress.size - progress.offset).min(stream.available() & !3);
        if size != 0 {
            let mut data = vec![0_u8; size];
            stream.read(&mut data);
            links
                .vpu
                .unpack(&progress.descriptor, progress.offset, &data);
            progress.offset += size;
        }

        let done = progress.offset == progress.size;
        if done {
            self.unpack = None;
            self.num = 0;
        }
        self.stat.set_vps(u32::from(!done));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::gif::{Gif, GifTransfer, make_tag};
    use crate::vif::stream::FifoStream;
    use crate::vif::xgkick::PendingXgKick;
    use crate::vpu::VUMEM1SIZE;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum VuCall {
        Execute { address: u32, top: u32, itop: u32 },
        Continue { top: u32 },
        MicroMemory { address: u32, data: Vec<u8> },
        Unpack { address: u32, offset: usize, data: Vec<u8> },
    }

    #[derive(Default)]
    pub struct MockVu {
        pub running: AtomicBool,
        pub calls: Mutex<Vec<VuCall>>,
    }

    impl MockVu {
        pub fn set_running(&self, running: bool) {
            self.running.store(running, Ordering::SeqCst);
        }

        pub fn take_calls(&self) -> Vec<VuCall> {
            std::mem::take(&mut self.calls.lock().unwrap())
        }
    }

    impl VectorUnit for MockVu {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn execute_micro_program(&self, address: u32, top: u32, itop: u32) {
            self.calls
                .lock()
                .unwrap()
                .push(VuCall::Execute { address, top, itop });
        }

        fn continue_micro_program(&self, top: u32, _itop: u32) {
            self.calls.lock().unwrap().push(VuCall::Continue { top });
        }

        fn write_micro_memory(&self, address: u32, data: &[u8]) {
            self.calls.lock().unwrap().push(VuCall::MicroMemory {
                address,
                data: data.to_vec(),
            });
        }

        fn unpack(&self, descriptor: &UnpackDescriptor, offset: usize, data: &[u8]) {
            self.calls.lock().unwrap().push(VuCall::Unpack {
                address: descriptor.address,
                offset,
                data: data.to_vec(),
            });
        }
    }

    /// A GIF that never takes more than `limit` bytes per call.
    struct StingyGif {
        inner: Gif,
        limit: usize,
    }

    impl GifArbiter for StingyGif {
        fn try_acquire_path(&self, path: GifPath) -> bool {
            self.inner.try_acquire_path(path)
        }

        fn active_path(&self) -> Option<GifPath> {
            self.inner.active_path()
        }

        fn set_path3_masked(&self, masked: bool) {
            self.inner.set_path3_masked(masked);
        }

        fn process_single_packet(
            &self,
            memory: &[u8],
            address: usize,
            end: usize,
            metadata: &PacketMetadata,
        ) -> usize {
            self.inner
                .process_single_packet(memory, address, end.min(address + self.limit), metadata)
        }

        fn process_multiple_packets(
            &self,
            memory: &[u8],
            address: usize,
            end: usize,
            metadata: &PacketMetadata,
        ) -> usize {
            self.inner
                .process_multiple_packets(memory, address, end.min(address + self.limit), metadata)
        }

        fn read_image_data(&self, buffer: &mut [u8]) {
            self.inner.read_image_data(buffer);
        }
    }

    pub fn words(codes: &[u32]) -> Vec<u8> {
        codes.iter().flat_map(|code| code.to_le_bytes()).collect()
    }

    pub fn code(cmd: u8, num: u8, imm: u16) -> u32 {
        Code::new(cmd, num, imm).into()
    }

    /// DIRECT header quadword followed by an IMAGE packet of `data_qwords`.
    pub fn direct_packet(data_qwords: u16, fill: u8) -> Vec<u8> {
        let mut bytes = words(&[0, 0, 0, code(0x50, 0, data_qwords + 1)]);
        bytes.extend(make_tag(data_qwords, true, 2, 0));
        for i in 0..data_qwords {
            bytes.extend([fill.wrapping_add(i as u8); QWORD_SIZE]);
        }
        bytes
    }

    struct Harness {
        interpreter: Interpreter,
        fifo: FifoStream,
        gif: Gif,
        vu: MockVu,
        xgkicks: XgKickQueue,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                interpreter: Interpreter::default(),
                fifo: FifoStream::default(),
                gif: Gif::new(),
                vu: MockVu::default(),
                xgkicks: XgKickQueue::default(),
            }
        }

        /// Runs `window` through the interpreter, returns the untouched tail.
        fn run(&mut self, window: &[u8]) -> usize {
            let links = Links {
                gif: &self.gif,
                vpu: &self.vu,
                xgkicks: &self.xgkicks,
            };
            run_stream(&mut self.interpreter, &mut self.fifo, window, &links)
        }

        fn run_with(&mut self, window: &[u8], gif: &dyn GifArbiter) -> usize {
            let links = Links {
                gif,
                vpu: &self.vu,
                xgkicks: &self.xgkicks,
            };
            run_stream(&mut self.interpreter, &mut self.fifo, window, &links)
        }
    }

    fn run_stream(
        interpreter: &mut Interpreter,
        fifo: &mut FifoStream,
        window: &[u8],
        links: &Links<'_>,
    ) -> usize {
        let mut stream = CommandStream::new(fifo, window);
        interpreter.process_packet(&mut stream, links);
        stream.remaining_window()
    }

    fn gif_paths(transfers: &[GifTransfer]) -> Vec<GifPath> {
        transfers.iter().map(|t| t.path).collect()
    }

    #[test]
    fn offset_and_base() {
        let mut h = Harness::new();
        h.interpreter.stat.set_dbf(true);
        h.run(&words(&[code(0x03, 0, 0x100), code(0x02, 0, 0x40), 0, 0]));

        assert_eq!(h.interpreter.base, 0x100);
        assert_eq!(h.interpreter.ofst, 0x40);
        assert_eq!(h.interpreter.tops, 0x100);
        assert!(!h.interpreter.stat.dbf());
        assert_eq!(h.interpreter.state(), InterpreterState::Idle);
    }

    #[test]
    fn double_buffer_flips_on_every_program() {
        let mut h = Harness::new();
        h.run(&words(&[code(0x03, 0, 0x10), code(0x02, 0, 0x20), 0, 0]));

        let mut dbf = Vec::new();
        for _ in 0..4 {
            h.run(&words(&[code(0x14, 0, 2), 0, 0, 0]));
            dbf.push(h.interpreter.stat.dbf());
        }

        let tops: Vec<u32> = h
            .vu
            .take_calls()
            .into_iter()
            .map(|call| match call {
                VuCall::Execute { top, address, .. } => {
                    assert_eq!(address, 16);
                    top
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(tops, vec![0x10, 0x30, 0x10, 0x30]);
        assert_eq!(dbf, vec![true, false, true, false]);
        assert_eq!(h.interpreter.top, 0x30);
        assert_eq!(h.interpreter.tops, 0x10);
    }

    #[test]
    fn itop_is_latched_at_program_start() {
        let mut h = Harness::new();
        h.run(&words(&[code(0x04, 0, 0x1FF), code(0x17, 0, 0), code(0x04, 0, 0x7), 0]));

        assert_eq!(h.interpreter.itop, 0x1FF);
        assert_eq!(h.interpreter.itops, 0x7);
        assert_eq!(h.vu.take_calls(), vec![VuCall::Continue { top: 0 }]);
    }

    #[test]
    fn direct_split_across_invocations() {
        let mut h = Harness::new();
        // DIRECT of 4 quadwords (tag + 3), only 2 present in the first run.
        let packet = direct_packet(3, 0x10);
        let (first, second) = packet.split_at(3 * QWORD_SIZE);

        assert_eq!(h.run(first), 0);
        assert_eq!(h.gif.take_transfers().len(), 2);
        assert_eq!(h.interpreter.code.imm(), 2);
        assert_eq!(h.interpreter.stat.vps(), 1);
        assert_eq!(h.interpreter.state(), InterpreterState::Decoding);

        assert_eq!(h.run(second), 0);
        let transfers = h.gif.take_transfers();
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].qword, [0x11; QWORD_SIZE]);
        assert_eq!(transfers[1].qword, [0x12; QWORD_SIZE]);
        assert_eq!(h.interpreter.code.imm(), 0);
        assert_eq!(h.interpreter.stat.vps(), 0);
    }

    #[test]
    fn direct_advances_by_what_the_gif_took() {
        let mut h = Harness::new();
        let stingy = StingyGif {
            inner: Gif::new(),
            limit: 2 * QWORD_SIZE,
        };
        let packet = direct_packet(4, 0x20);

        // Each call forwards two quadwords, the loop keeps calling while it
        // makes progress.
        assert_eq!(h.run_with(&packet, &stingy), 0);
        let transfers = stingy.inner.take_transfers();
        assert_eq!(transfers.len(), 5);
        assert_eq!(transfers[4].qword, [0x23; QWORD_SIZE]);
        assert_eq!(h.interpreter.stat.vps(), 0);
    }

    #[test]
    fn direct_byte_by_byte_matches_whole_quadwords() {
        let packet = direct_packet(2, 0x40);

        let mut whole = Harness::new();
        assert_eq!(whole.run(&packet), 0);
        let expected = whole.gif.take_transfers();
        assert_eq!(expected.len(), 3);

        // Command words in one go, then the DIRECT payload one byte at a time.
        let mut bytes = Harness::new();
        bytes.run(&packet[..QWORD_SIZE]);
        assert_eq!(bytes.interpreter.stat.vps(), 1);
        for byte in &packet[QWORD_SIZE..] {
            assert_eq!(bytes.run(std::slice::from_ref(byte)), 0);
        }

        assert_eq!(bytes.gif.take_transfers(), expected);
        assert_eq!(bytes.interpreter.stat.vps(), 0);
        assert_eq!(bytes.interpreter.direct_qword_buffer_index, 0);
    }

    #[test]
    fn misaligned_direct_goes_through_the_assembly_buffer() {
        let mut h = Harness::new();
        let mut data = words(&[code(0x50, 0, 1)]);
        data.extend(make_tag(0, true, 2, 0));
        data.extend([0; 12]);

        // Code word plus 12 bytes: the first run leaves a partial unit.
        h.run(&data[..QWORD_SIZE]);
        assert_eq!(h.interpreter.direct_qword_buffer_index, 12);
        assert_eq!(h.interpreter.state(), InterpreterState::AssemblingPartialUnit);
        assert!(h.gif.take_transfers().is_empty());

        h.run(&data[QWORD_SIZE..]);
        assert_eq!(h.interpreter.direct_qword_buffer_index, 0);
        assert_eq!(h.gif.take_transfers().len(), 1);
        assert_eq!(h.interpreter.stat.vps(), 0);
    }

    #[test]
    fn deferred_xgkick_drains_before_new_commands() {
        let mut h = Harness::new();

        // GIF DMA owns the GIF, an XGKICK has to wait.
        assert!(h.gif.try_acquire_path(GifPath::Path3));
        let mut vu_memory = vec![0_u8; VUMEM1SIZE];
        vu_memory[..QWORD_SIZE].copy_from_slice(&make_tag(1, true, 2, 0));
        vu_memory[QWORD_SIZE..2 * QWORD_SIZE].fill(0x77);
        h.xgkicks.push(PendingXgKick::new(
            &vu_memory,
            0,
            PacketMetadata::for_path(GifPath::Path1),
        ));

        let packet = direct_packet(1, 0x55);
        // The first NOP is read, then the interpreter stalls on VGW.
        let remaining = h.run(&packet);
        assert_eq!(remaining, packet.len() - QWORD_SIZE);
        assert!(h.interpreter.stat.vgw());
        assert_eq!(h.interpreter.state(), InterpreterState::StalledOnDownstream);

        // PATH3 packet ends, the GIF is free.
        let path3 = make_tag(0, true, 2, 0);
        h.gif
            .process_single_packet(&path3, 0, QWORD_SIZE, &PacketMetadata::for_path(GifPath::Path3));
        h.gif.take_transfers();

        assert_eq!(h.run(&packet[QWORD_SIZE..]), 0);
        assert!(!h.interpreter.stat.vgw());
        assert!(h.xgkicks.is_empty());

        let transfers = h.gif.take_transfers();
        assert_eq!(
            gif_paths(&transfers),
            vec![GifPath::Path1, GifPath::Path1, GifPath::Path2, GifPath::Path2]
        );
        assert_eq!(transfers[1].qword, [0x77; QWORD_SIZE]);
    }

    #[test]
    fn flush_waits_for_vu() {
        let mut h = Harness::new();
        h.vu.set_running(true);

        let remaining = h.run(&words(&[code(0x11, 0, 0), code(0x03, 0, 0x42), 0, 0]));
        assert_eq!(remaining, 0);
        assert!(h.interpreter.stat.vew());
        assert_eq!(h.interpreter.base, 0);

        // Still running: nothing moves.
        h.run(&words(&[0, 0, 0, 0]));
        assert_eq!(h.interpreter.base, 0);

        h.vu.set_running(false);
        h.run(&words(&[0, 0, 0, 0]));
        assert!(!h.interpreter.stat.vew());
        assert_eq!(h.interpreter.base, 0x42);
    }

    #[test]
    fn mscal_is_delayed_while_vu_runs() {
        let mut h = Harness::new();
        h.vu.set_running(true);

        h.run(&words(&[code(0x14, 0, 0x20), 0, 0, 0]));
        assert!(h.interpreter.stat.vew());
        assert_eq!(h.interpreter.state(), InterpreterState::WaitingOnVu);
        assert!(h.vu.take_calls().is_empty());

        h.vu.set_running(false);
        h.run(&words(&[0, 0, 0, 0]));
        assert!(!h.interpreter.stat.vew());
        assert_eq!(
            h.vu.take_calls(),
            vec![VuCall::Execute {
                address: 0x100,
                top: 0,
                itop: 0,
            }]
        );
    }

    #[test]
    fn mpg_uploads_across_runs() {
        let mut h = Harness::new();
        // MPG of 2 doublewords at 0x10 (imm = 2), code in the second word.
        let mut data = words(&[0, code(0x4A, 2, 2)]);
        data.extend([0xC0; 8]);
        data.extend([0xC1; 8]);

        h.run(&data[..QWORD_SIZE]);
        assert_eq!(h.interpreter.stat.vps(), 1);
        assert_eq!(h.interpreter.num, 1);
        h.run(&data[QWORD_SIZE..]);
        assert_eq!(h.interpreter.stat.vps(), 0);

        assert_eq!(
            h.vu.take_calls(),
            vec![
                VuCall::MicroMemory {
                    address: 0x10,
                    data: vec![0xC0; 8],
                },
                VuCall::MicroMemory {
                    address: 0x18,
                    data: vec![0xC1; 8],
                },
            ]
        );
    }

    #[test]
    fn unpack_adds_tops_when_flagged() {
        let mut h = Harness::new();
        h.interpreter.tops = 0x200;

        // UNPACK V4-32, 2 vectors to 0x8 + TOPS, split over two runs.
        let mut data = words(&[0, 0, 0, code(0x6C, 2, 0x8008)]);
        data.extend((0..32).map(|i| i as u8));

        h.run(&data[..2 * QWORD_SIZE]);
        assert_eq!(h.interpreter.stat.vps(), 1);
        h.run(&data[2 * QWORD_SIZE..]);
        assert_eq!(h.interpreter.stat.vps(), 0);

        assert_eq!(
            h.vu.take_calls(),
            vec![
                VuCall::Unpack {
                    address: 0x208,
                    offset: 0,
                    data: (0..16).collect(),
                },
                VuCall::Unpack {
                    address: 0x208,
                    offset: 16,
                    data: (16..32).collect(),
                },
            ]
        );
    }

    #[test]
    fn strow_and_stcol() {
        let mut h = Harness::new();
        let data = words(&[0, 0, 0, code(0x30, 0, 0), 1, 2, 3, 4, 0, 0, 0, code(0x31, 0, 0)]);
        h.run(&data);
        assert_eq!(h.interpreter.row, [1, 2, 3, 4]);
        assert_eq!(h.interpreter.stat.vps(), 1);

        h.run(&words(&[5, 6, 7, 8]));
        assert_eq!(h.interpreter.col, [5, 6, 7, 8]);
        assert_eq!(h.interpreter.stat.vps(), 0);
    }

    #[test]
    fn mark_stcycl_stmod_stmask() {
        let mut h = Harness::new();
        h.run(&words(&[
            code(0x07, 0, 0x1234),
            code(0x01, 0, 0x0104),
            code(0x05, 0, 0x2),
            code(0x20, 0, 0),
            0xAAAA_5555,
            0,
            0,
            0,
        ]));

        assert_eq!(h.interpreter.mark, 0x1234);
        assert!(h.interpreter.stat.mrk());
        assert_eq!(h.interpreter.cycle, Cycle { cl: 4, wl: 1 });
        assert_eq!(h.interpreter.mode, 2);
        assert_eq!(h.interpreter.mask, 0xAAAA_5555);
    }

    #[test]
    fn mskpath3_toggles_the_gif_gate() {
        let mut h = Harness::new();
        h.run(&words(&[code(0x06, 0, 0x8000), 0, 0, 0]));
        assert!(h.gif.is_path3_masked());

        h.run(&words(&[code(0x06, 0, 0), 0, 0, 0]));
        assert!(!h.gif.is_path3_masked());
    }

    #[test]
    fn interrupt_bit_stalls_the_stream() {
        let mut h = Harness::new();
        let remaining = h.run(&words(&[
            0x8000_0000,
            code(0x03, 0, 0x99),
            0,
            0,
            0,
            0,
            0,
            0,
        ]));

        assert!(h.interpreter.stat.int());
        assert!(h.interpreter.stat.vis());
        assert_eq!(h.interpreter.base, 0);
        assert_eq!(remaining, QWORD_SIZE);
    }

    #[test]
    #[should_panic(expected = "unknown VIFcode command 0x08")]
    fn unknown_command_is_fatal() {
        let mut h = Harness::new();
        h.run(&words(&[code(0x08, 0, 0), 0, 0, 0]));
    }
}
