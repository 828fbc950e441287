//! # VIF1 DMA channel
//!
//! ```text
//!  DMA controller ──receive_dma──┐
//!  FIFO writes ─────write_fifo───┤
//!                                ▼
//!                          ┌──────────┐   runs   ┌─────────────┐
//!                          │ DmaRing  │ ───────► │ Interpreter │──► VU1
//!                          └──────────┘          └─────────────┘
//!                                                   │ DIRECT (PATH2)
//!  VU1 XGKICK ──process_xgkick──► XgKickQueue ──────┴─► GIF
//!                                      (PATH1)
//! ```
//!
//! Producers only copy quadwords into the ring. Everything else happens on
//! the "VIF1 Thread", which owns the interpreter between two runs. Whoever
//! wants to look at or change the interpreter state from the outside
//! (register writes that reset, save states) pauses the thread first, the
//! pause is granted between two runs only.
//!
//! A panic on the consumer thread (unknown VIFcode, broken invariant) fails
//! the ring: every later pause, resume or blocked producer panics too.
//!
//! Lock order, for the consumer: ring cells, then interpreter, then the
//! deferred XGKICK queue, then whatever the GIF locks internally. The ring
//! counters are never held together with any of those.

pub mod interpreter;
pub mod registers;
pub mod stream;
pub mod xgkick;

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::bitwise::qword_word;
use crate::gif::{GifArbiter, GifPath, PacketMetadata};
use crate::memory::{BusMemory, MemoryError};
use crate::ring_buffer::{DmaRing, QWORD_SIZE, Qword};
use crate::savestate::{self, StateArchive};
use crate::vpu::VectorUnit;

use interpreter::{Interpreter, InterpreterState, Links};
use registers::{
    Code, Command, FBRST_FBK, FBRST_RST, FBRST_STC, FBRST_STP, STAT_FQC_BUSY, VIF1_BASE,
    VIF1_C0, VIF1_C3, VIF1_CODE, VIF1_CYCLE, VIF1_ERR, VIF1_FBRST, VIF1_FIFO, VIF1_ITOP,
    VIF1_ITOPS, VIF1_MARK, VIF1_MASK, VIF1_MODE, VIF1_NUM, VIF1_OFST, VIF1_R0, VIF1_R3,
    VIF1_STAT, VIF1_TOP, VIF1_TOPS,
};
use stream::{CommandStream, FifoStream};
use xgkick::XgKickQueue;

/// CHCR.DIR of the DMA request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Memory to VIF1, the usual case.
    FromMemory,
    /// VIF1 to memory, the GS hands back image data.
    ToMemory,
}

/// VU1 registers sampled when an XGKICK is issued, kept for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VuMiniState {
    pub top: u32,
    pub itop: u32,
}

#[derive(Default)]
struct Core {
    interpreter: Interpreter,
    fifo: FifoStream,
}

struct Shared {
    ring: DmaRing,
    core: Mutex<Core>,
    xgkicks: XgKickQueue,
    gif: Arc<dyn GifArbiter>,
    vpu: Arc<dyn VectorUnit>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn consume(&self) {
        let _guard = ConsumerGuard(&self.ring);
        let links = Links {
            gif: self.gif.as_ref(),
            vpu: self.vpu.as_ref(),
            xgkicks: &self.xgkicks,
        };

        let mut read_amount = 0;
        while let Some(run) = self.ring.dequeue(read_amount) {
            let cells = self.ring.cells();
            let window = cells[run].as_flattened();

            let mut core = self.core();
            let Core { interpreter, fifo } = &mut *core;
            let mut stream = CommandStream::new(fifo, window);
            interpreter.process_packet(&mut stream, &links);

            let discard = window.len() - stream.remaining_window();
            assert_eq!(discard % QWORD_SIZE, 0, "VIF1 consumed a partial quadword");
            read_amount = discard / QWORD_SIZE;

            drop(core);
            drop(cells);

            // Stalled: give the GIF and VU1 a chance to move.
            if read_amount == 0 {
                thread::yield_now();
            }
        }
        tracing::debug!("VIF1 consumer stopped");
    }
}

/// Fails the ring when the consumer unwinds, so nobody waits on it.
struct ConsumerGuard<'a>(&'a DmaRing);

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("VIF1 consumer thread panicked, channel is dead");
            self.0.fail();
        }
    }
}

pub struct Vif1 {
    number: u32,
    shared: Arc<Shared>,
    memory: Arc<Mutex<BusMemory>>,

    /// Words stored through the FIFO window, pushed on the fourth one.
    fifo_write: Mutex<Qword>,

    thread: Option<JoinHandle<()>>,
}

impl Vif1 {
    /// Builds the channel and starts its consumer thread.
    pub fn new(
        number: u32,
        gif: Arc<dyn GifArbiter>,
        vpu: Arc<dyn VectorUnit>,
        memory: Arc<Mutex<BusMemory>>,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            ring: DmaRing::default(),
            core: Mutex::default(),
            xgkicks: XgKickQueue::default(),
            gif,
            vpu,
        });

        let consumer = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("VIF1 Thread".to_owned())
            .spawn(move || consumer.consume())?;

        Ok(Self {
            number,
            shared,
            memory,
            fifo_write: Mutex::new([0; QWORD_SIZE]),
            thread: Some(thread),
        })
    }

    fn memory(&self) -> MutexGuard<'_, BusMemory> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serves a DMA request of `qwc` quadwords at `address` (bit 31 selects
    /// the scratchpad). Blocks while the ring can't take the whole transfer.
    /// Returns the number of quadwords moved.
    pub fn receive_dma(
        &self,
        address: u32,
        qwc: u32,
        direction: Direction,
        tag_included: bool,
    ) -> Result<u32, MemoryError> {
        let size = qwc as usize * QWORD_SIZE;
        match direction {
            Direction::ToMemory => {
                let mut memory = self.memory();
                self.shared
                    .gif
                    .read_image_data(memory.slice_mut(address, size)?);
                Ok(qwc)
            }
            Direction::FromMemory => {
                let memory = self.memory();
                let data = memory.slice(address, size)?;
                if tag_included {
                    assert_eq!(qwc, 1, "tagged VIF1 transfer must be a single quadword");
                    let mut qword = [0; QWORD_SIZE];
                    qword.copy_from_slice(data);
                    Ok(self.enqueue_tagged(&qword) as u32)
                } else {
                    Ok(self.enqueue(data) as u32)
                }
            }
        }
    }

    /// Copies whole quadwords into the ring, blocking for room. Returns 0 when
    /// a reset dropped the transfer halfway.
    pub fn enqueue(&self, data: &[u8]) -> usize {
        self.shared.ring.enqueue(data)
    }

    /// Pushes a quadword whose low half is a DMA tag. Only the two upper
    /// words reach the interpreter.
    pub fn enqueue_tagged(&self, qword: &Qword) -> usize {
        debug_assert!(
            (2..4).all(|i| matches!(
                Code::from(qword_word(qword, i)).command(),
                Ok(Command::Nop | Command::Direct | Command::Directhl)
            )),
            "DMA tag carries VIFcodes other than NOP/DIRECT/DIRECTHL"
        );
        self.shared.ring.enqueue_tagged(qword)
    }

    /// 32-bit store into the FIFO window.
    pub fn write_fifo(&self, address: u32, value: u32) {
        let index = (address as usize & 0xF) / 4;
        let mut fifo = self.fifo_write.lock().unwrap_or_else(PoisonError::into_inner);
        fifo[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
        if index == 3 {
            let qword = *fifo;
            self.shared.ring.enqueue(&qword);
            *fifo = [0; QWORD_SIZE];
        }
    }

    /// Process XGKICK from VU1, `address` is in quadwords. Never blocks.
    pub fn process_xgkick(&self, address: u32, vu_memory: &[u8], state: VuMiniState) {
        let address = (address as usize & 0x3FF) * QWORD_SIZE;
        let metadata = PacketMetadata {
            vu_mem_packet_address: address as u32,
            vpu1_top: state.top,
            vpu1_itop: state.itop,
            ..PacketMetadata::for_path(GifPath::Path1)
        };
        self.shared
            .xgkicks
            .kick(self.shared.gif.as_ref(), vu_memory, address, metadata);
    }

    /// Blocks until the consumer thread sits between two runs.
    pub fn pause_processing(&self) {
        self.shared.ring.request_pause();
    }

    pub fn resume_processing(&self) {
        self.shared.ring.request_resume();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.ring.is_paused()
    }

    /// The consumer thread panicked. The channel can't be used any more.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.shared.ring.has_failed()
    }

    /// True while the ring holds data the interpreter hasn't consumed.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.shared.ring.is_processing()
    }

    #[must_use]
    pub fn pending_xgkicks(&self) -> usize {
        self.shared.xgkicks.len()
    }

    #[must_use]
    pub fn state(&self) -> InterpreterState {
        self.shared.core().interpreter.state()
    }

    /// VU1 TOP as handed to the last micro program.
    #[must_use]
    pub fn top(&self) -> u32 {
        self.shared.core().interpreter.top
    }

    /// Power-on state: registers, ring, staged stream bytes and deferred
    /// XGKICKs are all dropped.
    pub fn reset(&self) {
        let was_paused = self.is_paused();
        if !was_paused {
            self.pause_processing();
        }

        {
            let mut core = self.shared.core();
            core.interpreter.reset();
            core.fifo.reset();
        }
        self.shared.ring.clear();
        self.shared.xgkicks.clear();
        *self.fifo_write.lock().unwrap_or_else(PoisonError::into_inner) = [0; QWORD_SIZE];

        if !was_paused {
            self.resume_processing();
        }
    }

    /// The channel must be paused.
    pub fn save_state(&self, archive: &mut StateArchive) {
        assert!(self.is_paused(), "VIF1 state saved while processing");
        self.shared
            .core()
            .interpreter
            .save_state(archive, self.number);
    }

    /// The channel must be paused. Ring contents and deferred XGKICKs aren't
    /// part of a save state, both come back empty.
    pub fn load_state(&self, archive: &StateArchive) -> savestate::Result<()> {
        assert!(self.is_paused(), "VIF1 state loaded while processing");

        {
            let mut core = self.shared.core();
            core.interpreter.load_state(archive, self.number)?;
            core.fifo.reset();
        }
        self.shared.ring.clear();
        self.shared.xgkicks.clear();
        *self.fifo_write.lock().unwrap_or_else(PoisonError::into_inner) = [0; QWORD_SIZE];
        Ok(())
    }

    #[must_use]
    pub fn register(&self, address: u32) -> u32 {
        let core = self.shared.core();
        let interpreter = &core.interpreter;
        match address {
            VIF1_STAT => {
                let mut stat = u32::from(interpreter.stat);
                if self.shared.ring.is_processing() {
                    stat |= STAT_FQC_BUSY;
                }
                stat
            }
            // Write only.
            VIF1_FBRST => 0,
            VIF1_ERR => interpreter.err,
            VIF1_MARK => interpreter.mark,
            VIF1_CYCLE => {
                u32::from(interpreter.cycle.cl) | (u32::from(interpreter.cycle.wl) << 8)
            }
            VIF1_MODE => interpreter.mode,
            VIF1_NUM => interpreter.num,
            VIF1_MASK => interpreter.mask,
            VIF1_CODE => interpreter.code.into(),
            VIF1_ITOPS => interpreter.itops,
            VIF1_BASE => interpreter.base,
            VIF1_OFST => interpreter.ofst,
            VIF1_TOPS => interpreter.tops,
            VIF1_ITOP => interpreter.itop,
            VIF1_TOP => interpreter.top,
            VIF1_R0..=VIF1_R3 if address & 0xF == 0 => {
                interpreter.row[((address - VIF1_R0) / 0x10) as usize]
            }
            VIF1_C0..=VIF1_C3 if address & 0xF == 0 => {
                interpreter.col[((address - VIF1_C0) / 0x10) as usize]
            }
            _ => panic!("read of unknown VIF1 register {address:#010x}"),
        }
    }

    pub fn set_register(&self, address: u32, value: u32) {
        match address {
            VIF1_FBRST => self.write_fbrst(value),
            VIF1_MARK => {
                let mut core = self.shared.core();
                core.interpreter.mark = value;
                core.interpreter.stat.set_mrk(false);
            }
            VIF1_ERR => self.shared.core().interpreter.err = value,
            _ if (VIF1_FIFO..VIF1_FIFO + QWORD_SIZE as u32).contains(&address) => {
                self.write_fifo(address, value);
            }
            _ => panic!("write of {value:#010x} to unknown VIF1 register {address:#010x}"),
        }
    }

    fn write_fbrst(&self, value: u32) {
        if value & FBRST_RST != 0 {
            self.pause_processing();
            debug_assert!(
                !matches!(
                    self.shared.gif.active_path(),
                    Some(GifPath::Path1 | GifPath::Path2)
                ),
                "VIF1 reset with a VU1 or VIF1 packet in flight"
            );
            {
                let mut core = self.shared.core();
                core.interpreter.reset_command();
                core.fifo.reset();
            }
            self.shared.ring.clear();
            tracing::debug!("VIF1 reset through FBRST");
            self.resume_processing();
        }
        if value & (FBRST_FBK | FBRST_STP) != 0 {
            unimplemented!("VIF1 FBRST force break / stop ({value:#x})");
        }
        if value & FBRST_STC != 0 {
            self.pause_processing();
            self.shared.core().interpreter.stat.clear_stall_bits();
            self.resume_processing();
        }
    }
}

impl Drop for Vif1 {
    fn drop(&mut self) {
        self.shared.ring.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("VIF1 consumer thread panicked");
            }
        }
    }
}
