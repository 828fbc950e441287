//! # DMA ring buffer
//!
//! Quadwords pushed by the DMA controller wait here until the VIF1 consumer
//! thread gets to them.
//!
//! ```text
//!              read_pos              write_pos
//!                 │                      │
//!  ┌───┬───┬───┬──▼┬───┬───┬───┬───┬───┬─▼─┬───┬───┐
//!  │   │   │   │ q │ q │ q │ q │ q │ q │   │   │   │
//!  └───┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//!                 └──── contents_size ────┘
//! ```
//!
//! `contents_size` is the authoritative fill level (read and write positions
//! are equal both when empty and when full).
//!
//! The same lock also carries the pause handshake. A requester raises
//! `pause_rq` or `resume_rq` and sleeps until the consumer flips `paused`.
//! The consumer only looks at requests inside [`DmaRing::dequeue`], which it
//! calls between two runs, so a paused channel is never in the middle of a
//! command.
//!
//! Producers are serialized among themselves, a transfer is copied and
//! committed as a whole. `clear` bumps a generation counter, so a transfer
//! that was being copied while the ring got cleared is dropped at commit
//! instead of landing at a stale position.
//!
//! If the consumer dies, the ring is marked failed: anything that would wait
//! on the consumer (producers short of room, pause and resume requests)
//! panics instead of blocking forever.

use std::ops::Range;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Ring capacity in quadwords.
pub const DMA_BUFFER_SIZE: usize = 0x1000;

pub use crate::gif::QWORD_SIZE;

pub type Qword = [u8; QWORD_SIZE];

#[derive(Debug, Default)]
struct RingState {
    contents_size: usize,
    read_pos: usize,
    write_pos: usize,

    /// Mirrors `contents_size != 0`, reported through STAT.FQC.
    processing: bool,

    paused: bool,
    pause_rq: bool,
    resume_rq: bool,

    shutdown: bool,

    /// The consumer panicked, nothing will ever be dequeued again.
    failed: bool,

    /// Bumped by every `clear`.
    generation: u64,
}

/// Cells handed to a producer, valid until the next `clear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    position: usize,
    generation: u64,
}

const CONSUMER_DEAD: &str = "VIF1 consumer thread is dead";

pub struct DmaRing {
    capacity: usize,
    state: Mutex<RingState>,

    /// Consumer side: data arrived or a request is pending.
    has_data: Condvar,
    /// Producer side: room was made.
    consumed_data: Condvar,
    /// Requester side: `paused` changed.
    pause_ack: Condvar,

    cells: Mutex<Box<[Qword]>>,

    /// Held across reserve, copy and commit.
    producer: Mutex<()>,
}

impl Default for DmaRing {
    fn default() -> Self {
        Self::with_capacity(DMA_BUFFER_SIZE)
    }
}

impl DmaRing {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            state: Mutex::new(RingState::default()),
            has_data: Condvar::new(),
            consumed_data: Condvar::new(),
            pause_ack: Condvar::new(),
            cells: Mutex::new(vec![[0; QWORD_SIZE]; capacity].into_boxed_slice()),
            producer: Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the storage. The consumer holds this while it interprets a run,
    /// producers only for the duration of a copy.
    pub fn cells(&self) -> MutexGuard<'_, Box<[Qword]>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn producer(&self) -> MutexGuard<'_, ()> {
        self.producer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `count` cells are free and returns where they start.
    /// The caller must hold the producer lock.
    fn reserve(&self, count: usize) -> Reservation {
        assert!(
            count <= self.capacity,
            "transfer of {count} qwords can never fit a ring of {}",
            self.capacity
        );
        let state = self.state();
        let state = self
            .consumed_data
            .wait_while(state, |s| {
                self.capacity - s.contents_size < count && !s.failed
            })
            .unwrap_or_else(PoisonError::into_inner);
        assert!(!state.failed, "{CONSUMER_DEAD}");
        Reservation {
            position: state.write_pos,
            generation: state.generation,
        }
    }

    /// Publishes the reserved cells. Returns false when a `clear` came in
    /// since the reservation, the data is dropped then.
    fn commit(&self, reservation: Reservation, count: usize) -> bool {
        let mut state = self.state();
        if state.generation != reservation.generation {
            return false;
        }
        debug_assert_eq!(state.write_pos, reservation.position);
        state.write_pos = (state.write_pos + count) % self.capacity;
        state.contents_size += count;
        if state.contents_size != 0 {
            state.processing = true;
        }
        self.has_data.notify_one();
        true
    }

    /// Copies whole quadwords from `data` into the ring, blocking while there
    /// isn't enough room. Returns the number of quadwords written, 0 when the
    /// ring was cleared in the middle of the copy.
    pub fn enqueue(&self, data: &[u8]) -> usize {
        assert_eq!(data.len() % QWORD_SIZE, 0, "DMA data must be whole qwords");
        let count = data.len() / QWORD_SIZE;
        if count == 0 {
            return 0;
        }

        let _producer = self.producer();
        let reservation = self.reserve(count);
        {
            let write_pos = reservation.position;
            let mut cells = self.cells();
            let first = count.min(self.capacity - write_pos);
            let (head, tail) = data.split_at(first * QWORD_SIZE);
            cells[write_pos..write_pos + first]
                .as_flattened_mut()
                .copy_from_slice(head);
            if !tail.is_empty() {
                cells[..count - first]
                    .as_flattened_mut()
                    .copy_from_slice(tail);
            }
        }
        if self.commit(reservation, count) { count } else { 0 }
    }

    /// Writes a single quadword carrying its own DMA tag. The tag half (low
    /// 64 bits) is cleared so the consumer sees two NOP commands there.
    pub fn enqueue_tagged(&self, qword: &Qword) -> usize {
        let mut qword = *qword;
        qword[..8].fill(0);

        let _producer = self.producer();
        let reservation = self.reserve(1);
        self.cells()[reservation.position] = qword;
        usize::from(self.commit(reservation, 1))
    }

    /// Consumer entry point, called at the top of every loop iteration.
    ///
    /// Releases the `consumed` quadwords of the previous run, services pause
    /// and resume requests, then waits for data. Returns the cell range of the
    /// next contiguous run, or `None` once the ring is shut down.
    pub fn dequeue(&self, consumed: usize) -> Option<Range<usize>> {
        let mut state = self.state();
        debug_assert!(consumed <= state.contents_size);
        state.read_pos = (state.read_pos + consumed) % self.capacity;
        state.contents_size -= consumed;
        if state.contents_size == 0 {
            state.processing = false;
        }
        self.consumed_data.notify_one();

        loop {
            if state.paused {
                state = self
                    .has_data
                    .wait_while(state, |s| !s.resume_rq && !s.shutdown)
                    .unwrap_or_else(PoisonError::into_inner);
                if state.shutdown {
                    return None;
                }
                state.paused = false;
                state.resume_rq = false;
                self.pause_ack.notify_all();
            } else {
                if state.pause_rq {
                    state.paused = true;
                    state.pause_rq = false;
                    self.pause_ack.notify_all();
                    continue;
                }
                if state.shutdown {
                    return None;
                }
                if state.contents_size > 0 {
                    break;
                }
                state = self
                    .has_data
                    .wait_while(state, |s| {
                        s.contents_size == 0 && !s.pause_rq && !s.shutdown
                    })
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        let len = (self.capacity - state.read_pos).min(state.contents_size);
        Some(state.read_pos..state.read_pos + len)
    }

    /// Blocks until the consumer has parked itself at its checkpoint.
    pub fn request_pause(&self) {
        let mut state = self.state();
        assert!(!state.failed, "{CONSUMER_DEAD}");
        assert!(
            !state.paused && !state.resume_rq && !state.pause_rq,
            "pause requested while paused or with a request in flight"
        );
        state.pause_rq = true;
        self.has_data.notify_one();
        let state = self
            .pause_ack
            .wait_while(state, |s| !s.paused && !s.failed)
            .unwrap_or_else(PoisonError::into_inner);
        assert!(!state.failed, "{CONSUMER_DEAD}");
        assert!(!state.pause_rq);
    }

    /// Blocks until the consumer has left its checkpoint.
    pub fn request_resume(&self) {
        let mut state = self.state();
        assert!(!state.failed, "{CONSUMER_DEAD}");
        assert!(
            state.paused && !state.resume_rq && !state.pause_rq,
            "resume requested while running or with a request in flight"
        );
        state.resume_rq = true;
        self.has_data.notify_one();
        let state = self
            .pause_ack
            .wait_while(state, |s| s.paused && !s.failed)
            .unwrap_or_else(PoisonError::into_inner);
        assert!(!state.failed, "{CONSUMER_DEAD}");
        assert!(!state.resume_rq);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.state().processing
    }

    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.state().failed
    }

    #[must_use]
    pub fn contents_size(&self) -> usize {
        self.state().contents_size
    }

    /// `(read_pos, write_pos)`
    #[must_use]
    pub fn positions(&self) -> (usize, usize) {
        let state = self.state();
        (state.read_pos, state.write_pos)
    }

    /// Drops everything queued. Only legal while the consumer is paused.
    pub fn clear(&self) {
        let mut state = self.state();
        assert!(state.paused, "ring cleared while the consumer is running");
        state.contents_size = 0;
        state.read_pos = 0;
        state.write_pos = 0;
        state.processing = false;
        state.generation += 1;
        self.consumed_data.notify_all();
    }

    /// Makes the consumer return `None` from its next (or current) dequeue.
    pub fn shutdown(&self) {
        self.state().shutdown = true;
        self.has_data.notify_all();
    }

    /// Called when the consumer died. Wakes every waiter so it can panic
    /// instead of blocking on a thread that is gone.
    pub fn fail(&self) {
        {
            let mut state = self.state();
            state.failed = true;
            state.shutdown = true;
            state.processing = false;
        }
        self.has_data.notify_all();
        self.consumed_data.notify_all();
        self.pause_ack.notify_all();
    }
}
