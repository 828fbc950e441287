//! PATH1 transfers started by the VU1 `XGKICK` instruction.
//!
//! XGKICK must never block the VU. When PATH1 can't be acquired the whole
//! VU1 data memory is copied aside, since the VU is free to overwrite it
//! right after the kick, and the VIF1 consumer retries before it decodes
//! anything else.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::gif::{GifArbiter, GifPath, PacketMetadata};
use crate::vpu::VUMEM1SIZE;

pub const MAX_PENDING_XGKICKS: usize = 4;

pub struct PendingXgKick {
    memory: Box<[u8]>,
    address: usize,
    metadata: PacketMetadata,
}

impl PendingXgKick {
    #[must_use]
    pub fn new(vu_memory: &[u8], address: usize, metadata: PacketMetadata) -> Self {
        assert_eq!(vu_memory.len(), VUMEM1SIZE);
        Self {
            memory: vu_memory.into(),
            address,
            metadata,
        }
    }
}

/// Sends the packet at `address` of VU1 memory through PATH1. PATH1 must
/// already be held.
///
/// VU1 memory wraps: a packet that runs into the end continues at address 0,
/// but only once.
pub fn process_xgkick_packet(
    gif: &dyn GifArbiter,
    vu_memory: &[u8],
    address: usize,
    metadata: &PacketMetadata,
) {
    let mut address =
        address + gif.process_single_packet(vu_memory, address, VUMEM1SIZE, metadata);
    if address == VUMEM1SIZE && gif.active_path() == Some(GifPath::Path1) {
        address = gif.process_single_packet(vu_memory, 0, VUMEM1SIZE, metadata);
        tracing::trace!("XGKICK wrapped, {address:#x} bytes from the start");
    }
    debug_assert_eq!(gif.active_path(), None, "XGKICK packet left PATH1 open");
}

/// Deferred XGKICKs. Drained newest first.
#[derive(Default)]
pub struct XgKickQueue {
    entries: Mutex<Vec<PendingXgKick>>,
}

impl XgKickQueue {
    fn entries(&self) -> MutexGuard<'_, Vec<PendingXgKick>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Sends the packet right away when PATH1 can be acquired, defers a copy
    /// of `vu_memory` otherwise. Never blocks on the GIF.
    pub fn kick(
        &self,
        gif: &dyn GifArbiter,
        vu_memory: &[u8],
        address: usize,
        metadata: PacketMetadata,
    ) {
        // Held across the attempt so a flush can't interleave on PATH1.
        let mut entries = self.entries();
        if gif.try_acquire_path(GifPath::Path1) {
            process_xgkick_packet(gif, vu_memory, address, &metadata);
        } else {
            Self::defer(&mut entries, PendingXgKick::new(vu_memory, address, metadata));
        }
    }

    pub fn push(&self, kick: PendingXgKick) {
        Self::defer(&mut self.entries(), kick);
    }

    fn defer(entries: &mut Vec<PendingXgKick>, kick: PendingXgKick) {
        assert!(
            entries.len() < MAX_PENDING_XGKICKS,
            "more than {MAX_PENDING_XGKICKS} XGKICKs waiting for PATH1"
        );
        tracing::debug!(
            "PATH1 busy, XGKICK at {:#06x} deferred ({} pending)",
            kick.address,
            entries.len() + 1
        );
        entries.push(kick);
    }

    /// Sends deferred packets while PATH1 can be acquired. Returns how many
    /// are still waiting.
    pub fn flush(&self, gif: &dyn GifArbiter) -> usize {
        let mut entries = self.entries();
        while !entries.is_empty() && gif.try_acquire_path(GifPath::Path1) {
            if let Some(kick) = entries.pop() {
                process_xgkick_packet(gif, &kick.memory, kick.address, &kick.metadata);
            }
        }
        entries.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}
