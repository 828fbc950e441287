//! Cursor over the run of ring cells handed to the interpreter.
//!
//! Scalar reads go through a one-quadword staging buffer: a read that needs
//! any byte of a quadword pulls the whole quadword out of the run. The run
//! is therefore always consumed in whole quadwords, and whatever is left of
//! a partly read quadword survives in [`FifoStream`] until the next run.

use crate::ring_buffer::QWORD_SIZE;

/// The part of the stream that outlives a run.
#[derive(Debug, Default, Clone)]
pub struct FifoStream {
    buffer: [u8; QWORD_SIZE],
    start: usize,
    end: usize,
}

impl FifoStream {
    /// Bytes pulled out of a run but not read yet.
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.end - self.start
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct CommandStream<'a> {
    fifo: &'a mut FifoStream,
    window: &'a [u8],
    next: usize,
}

impl<'a> CommandStream<'a> {
    pub fn new(fifo: &'a mut FifoStream, window: &'a [u8]) -> Self {
        Self {
            fifo,
            window,
            next: 0,
        }
    }

    /// Bytes readable before the run is exhausted.
    #[must_use]
    pub fn available(&self) -> usize {
        self.fifo.buffered() + self.remaining_window()
    }

    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.fifo.buffered()
    }

    /// Bytes of the run nobody has touched, what the ring keeps on return.
    #[must_use]
    pub const fn remaining_window(&self) -> usize {
        self.window.len() - self.next
    }

    fn fill(&mut self) {
        let size = QWORD_SIZE.min(self.remaining_window());
        assert!(size != 0, "read past the end of the DMA run");
        self.fifo.buffer[..size].copy_from_slice(&self.window[self.next..self.next + size]);
        self.fifo.start = 0;
        self.fifo.end = size;
        self.next += size;
    }

    pub fn read(&mut self, dst: &mut [u8]) {
        let mut written = 0;
        while written < dst.len() {
            if self.fifo.buffered() == 0 {
                self.fill();
            }
            let size = self.fifo.buffered().min(dst.len() - written);
            let start = self.fifo.start;
            dst[written..written + size].copy_from_slice(&self.fifo.buffer[start..start + size]);
            self.fifo.start += size;
            written += size;
        }
    }

    pub fn read_u32(&mut self) -> u32 {
        let mut word = [0_u8; 4];
        self.read(&mut word);
        u32::from_le_bytes(word)
    }

    /// Borrows the rest of the run without copying. Only valid with nothing
    /// staged, and only until the next `advance`.
    #[must_use]
    pub fn direct(&self) -> &'a [u8] {
        assert_eq!(self.fifo.buffered(), 0, "direct access with staged bytes");
        &self.window[self.next..]
    }

    pub fn advance(&mut self, size: usize) {
        assert_eq!(self.fifo.buffered(), 0, "advance with staged bytes");
        assert!(size <= self.remaining_window());
        self.next += size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Vec<u8> {
        (0..48).collect()
    }

    #[test]
    fn scalar_reads_take_whole_quadwords() {
        let data = run();
        let mut fifo = FifoStream::default();
        let mut stream = CommandStream::new(&mut fifo, &data);

        assert_eq!(stream.read_u32(), u32::from_le_bytes([0, 1, 2, 3]));
        assert_eq!(stream.buffered(), 12);
        assert_eq!(stream.remaining_window(), 32);
        assert_eq!(stream.available(), 44);
    }

    #[test]
    fn staged_bytes_survive_the_run() {
        let data = run();
        let mut fifo = FifoStream::default();
        {
            let mut stream = CommandStream::new(&mut fifo, &data[..16]);
            stream.read_u32();
        }
        assert_eq!(fifo.buffered(), 12);

        let mut stream = CommandStream::new(&mut fifo, &data[16..]);
        let mut bytes = [0_u8; 16];
        stream.read(&mut bytes);
        let expected: Vec<u8> = (4..20).collect();
        assert_eq!(bytes.to_vec(), expected);
    }

    #[test]
    fn direct_then_advance() {
        let data = run();
        let mut fifo = FifoStream::default();
        let mut stream = CommandStream::new(&mut fifo, &data);

        let packet = stream.direct();
        assert_eq!(packet.len(), 48);
        stream.advance(32);
        assert_eq!(stream.direct(), &data[32..]);
        assert_eq!(stream.available(), 16);
    }

    #[test]
    #[should_panic(expected = "read past the end of the DMA run")]
    fn reading_past_the_run_is_fatal() {
        let data = run();
        let mut fifo = FifoStream::default();
        let mut stream = CommandStream::new(&mut fifo, &data[..4]);
        let mut bytes = [0_u8; 8];
        stream.read(&mut bytes);
    }
}
