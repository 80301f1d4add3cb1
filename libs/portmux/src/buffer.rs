//! Replayable read buffer.
//!
//! Bytes captured while a connection is being sniffed are kept in an
//! append-only store. Readers consume them through a cursor that can be
//! rewound to the start without discarding anything, so several matchers
//! can inspect the same prefix before the eventual owner reads it once.

use std::io::{self, Read, Write};

/// Append-only byte store with a rewindable read cursor.
///
/// `read` follows the `std::io::Read` contract: a call that copies the
/// last stored bytes returns their count, and the caller can tell that the
/// store is exhausted from [`ReplayBuffer::remaining`] without issuing a
/// further read that might be mistaken for "wait for more data".
#[derive(Debug)]
pub struct ReplayBuffer {
    data: Vec<u8>,
    /// First replayable byte; everything before it was consumed by a
    /// preprocessor (the proxy header) and is never replayed again.
    start: usize,
    read_pos: usize,
    recording: bool,
}

impl ReplayBuffer {
    /// Create an empty buffer in recording mode.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            start: 0,
            read_pos: 0,
            recording: true,
        }
    }

    /// Whether bytes pulled from the underlying source are captured.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Number of replayable bytes held (the write cursor).
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes between the read cursor and the write cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// The stored bytes not yet delivered to the current reader.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    /// All replayable bytes, independent of the read cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Rewind the read cursor. The store is left untouched.
    pub fn reset_read(&mut self) {
        self.read_pos = self.start;
    }

    /// Mark `n` stored bytes as delivered without copying them out.
    pub(crate) fn advance(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n).min(self.data.len());
    }

    /// Drop the first `n` replayable bytes from every future replay.
    pub(crate) fn consume_front(&mut self, n: usize) {
        self.start = (self.start + n).min(self.data.len());
        self.read_pos = self.read_pos.max(self.start);
    }

    /// Stop capturing and rewind, so the owner drains the store once.
    pub(crate) fn finish_sniffing(&mut self) {
        self.recording = false;
        self.reset_read();
    }

    /// Release the storage once a non-recording buffer has been drained.
    pub(crate) fn release_if_drained(&mut self) {
        if !self.recording && self.remaining() == 0 && !self.data.is_empty() {
            self.data = Vec::new();
            self.start = 0;
            self.read_pos = 0;
        }
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for ReplayBuffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let unread = self.unread();
        let n = unread.len().min(out.len());
        out[..n].copy_from_slice(&unread[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl Write for ReplayBuffer {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
