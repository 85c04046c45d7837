//! Stream framing: raw bytes -> delimited protocol units
//!
//! Devices write `#...!` units back to back, sometimes with `\r\n` between
//! them, and partial units arrive across socket reads. `UnitReader` owns a
//! ring buffer with O(1) advance (no drain) and yields complete unit bodies
//! as they become available. Bytes outside `#...!` are skipped; a start
//! marker that never terminates within [`MAX_UNIT_SIZE`](super::MAX_UNIT_SIZE)
//! is dropped and the reader resyncs on the next marker.

use super::{MAX_UNIT_SIZE, UNIT_END, UNIT_START};
use crate::error::{Error, Result};
use std::io::Read;

const BUFFER_CAPACITY: usize = 16384;

/// Fixed-capacity ring buffer with O(1) advance
struct RingBuffer {
    data: Box<[u8; BUFFER_CAPACITY]>,
    head: usize, // Write position (next empty slot)
    tail: usize, // Read position (first valid byte)
    len: usize,  // Number of bytes available
}

impl RingBuffer {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; BUFFER_CAPACITY]),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Append bytes; bytes that would overflow are dropped
    fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.len < BUFFER_CAPACITY {
                self.data[self.head] = b;
                self.head = (self.head + 1) % BUFFER_CAPACITY;
                self.len += 1;
            }
        }
    }

    /// Consume n bytes from the front without shifting
    fn advance(&mut self, n: usize) {
        let n = n.min(self.len);
        self.tail = (self.tail + n) % BUFFER_CAPACITY;
        self.len -= n;
    }

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Option<u8> {
        if index < self.len {
            Some(self.data[(self.tail + index) % BUFFER_CAPACITY])
        } else {
            None
        }
    }

    /// Find a byte at or after `from`, returning its logical offset
    fn find_byte(&self, from: usize, byte: u8) -> Option<usize> {
        (from..self.len).find(|&i| self.data[(self.tail + i) % BUFFER_CAPACITY] == byte)
    }

    /// Copy `len` bytes starting at logical offset `start` into `out`
    fn copy_range(&self, start: usize, len: usize, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(len);
        for i in start..start + len.min(self.len.saturating_sub(start)) {
            out.push(self.data[(self.tail + i) % BUFFER_CAPACITY]);
        }
    }
}

/// Outcome of a single socket read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedResult {
    /// Bytes were appended to the buffer
    Bytes(usize),
    /// Read timed out or would block; try again later
    Idle,
    /// Peer closed the connection
    Eof,
}

/// One framed unit pulled from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitEvent {
    /// Complete unit body (text between `#` and `!`, exclusive)
    Unit(String),
    /// An unterminated start marker was dropped during resync
    Discarded { bytes: usize },
}

/// Incremental reader turning a byte stream into protocol units
pub struct UnitReader {
    buffer: RingBuffer,
    scratch: Vec<u8>,
}

impl UnitReader {
    pub fn new() -> Self {
        Self {
            buffer: RingBuffer::new(),
            scratch: Vec::with_capacity(MAX_UNIT_SIZE),
        }
    }

    /// Read once from `source` into the internal buffer
    pub fn feed_from<R: Read>(&mut self, source: &mut R) -> Result<FeedResult> {
        let mut temp = [0u8; 4096];
        match source.read(&mut temp) {
            Ok(0) => Ok(FeedResult::Eof),
            Ok(n) => {
                self.buffer.extend(&temp[..n]);
                Ok(FeedResult::Bytes(n))
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(FeedResult::Idle),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(FeedResult::Idle),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Append bytes directly (tests and in-memory feeds)
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes);
    }

    /// Pull the next complete unit, if any
    ///
    /// Call repeatedly after each feed until it returns `None`.
    pub fn next_unit(&mut self) -> Option<UnitEvent> {
        // Skip inter-unit noise (terminator trailers, line endings)
        let Some(start) = self.buffer.find_byte(0, UNIT_START) else {
            let noise = self.buffer.len();
            if noise > 0 {
                log::trace!("Skipping {} bytes of inter-unit noise", noise);
                self.buffer.advance(noise);
            }
            return None;
        };
        if start > 0 {
            log::trace!("Skipping {} bytes before unit start", start);
            self.buffer.advance(start);
        }

        match self.buffer.find_byte(1, UNIT_END) {
            Some(end) if end - 1 > MAX_UNIT_SIZE => {
                // Terminated, but far beyond any legal unit: reject rather
                // than hand a multi-kilobyte blob to the decoder. Dropping
                // the start marker resyncs the scan.
                self.buffer.advance(1);
                Some(UnitEvent::Discarded { bytes: end + 1 })
            }
            Some(end) => {
                self.buffer.copy_range(1, end - 1, &mut self.scratch);
                let body = String::from_utf8_lossy(&self.scratch).into_owned();
                self.buffer.advance(end + 1);
                Some(UnitEvent::Unit(body))
            }
            None if self.buffer.len() > MAX_UNIT_SIZE => {
                // Unterminated oversize unit: drop its start marker so the
                // scan resyncs on the next one.
                let scanned = self.buffer.len();
                self.buffer.advance(1);
                Some(UnitEvent::Discarded { bytes: scanned })
            }
            None => None,
        }
    }
}

impl Default for UnitReader {
    fn default() -> Self {
        Self::new()
    }
}
