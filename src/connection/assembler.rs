use std::{
    cmp::Ordering,
    collections::{binary_heap::PeekMut, BinaryHeap},
};

use bytes::{Buf, Bytes};

/// Helper to assemble unordered frames into an ordered byte stream
///
/// Both stream data and per-level CRYPTO data are reassembled with this
/// type. Delivery is strictly in-order: [`Assembler::read`] only yields
/// the contiguous prefix that has not yet been consumed, so callers can
/// push each chunk straight into a callback.
#[derive(Debug, Default)]
pub(super) struct Assembler {
    data: BinaryHeap<Buffer>,
    /// Number of buffered bytes, including duplicates
    buffered: usize,
    /// Length of the contiguous prefix consumed by the application
    bytes_read: u64,
    /// Highest offset seen, exclusive
    end: u64,
}

impl Assembler {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn insert(&mut self, mut offset: u64, mut bytes: Bytes) {
        self.end = self.end.max(offset + bytes.len() as u64);
        if offset < self.bytes_read {
            if (offset + bytes.len() as u64) <= self.bytes_read {
                // Wholly duplicate
                return;
            }
            let diff = self.bytes_read - offset;
            offset += diff;
            bytes.advance(diff as usize);
        }
        if bytes.is_empty() {
            return;
        }
        self.buffered += bytes.len();
        self.data.push(Buffer { offset, bytes });
    }

    /// Pop the next contiguous chunk, if any
    pub(super) fn read(&mut self) -> Option<Chunk> {
        loop {
            let mut chunk = self.data.peek_mut()?;

            if chunk.offset > self.bytes_read {
                // Next chunk is after the current read index
                return None;
            }
            if (chunk.offset + chunk.bytes.len() as u64) <= self.bytes_read {
                // Wholly consumed already
                self.buffered -= chunk.bytes.len();
                PeekMut::pop(chunk);
                continue;
            }

            // Discard the duplicated prefix
            let start = (self.bytes_read - chunk.offset) as usize;
            if start > 0 {
                chunk.bytes.advance(start);
                chunk.offset += start as u64;
                self.buffered -= start;
            }

            self.bytes_read += chunk.bytes.len() as u64;
            self.buffered -= chunk.bytes.len();
            let chunk = PeekMut::pop(chunk);
            return Some(Chunk {
                offset: chunk.offset,
                bytes: chunk.bytes,
            });
        }
    }

    /// Length of the contiguous prefix consumed so far
    pub(super) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Number of bytes currently buffered out of order
    pub(super) fn buffered(&self) -> usize {
        self.buffered
    }

    /// Highest offset seen, exclusive
    pub(super) fn end(&self) -> u64 {
        self.end
    }

    /// Discard all buffered data
    pub(super) fn clear(&mut self) {
        self.data.clear();
        self.buffered = 0;
    }
}

/// A chunk of data from the receive stream
#[derive(Debug, PartialEq, Eq)]
pub(super) struct Chunk {
    /// The offset in the stream
    pub(super) offset: u64,
    /// The contents of the chunk
    pub(super) bytes: Bytes,
}

#[derive(Debug, Eq)]
struct Buffer {
    offset: u64,
    bytes: Bytes,
}

impl Ord for Buffer {
    // Invert ordering based on offset (max-heap, min offset first),
    // prioritize longer chunks at the same offset.
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset
            .cmp(&other.offset)
            .reverse()
            .then(self.bytes.len().cmp(&other.bytes.len()))
    }
}

impl PartialOrd for Buffer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        (self.offset, self.bytes.len()) == (other.offset, other.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn next(x: &mut Assembler) -> Option<Bytes> {
        x.read().map(|chunk| chunk.bytes)
    }

    #[test]
    fn assemble_ordered() {
        let mut x = Assembler::new();
        assert_matches!(next(&mut x), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123");
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"456");
        x.insert(6, Bytes::from_static(b"789"));
        x.insert(9, Bytes::from_static(b"10"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"789");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"10");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_unordered() {
        let mut x = Assembler::new();
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(next(&mut x), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"456");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_duplicate() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_contained() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"12345"));
        x.insert(1, Bytes::from_static(b"234"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"12345");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_overlapping() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(1, Bytes::from_static(b"234"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"4");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_old() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"1234"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"1234");
        x.insert(0, Bytes::from_static(b"1234"));
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn buffered_accounting() {
        let mut x = Assembler::new();
        x.insert(3, Bytes::from_static(b"def"));
        assert_eq!(x.buffered(), 3);
        x.insert(0, Bytes::from_static(b"abc"));
        assert_eq!(x.buffered(), 6);
        assert_matches!(next(&mut x), Some(_));
        assert_matches!(next(&mut x), Some(_));
        assert_eq!(x.buffered(), 0);
        assert_eq!(x.bytes_read(), 6);
        assert_eq!(x.end(), 6);
    }
}
