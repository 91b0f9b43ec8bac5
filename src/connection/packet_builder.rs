use tracing::trace;

use crate::crypto::{CryptoBackend, CryptoError, Keys, Level};
use crate::packet::{Header, PartialEncode};
use crate::HP_SAMPLE_SIZE;

/// Accumulates frames into one packet of a datagram
///
/// The header is written at construction; frames are appended directly to
/// the buffer within `left()`; `finish` pads, seals, and protects.
pub(super) struct PacketBuilder {
    /// Offset of the datagram this packet belongs to
    datagram_start: usize,
    pub(super) partial_encode: PartialEncode,
    exact_number: u64,
    /// Smallest buffer length `finish` will produce, padding included but
    /// not the AEAD tag
    min_size: usize,
    /// Largest buffer length frames may grow to, leaving room for the tag
    max_size: usize,
    tag_len: usize,
}

impl PacketBuilder {
    /// Write `header` into `buf` and set up the packet's size envelope
    ///
    /// `datagram_budget` is the total datagram size still available,
    /// measured from `datagram_start`.
    pub(super) fn new(
        buf: &mut Vec<u8>,
        header: &Header,
        exact_number: u64,
        tag_len: usize,
        datagram_start: usize,
        datagram_budget: usize,
    ) -> Self {
        let partial_encode = header.encode(buf);
        let payload_start = partial_encode.payload_start();
        // The header protection sample begins four bytes past the packet
        // number; every packet must be long enough to contain it
        let min_size =
            payload_start + (4 + HP_SAMPLE_SIZE).saturating_sub(partial_encode.pn_len() + tag_len);
        let max_size = datagram_start + datagram_budget - tag_len;
        debug_assert!(payload_start <= max_size);
        Self {
            datagram_start,
            partial_encode,
            exact_number,
            min_size,
            max_size,
            tag_len,
        }
    }

    /// Remaining space for frame data
    pub(super) fn left(&self, buf: &[u8]) -> usize {
        self.max_size.saturating_sub(buf.len())
    }

    /// Absolute buffer offset frames must not grow past
    pub(super) fn frame_space_limit(&self) -> usize {
        self.max_size
    }

    /// Whether any frame has been written yet
    pub(super) fn is_empty(&self, buf: &[u8]) -> bool {
        buf.len() == self.partial_encode.payload_start()
    }

    /// Guarantee the datagram is at least `min_datagram` bytes once this
    /// packet is finished
    pub(super) fn pad_to(&mut self, min_datagram: usize) {
        let padded = (self.datagram_start + min_datagram).saturating_sub(self.tag_len);
        self.min_size = self.min_size.max(padded).min(self.max_size);
    }

    /// Pad, seal, and protect the packet
    ///
    /// Returns the total bytes the finished packet occupies in `buf`.
    pub(super) fn finish(
        self,
        buf: &mut Vec<u8>,
        backend: &dyn CryptoBackend,
        level: Level,
        keys: &Keys,
    ) -> Result<usize, CryptoError> {
        let start = self.partial_encode.start();
        if buf.len() < self.min_size {
            // Zero bytes are PADDING frames
            trace!("PADDING * {}", self.min_size - buf.len());
            buf.resize(self.min_size, 0);
        }
        self.partial_encode.finish(
            buf,
            backend,
            level,
            self.exact_number,
            &keys.packet.local,
            &keys.header.local,
        )?;
        Ok(buf.len() - start)
    }
}
