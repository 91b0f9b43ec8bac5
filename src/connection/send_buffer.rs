use std::{collections::VecDeque, ops::Range};

use bytes::{Buf, Bytes};

use crate::range_set::RangeSet;
use crate::VarInt;

/// Buffer of outgoing retransmittable stream data
///
/// Data segments are owned until acknowledged; ranges deemed lost are
/// scheduled for retransmission ahead of fresh data.
#[derive(Default, Debug)]
pub(super) struct SendBuffer {
    /// Data queued by the application but not yet acknowledged. May or may
    /// not have been sent.
    segments: VecDeque<Bytes>,
    /// Total size of `segments`
    segments_len: usize,
    /// The first offset that hasn't been written by the application
    offset: u64,
    /// The first offset that hasn't been sent
    ///
    /// Always lies in `(offset - segments_len)..offset`
    unsent: u64,
    /// Acknowledged ranges which couldn't be discarded yet as they don't
    /// include the earliest offset still buffered
    acks: RangeSet,
    /// Previously transmitted ranges deemed lost
    retransmits: RangeSet,
}

impl SendBuffer {
    /// Construct an empty buffer at the initial offset
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Append application data to the end of the stream
    pub(super) fn write(&mut self, data: Bytes) {
        self.segments_len += data.len();
        self.offset += data.len() as u64;
        self.segments.push_back(data);
    }

    /// Discard a range of acknowledged stream data
    pub(super) fn ack(&mut self, mut range: Range<u64>) {
        // Clamp the range to data which is still tracked
        let base_offset = self.offset - self.segments_len as u64;
        range.start = base_offset.max(range.start);
        range.end = base_offset.max(range.end);

        self.acks.insert(range);

        // Drop the contiguous acknowledged prefix
        while self.acks.min() == Some(self.offset - self.segments_len as u64) {
            let prefix = self.acks.pop_min().unwrap();
            let mut to_advance = (prefix.end - prefix.start) as usize;

            self.segments_len -= to_advance;
            while to_advance > 0 {
                let front = self.segments.front_mut().expect("missing buffered data");
                if front.len() <= to_advance {
                    to_advance -= front.len();
                    self.segments.pop_front();
                    if self.segments.len() * 4 < self.segments.capacity() {
                        self.segments.shrink_to_fit();
                    }
                } else {
                    front.advance(to_advance);
                    to_advance = 0;
                }
            }
        }
    }

    /// Compute the next range to transmit on this stream and update state
    /// to account for that transmission
    ///
    /// `max_len` here includes the space which is available to transmit the
    /// offset and length of the data to send. The caller has to guarantee
    /// that there is at least enough space for maximum-sized metadata
    /// (8 byte offset + 8 byte length). Fresh data is never sent past
    /// `flow_limit`; retransmissions were within limits when first sent.
    ///
    /// Returns the range to send, and whether the frame's length must be
    /// encoded explicitly (`true`) or may run to the end of the packet.
    pub(super) fn poll_transmit(&mut self, mut max_len: usize, flow_limit: u64) -> (Range<u64>, bool) {
        debug_assert!(max_len >= 8 + 8);
        let mut encode_length = false;

        if let Some(range) = self.retransmits.pop_min() {
            // Retransmit lost data before anything fresh

            // Offset 0 requires no space
            if range.start != 0 {
                max_len -= VarInt::from_u64(range.start).unwrap().size();
            }
            if range.end - range.start < max_len as u64 {
                encode_length = true;
                max_len -= 8;
            }

            let end = range.end.min((max_len as u64).saturating_add(range.start));
            if end != range.end {
                self.retransmits.insert(end..range.end);
            }
            return (range.start..end, encode_length);
        }

        // Transmit new data

        // Offset 0 requires no space
        if self.unsent != 0 {
            max_len -= VarInt::from_u64(self.unsent).unwrap().size();
        }
        if self.offset - self.unsent < max_len as u64 {
            encode_length = true;
            max_len -= 8;
        }

        let end = self
            .offset
            .min(flow_limit)
            .max(self.unsent)
            .min((max_len as u64).saturating_add(self.unsent));
        let result = self.unsent..end;
        self.unsent = end;
        (result, encode_length)
    }

    /// First offset never transmitted
    pub(super) fn unsent_offset(&self) -> u64 {
        self.unsent
    }

    /// Whether lost data is waiting to be sent again
    pub(super) fn has_retransmit(&self) -> bool {
        !self.retransmits.is_empty()
    }

    /// Returns data associated with a range
    ///
    /// May return a subset of the requested range when the underlying
    /// segmentation doesn't line up; call again with an advanced start
    /// offset to fetch the rest.
    pub(super) fn get(&self, offsets: Range<u64>) -> &[u8] {
        let base_offset = self.offset - self.segments_len as u64;

        let mut segment_offset = base_offset;
        for segment in self.segments.iter() {
            if offsets.start >= segment_offset
                && offsets.start < segment_offset + segment.len() as u64
            {
                let start = (offsets.start - segment_offset) as usize;
                let end = (offsets.end - segment_offset) as usize;
                return &segment[start..end.min(segment.len())];
            }
            segment_offset += segment.len() as u64;
        }

        &[]
    }

    /// Queue a range of sent but unacknowledged data for retransmission
    pub(super) fn retransmit(&mut self, range: Range<u64>) {
        debug_assert!(range.end <= self.unsent, "unsent data can't be lost");
        self.retransmits.insert(range);
    }

    /// First stream offset unwritten by the application
    pub(super) fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether all sent data has been acknowledged
    pub(super) fn is_fully_acked(&self) -> bool {
        self.segments_len == 0
    }

    /// Whether there's data to send
    ///
    /// There may be sent unacknowledged data even when this is false.
    pub(super) fn has_unsent_data(&self) -> bool {
        self.unsent != self.offset || !self.retransmits.is_empty()
    }

    /// Amount of data that hasn't been acknowledged
    pub(super) fn unacked(&self) -> u64 {
        self.segments_len as u64 - self.acks.iter().map(|x| x.end - x.start).sum::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate_unacked(buf: &SendBuffer) -> Vec<u8> {
        let mut result = Vec::new();
        for segment in buf.segments.iter() {
            result.extend_from_slice(&segment[..]);
        }
        result
    }

    #[test]
    fn fragment_with_length() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world!";
        buf.write(MSG.into());
        // 0 byte offset => 19 bytes left => 13 byte data isn't enough;
        // with 8 bytes reserved for length, 11 payload bytes fit
        assert_eq!(buf.poll_transmit(19, u64::MAX), (0..11, true));
        assert_eq!(
            buf.poll_transmit(MSG.len() + 16 - 11, u64::MAX),
            (11..MSG.len() as u64, true)
        );
        assert_eq!(
            buf.poll_transmit(58, u64::MAX),
            (MSG.len() as u64..MSG.len() as u64, true)
        );
    }

    #[test]
    fn fragment_without_length() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world with some extra data!";
        buf.write(MSG.into());
        // 0 byte offset => 19 bytes left => filled by the 34 byte payload
        assert_eq!(buf.poll_transmit(19, u64::MAX), (0..19, false));
        assert_eq!(
            buf.poll_transmit(MSG.len() - 19 + 1, u64::MAX),
            (19..MSG.len() as u64, false)
        );
        assert_eq!(
            buf.poll_transmit(58, u64::MAX),
            (MSG.len() as u64..MSG.len() as u64, true)
        );
    }

    #[test]
    fn multiple_segments() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world!";
        const MSG_LEN: u64 = MSG.len() as u64;

        buf.write(b"He"[..].into());
        buf.write(b"llo,"[..].into());
        buf.write(b" w"[..].into());
        buf.write(b"o"[..].into());
        buf.write(b"rld!"[..].into());

        assert_eq!(aggregate_unacked(&buf), MSG);

        assert_eq!(buf.poll_transmit(16, u64::MAX), (0..8, true));
        assert_eq!(buf.get(0..5), b"He");
        assert_eq!(buf.get(2..8), b"llo,");
        assert_eq!(buf.get(6..8), b" w");

        assert_eq!(buf.poll_transmit(16, u64::MAX), (8..MSG_LEN, true));
        assert_eq!(buf.get(8..MSG_LEN), b"o");
        assert_eq!(buf.get(9..MSG_LEN), b"rld!");

        assert_eq!(buf.poll_transmit(42, u64::MAX), (MSG_LEN..MSG_LEN, true));

        // Now drain the segments
        buf.ack(0..1);
        assert_eq!(aggregate_unacked(&buf), &MSG[1..]);
        buf.ack(0..3);
        assert_eq!(aggregate_unacked(&buf), &MSG[3..]);
        buf.ack(3..5);
        assert_eq!(aggregate_unacked(&buf), &MSG[5..]);
        buf.ack(7..9);
        assert_eq!(aggregate_unacked(&buf), &MSG[5..]);
        buf.ack(4..7);
        assert_eq!(aggregate_unacked(&buf), &MSG[9..]);
        buf.ack(0..MSG_LEN);
        assert_eq!(aggregate_unacked(&buf), &[] as &[u8]);
    }

    #[test]
    fn retransmit() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world with extra data!";
        buf.write(MSG.into());
        // Transmit two frames
        assert_eq!(buf.poll_transmit(16, u64::MAX), (0..16, false));
        assert_eq!(buf.poll_transmit(16, u64::MAX), (16..23, true));
        // Lose the first, but not the second
        buf.retransmit(0..16);
        // Only the lost frame is retransmitted, then fresh data continues
        assert_eq!(buf.poll_transmit(16, u64::MAX), (0..16, false));
        assert_eq!(buf.poll_transmit(16, u64::MAX), (23..MSG.len() as u64, true));
        // Lose the second frame
        buf.retransmit(16..23);
        assert_eq!(buf.poll_transmit(16, u64::MAX), (16..23, true));
    }

    #[test]
    fn ack() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world!";
        buf.write(MSG.into());
        assert_eq!(buf.poll_transmit(16, u64::MAX), (0..8, true));
        buf.ack(0..8);
        assert_eq!(aggregate_unacked(&buf), &MSG[8..]);
        assert!(!buf.is_fully_acked());
        assert_eq!(buf.unacked(), (MSG.len() - 8) as u64);
    }

    #[test]
    fn reordered_ack() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world with extra data!";
        buf.write(MSG.into());
        assert_eq!(buf.poll_transmit(16, u64::MAX), (0..16, false));
        assert_eq!(buf.poll_transmit(16, u64::MAX), (16..23, true));
        buf.ack(16..23);
        assert_eq!(aggregate_unacked(&buf), MSG);
        buf.ack(0..16);
        assert_eq!(aggregate_unacked(&buf), &MSG[23..]);
        assert!(buf.acks.is_empty());
    }
}
