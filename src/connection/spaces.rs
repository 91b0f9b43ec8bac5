use std::{
    cmp,
    collections::{BTreeMap, BinaryHeap},
    mem,
    ops::{Index, IndexMut},
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashSet;

use super::assembler::Assembler;
use crate::crypto::Keys;
use crate::frame;
use crate::packet::SpaceId;
use crate::range_set::{ArrayRangeSet, RangeSet};
use crate::{StreamId, VarInt};

pub(super) struct PacketSpace {
    pub(super) crypto: Option<Keys>,
    pub(super) dedup: Dedup,
    /// Highest received packet number
    pub(super) rx_packet: u64,

    /// Retransmittable control data to send
    pub(super) pending: Retransmits,
    /// Packet numbers to acknowledge
    pub(super) pending_acks: PendingAcks,

    /// The packet number of the next packet that will be sent
    pub(super) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(super) largest_acked_packet: Option<u64>,
    /// Transmitted ack-eliciting packets that are neither acknowledged nor
    /// deemed lost
    pub(super) sent_packets: BTreeMap<u64, SentPacket>,

    /// Incoming cryptographic handshake stream
    pub(super) crypto_stream: Assembler,
    /// Outgoing handshake fragments, lowest offset first
    crypto_send: BinaryHeap<PendingCrypto>,
    /// Current offset of the outgoing cryptographic handshake stream
    pub(super) crypto_offset: u64,
    /// Handshake byte ranges the peer has acknowledged
    pub(super) crypto_acked: RangeSet,

    /// The time the most recently ack-eliciting packet was sent
    pub(super) time_of_last_ack_eliciting_packet: Option<Instant>,
    /// The time at which the earliest sent packet in this space will be
    /// considered lost based on exceeding the reordering window in time.
    /// Only set for packets numbered prior to a packet that has been
    /// acknowledged.
    pub(super) loss_time: Option<Instant>,
    /// Number of tail loss probes to send
    pub(super) loss_probes: u32,
    /// Number of congestion control "in flight" bytes in this space
    pub(super) in_flight: u64,
}

impl PacketSpace {
    pub(super) fn new() -> Self {
        Self {
            crypto: None,
            dedup: Dedup::new(),
            rx_packet: 0,

            pending: Retransmits::default(),
            pending_acks: PendingAcks::default(),

            next_packet_number: 0,
            largest_acked_packet: None,
            sent_packets: BTreeMap::new(),

            crypto_stream: Assembler::new(),
            crypto_send: BinaryHeap::new(),
            crypto_offset: 0,
            crypto_acked: RangeSet::new(),

            time_of_last_ack_eliciting_packet: None,
            loss_time: None,
            loss_probes: 0,
            in_flight: 0,
        }
    }

    pub(super) fn get_tx_number(&mut self) -> u64 {
        debug_assert!(self.next_packet_number < 1 << 62);
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    /// Append handshake bytes to the outgoing CRYPTO stream
    pub(super) fn queue_crypto(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let offset = self.crypto_offset;
        self.crypto_offset += data.len() as u64;
        self.crypto_send.push(PendingCrypto(frame::Crypto { offset, data }));
    }

    /// Put a lost fragment back; it keeps its original offset
    pub(super) fn requeue_crypto(&mut self, frame: frame::Crypto) {
        if frame.data.is_empty() {
            return;
        }
        self.crypto_send.push(PendingCrypto(frame));
    }

    /// Pop the lowest-offset unacknowledged fragment, at most `max_len`
    /// bytes of it
    ///
    /// Fragments that turn out to be fully acknowledged are discarded.
    /// Adjacent fragments are merged to fill the packet, and an oversized
    /// fragment is split with its tail requeued.
    pub(super) fn next_crypto_chunk(&mut self, max_len: usize) -> Option<frame::Crypto> {
        if max_len == 0 {
            return None;
        }
        loop {
            let PendingCrypto(mut frame) = self.crypto_send.pop()?;

            // Skip the acknowledged prefix, if any
            let mut unacked = frame.offset..frame.offset + frame.data.len() as u64;
            while let Some(range) = self
                .crypto_acked
                .iter()
                .find(|r| r.start <= unacked.start && r.end > unacked.start)
            {
                unacked.start = range.end;
            }
            if unacked.start >= unacked.end {
                continue;
            }
            frame.data.advance((unacked.start - frame.offset) as usize);
            frame.offset = unacked.start;

            if frame.data.len() > max_len {
                let rest = frame.data.split_off(max_len);
                self.crypto_send.push(PendingCrypto(frame::Crypto {
                    offset: frame.offset + max_len as u64,
                    data: rest,
                }));
                return Some(frame);
            }

            // The tail of this fragment may steal from the head of the
            // next to fill the packet
            while frame.data.len() < max_len {
                let next_contiguous = self
                    .crypto_send
                    .peek()
                    .is_some_and(|next| next.0.offset == frame.offset + frame.data.len() as u64);
                if !next_contiguous {
                    break;
                }
                let PendingCrypto(mut next) = self.crypto_send.pop().unwrap();
                let take = cmp::min(max_len - frame.data.len(), next.data.len());
                let mut merged = BytesMut::with_capacity(frame.data.len() + take);
                merged.put_slice(&frame.data);
                merged.put_slice(&next.data[..take]);
                if take < next.data.len() {
                    next.data.advance(take);
                    next.offset += take as u64;
                    self.crypto_send.push(PendingCrypto(next));
                }
                frame.data = merged.freeze();
            }
            return Some(frame);
        }
    }

    pub(super) fn has_pending_crypto(&self) -> bool {
        !self.crypto_send.is_empty()
    }

    /// Register a sent ack-eliciting packet
    pub(super) fn sent(&mut self, number: u64, packet: SentPacket) {
        self.in_flight += u64::from(packet.size);
        self.sent_packets.insert(number, packet);
    }

    /// Remove a tracked packet, keeping `in_flight` consistent
    pub(super) fn take(&mut self, number: u64) -> Option<SentPacket> {
        let packet = self.sent_packets.remove(&number)?;
        self.in_flight -= u64::from(packet.size);
        Some(packet)
    }

    /// Whether any tracked packet carried handshake data
    pub(super) fn crypto_in_flight(&self) -> bool {
        self.sent_packets.values().any(|x| x.is_crypto)
    }
}

impl Index<SpaceId> for [PacketSpace; 3] {
    type Output = PacketSpace;
    fn index(&self, space: SpaceId) -> &PacketSpace {
        &self.as_ref()[space as usize]
    }
}

impl IndexMut<SpaceId> for [PacketSpace; 3] {
    fn index_mut(&mut self, space: SpaceId) -> &mut PacketSpace {
        &mut self.as_mut()[space as usize]
    }
}

/// Outgoing CRYPTO fragment ordered for a min-heap
#[derive(Debug)]
struct PendingCrypto(frame::Crypto);

impl Ord for PendingCrypto {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.0.offset.cmp(&other.0.offset).reverse()
    }
}

impl PartialOrd for PendingCrypto {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PendingCrypto {
    fn eq(&self, other: &Self) -> bool {
        self.0.offset == other.0.offset
    }
}

impl Eq for PendingCrypto {}

/// Represents one or more packets subject to retransmission
#[derive(Debug, Clone)]
pub(super) struct SentPacket {
    /// The time the packet was sent
    pub(super) time_sent: Instant,
    /// The number of bytes sent in the packet, not including UDP or IP
    /// overhead, but including QUIC framing overhead
    pub(super) size: u16,
    /// Whether an acknowledgement is expected directly in response to this
    /// packet
    pub(super) ack_eliciting: bool,
    /// Whether the packet carried CRYPTO frames
    pub(super) is_crypto: bool,
    /// Whether the packet was sent as a loss probe, exempt from congestion
    /// control
    pub(super) is_probe: bool,
    /// Ranges of packet numbers this packet acknowledged
    pub(super) acks: ArrayRangeSet,
    /// Reliable control frames to reschedule if the packet is lost
    pub(super) retransmits: ThinRetransmits,
    /// Metadata for stream frames in the packet; the data itself is stored
    /// with the stream state
    pub(super) stream_frames: frame::StreamMetaVec,
    /// CRYPTO frames carried by the packet
    pub(super) crypto_frames: frame::CryptoVec,
}

/// Retransmittable control-frame queue
#[derive(Debug, Default, Clone)]
pub(super) struct Retransmits {
    pub(super) max_data: bool,
    pub(super) max_stream_id_bidi: bool,
    pub(super) max_stream_id_uni: bool,
    pub(super) reset_stream: Vec<(StreamId, VarInt)>,
    pub(super) stop_sending: Vec<frame::StopSending>,
    pub(super) max_stream_data: FxHashSet<StreamId>,
    pub(super) new_cids: Vec<frame::NewConnectionId>,
    pub(super) retire_cids: Vec<u64>,
    pub(super) handshake_done: bool,
    /// Hints sent at most once, never rescheduled
    pub(super) data_blocked: bool,
    pub(super) stream_data_blocked: Vec<(StreamId, u64)>,
    pub(super) streams_blocked: [Option<u64>; 2],
}

impl Retransmits {
    pub(super) fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_stream_id_bidi
            && !self.max_stream_id_uni
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
            && self.new_cids.is_empty()
            && self.retire_cids.is_empty()
            && !self.handshake_done
            && !self.data_blocked
            && self.stream_data_blocked.is_empty()
            && self.streams_blocked.iter().all(|x| x.is_none())
    }
}

impl std::ops::BitOrAssign for Retransmits {
    // Lost reliable control frames fold back into the pending queue
    fn bitor_assign(&mut self, rhs: Self) {
        self.max_data |= rhs.max_data;
        self.max_stream_id_bidi |= rhs.max_stream_id_bidi;
        self.max_stream_id_uni |= rhs.max_stream_id_uni;
        self.reset_stream.extend_from_slice(&rhs.reset_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.max_stream_data.extend(&rhs.max_stream_data);
        self.new_cids.extend(rhs.new_cids);
        self.retire_cids.extend(rhs.retire_cids);
        self.handshake_done |= rhs.handshake_done;
    }
}

impl std::ops::BitOrAssign<ThinRetransmits> for Retransmits {
    fn bitor_assign(&mut self, rhs: ThinRetransmits) {
        if let Some(retransmits) = rhs.retransmits {
            self.bitor_assign(*retransmits)
        }
    }
}

/// A variant of `Retransmits` which only allocates storage when required
#[derive(Debug, Default, Clone)]
pub(super) struct ThinRetransmits {
    retransmits: Option<Box<Retransmits>>,
}

impl ThinRetransmits {
    /// Returns `true` if no retransmits are necessary
    pub(super) fn is_empty(&self) -> bool {
        match &self.retransmits {
            Some(retransmits) => retransmits.is_empty(),
            None => true,
        }
    }

    /// Returns a reference to the retransmits stored in this box
    pub(super) fn get(&self) -> Option<&Retransmits> {
        self.retransmits.as_deref()
    }

    /// Returns a mutable reference to the stored retransmits
    ///
    /// A backing allocation is created on first use.
    pub(super) fn get_or_create(&mut self) -> &mut Retransmits {
        if self.retransmits.is_none() {
            self.retransmits = Some(Box::default());
        }
        self.retransmits.as_deref_mut().unwrap()
    }
}

/// RFC 4303-style sliding window packet number deduplicator.
///
/// A contiguous bitfield, where each bit corresponds to a packet number and
/// the rightmost bit is always set. A set bit represents a packet that has
/// been successfully authenticated. Bits left of the window are assumed to
/// be set.
///
/// ```text
/// ...xxxxxxxxx 1 0
///     ^        ^ ^
/// window highest next
/// ```
pub(super) struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet authenticated.
    next: u64,
}

/// Inner bitfield type.
///
/// Because QUIC never reuses packet numbers, this only needs to be large
/// enough to deal with packets that are reordered but still delivered in a
/// timely manner.
type Window = u128;

/// Number of packets tracked by `Dedup`.
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    /// Construct an empty window positioned at the start.
    pub(super) fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    /// Highest packet number authenticated.
    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Record a newly authenticated packet number.
    ///
    /// Returns whether the packet might be a duplicate.
    pub(super) fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of window
            self.window = (self.window << 1 | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                // < highest
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of window
            true
        }
    }
}

/// Bounds the number of ACK ranges remembered: one first block plus the
/// largest extra-block count an ACK frame will carry
const MAX_ACK_RANGES: usize = 33;

/// Tracker deciding when and what to acknowledge
///
/// Ranges stay in the tracker until the peer confirms receipt of an ACK
/// carrying them, but resending is suppressed while nothing new has
/// arrived.
#[derive(Debug, Default)]
pub(super) struct PendingAcks {
    ranges: ArrayRangeSet,
    /// Receipt time of the largest pending packet number
    latest_ts: Option<Instant>,
    /// Receipt time of the earliest ack-eliciting packet not yet covered by
    /// a sent ACK
    earliest_unacked: Option<Instant>,
    /// Ack-eliciting packets received since the last ACK was sent
    unacked_count: u64,
    /// Send an ACK at the next opportunity, without delay
    immediate: bool,
    /// Whether ackable packets were received since the last ACK was sent
    dirty: bool,
}

impl PendingAcks {
    /// Record receipt of an authenticated packet
    pub(super) fn packet_received(&mut self, number: u64, now: Instant, ack_eliciting: bool) {
        let expected = self.ranges.max().map(|x| x + 1);
        self.ranges.insert_one(number);
        while self.ranges.len() > MAX_ACK_RANGES {
            // Dropped ranges can no longer be acknowledged
            self.ranges.pop_min();
        }
        if expected.map_or(true, |x| number >= x) {
            self.latest_ts = Some(now);
        }

        if !ack_eliciting {
            return;
        }
        self.dirty = true;
        self.unacked_count += 1;
        if self.earliest_unacked.is_none() {
            self.earliest_unacked = Some(now);
        }
        // Out-of-order receipt or a full batch means the peer should not
        // have to wait out the ack delay
        if expected.is_some_and(|x| number != x) || self.unacked_count >= 2 {
            self.immediate = true;
        }
    }

    /// Whether an ACK frame should be sent now
    pub(super) fn ack_due(&self, now: Instant, max_ack_delay: Duration) -> bool {
        self.dirty
            && (self.immediate
                || self
                    .earliest_unacked
                    .is_some_and(|t| t + max_ack_delay <= now))
    }

    /// When `ack_due` will next become true, absent further receipts
    pub(super) fn next_ack_time(&self, max_ack_delay: Duration) -> Option<Instant> {
        if !self.dirty || self.immediate {
            return None;
        }
        self.earliest_unacked.map(|t| t + max_ack_delay)
    }

    /// Whether any ACK information is pending at all
    pub(super) fn can_send(&self) -> bool {
        self.dirty && !self.ranges.is_empty()
    }

    /// Time the largest pending packet has been held unacknowledged
    pub(super) fn delay(&self, now: Instant) -> Duration {
        self.latest_ts
            .map_or(Duration::ZERO, |ts| now.saturating_duration_since(ts))
    }

    /// Should be called whenever an ACK frame was serialized
    ///
    /// Suppresses further ACKs until new ackable packets arrive.
    pub(super) fn acks_sent(&mut self) {
        self.dirty = false;
        self.immediate = false;
        self.unacked_count = 0;
        self.earliest_unacked = None;
    }

    /// Removes ranges the peer confirmed receiving an ACK for
    pub(super) fn subtract(&mut self, acks: &ArrayRangeSet) {
        self.ranges.subtract(acks);
    }

    /// The set of currently pending ACK ranges
    pub(super) fn ranges(&self) -> &ArrayRangeSet {
        &self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_sanity() {
        let mut dedup = Dedup::new();
        assert!(!dedup.insert(0));
        assert_eq!(dedup.next, 1);
        assert_eq!(dedup.window, 0b1);
        assert!(dedup.insert(0));
        assert_eq!(dedup.next, 1);
        assert_eq!(dedup.window, 0b1);
        assert!(!dedup.insert(1));
        assert_eq!(dedup.next, 2);
        assert_eq!(dedup.window, 0b11);
        assert!(!dedup.insert(2));
        assert_eq!(dedup.next, 3);
        assert_eq!(dedup.window, 0b111);
        assert!(!dedup.insert(4));
        assert_eq!(dedup.next, 5);
        assert_eq!(dedup.window, 0b11110);
        assert!(!dedup.insert(7));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_0100);
        assert!(dedup.insert(4));
        assert!(!dedup.insert(3));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_1100);
        assert!(!dedup.insert(6));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_1101);
        assert!(!dedup.insert(5));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_1111);
    }

    #[test]
    fn dedup_happypath() {
        let mut dedup = Dedup::new();
        for i in 0..(2 * WINDOW_SIZE) {
            assert!(!dedup.insert(i));
            for j in 0..=i {
                assert!(dedup.insert(j));
            }
        }
    }

    #[test]
    fn dedup_jump() {
        let mut dedup = Dedup::new();
        dedup.insert(2 * WINDOW_SIZE);
        assert!(dedup.insert(WINDOW_SIZE));
        assert_eq!(dedup.next, 2 * WINDOW_SIZE + 1);
        assert_eq!(dedup.window, 0);
        assert!(!dedup.insert(WINDOW_SIZE + 1));
        assert_eq!(dedup.next, 2 * WINDOW_SIZE + 1);
        assert_eq!(dedup.window, 1 << (WINDOW_SIZE - 2));
    }

    #[test]
    fn ack_tracker_immediate_on_gap() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.packet_received(0, now, true);
        // A single in-order ack-eliciting packet waits out the delay
        assert!(!acks.ack_due(now, Duration::from_millis(25)));
        assert!(acks.ack_due(now + Duration::from_millis(25), Duration::from_millis(25)));
        // A second one triggers an immediate ACK
        acks.packet_received(1, now, true);
        assert!(acks.ack_due(now, Duration::from_millis(25)));
    }

    #[test]
    fn ack_tracker_immediate_on_reorder() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.packet_received(5, now, true);
        assert!(!acks.ack_due(now, Duration::from_millis(25)));
        acks.packet_received(7, now, true);
        assert!(acks.ack_due(now, Duration::from_millis(25)));
    }

    #[test]
    fn ack_tracker_suppressed_after_send() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.packet_received(0, now, true);
        acks.packet_received(1, now, true);
        assert!(acks.ack_due(now, Duration::from_millis(25)));
        acks.acks_sent();
        assert!(!acks.ack_due(now + Duration::from_secs(1), Duration::from_millis(25)));
        // Ranges are retained until the peer acknowledges our ACK
        assert!(!acks.ranges().is_empty());
        acks.packet_received(2, now, true);
        // New packet revives sending; ranges accumulate
        assert_eq!(acks.ranges().elts().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn ack_tracker_overflow_drops_lowest() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        // Insert isolated packet numbers to create many ranges
        for i in 0..40u64 {
            acks.packet_received(i * 2, now, true);
        }
        assert_eq!(acks.ranges().len(), MAX_ACK_RANGES);
        assert_eq!(acks.ranges().min(), Some((40 - MAX_ACK_RANGES as u64) * 2));
    }

    #[test]
    fn ack_tracker_non_eliciting_does_not_trigger() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.packet_received(0, now, false);
        acks.packet_received(1, now, false);
        assert!(!acks.ack_due(now + Duration::from_secs(1), Duration::from_millis(25)));
        assert!(!acks.can_send());
    }

    #[test]
    fn crypto_queue_merges_and_splits() {
        let mut space = PacketSpace::new();
        space.queue_crypto(Bytes::from_static(b"hello "));
        space.queue_crypto(Bytes::from_static(b"world"));

        // Merge across contiguous fragments, splitting at max_len
        let chunk = space.next_crypto_chunk(8).unwrap();
        assert_eq!(chunk.offset, 0);
        assert_eq!(&chunk.data[..], b"hello wo");
        let chunk = space.next_crypto_chunk(8).unwrap();
        assert_eq!(chunk.offset, 8);
        assert_eq!(&chunk.data[..], b"rld");
        assert!(space.next_crypto_chunk(8).is_none());
    }

    #[test]
    fn crypto_queue_skips_acked() {
        let mut space = PacketSpace::new();
        space.queue_crypto(Bytes::from_static(b"0123456789"));
        space.crypto_acked.insert(0..4);
        let chunk = space.next_crypto_chunk(100).unwrap();
        assert_eq!(chunk.offset, 4);
        assert_eq!(&chunk.data[..], b"456789");
    }

    #[test]
    fn crypto_requeue_preserves_order() {
        let mut space = PacketSpace::new();
        space.queue_crypto(Bytes::from_static(b"abcdef"));
        let first = space.next_crypto_chunk(3).unwrap();
        assert_eq!(first.offset, 0);
        let second = space.next_crypto_chunk(3).unwrap();
        assert_eq!(second.offset, 3);
        // Lose the first fragment; it comes back ahead of fresh data
        space.requeue_crypto(first);
        let again = space.next_crypto_chunk(3).unwrap();
        assert_eq!(again.offset, 0);
        assert_eq!(&again.data[..], b"abc");
    }

    #[test]
    fn in_flight_conservation() {
        let now = Instant::now();
        let mut space = PacketSpace::new();
        for i in 0..4u64 {
            space.sent(
                i,
                SentPacket {
                    time_sent: now,
                    size: 100,
                    ack_eliciting: true,
                    is_crypto: false,
                    is_probe: false,
                    acks: ArrayRangeSet::new(),
                    retransmits: ThinRetransmits::default(),
                    stream_frames: frame::StreamMetaVec::new(),
                    crypto_frames: frame::CryptoVec::new(),
                },
            );
        }
        assert_eq!(space.in_flight, 400);
        assert_eq!(
            space.in_flight,
            space.sent_packets.values().map(|x| x.size as u64).sum()
        );
        space.take(2).unwrap();
        assert_eq!(space.in_flight, 300);
        assert!(space.take(2).is_none());
    }
}
