use std::{cmp::Ordering, io, ops::Range};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::cid::ConnectionId;
use crate::coding::{self, BufExt, BufMutExt};
use crate::crypto::{packet_nonce, CryptoBackend, CryptoError, HeaderKey, Level, PacketKey};
use crate::{HP_SAMPLE_SIZE, MAX_CID_SIZE, VERSION};

// Due to packet number encryption, it is impossible to fully decode a header
// (which includes a variable-length packet number) without crypto context.
// We first decode the invariant header, which gives us the destination CID
// and lets us inspect the version and packet type. With keys for the
// packet's encryption level the caller can then `finish` the decode.
pub(crate) struct PartialDecode {
    plain_header: PlainHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    /// Begin decoding the first packet of a datagram
    ///
    /// Returns the partially decoded packet and, when the packet carries an
    /// explicit length and the datagram continues past it, the remainder of
    /// the datagram holding coalesced packets.
    pub(crate) fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        match dgram_len.cmp(&packet_len) {
            Ordering::Equal => Ok((Self { plain_header, buf }, None)),
            Ordering::Less => Err(PacketDecodeError::InvalidHeader(
                "packet too short to contain payload length",
            )),
            Ordering::Greater => {
                let rest = Some(buf.get_mut().split_off(packet_len));
                Ok((Self { plain_header, buf }, rest))
            }
        }
    }

    pub(crate) fn has_long_header(&self) -> bool {
        !matches!(self.plain_header, PlainHeader::Short { .. })
    }

    pub(crate) fn is_initial(&self) -> bool {
        matches!(self.plain_header, PlainHeader::Initial { .. })
    }

    pub(crate) fn space(&self) -> Option<SpaceId> {
        use PlainHeader::*;
        match self.plain_header {
            Initial { .. } => Some(SpaceId::Initial),
            Long {
                ty: LongType::Handshake,
                ..
            } => Some(SpaceId::Handshake),
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => Some(SpaceId::Data),
            Short { .. } => Some(SpaceId::Data),
            _ => None,
        }
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        matches!(
            self.plain_header,
            PlainHeader::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    pub(crate) fn dst_cid(&self) -> ConnectionId {
        self.plain_header.dst_cid()
    }

    /// Length of the packet being decoded
    pub(crate) fn len(&self) -> usize {
        self.buf.get_ref().len()
    }

    /// The whole packet, as received
    pub(crate) fn data(&self) -> &[u8] {
        self.buf.get_ref()
    }

    /// Complete the decode, removing header protection where applicable
    ///
    /// `header` must be `Some` exactly when the packet's header is
    /// protected, i.e. for everything except Retry and Version Negotiation.
    pub(crate) fn finish(
        self,
        header: Option<(&dyn CryptoBackend, Level, &HeaderKey)>,
    ) -> Result<Packet, PacketDecodeError> {
        use PlainHeader::*;
        let Self { plain_header, buf } = self;
        let pn_offset = buf.position() as usize;
        let mut bytes = buf.into_inner();

        // Retry and Version Negotiation carry no packet number
        match plain_header {
            VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            } => {
                let payload = bytes.split_off(pn_offset);
                return Ok(Packet {
                    header: Header::VersionNegotiate {
                        random,
                        dst_cid,
                        src_cid,
                    },
                    header_data: bytes.freeze(),
                    payload,
                });
            }
            Retry { dst_cid, src_cid } => {
                let payload = bytes.split_off(pn_offset);
                return Ok(Packet {
                    header: Header::Retry { dst_cid, src_cid },
                    header_data: bytes.freeze(),
                    payload,
                });
            }
            _ => {}
        }

        let (backend, level, key) = header.expect("protected packet decoded without keys");
        if bytes.len() < pn_offset + 4 + HP_SAMPLE_SIZE {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short for header protection sample",
            ));
        }
        let mut sample = [0; HP_SAMPLE_SIZE];
        sample.copy_from_slice(&bytes[pn_offset + 4..pn_offset + 4 + HP_SAMPLE_SIZE]);
        let mask = backend.header_mask(level, key, &sample);
        let long = bytes[0] & LONG_HEADER_FORM != 0;
        bytes[0] ^= mask[0] & if long { 0x0f } else { 0x1f };
        let pn_len = (bytes[0] & 0x03) as usize + 1;
        if bytes.len() < pn_offset + pn_len {
            return Err(PacketDecodeError::InvalidHeader("packet number underflow"));
        }
        for i in 0..pn_len {
            bytes[pn_offset + i] ^= mask[1 + i];
        }
        let number = {
            let mut pn_bytes = &bytes[pn_offset..pn_offset + pn_len];
            PacketNumber::decode(pn_len, &mut pn_bytes)?
        };
        let first = bytes[0];

        let header = match plain_header {
            Initial {
                dst_cid,
                src_cid,
                token_pos,
                ..
            } => Header::Initial {
                dst_cid,
                src_cid,
                token: Bytes::copy_from_slice(&bytes[token_pos]),
                number,
            },
            Long {
                ty,
                dst_cid,
                src_cid,
                ..
            } => Header::Long {
                ty,
                dst_cid,
                src_cid,
                number,
            },
            Short { spin, dst_cid } => Header::Short {
                spin,
                key_phase: first & KEY_PHASE_BIT != 0,
                dst_cid,
                number,
            },
            Retry { .. } | VersionNegotiate { .. } => unreachable!(),
        };

        let payload = bytes.split_off(pn_offset + pn_len);
        Ok(Packet {
            header,
            header_data: bytes.freeze(),
            payload,
        })
    }
}

/// A packet with its header fully decoded and header protection removed
///
/// The payload remains AEAD-protected.
pub(crate) struct Packet {
    pub(crate) header: Header,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

impl Packet {
    /// Whether the reserved header bits, which are covered by both header
    /// protection and the AEAD, are clear
    pub(crate) fn reserved_bits_valid(&self) -> bool {
        let mask = match self.header {
            Header::Short { .. } => SHORT_RESERVED_BITS,
            _ => LONG_RESERVED_BITS,
        };
        self.header_data[0] & mask == 0
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    Short {
        spin: bool,
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl Header {
    /// Write the header, leaving the length field (if any) for
    /// [`PartialEncode::finish`] to fill in
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use Header::*;
        let start = w.len();
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                w.put_u8(0b1100_0000 | number.tag());
                w.put_u32(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                let len_pos = w.len();
                w.put_u16(0);
                let pn_pos = w.len();
                number.encode(w);
                PartialEncode {
                    start,
                    len_pos: Some(len_pos),
                    pn: Some((pn_pos, number.len())),
                    short: false,
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                w.put_u8(0b1100_0000 | (ty as u8) << 4 | number.tag());
                w.put_u32(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                let len_pos = w.len();
                w.put_u16(0);
                let pn_pos = w.len();
                number.encode(w);
                PartialEncode {
                    start,
                    len_pos: Some(len_pos),
                    pn: Some((pn_pos, number.len())),
                    short: false,
                }
            }
            Short {
                spin,
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.put_u8(
                    0b0100_0000
                        | (spin as u8) << 5
                        | (key_phase as u8) << 2
                        | number.tag(),
                );
                w.put_slice(dst_cid);
                let pn_pos = w.len();
                number.encode(w);
                PartialEncode {
                    start,
                    len_pos: None,
                    pn: Some((pn_pos, number.len())),
                    short: true,
                }
            }
            // The engine never originates Retry or Version Negotiation
            // packets; those are listener responsibilities.
            Retry { .. } | VersionNegotiate { .. } => {
                unreachable!("tried to send a Retry or Version Negotiation packet")
            }
        }
    }

    fn encode_cids(w: &mut Vec<u8>, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
        w.put_u8(dst_cid.len() as u8);
        w.put_slice(dst_cid);
        w.put_u8(src_cid.len() as u8);
        w.put_slice(src_cid);
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use Header::*;
        match *self {
            Initial { number, .. } | Long { number, .. } | Short { number, .. } => Some(number),
            _ => None,
        }
    }

    pub(crate) fn space(&self) -> SpaceId {
        use Header::*;
        match *self {
            Initial { .. } => SpaceId::Initial,
            Long {
                ty: LongType::Handshake,
                ..
            } => SpaceId::Handshake,
            _ => SpaceId::Data,
        }
    }

    pub(crate) fn key_phase(&self) -> bool {
        match *self {
            Self::Short { key_phase, .. } => key_phase,
            _ => false,
        }
    }

    pub(crate) fn is_short(&self) -> bool {
        matches!(*self, Self::Short { .. })
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        matches!(
            *self,
            Self::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    pub(crate) fn is_protected(&self) -> bool {
        !matches!(*self, Self::Retry { .. } | Self::VersionNegotiate { .. })
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        use Header::*;
        match *self {
            Initial { ref dst_cid, .. }
            | Long { ref dst_cid, .. }
            | Retry { ref dst_cid, .. }
            | Short { ref dst_cid, .. }
            | VersionNegotiate { ref dst_cid, .. } => dst_cid,
        }
    }
}

pub(crate) struct PartialEncode {
    start: usize,
    len_pos: Option<usize>,
    pn: Option<(usize, usize)>,
    short: bool,
}

impl PartialEncode {
    /// Offset at which the packet's payload begins
    pub(crate) fn payload_start(&self) -> usize {
        let (pn_pos, pn_len) = self.pn.expect("protected packet");
        pn_pos + pn_len
    }

    /// Length of the encoded packet number
    pub(crate) fn pn_len(&self) -> usize {
        self.pn.expect("protected packet").1
    }

    /// Offset of the packet within the datagram buffer
    pub(crate) fn start(&self) -> usize {
        self.start
    }

    /// Seal the packet and apply header protection
    ///
    /// `buf` must already contain the complete plaintext payload; the
    /// length field is patched, `tag_len` bytes are appended, the payload
    /// is sealed, and finally the first byte and packet number bytes are
    /// masked.
    pub(crate) fn finish(
        self,
        buf: &mut Vec<u8>,
        backend: &dyn CryptoBackend,
        level: Level,
        number: u64,
        packet_key: &PacketKey,
        header_key: &HeaderKey,
    ) -> Result<(), CryptoError> {
        let Self {
            start,
            len_pos,
            pn,
            short,
        } = self;
        let (pn_pos, pn_len) = pn.expect("protected packet");
        let tag_len = backend.tag_len(level);

        if let Some(len_pos) = len_pos {
            let len = buf.len() - pn_pos + tag_len;
            debug_assert!(len < (1 << 14), "packet length exceeds two-byte varint");
            buf[len_pos] = 0b0100_0000 | (len >> 8) as u8;
            buf[len_pos + 1] = len as u8;
        }

        let header_len = pn_pos + pn_len - start;
        buf.resize(buf.len() + tag_len, 0);
        let nonce = packet_nonce(&packet_key.iv, number);
        backend.seal(level, packet_key, &nonce, &mut buf[start..], header_len)?;

        let sample_start = pn_pos + 4;
        debug_assert!(sample_start + HP_SAMPLE_SIZE <= buf.len());
        let mut sample = [0; HP_SAMPLE_SIZE];
        sample.copy_from_slice(&buf[sample_start..sample_start + HP_SAMPLE_SIZE]);
        let mask = backend.header_mask(level, header_key, &sample);
        buf[start] ^= mask[0] & if short { 0x1f } else { 0x0f };
        for i in 0..pn_len {
            buf[pn_pos + i] ^= mask[1 + i];
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: Range<usize>,
        len: u64,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    Short {
        spin: bool,
        dst_cid: ConnectionId,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn dst_cid(&self) -> ConnectionId {
        use PlainHeader::*;
        match self {
            Initial { dst_cid, .. }
            | Long { dst_cid, .. }
            | Retry { dst_cid, .. }
            | Short { dst_cid, .. }
            | VersionNegotiate { dst_cid, .. } => *dst_cid,
        }
    }

    fn payload_len(&self) -> Option<u64> {
        use PlainHeader::*;
        match self {
            Initial { len, .. } | Long { len, .. } => Some(*len),
            _ => None,
        }
    }

    fn decode(
        buf: &mut io::Cursor<BytesMut>,
        local_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            // Short header
            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            let spin = first & SPIN_BIT != 0;
            let dst_cid = ConnectionId::decode_fixed(buf, local_cid_len)?;
            Ok(Self::Short { spin, dst_cid })
        } else {
            let version = buf.get::<u32>()?;
            let dst_cid = Self::decode_cid(buf)?;
            let src_cid = Self::decode_cid(buf)?;
            if version == 0 {
                return Ok(Self::VersionNegotiate {
                    random: first & !LONG_HEADER_FORM,
                    dst_cid,
                    src_cid,
                });
            }
            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion { version });
            }
            match (first >> 4) & 0x3 {
                0x0 => {
                    let token_len = buf.get_var()?;
                    let token_start = buf.position() as usize;
                    if token_len > buf.remaining() as u64 {
                        return Err(PacketDecodeError::InvalidHeader("token out of bounds"));
                    }
                    buf.advance(token_len as usize);
                    let len = buf.get_var()?;
                    Ok(Self::Initial {
                        dst_cid,
                        src_cid,
                        token_pos: token_start..token_start + token_len as usize,
                        len,
                    })
                }
                0x1 => Ok(Self::Long {
                    ty: LongType::ZeroRtt,
                    dst_cid,
                    src_cid,
                    len: buf.get_var()?,
                }),
                0x2 => Ok(Self::Long {
                    ty: LongType::Handshake,
                    dst_cid,
                    src_cid,
                    len: buf.get_var()?,
                }),
                0x3 => Ok(Self::Retry { dst_cid, src_cid }),
                _ => unreachable!(),
            }
        }
    }

    fn decode_cid(buf: &mut io::Cursor<BytesMut>) -> Result<ConnectionId, PacketDecodeError> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader(
                "illegal connection ID length",
            ));
        }
        Ok(ConnectionId::decode_fixed(buf, len)?)
    }
}

/// Long packet type bits
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum LongType {
    ZeroRtt = 0x1,
    Handshake = 0x2,
}

/// A truncated packet number, as it appears on the wire
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Truncate `n` for transmission given the largest packet number the
    /// peer has acknowledged in this space
    ///
    /// Uses the shortest encoding whose window unambiguously covers
    /// `2 * (n - largest_acked) + 1` packet numbers, but never fewer than
    /// two bytes, which keeps reconstruction robust when short runs of
    /// packets are reordered.
    pub(crate) fn new(n: u64, largest_acked: Option<u64>) -> Self {
        let range = match largest_acked {
            Some(base) => (n - base) * 2 + 1,
            None => n * 2 + 1,
        };
        if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else {
            debug_assert!(range < 1 << 32, "packet number delta too large to encode");
            Self::U32(n as u32)
        }
    }

    pub(crate) fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    /// Low two bits of the first header byte
    fn tag(self) -> u8 {
        (self.len() - 1) as u8
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use PacketNumber::*;
        match self {
            U8(x) => w.put_u8(x),
            U16(x) => w.put_u16(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.put_u32(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use PacketNumber::*;
        if r.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader("packet number underflow"));
        }
        Ok(match len {
            1 => U8(r.get_u8()),
            2 => U16(r.get_u16()),
            3 => U24(r.get_uint(3) as u32),
            4 => U32(r.get_u32()),
            _ => unreachable!("illegal packet number length"),
        })
    }

    /// Reconstruct the full packet number as the candidate closest to
    /// `expected`, the next packet number we anticipate in this space
    pub(crate) fn expand(self, expected: u64) -> u64 {
        use PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() as u64 * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin
        // and less than or equal to expected + hwin. This means we can't
        // just strip the trailing bits from expected and add the truncated
        // number because that might yield a value outside the window.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).is_some_and(|x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Bit masks within the first byte of a packet header
const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const SPIN_BIT: u8 = 0x20;
const KEY_PHASE_BIT: u8 = 0x04;
const SHORT_RESERVED_BITS: u8 = 0x18;
const LONG_RESERVED_BITS: u8 = 0x0c;

/// Packet number space identifiers, in ascending encryption-level order
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum SpaceId {
    Initial = 0,
    Handshake = 1,
    /// 0-RTT and 1-RTT packets share a space
    Data = 2,
}

impl SpaceId {
    pub(crate) fn iter() -> impl DoubleEndedIterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().copied()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub(crate) enum PacketDecodeError {
    #[error("unsupported version {version:x}")]
    UnsupportedVersion { version: u32 },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}
