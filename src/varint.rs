use std::{convert::TryFrom, fmt};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, Codec, UnexpectedEnd};

/// An integer less than 2^62
///
/// Values of this type are suitable for encoding as a QUIC variable-length
/// integer: the two high bits of the first byte select a 1, 2, 4, or 8 byte
/// big-endian encoding.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    /// The largest representable value
    pub const MAX: Self = Self((1 << 62) - 1);

    /// Construct a `VarInt` infallibly
    pub const fn from_u32(x: u32) -> Self {
        Self(x as u64)
    }

    /// Succeeds iff `x` < 2^62
    pub fn from_u64(x: u64) -> Result<Self, VarIntBoundsExceeded> {
        if x < (1 << 62) {
            Ok(Self(x))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    /// Create a VarInt without checking that it is in range
    ///
    /// # Safety
    ///
    /// `x` must be less than 2^62.
    pub const unsafe fn from_u64_unchecked(x: u64) -> Self {
        Self(x)
    }

    /// Extract the integer value
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Length of the value's encoding in bytes
    pub const fn size(self) -> usize {
        let x = self.0;
        if x < (1 << 6) {
            1
        } else if x < (1 << 14) {
            2
        } else if x < (1 << 30) {
            4
        } else {
            8
        }
    }
}

impl From<VarInt> for u64 {
    fn from(x: VarInt) -> Self {
        x.0
    }
}

impl From<u8> for VarInt {
    fn from(x: u8) -> Self {
        Self(x.into())
    }
}

impl From<u16> for VarInt {
    fn from(x: u16) -> Self {
        Self(x.into())
    }
}

impl From<u32> for VarInt {
    fn from(x: u32) -> Self {
        Self(x.into())
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        Self::from_u64(x)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntBoundsExceeded;
    fn try_from(x: usize) -> Result<Self, Self::Error> {
        Self::from_u64(x as u64)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when constructing a `VarInt` from a value >= 2^62
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

impl Codec for VarInt {
    fn decode<B: Buf>(r: &mut B) -> coding::Result<Self> {
        if !r.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let mut buf = [0; 8];
        buf[0] = r.get_u8();
        let tag = buf[0] >> 6;
        buf[0] &= 0b0011_1111;
        let x = match tag {
            0b00 => u64::from(buf[0]),
            0b01 => {
                if r.remaining() < 1 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..2]);
                u64::from(u16::from_be_bytes([buf[0], buf[1]]))
            }
            0b10 => {
                if r.remaining() < 3 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..4]);
                u64::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
            }
            0b11 => {
                if r.remaining() < 7 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..8]);
                u64::from_be_bytes(buf)
            }
            _ => unreachable!(),
        };
        Ok(Self(x))
    }

    fn encode<B: BufMut>(&self, w: &mut B) {
        let x = self.0;
        if x < (1 << 6) {
            w.put_u8(x as u8);
        } else if x < (1 << 14) {
            w.put_u16(0b01 << 14 | x as u16);
        } else if x < (1 << 30) {
            w.put_u32(0b10 << 30 | x as u32);
        } else if x < (1 << 62) {
            w.put_u64(0b11 << 62 | x);
        } else {
            unreachable!("malformed VarInt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::io;

    fn roundtrip(x: u64) {
        let mut buf = Vec::new();
        VarInt::from_u64(x).unwrap().encode(&mut buf);
        let mut r = io::Cursor::new(buf);
        assert_eq!(VarInt::decode(&mut r).unwrap().into_inner(), x);
    }

    #[test]
    fn sizes() {
        assert_eq!(VarInt(0).size(), 1);
        assert_eq!(VarInt(63).size(), 1);
        assert_eq!(VarInt(64).size(), 2);
        assert_eq!(VarInt(16383).size(), 2);
        assert_eq!(VarInt(16384).size(), 4);
        assert_eq!(VarInt(1_073_741_823).size(), 4);
        assert_eq!(VarInt(1_073_741_824).size(), 8);
        assert_eq!(VarInt::MAX.size(), 8);
    }

    #[test]
    fn eight_byte_example() {
        // The canonical eight-byte example from the transport specification
        let mut r = io::Cursor::new(&hex!("c2197c5eff14e88c")[..]);
        assert_eq!(
            VarInt::decode(&mut r).unwrap().into_inner(),
            151_288_809_941_952_652
        );
    }

    #[test]
    fn four_byte_example() {
        let mut r = io::Cursor::new(&hex!("9d7f3e7d")[..]);
        assert_eq!(VarInt::decode(&mut r).unwrap().into_inner(), 494_878_333);
    }

    #[test]
    fn two_byte_example() {
        let mut r = io::Cursor::new(&hex!("7bbd")[..]);
        assert_eq!(VarInt::decode(&mut r).unwrap().into_inner(), 15_293);
    }

    #[test]
    fn one_byte_example() {
        let mut r = io::Cursor::new(&hex!("25")[..]);
        assert_eq!(VarInt::decode(&mut r).unwrap().into_inner(), 37);
    }

    #[test]
    fn roundtrip_boundaries() {
        for x in [
            0,
            1,
            63,
            64,
            16383,
            16384,
            1_073_741_823,
            1_073_741_824,
            (1 << 62) - 1,
        ] {
            roundtrip(x);
        }
    }

    #[test]
    fn bounds() {
        assert!(VarInt::from_u64(1 << 62).is_err());
        assert!(VarInt::from_u64((1 << 62) - 1).is_ok());
    }

    #[test]
    fn truncated() {
        for bytes in [&hex!("7b")[..], &hex!("9d7f3e")[..], &[0xc2; 7][..]] {
            let mut r = io::Cursor::new(bytes);
            assert_eq!(VarInt::decode(&mut r), Err(UnexpectedEnd));
        }
    }
}
