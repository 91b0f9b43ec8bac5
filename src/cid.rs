use std::{cmp::Ordering, fmt, ops};

use bytes::Buf;

use crate::coding::{BufExt, Result, UnexpectedEnd};
use crate::{MAX_CID_SIZE, MIN_CID_SIZE, RESET_TOKEN_SIZE};

/// Protocol-level identifier for a connection
///
/// An opaque byte sequence of length 0 or 4 through 20 chosen by the
/// endpoint that will route on it. Mainly useful for identifying a
/// connection's packets on the wire with tools like Wireshark.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(
            bytes.is_empty() || (bytes.len() >= MIN_CID_SIZE && bytes.len() <= MAX_CID_SIZE)
        );
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Decode a length-prefixed connection ID, as in long headers and
    /// NEW_CONNECTION_ID frames
    pub(crate) fn decode_prefixed<B: Buf>(buf: &mut B) -> Result<Self> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; MAX_CID_SIZE];
        buf.copy_to_slice(&mut bytes[..len]);
        Ok(Self {
            len: len as u8,
            bytes,
        })
    }

    /// Decode a bare connection ID of known length, as in short headers
    pub(crate) fn decode_fixed<B: Buf>(buf: &mut B, len: usize) -> Result<Self> {
        debug_assert!(len <= MAX_CID_SIZE);
        if buf.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; MAX_CID_SIZE];
        buf.copy_to_slice(&mut bytes[..len]);
        Ok(Self {
            len: len as u8,
            bytes,
        })
    }
}

impl Ord for ConnectionId {
    // Lexicographic over the id's bytes, so that ids of different lengths
    // still have a total order
    fn cmp(&self, other: &Self) -> Ordering {
        self[..].cmp(&other[..])
    }
}

impl PartialOrd for ConnectionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Stateless reset token bound to a remotely issued connection ID
///
/// A peer that has lost connection state answers otherwise-undecryptable
/// packets with a datagram ending in this token.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    pub(crate) fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < RESET_TOKEN_SIZE {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; RESET_TOKEN_SIZE];
        buf.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographic_order() {
        let a = ConnectionId::new(&[0x00, 0x01, 0x02, 0x03]);
        let b = ConnectionId::new(&[0x00, 0x01, 0x02, 0x04]);
        let c = ConnectionId::new(&[0x00, 0x01, 0x02, 0x03, 0x00]);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
        assert!(ConnectionId::new(&[]) < a);
    }

    #[test]
    fn prefixed_roundtrip() {
        let cid = ConnectionId::new(&[0xde, 0xad, 0xbe, 0xef, 0x42]);
        let mut buf = vec![cid.len() as u8];
        buf.extend_from_slice(&cid);
        let mut r = std::io::Cursor::new(&buf[..]);
        let decoded = ConnectionId::decode_prefixed(&mut r).unwrap();
        assert_eq!(decoded, cid);
    }

    #[test]
    fn prefixed_too_long() {
        let mut buf = vec![21u8];
        buf.extend_from_slice(&[0; 21]);
        let mut r = std::io::Cursor::new(&buf[..]);
        assert!(ConnectionId::decode_prefixed(&mut r).is_err());
    }
}
