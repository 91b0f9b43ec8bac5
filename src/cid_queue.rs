use std::ops::Range;

use crate::cid::{ConnectionId, ResetToken};

/// Data stored per remotely issued connection ID
type CidData = (ConnectionId, Option<ResetToken>);

/// Sliding window of connection IDs issued to us by the peer
///
/// May contain gaps due to packet loss or reordering. The active CID is the
/// one written into outgoing short headers; inactive successors are held in
/// reserve for migration and rotation.
#[derive(Debug)]
pub(crate) struct CidQueue {
    /// Ring buffer indexed by `self.cursor`
    buffer: [Option<CidData>; Self::LEN],
    /// Index at which circular buffer addressing is based
    cursor: usize,
    /// Sequence number of `self.buffer[cursor]`
    ///
    /// The sequence number of the active CID; must be the smallest among
    /// CIDs in `buffer`.
    offset: u64,
}

/// A connection ID the peer issued with NEW_CONNECTION_ID, or the one it
/// supplied during the handshake
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct IssuedCid {
    pub(crate) sequence: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

impl CidQueue {
    pub(crate) fn new(cid: ConnectionId) -> Self {
        let mut buffer = [None; Self::LEN];
        buffer[0] = Some((cid, None));
        Self {
            buffer,
            cursor: 0,
            offset: 0,
        }
    }

    pub(crate) fn insert(&mut self, cid: IssuedCid) -> Result<(), InsertError> {
        if cid.sequence == self.offset && self.buffer[self.cursor].is_some() {
            let (existing, _) = self.buffer[self.cursor].unwrap();
            if existing != cid.id {
                // Reusing a sequence number for a new CID is a protocol
                // violation
                return Err(InsertError::Conflict);
            }
            // Duplicate of the active CID
            return Ok(());
        }
        let index = match cid.sequence.checked_sub(self.offset) {
            None => return Err(InsertError::Retired),
            Some(x) => x,
        };
        if index >= Self::LEN as u64 {
            return Err(InsertError::ExceedsLimit);
        }
        let index = (self.cursor + index as usize) % Self::LEN;
        if let Some((existing, existing_token)) = self.buffer[index] {
            if existing != cid.id || existing_token != Some(cid.reset_token) {
                return Err(InsertError::Conflict);
            }
        }
        self.buffer[index] = Some((cid.id, Some(cid.reset_token)));
        Ok(())
    }

    /// Returns the possibly-empty range of newly retired CIDs
    pub(crate) fn retire_prior_to(&mut self, sequence: u64) -> Range<u64> {
        let n = match sequence.checked_sub(self.offset) {
            None => return 0..0,
            Some(n) => n as usize,
        };
        for i in 0..n {
            self.buffer[(self.cursor + i) % Self::LEN] = None;
        }
        let orig_offset = self.offset;
        self.offset = sequence;
        self.cursor = (self.cursor + n) % Self::LEN;
        orig_offset..sequence
    }

    /// Switch to the next available CID, if any
    ///
    /// Returns the newly active CID's sequence number and the
    /// possibly-empty range of sequence numbers preceding it that must be
    /// retired.
    pub(crate) fn next(&mut self) -> Option<(u64, Range<u64>)> {
        let (i, _) = self.iter_inactive().next()?;
        self.buffer[self.cursor] = None;

        let orig_offset = self.offset;
        self.offset += i as u64;
        self.cursor = (self.cursor + i) % Self::LEN;
        Some((self.offset, orig_offset..self.offset))
    }

    /// Iterate inactive CIDs that are present
    fn iter_inactive(&self) -> impl Iterator<Item = (usize, CidData)> + '_ {
        (1..Self::LEN).filter_map(move |step| {
            let index = (self.cursor + step) % Self::LEN;
            self.buffer[index].map(|data| (step, data))
        })
    }

    /// Whether a successor to the active CID is available
    pub(crate) fn has_spare(&self) -> bool {
        self.iter_inactive().next().is_some()
    }

    /// The next CID `next` would activate, without activating it
    pub(crate) fn peek_next(&self) -> Option<(u64, ConnectionId)> {
        self.iter_inactive()
            .next()
            .map(|(step, (id, _))| (self.offset + step as u64, id))
    }

    /// Replace the active CID without changing sequence numbers
    ///
    /// Used when the handshake or a Retry packet supersedes the initial
    /// randomly chosen DCID.
    pub(crate) fn update_cid(&mut self, cid: ConnectionId) {
        debug_assert_eq!(self.offset, 0);
        self.buffer[self.cursor] = Some((cid, None));
    }

    /// Whether the active slot currently holds a CID
    pub(crate) fn active_available(&self) -> bool {
        self.buffer[self.cursor].is_some()
    }

    /// The active remote CID
    pub(crate) fn active(&self) -> ConnectionId {
        self.buffer[self.cursor].expect("empty CidQueue").0
    }

    /// Sequence number of the active remote CID
    pub(crate) fn active_seq(&self) -> u64 {
        self.offset
    }

    /// Stateless reset tokens of all stored CIDs
    pub(crate) fn reset_tokens(&self) -> impl Iterator<Item = ResetToken> + '_ {
        self.buffer.iter().filter_map(|x| x.and_then(|(_, t)| t))
    }

    pub(crate) const LEN: usize = 5;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum InsertError {
    /// CID was already retired
    Retired,
    /// Sequence number violates the leading edge of the window
    ExceedsLimit,
    /// Sequence number was reused for a different CID or token
    Conflict,
}
