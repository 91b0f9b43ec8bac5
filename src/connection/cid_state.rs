use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::cid::ConnectionId;
use crate::transport_error::TransportError;

/// State of the connection IDs we issued to the peer
pub(super) struct CidState {
    /// Issued, not yet removed CIDs, by sequence number
    issued: FxHashMap<u64, LocalCid>,
    /// Reverse index for routing incoming packets to sequence numbers
    index: FxHashMap<ConnectionId, u64>,
    /// Sequence number for the next issued CID
    next_seq: u64,
    /// Retired CIDs awaiting their removal deadline, earliest first
    retiring: BinaryHeap<Reverse<(Instant, u64)>>,
}

struct LocalCid {
    cid: ConnectionId,
    /// The peer has addressed a packet to this CID
    used: bool,
    retired: bool,
}

impl CidState {
    /// Track the CID exchanged during the handshake, which implicitly has
    /// sequence number 0
    pub(super) fn new(initial: ConnectionId) -> Self {
        let mut this = Self {
            issued: FxHashMap::default(),
            index: FxHashMap::default(),
            next_seq: 0,
            retiring: BinaryHeap::new(),
        };
        let seq = this.issue(initial);
        this.issued.get_mut(&seq).unwrap().used = true;
        this
    }

    /// The CID issued during the handshake, sequence number 0
    pub(super) fn initial_cid(&self) -> ConnectionId {
        match self.issued.get(&0) {
            Some(x) => x.cid,
            None => self.issued.values().next().expect("no local CIDs").cid,
        }
    }

    /// Register a freshly allocated CID, returning its sequence number
    pub(super) fn issue(&mut self, cid: ConnectionId) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.issued.insert(
            seq,
            LocalCid {
                cid,
                used: false,
                retired: false,
            },
        );
        self.index.insert(cid, seq);
        seq
    }

    /// Whether `cid` routes to this connection
    pub(super) fn is_local(&self, cid: &ConnectionId) -> bool {
        cid.is_empty() || self.index.contains_key(cid)
    }

    /// Note that the peer addressed a packet to `cid`
    ///
    /// Returns `true` the first time a given CID is seen in use, which is
    /// the signal to replenish the pool.
    pub(super) fn on_used(&mut self, cid: &ConnectionId) -> bool {
        let Some(&seq) = self.index.get(cid) else {
            return false;
        };
        let entry = self.issued.get_mut(&seq).unwrap();
        !std::mem::replace(&mut entry.used, true)
    }

    /// Number of issued CIDs that are not retired
    pub(super) fn active_count(&self) -> usize {
        self.issued.values().filter(|x| !x.retired).count()
    }

    /// Process a RETIRE_CONNECTION_ID frame
    ///
    /// `packet_dcid` is the CID the carrying packet itself was addressed
    /// to; retiring that one is a protocol violation, as is naming a
    /// sequence number we never issued.
    pub(super) fn retire(
        &mut self,
        sequence: u64,
        packet_dcid: &ConnectionId,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        if sequence >= self.next_seq {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID for unissued sequence number",
            ));
        }
        let Some(entry) = self.issued.get_mut(&sequence) else {
            // Already removed; duplicate retirement is a no-op
            return Ok(());
        };
        if entry.cid == *packet_dcid {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID names the connection ID it arrived on",
            ));
        }
        if !std::mem::replace(&mut entry.retired, true) {
            self.retiring.push(Reverse((deadline, sequence)));
        }
        Ok(())
    }

    /// When the earliest retired CID can be removed
    pub(super) fn next_expiry(&self) -> Option<Instant> {
        self.retiring.peek().map(|Reverse((t, _))| *t)
    }

    /// Remove retired CIDs whose grace period has passed
    pub(super) fn expire(&mut self, now: Instant) -> Vec<ConnectionId> {
        let mut removed = Vec::new();
        while let Some(&Reverse((deadline, seq))) = self.retiring.peek() {
            if deadline > now {
                break;
            }
            self.retiring.pop();
            if let Some(entry) = self.issued.remove(&seq) {
                self.index.remove(&entry.cid);
                removed.push(entry.cid);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cid(x: u8) -> ConnectionId {
        ConnectionId::new(&[x; 8])
    }

    #[test]
    fn issue_and_route() {
        let mut cids = CidState::new(cid(0));
        assert!(cids.is_local(&cid(0)));
        assert!(!cids.is_local(&cid(1)));
        let seq = cids.issue(cid(1));
        assert_eq!(seq, 1);
        assert!(cids.is_local(&cid(1)));
        assert_eq!(cids.active_count(), 2);
    }

    #[test]
    fn first_use_detected_once() {
        let mut cids = CidState::new(cid(0));
        cids.issue(cid(1));
        assert!(cids.on_used(&cid(1)));
        assert!(!cids.on_used(&cid(1)));
        assert!(!cids.on_used(&cid(9)));
    }

    #[test]
    fn retire_unissued_is_violation() {
        let mut cids = CidState::new(cid(0));
        assert!(cids.retire(7, &cid(0), Instant::now()).is_err());
    }

    #[test]
    fn retire_own_dcid_is_violation() {
        let mut cids = CidState::new(cid(0));
        cids.issue(cid(1));
        assert!(cids.retire(1, &cid(1), Instant::now()).is_err());
        assert!(cids.retire(1, &cid(0), Instant::now()).is_ok());
    }

    #[test]
    fn removal_waits_for_grace_period() {
        let now = Instant::now();
        let mut cids = CidState::new(cid(0));
        cids.issue(cid(1));
        let deadline = now + Duration::from_secs(2);
        cids.retire(1, &cid(0), deadline).unwrap();
        assert_eq!(cids.active_count(), 1);
        assert!(cids.expire(now).is_empty());
        assert_eq!(cids.next_expiry(), Some(deadline));
        let removed = cids.expire(deadline);
        assert_eq!(removed, vec![cid(1)]);
        assert!(!cids.is_local(&cid(1)));
        assert_eq!(cids.next_expiry(), None);
    }
}
