use std::cmp;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::cid::ConnectionId;
use crate::config::TransportConfig;
use crate::congestion::Controller;
use crate::TIMER_GRANULARITY;

/// Description of a particular network path
pub(super) struct PathData {
    pub(super) remote: SocketAddr,
    pub(super) rtt: RttEstimator,
    /// Congestion controller state
    pub(super) congestion: Box<dyn Controller>,
    /// Whether we're certain the peer can both send and receive on this
    /// address
    ///
    /// Always true for clients; servers clear it again on migration.
    pub(super) validated: bool,
    /// Total size of all UDP datagrams sent on this path
    pub(super) total_sent: u64,
    /// Total size of all UDP datagrams received on this path
    pub(super) total_recvd: u64,
}

impl PathData {
    pub(super) fn new(remote: SocketAddr, now: Instant, config: &TransportConfig) -> Self {
        Self {
            remote,
            rtt: RttEstimator::new(config.initial_rtt),
            congestion: config
                .congestion_controller_factory
                .build(now, u64::from(config.max_udp_payload_size)),
            validated: false,
            total_sent: 0,
            total_recvd: 0,
        }
    }

    /// Create a path to `remote` that inherits the old path's estimates
    pub(super) fn from_previous(remote: SocketAddr, prev: &Self) -> Self {
        Self {
            remote,
            rtt: prev.rtt,
            congestion: prev.congestion.clone_box(),
            validated: false,
            total_sent: 0,
            total_recvd: 0,
        }
    }

    /// Resets RTT and congestion control, for when the underlying path is
    /// known to have changed
    pub(super) fn reset(&mut self, now: Instant, config: &TransportConfig) {
        self.rtt = RttEstimator::new(config.initial_rtt);
        self.congestion = config
            .congestion_controller_factory
            .build(now, u64::from(config.max_udp_payload_size));
    }

    /// Whether an unvalidated path's three-times-received budget stops us
    /// from sending `bytes_to_send` more bytes
    pub(super) fn anti_amplification_blocked(&self, bytes_to_send: u64) -> bool {
        !self.validated && self.total_recvd * 3 < self.total_sent + bytes_to_send
    }

    /// Bytes an unvalidated path may still send
    pub(super) fn anti_amplification_credit(&self) -> u64 {
        if self.validated {
            return u64::MAX;
        }
        (self.total_recvd * 3).saturating_sub(self.total_sent)
    }
}

/// RTT estimation for a particular network path
#[derive(Copy, Clone)]
pub(super) struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a
    /// previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, an exponentially weighted moving
    /// average of RTT samples
    smoothed: Option<Duration>,
    /// The RTT variance, estimating the variation in the RTT samples
    var: Duration,
    /// The minimum RTT seen over a period of time
    min: Duration,
}

impl RttEstimator {
    pub(super) fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    pub(super) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay
        self.min = cmp::min(self.min, rtt);
        if let Some(smoothed) = self.smoothed {
            // Adjust for ack delay unless it would put us below min_rtt
            let adjusted_rtt = if self.min + ack_delay <= rtt {
                rtt - ack_delay
            } else {
                rtt
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.min = rtt;
            self.smoothed = Some(rtt);
            self.var = rtt / 2;
        }
    }

    /// Current best RTT estimate
    pub(super) fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    pub(super) fn latest(&self) -> Duration {
        self.latest
    }

    /// Conservative estimate of RTT plus scheduling and processing slack
    pub(super) fn pto_base(&self) -> Duration {
        self.get() + cmp::max(4 * self.var, TIMER_GRANULARITY)
    }
}

/// Maximum number of times a path validation is retried after timing out
pub(super) const MAX_VALIDATION_RETRIES: u32 = 6;

/// An in-progress PATH_CHALLENGE / PATH_RESPONSE exchange
pub(super) struct PathValidator {
    /// Address being probed
    pub(super) remote: SocketAddr,
    /// Connection ID reserved for the new path
    pub(super) dcid: ConnectionId,
    /// Sequence number of `dcid` in the remote CID ring
    pub(super) dcid_sequence: u64,
    /// Payload of the outstanding challenge
    pub(super) token: u64,
    /// A challenge is waiting to be written to the wire
    pub(super) challenge_pending: bool,
    /// When the outstanding challenge expires
    pub(super) deadline: Instant,
    /// Number of challenges that have timed out
    pub(super) loss_count: u32,
    /// Retire `dcid` instead of adopting it when validation concludes
    pub(super) retire_on_finish: bool,
}

impl PathValidator {
    pub(super) fn new(
        remote: SocketAddr,
        dcid: ConnectionId,
        dcid_sequence: u64,
        token: u64,
        deadline: Instant,
    ) -> Self {
        Self {
            remote,
            dcid,
            dcid_sequence,
            token,
            challenge_pending: true,
            deadline,
            loss_count: 0,
            retire_on_finish: false,
        }
    }

    /// Probe timeout for the current attempt
    ///
    /// Doubles with each timed-out challenge.
    pub(super) fn timeout(pto: Duration, initial_rtt: Duration, loss_count: u32) -> Duration {
        cmp::max(pto, 6 * initial_rtt) * 2u32.saturating_pow(loss_count)
    }

    pub(super) fn exhausted(&self) -> bool {
        self.loss_count >= MAX_VALIDATION_RETRIES
    }
}
