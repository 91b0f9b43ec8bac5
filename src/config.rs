use std::{fmt, sync::Arc, time::Duration};

use crate::congestion::{ControllerFactory, NewRenoConfig};
use crate::VarInt;

/// Parameters governing the core QUIC state machine
///
/// Default values should be suitable for most internet applications.
/// Applications protocols which forbid remotely-initiated streams should
/// set `max_concurrent_bidi_streams` and `max_concurrent_uni_streams` to
/// zero.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) max_idle_timeout: Option<Duration>,
    pub(crate) initial_rtt: Duration,
    pub(crate) max_udp_payload_size: u16,
    pub(crate) receive_window: VarInt,
    pub(crate) stream_receive_window: VarInt,
    pub(crate) max_concurrent_bidi_streams: VarInt,
    pub(crate) max_concurrent_uni_streams: VarInt,
    pub(crate) max_ack_delay: Duration,
    pub(crate) ack_delay_exponent: u8,
    pub(crate) congestion_controller_factory: Arc<dyn ControllerFactory + Send + Sync>,
}

impl TransportConfig {
    /// Maximum duration of inactivity to accept before timing out the
    /// connection. `None` disables the idle timeout.
    pub fn max_idle_timeout(&mut self, value: Option<Duration>) -> &mut Self {
        self.max_idle_timeout = value;
        self
    }

    /// RTT assumed before the first sample on a path
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// Maximum UDP payload size for outgoing datagrams
    ///
    /// Also used as the maximum segment size for congestion control.
    pub fn max_udp_payload_size(&mut self, value: u16) -> &mut Self {
        self.max_udp_payload_size = value;
        self
    }

    /// Connection-level flow control credit advertised to the peer
    pub fn receive_window(&mut self, value: VarInt) -> &mut Self {
        self.receive_window = value;
        self
    }

    /// Per-stream flow control credit advertised to the peer
    pub fn stream_receive_window(&mut self, value: VarInt) -> &mut Self {
        self.stream_receive_window = value;
        self
    }

    /// Number of bidirectional streams the peer may have open concurrently
    pub fn max_concurrent_bidi_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_bidi_streams = value;
        self
    }

    /// Number of unidirectional streams the peer may have open concurrently
    pub fn max_concurrent_uni_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_uni_streams = value;
        self
    }

    /// Maximum delay before sending an acknowledgement, advertised to the peer
    pub fn max_ack_delay(&mut self, value: Duration) -> &mut Self {
        self.max_ack_delay = value;
        self
    }

    /// How to construct the congestion controller for new paths
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn ControllerFactory + Send + Sync>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT: u32 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u32 = 12500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;

        Self {
            max_idle_timeout: Some(Duration::from_secs(10)),
            initial_rtt: Duration::from_millis(333),
            max_udp_payload_size: 1200,
            receive_window: VarInt::from_u32(8 * STREAM_RWND),
            stream_receive_window: VarInt::from_u32(STREAM_RWND),
            max_concurrent_bidi_streams: VarInt::from_u32(100),
            max_concurrent_uni_streams: VarInt::from_u32(100),
            max_ack_delay: Duration::from_millis(25),
            ack_delay_exponent: 3,
            congestion_controller_factory: Arc::new(NewRenoConfig::default()),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("initial_rtt", &self.initial_rtt)
            .field("max_udp_payload_size", &self.max_udp_payload_size)
            .field("receive_window", &self.receive_window)
            .field("stream_receive_window", &self.stream_receive_window)
            .field(
                "max_concurrent_bidi_streams",
                &self.max_concurrent_bidi_streams,
            )
            .field(
                "max_concurrent_uni_streams",
                &self.max_concurrent_uni_streams,
            )
            .field("max_ack_delay", &self.max_ack_delay)
            .field("ack_delay_exponent", &self.ack_delay_exponent)
            .finish_non_exhaustive()
    }
}
