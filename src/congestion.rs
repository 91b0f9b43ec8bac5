//! Congestion control, with a NewReno-shaped default controller.

use std::any::Any;
use std::time::Instant;

/// Common interface for different congestion controllers
pub trait Controller: Send {
    /// One or more packets were just sent
    #[allow(unused_variables)]
    fn on_sent(&mut self, now: Instant, bytes: u64) {}

    /// Packets were deemed delivered
    ///
    /// `app_limited` indicates whether the connection was blocked on
    /// outgoing application data at the time the packet was sent.
    fn on_ack(&mut self, now: Instant, sent: Instant, bytes: u64, app_limited: bool);

    /// Packets were deemed lost or marked congested
    ///
    /// `is_persistent_congestion` indicates whether the congestion window
    /// should be reset to minimum.
    fn on_congestion_event(&mut self, now: Instant, sent: Instant, is_persistent_congestion: bool);

    /// Number of bytes that may be in flight
    fn window(&self) -> u64;

    /// Initial congestion window
    fn initial_window(&self) -> u64;

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn Controller>;

    /// Cast to `Any` for external inspection in tests and instrumentation
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Constructs controllers on demand
pub trait ControllerFactory {
    /// Construct a fresh `Controller`
    fn build(&self, now: Instant, max_datagram_size: u64) -> Box<dyn Controller>;
}

/// A simple, standard congestion controller
#[derive(Debug, Clone)]
pub struct NewReno {
    config: NewRenoConfig,
    max_datagram_size: u64,
    /// Maximum number of bytes in flight that may be sent.
    window: u64,
    /// Slow start threshold in bytes. When the congestion window is below
    /// ssthresh, the mode is slow start and the window grows by the number
    /// of bytes acknowledged.
    ssthresh: u64,
    /// The time when QUIC first detects a loss, causing it to enter
    /// recovery. When a packet sent after this time is acknowledged, QUIC
    /// exits recovery.
    recovery_start_time: Instant,
}

impl NewReno {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: NewRenoConfig, now: Instant, max_datagram_size: u64) -> Self {
        Self {
            window: initial_window(max_datagram_size),
            ssthresh: u64::MAX,
            recovery_start_time: now,
            max_datagram_size,
            config,
        }
    }

    fn minimum_window(&self) -> u64 {
        2 * self.max_datagram_size
    }
}

impl Controller for NewReno {
    fn on_ack(&mut self, _now: Instant, sent: Instant, bytes: u64, app_limited: bool) {
        if app_limited || sent <= self.recovery_start_time {
            return;
        }
        if self.window < self.ssthresh {
            // Slow start
            self.window += bytes;
        } else {
            // Congestion avoidance
            self.window += self.max_datagram_size * bytes / self.window;
        }
    }

    fn on_congestion_event(&mut self, now: Instant, sent: Instant, is_persistent_congestion: bool) {
        if sent <= self.recovery_start_time {
            return;
        }

        self.recovery_start_time = now;
        self.ssthresh = (self.window as f32 * self.config.loss_reduction_factor) as u64;
        self.window = self.ssthresh.max(self.minimum_window());

        if is_persistent_congestion {
            self.window = self.minimum_window();
        }
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn initial_window(&self) -> u64 {
        initial_window(self.max_datagram_size)
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

fn initial_window(max_datagram_size: u64) -> u64 {
    (10 * max_datagram_size).min((2 * max_datagram_size).max(14720))
}

/// Configuration for the `NewReno` congestion controller
#[derive(Debug, Clone)]
pub struct NewRenoConfig {
    loss_reduction_factor: f32,
}

impl NewRenoConfig {
    /// Reduction in congestion window when a new loss event is detected
    pub fn loss_reduction_factor(&mut self, value: f32) -> &mut Self {
        self.loss_reduction_factor = value;
        self
    }
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            loss_reduction_factor: 0.5,
        }
    }
}

impl ControllerFactory for NewRenoConfig {
    fn build(&self, now: Instant, max_datagram_size: u64) -> Box<dyn Controller> {
        Box::new(NewReno::new(self.clone(), now, max_datagram_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MSS: u64 = 1200;

    fn controller(now: Instant) -> NewReno {
        NewReno::new(NewRenoConfig::default(), now, MSS)
    }

    #[test]
    fn initial_window_bounds() {
        assert_eq!(initial_window(1200), 12000);
        assert_eq!(initial_window(1472), 14720);
        assert_eq!(initial_window(9000), 18000);
    }

    #[test]
    fn slow_start_doubles_per_round() {
        let now = Instant::now();
        let mut cc = controller(now);
        let base = cc.window();
        let sent = now + Duration::from_millis(10);
        cc.on_ack(now + Duration::from_millis(20), sent, base, false);
        assert_eq!(cc.window(), 2 * base);
    }

    #[test]
    fn loss_halves_window() {
        let now = Instant::now();
        let mut cc = controller(now);
        let base = cc.window();
        let sent = now + Duration::from_millis(10);
        cc.on_congestion_event(now + Duration::from_millis(20), sent, false);
        assert_eq!(cc.window(), base / 2);

        // Additional losses in the same recovery period are ignored
        cc.on_congestion_event(now + Duration::from_millis(21), sent, false);
        assert_eq!(cc.window(), base / 2);
    }

    #[test]
    fn window_floor() {
        let now = Instant::now();
        let mut cc = controller(now);
        let mut t = now;
        for _ in 0..16 {
            t += Duration::from_millis(10);
            cc.on_congestion_event(t, t - Duration::from_millis(1), false);
        }
        assert_eq!(cc.window(), 2 * MSS);
    }

    #[test]
    fn persistent_congestion_resets_to_minimum() {
        let now = Instant::now();
        let mut cc = controller(now);
        let sent = now + Duration::from_millis(10);
        cc.on_congestion_event(now + Duration::from_millis(20), sent, true);
        assert_eq!(cc.window(), 2 * MSS);
    }

    #[test]
    fn congestion_avoidance_is_linear() {
        let now = Instant::now();
        let mut cc = controller(now);
        let sent = now + Duration::from_millis(10);
        cc.on_congestion_event(now + Duration::from_millis(20), sent, false);
        let window = cc.window();
        assert!(cc.ssthresh <= window);
        // A full window of acks grows the window by about one segment
        let t = now + Duration::from_millis(30);
        cc.on_ack(t, t - Duration::from_millis(5), window, false);
        assert!(cc.window() >= window + MSS - 1 && cc.window() <= window + MSS + 1);
    }
}
