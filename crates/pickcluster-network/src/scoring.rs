//! Per-peer misbehavior tolerance and latency tracking.

use crate::penalties::{Penalties, PenaltyReason};
use std::time::{Duration, Instant};

/// Round trips at or above this are treated as lost and not sampled.
pub const MAX_LATENCY_SAMPLE: Duration = Duration::from_secs(30);

/// A new latency sample contributes 1/LATENCY_WEIGHT of the average.
const LATENCY_WEIGHT: u32 = 4;

/// An outstanding ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPing {
    pub nonce: u64,
    pub sent_at: Instant,
}

/// Peer score: remaining tolerance plus ping state.
#[derive(Debug, Clone)]
pub struct PeerScore {
    tolerance: i32,
    pending_ping: Option<PendingPing>,
    /// Exponential moving average of ping round trips.
    latency: Option<Duration>,
}

impl Default for PeerScore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerScore {
    pub fn new() -> Self {
        Self {
            tolerance: Penalties::INITIAL_TOLERANCE,
            pending_ping: None,
            latency: None,
        }
    }

    pub fn tolerance(&self) -> i32 {
        self.tolerance
    }

    /// Returns `true` if the peer should now be disconnected.
    pub fn apply_penalty(&mut self, reason: PenaltyReason) -> bool {
        self.apply_penalty_amount(reason.penalty())
    }

    /// Returns `true` if the peer should now be disconnected.
    pub fn apply_penalty_amount(&mut self, amount: i32) -> bool {
        self.tolerance = self.tolerance.saturating_sub(amount);
        self.should_disconnect()
    }

    pub fn should_disconnect(&self) -> bool {
        self.tolerance <= 0
    }

    pub fn pending_ping(&self) -> Option<PendingPing> {
        self.pending_ping
    }

    /// Record a ping sent at `sent_at`, replacing any outstanding one.
    pub fn ping_sent(&mut self, nonce: u64, sent_at: Instant) {
        self.pending_ping = Some(PendingPing { nonce, sent_at });
    }

    /// Match a pong against the outstanding ping.
    ///
    /// Returns the round trip if the nonce matched. A matching pong clears
    /// the outstanding ping and, when the round trip is plausible, feeds the
    /// latency average.
    pub fn pong_received(&mut self, nonce: u64, received_at: Instant) -> Option<Duration> {
        let pending = self.pending_ping.filter(|p| p.nonce == nonce)?;
        self.pending_ping = None;

        let rtt = received_at.saturating_duration_since(pending.sent_at);
        if !rtt.is_zero() && rtt < MAX_LATENCY_SAMPLE {
            self.record_latency(rtt);
        }
        Some(rtt)
    }

    fn record_latency(&mut self, sample: Duration) {
        self.latency = Some(match self.latency {
            None => sample,
            Some(prev) => (sample + prev * (LATENCY_WEIGHT - 1)) / LATENCY_WEIGHT,
        });
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_accounting() {
        let mut score = PeerScore::new();
        assert_eq!(score.tolerance(), 100);
        assert!(!score.apply_penalty_amount(40));
        assert!(!score.apply_penalty_amount(40));
        assert_eq!(score.tolerance(), 20);
        assert!(score.apply_penalty_amount(40));
        assert_eq!(score.tolerance(), -20);
    }

    #[test]
    fn test_duplicate_handshake_disconnects() {
        let mut score = PeerScore::new();
        assert!(score.apply_penalty(PenaltyReason::DuplicateHandshake));
    }

    #[test]
    fn test_latency_average() {
        let mut score = PeerScore::new();
        let start = Instant::now();

        score.ping_sent(1, start);
        assert_eq!(score.pong_received(2, start), None);
        assert!(score.pending_ping().is_some());

        let rtt = score.pong_received(1, start + Duration::from_millis(400));
        assert_eq!(rtt, Some(Duration::from_millis(400)));
        assert_eq!(score.latency(), Some(Duration::from_millis(400)));
        assert!(score.pending_ping().is_none());

        score.ping_sent(3, start);
        score.pong_received(3, start + Duration::from_millis(800));
        assert_eq!(score.latency(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_implausible_round_trip_not_sampled() {
        let mut score = PeerScore::new();
        let start = Instant::now();
        score.ping_sent(9, start);
        assert!(score
            .pong_received(9, start + MAX_LATENCY_SAMPLE)
            .is_some());
        assert_eq!(score.latency(), None);
        assert!(score.pending_ping().is_none());
    }
}
