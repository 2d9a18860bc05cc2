//! Per-peer bookkeeping: advertised range, outstanding requests, receive-rate
//! and idle tracking.

use crate::stats::ReceiveRateMonitor;
use crate::types::PeerId;
use std::time::{Duration, Instant};

/// What the pool must do with the peer's idle timer after a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    /// Nothing outstanding anymore; the running timer is stale.
    Cancel,
    /// Still busy; push the deadline out again.
    Rearm,
}

/// One tracked peer. All fields are guarded by the pool lock.
#[derive(Debug)]
pub(crate) struct PeerState {
    pub(crate) id: PeerId,
    /// Lowest height the peer advertises.
    pub(crate) base: u64,
    /// Highest height the peer advertises.
    pub(crate) tip: u64,
    /// Outstanding block plus header requests.
    pub(crate) in_flight: u32,
    /// Set when the idle timer fired or the receive rate stalled; tombstoned
    /// peers are swept out by the scheduler.
    pub(crate) timed_out: bool,
    pub(crate) recv_monitor: ReceiveRateMonitor,
    /// Bumped to invalidate any idle-timer task already in flight.
    pub(crate) timer_generation: u64,
    pub(crate) connected_at: Instant,
    min_recv_rate: f64,
    recv_rate_window: Duration,
}

impl PeerState {
    pub(crate) fn new(
        id: PeerId,
        base: u64,
        tip: u64,
        min_recv_rate: f64,
        recv_rate_window: Duration,
        now: Instant,
    ) -> Self {
        Self {
            id,
            base,
            tip,
            in_flight: 0,
            timed_out: false,
            recv_monitor: ReceiveRateMonitor::new(
                recv_rate_window,
                min_recv_rate * std::f64::consts::E,
                now,
            ),
            timer_generation: 0,
            connected_at: now,
            min_recv_rate,
            recv_rate_window,
        }
    }

    pub(crate) fn covers(&self, height: u64) -> bool {
        height >= self.base && height <= self.tip
    }

    /// Reserve one outstanding request. Returns true when the peer was idle,
    /// in which case the receive-rate estimate restarts from its seed and the
    /// caller must arm the idle timer.
    pub(crate) fn begin_request(&mut self, now: Instant) -> bool {
        let was_idle = self.in_flight == 0;
        if was_idle {
            self.recv_monitor = ReceiveRateMonitor::new(
                self.recv_rate_window,
                self.min_recv_rate * std::f64::consts::E,
                now,
            );
        }
        self.in_flight += 1;
        was_idle
    }

    /// Release one outstanding request for a delivery of `bytes`.
    pub(crate) fn record_receipt(&mut self, bytes: usize, now: Instant) -> TimerAction {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 {
            TimerAction::Cancel
        } else {
            self.recv_monitor.record(bytes, now);
            TimerAction::Rearm
        }
    }

    /// Release one outstanding request without a delivery (the requester was
    /// torn down). Returns true when the peer is now idle and the running
    /// timer is stale.
    pub(crate) fn release_request(&mut self) -> bool {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.in_flight == 0
    }

    /// Invalidate any idle-timer task already dispatched for this peer.
    pub(crate) fn invalidate_timer(&mut self) {
        self.timer_generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer(now: Instant) -> PeerState {
        PeerState::new(
            PeerId::repeat_byte(1),
            1,
            10,
            7680.0,
            Duration::from_secs(40),
            now,
        )
    }

    #[test]
    fn idle_transitions_drive_the_timer() {
        let now = Instant::now();
        let mut peer = test_peer(now);

        assert!(peer.begin_request(now));
        assert!(!peer.begin_request(now));
        assert_eq!(peer.in_flight, 2);

        assert_eq!(
            peer.record_receipt(1024, now + Duration::from_secs(1)),
            TimerAction::Rearm
        );
        assert_eq!(
            peer.record_receipt(1024, now + Duration::from_secs(2)),
            TimerAction::Cancel
        );
        assert_eq!(peer.in_flight, 0);
    }

    #[test]
    fn range_coverage_is_inclusive() {
        let peer = test_peer(Instant::now());
        assert!(!peer.covers(0));
        assert!(peer.covers(1));
        assert!(peer.covers(10));
        assert!(!peer.covers(11));
    }

    #[test]
    fn going_busy_reseeds_the_rate_estimate() {
        let now = Instant::now();
        let mut peer = test_peer(now);
        peer.begin_request(now);
        peer.recv_monitor.record(1, now + Duration::from_secs(60));
        assert!(peer.recv_monitor.rate() < 7680.0);
        peer.record_receipt(1, now + Duration::from_secs(61));
        // Idle again; the next reservation must not inherit the stalled rate.
        assert!(peer.begin_request(now + Duration::from_secs(62)));
        assert!(peer.recv_monitor.rate() > 7680.0);
    }
}
