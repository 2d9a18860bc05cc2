//! Rate estimation: per-peer receive rate and overall sync throughput.

use std::time::{Duration, Instant};

/// Exponentially-weighted receive-rate estimate for one peer, in bytes/sec.
///
/// The estimate is seeded well above the stall threshold so a peer cannot be
/// flagged before its first response had any time to arrive.
#[derive(Debug, Clone)]
pub(crate) struct ReceiveRateMonitor {
    window: Duration,
    last_sample: Instant,
    rate: f64,
}

impl ReceiveRateMonitor {
    pub(crate) fn new(window: Duration, initial_rate: f64, now: Instant) -> Self {
        Self {
            window,
            last_sample: now,
            rate: initial_rate,
        }
    }

    /// Fold a received chunk into the estimate. Samples arriving within the
    /// same instant are ignored rather than dividing by zero.
    pub(crate) fn record(&mut self, bytes: usize, now: Instant) {
        let secs = now.saturating_duration_since(self.last_sample).as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let instant_rate = bytes as f64 / secs;
        let alpha = (secs / self.window.as_secs_f64()).min(1.0);
        self.rate += alpha * (instant_rate - self.rate);
        self.last_sample = now;
    }

    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }
}

/// Number of advances between sync-rate samples.
const SYNC_RATE_WINDOW_BLOCKS: u64 = 100;

/// Blocks-per-second estimate over 100-block windows, smoothed 0.9/0.1.
///
/// The first window only opens the measurement; the first usable sample lands
/// one full window later, so a fresh pool reports 0 until then.
#[derive(Debug, Clone)]
pub(crate) struct SyncRateEstimator {
    start_height: u64,
    window_started: Instant,
    rate: f64,
}

impl SyncRateEstimator {
    pub(crate) fn new(start_height: u64, now: Instant) -> Self {
        Self {
            start_height,
            window_started: now,
            rate: 0.0,
        }
    }

    /// Record that the base height advanced to `new_base`.
    pub(crate) fn on_advance(&mut self, new_base: u64, now: Instant) {
        let advanced = new_base.saturating_sub(self.start_height);
        if advanced == 0 || (advanced - 1) % SYNC_RATE_WINDOW_BLOCKS != 0 {
            return;
        }
        if advanced > 1 {
            let secs = now
                .saturating_duration_since(self.window_started)
                .as_secs_f64();
            if secs > 0.0 {
                let sample = SYNC_RATE_WINDOW_BLOCKS as f64 / secs;
                self.rate = if self.rate == 0.0 {
                    sample
                } else {
                    0.9 * self.rate + 0.1 * sample
                };
            }
        }
        self.window_started = now;
    }

    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_monitor_sits_above_the_stall_threshold() {
        let now = Instant::now();
        let min_rate = 7680.0;
        let monitor =
            ReceiveRateMonitor::new(Duration::from_secs(40), min_rate * std::f64::consts::E, now);
        assert!(monitor.rate() > min_rate);
    }

    #[test]
    fn sustained_slow_transfers_pull_the_estimate_down() {
        let now = Instant::now();
        let mut monitor =
            ReceiveRateMonitor::new(Duration::from_secs(40), 7680.0 * std::f64::consts::E, now);
        let mut at = now;
        for _ in 0..100 {
            at += Duration::from_secs(1);
            monitor.record(100, at);
        }
        assert!(monitor.rate() < 7680.0);
        assert!(monitor.rate() > 0.0);
    }

    #[test]
    fn same_instant_samples_are_ignored() {
        let now = Instant::now();
        let mut monitor = ReceiveRateMonitor::new(Duration::from_secs(40), 1000.0, now);
        monitor.record(1_000_000, now);
        assert!((monitor.rate() - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sync_rate_smooths_hundred_block_windows() {
        let t0 = Instant::now();
        let mut estimator = SyncRateEstimator::new(1, t0);

        // First advance opens the window without producing a sample.
        estimator.on_advance(2, t0);
        assert_eq!(estimator.rate(), 0.0);

        // Intermediate advances do not sample.
        estimator.on_advance(50, t0 + Duration::from_secs(4));
        assert_eq!(estimator.rate(), 0.0);

        // 100 blocks in 10 seconds.
        estimator.on_advance(102, t0 + Duration::from_secs(10));
        assert!((estimator.rate() - 10.0).abs() < 1e-9);

        // Another 100 blocks in 5 seconds: 0.9 * 10 + 0.1 * 20.
        estimator.on_advance(202, t0 + Duration::from_secs(15));
        assert!((estimator.rate() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn sync_rate_honours_a_nonunit_start_height() {
        let t0 = Instant::now();
        let mut estimator = SyncRateEstimator::new(500, t0);
        estimator.on_advance(501, t0);
        estimator.on_advance(601, t0 + Duration::from_secs(20));
        assert!((estimator.rate() - 5.0).abs() < 1e-9);
    }
}
