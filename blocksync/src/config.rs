//! Pool tuning knobs.

use std::time::Duration;

/// Block pool configuration.
///
/// The defaults are the deployed values; tests shrink the timeouts instead of
/// waiting them out.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Back-off between peer-picking attempts and scheduler rounds.
    pub request_interval: Duration,
    /// Cap on concurrently tracked heights.
    pub max_total_requesters: usize,
    /// Cap on block requests still awaiting a response.
    pub max_pending_requests: usize,
    /// Per-peer cap on outstanding block plus header requests.
    pub max_pending_requests_per_peer: u32,
    /// Suggested capacity for the peer-error sink.
    pub max_peer_err_buffer: usize,
    /// Minimum receive rate (bytes/sec) below which a busy peer is considered
    /// stalled. Assumes roughly a transatlantic DSL link as the floor.
    pub min_recv_rate: f64,
    /// How long a peer may stay busy without delivering anything before its
    /// idle timer fires.
    pub peer_timeout: Duration,
    /// Averaging window of the per-peer receive-rate estimate.
    pub recv_rate_window: Duration,
    /// Unexpected blocks farther than this from the base height raise a peer
    /// error; closer ones are dropped as stale.
    pub max_received_height_gap: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            request_interval: Duration::from_millis(2),
            max_total_requesters: 600,
            max_pending_requests: 600,
            max_pending_requests_per_peer: 20,
            max_peer_err_buffer: 1000,
            min_recv_rate: 7680.0,
            peer_timeout: Duration::from_secs(15),
            recv_rate_window: Duration::from_secs(40),
            max_received_height_gap: 100,
        }
    }
}
