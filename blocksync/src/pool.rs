//! Central block pool: shared scheduling state and the public surface.
//!
//! All maps and per-peer state live behind one reader/writer lock that is
//! never held across an await. The global pending counter is atomic so
//! `status` can read it under the read lock. Requester-local state has its own
//! lock; the ordering is always pool lock first, requester lock second.

use crate::config::PoolConfig;
use crate::peer::{PeerState, TimerAction};
use crate::requester::{stopped, BlockRequester, WitnessRequester};
use crate::stats::SyncRateEstimator;
use crate::types::{Block, BlockRequest, Header, HeaderRequest, PeerError, PeerId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Scheduler for downloading contiguous blocks from the current base height
/// up to the highest tip reported by any peer.
///
/// Construction wires the three outbound sinks; [`BlockPool::start`] spawns
/// the scheduler worker, which grows the tracked window and creates one
/// requester pair per height. The consumer drains blocks in ascending order
/// through [`BlockPool::peek_two_blocks`] and [`BlockPool::pop_request`].
pub struct BlockPool {
    weak_self: Weak<BlockPool>,
    config: PoolConfig,
    start_height: u64,
    /// Tracked heights whose block has not been accepted yet.
    num_pending: AtomicI64,
    requests_tx: mpsc::Sender<BlockRequest>,
    witness_requests_tx: mpsc::Sender<HeaderRequest>,
    errors_tx: mpsc::Sender<PeerError>,
    shutdown_tx: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    inner: RwLock<PoolInner>,
}

struct PoolInner {
    /// Lowest height not yet handed to the consumer.
    height: u64,
    requesters: HashMap<u64, Arc<BlockRequester>>,
    witness_requesters: HashMap<u64, Arc<WitnessRequester>>,
    peers: HashMap<PeerId, PeerState>,
    /// Highest tip advertised by any live peer, 0 with no peers.
    max_peer_height: u64,
    last_advance: Instant,
    sync_rate: SyncRateEstimator,
}

impl BlockPool {
    /// Create a pool with its base at `start`. Requests and peer errors are
    /// written to the given sinks; the callers size those channels (the
    /// capacities in [`PoolConfig`] are the intended defaults).
    pub fn new(
        config: PoolConfig,
        start: u64,
        requests_tx: mpsc::Sender<BlockRequest>,
        witness_requests_tx: mpsc::Sender<HeaderRequest>,
        errors_tx: mpsc::Sender<PeerError>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let now = Instant::now();
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            start_height: start,
            num_pending: AtomicI64::new(0),
            requests_tx,
            witness_requests_tx,
            errors_tx,
            shutdown_tx,
            scheduler: Mutex::new(None),
            inner: RwLock::new(PoolInner {
                height: start,
                requesters: HashMap::new(),
                witness_requesters: HashMap::new(),
                peers: HashMap::new(),
                max_peer_height: 0,
                last_advance: now,
                sync_rate: SyncRateEstimator::new(start, now),
            }),
        })
    }

    /// Spawn the scheduler worker. Requesters are created lazily once peers
    /// report ranges covering new heights.
    pub fn start(&self) {
        let Some(pool) = self.weak_self.upgrade() else {
            return;
        };
        {
            let mut inner = self.inner.write();
            let now = Instant::now();
            inner.last_advance = now;
            inner.sync_rate = SyncRateEstimator::new(self.start_height, now);
        }
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(scheduler_loop(pool, shutdown_rx));
        *self.scheduler.lock() = Some(handle);
    }

    /// Stop every worker: the scheduler, all requesters, and any armed peer
    /// timers. No background work survives this call.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
        }
        let inner = self.inner.read();
        for requester in inner.requesters.values() {
            requester.stop();
        }
        for witness in inner.witness_requesters.values() {
            witness.stop();
        }
    }

    /// Base height, pending-block count, and tracked-height count, read
    /// consistently enough for scheduling decisions.
    pub fn status(&self) -> (u64, i64, usize) {
        let inner = self.inner.read();
        (
            inner.height,
            self.num_pending.load(Ordering::SeqCst),
            inner.requesters.len(),
        )
    }

    /// True once at least one peer is known and the base height is within one
    /// block of the best advertised tip. The margin exists because validating
    /// block H needs H+1's commit.
    pub fn is_caught_up(&self) -> bool {
        let inner = self.inner.read();
        if inner.peers.is_empty() {
            return false;
        }
        inner.height >= inner.max_peer_height.saturating_sub(1)
    }

    /// Delivered block at the base height, if any.
    pub fn peek_block(&self) -> Option<Block> {
        let inner = self.inner.read();
        inner
            .requesters
            .get(&inner.height)
            .and_then(|requester| requester.block())
    }

    /// Delivered blocks at the base height and the one above it. The second
    /// block carries the commit needed to validate the first, so the consumer
    /// peeks both before popping either.
    pub fn peek_two_blocks(&self) -> (Option<Block>, Option<Block>) {
        let inner = self.inner.read();
        let first = inner
            .requesters
            .get(&inner.height)
            .and_then(|requester| requester.block());
        let second = inner
            .requesters
            .get(&(inner.height + 1))
            .and_then(|requester| requester.block());
        (first, second)
    }

    /// Advance past the base height after the consumer accepted its block.
    ///
    /// Panics when no requester exists at the base height: popping an
    /// untracked height is a consumer sequencing bug, not a recoverable
    /// condition.
    pub fn pop_request(&self) {
        let mut inner = self.inner.write();
        let height = inner.height;
        let Some(requester) = inner.requesters.remove(&height) else {
            panic!("no requester at height {height} to pop");
        };
        requester.stop();
        if requester.block().is_none() {
            self.num_pending.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(peer_id) = requester.outstanding() {
            release_peer_reservation(&mut inner, peer_id);
        }
        if let Some(witness) = inner.witness_requesters.remove(&height) {
            witness.stop();
            if let Some(peer_id) = witness.outstanding() {
                release_peer_reservation(&mut inner, peer_id);
            }
        }
        inner.height += 1;
        let now = Instant::now();
        inner.last_advance = now;
        let new_base = inner.height;
        inner.sync_rate.on_advance(new_base, now);
    }

    /// Invalidate the assignment at `height` by removing its peer, which
    /// forces every height held by that peer to reassign. Returns the removed
    /// peer, or `None` when the height is untracked or unassigned.
    pub fn redo_request(&self, height: u64) -> Option<PeerId> {
        let mut inner = self.inner.write();
        let peer_id = inner
            .requesters
            .get(&height)
            .and_then(|requester| requester.peer_id())?;
        self.remove_peer_locked(&mut inner, peer_id);
        Some(peer_id)
    }

    /// Upsert a peer's advertised range. Outstanding requests to the peer are
    /// left in flight.
    pub fn set_peer_range(&self, peer_id: PeerId, base: u64, tip: u64) {
        let mut inner = self.inner.write();
        match inner.peers.get_mut(&peer_id) {
            Some(peer) => {
                peer.base = base;
                peer.tip = tip;
            }
            None => {
                debug!(peer_id = ?peer_id, base, tip, "tracking new peer");
                inner.peers.insert(
                    peer_id,
                    PeerState::new(
                        peer_id,
                        base,
                        tip,
                        self.config.min_recv_rate,
                        self.config.recv_rate_window,
                        Instant::now(),
                    ),
                );
            }
        }
        if tip > inner.max_peer_height {
            inner.max_peer_height = tip;
        }
    }

    /// Forget a peer and redo every height assigned to it. No-op for unknown
    /// peers.
    pub fn remove_peer(&self, peer_id: PeerId) {
        let mut inner = self.inner.write();
        self.remove_peer_locked(&mut inner, peer_id);
    }

    /// Record a block response from a peer. Never fails visibly; rejected
    /// deliveries surface on the peer-error sink instead.
    pub async fn add_block(&self, peer_id: PeerId, block: Block, block_size: usize) {
        let height = block.height();
        let mut rejection = None;
        {
            let mut inner = self.inner.write();
            match inner.requesters.get(&height).cloned() {
                None => {
                    let base = inner.height;
                    let gap = base.abs_diff(height);
                    if gap > self.config.max_received_height_gap {
                        warn!(
                            peer_id = ?peer_id,
                            height,
                            base,
                            "peer sent an unexpected block far outside the tracked window"
                        );
                        rejection = Some("unexpected block with height too far from the base");
                    } else {
                        debug!(
                            peer_id = ?peer_id,
                            height,
                            base,
                            "dropping block with no matching requester"
                        );
                    }
                }
                Some(requester) => {
                    if requester.set_block(block, peer_id) {
                        self.num_pending.fetch_sub(1, Ordering::SeqCst);
                        self.record_peer_receipt(&mut inner, peer_id, block_size);
                    } else {
                        warn!(
                            peer_id = ?peer_id,
                            height,
                            assigned = ?requester.peer_id(),
                            "block response from the wrong peer, or the height is already filled"
                        );
                        rejection = Some("block response from wrong peer or block already received");
                    }
                }
            }
        }
        if let Some(reason) = rejection {
            self.send_error(peer_id, reason).await;
        }
    }

    /// Record a witness header response. Headers nobody asked for are dropped;
    /// signature verification happens downstream.
    pub fn add_header(&self, header: Header) {
        let mut inner = self.inner.write();
        let height = header.height;
        let Some(witness) = inner.witness_requesters.get(&height).cloned() else {
            debug!(height, base = inner.height, "dropping header with no matching witness requester");
            return;
        };
        let size = header.encoded_len();
        if witness.set_header(header) {
            if let Some(peer_id) = witness.peer_id() {
                self.record_peer_receipt(&mut inner, peer_id, size);
            }
        } else {
            debug!(height, "duplicate header delivery ignored");
        }
    }

    /// Highest tip advertised by any live peer, 0 with no peers.
    pub fn max_peer_height(&self) -> u64 {
        self.inner.read().max_peer_height
    }

    /// When the consumer last popped a block (or the pool started).
    pub fn last_advance(&self) -> Instant {
        self.inner.read().last_advance
    }

    /// Smoothed sync throughput in blocks/sec, 0 until the first full
    /// measurement window completes.
    pub fn last_sync_rate(&self) -> f64 {
        self.inner.read().sync_rate.rate()
    }

    /// Total number of blocks this sync is expected to cover.
    pub fn target_blocks(&self) -> u64 {
        let inner = self.inner.read();
        (inner.max_peer_height + 1).saturating_sub(self.start_height)
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// A redone requester puts its already-delivered block back into the
    /// pending count.
    pub(crate) fn restore_pending(&self) {
        self.num_pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) async fn send_block_request(&self, height: u64, peer_id: PeerId) -> bool {
        self.requests_tx
            .send(BlockRequest { height, peer_id })
            .await
            .is_ok()
    }

    pub(crate) async fn send_header_request(&self, height: u64, peer_id: PeerId) -> bool {
        self.witness_requests_tx
            .send(HeaderRequest { height, peer_id })
            .await
            .is_ok()
    }

    async fn send_error(&self, peer_id: PeerId, reason: &str) {
        let _ = self
            .errors_tx
            .send(PeerError {
                peer_id,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Pick a peer able to serve `height`, reserving one in-flight slot on it.
    /// Tombstoned peers encountered along the way are removed in place.
    ///
    /// Peers other than the one holding the height's witness assignment are
    /// preferred. When the witness's peer is the only eligible source, the
    /// block takes it and the witness gives way: its reservation is released
    /// and it is redone, so block and header keep coming from different
    /// sources.
    pub(crate) fn pick_available_peer(&self, height: u64) -> Option<PeerId> {
        let mut inner = self.inner.write();
        let witness_peer = inner
            .witness_requesters
            .get(&height)
            .and_then(|witness| witness.peer_id());
        if let Some(peer_id) = self.pick_from(&mut inner, height, witness_peer) {
            return Some(peer_id);
        }
        witness_peer?;
        let peer_id = self.pick_from(&mut inner, height, None)?;
        if let Some(witness) = inner.witness_requesters.get(&height).cloned() {
            if witness.peer_id() == Some(peer_id) {
                if witness.outstanding() == Some(peer_id) {
                    release_peer_reservation(&mut inner, peer_id);
                }
                witness.redo(peer_id);
            }
        }
        Some(peer_id)
    }

    /// Like [`Self::pick_available_peer`], but for the witness header: the
    /// peer serving the block at the same height is excluded. Declines to pick
    /// while the block requester has not committed to a peer yet, since the
    /// exclusion would be meaningless.
    pub(crate) fn pick_available_witness_peer(&self, height: u64) -> Option<PeerId> {
        let mut inner = self.inner.write();
        let block_peer = inner
            .requesters
            .get(&height)
            .and_then(|requester| requester.peer_id())?;
        self.pick_from(&mut inner, height, Some(block_peer))
    }

    fn pick_from(
        &self,
        inner: &mut PoolInner,
        height: u64,
        excluded: Option<PeerId>,
    ) -> Option<PeerId> {
        let tombstoned: Vec<PeerId> = inner
            .peers
            .values()
            .filter(|peer| peer.timed_out)
            .map(|peer| peer.id)
            .collect();
        for peer_id in tombstoned {
            self.remove_peer_locked(inner, peer_id);
        }

        let cap = self.config.max_pending_requests_per_peer;
        let peer_id = inner
            .peers
            .values()
            .find(|peer| peer.in_flight < cap && peer.covers(height) && Some(peer.id) != excluded)
            .map(|peer| peer.id)?;
        if let Some(peer) = inner.peers.get_mut(&peer_id) {
            if peer.begin_request(Instant::now()) {
                self.arm_idle_timer(peer);
            }
        }
        Some(peer_id)
    }

    fn remove_peer_locked(&self, inner: &mut PoolInner, peer_id: PeerId) {
        for requester in inner.requesters.values() {
            if requester.peer_id() == Some(peer_id) {
                requester.redo(peer_id);
            }
        }
        for witness in inner.witness_requesters.values() {
            if witness.peer_id() == Some(peer_id) {
                witness.redo(peer_id);
            }
        }
        let Some(peer) = inner.peers.remove(&peer_id) else {
            return;
        };
        debug!(
            peer_id = ?peer_id,
            connected_for = ?peer.connected_at.elapsed(),
            "peer removed"
        );
        if peer.tip == inner.max_peer_height {
            inner.max_peer_height = inner.peers.values().map(|peer| peer.tip).max().unwrap_or(0);
        }
    }

    /// Account a delivery of `bytes` against the peer and keep its idle timer
    /// honest.
    fn record_peer_receipt(&self, inner: &mut PoolInner, peer_id: PeerId, bytes: usize) {
        if let Some(peer) = inner.peers.get_mut(&peer_id) {
            match peer.record_receipt(bytes, Instant::now()) {
                TimerAction::Cancel => peer.invalidate_timer(),
                TimerAction::Rearm => self.arm_idle_timer(peer),
            }
        }
    }

    /// Arm (or push out) the peer's idle timer. The previous timer task, if
    /// any, is invalidated by the generation bump and goes inert on fire.
    fn arm_idle_timer(&self, peer: &mut PeerState) {
        peer.invalidate_timer();
        let generation = peer.timer_generation;
        let peer_id = peer.id;
        let timeout = self.config.peer_timeout;
        let Some(pool) = self.weak_self.upgrade() else {
            return;
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => pool.on_idle_timeout(peer_id, generation).await,
                _ = stopped(&mut shutdown_rx) => {}
            }
        });
    }

    /// Idle timer callback. Re-checks the peer under the lock: a reset or
    /// cancel that raced with the dispatch shows up as a stale generation.
    async fn on_idle_timeout(&self, peer_id: PeerId, generation: u64) {
        let fired = {
            let mut inner = self.inner.write();
            match inner.peers.get_mut(&peer_id) {
                Some(peer)
                    if peer.timer_generation == generation
                        && peer.in_flight > 0
                        && !peer.timed_out =>
                {
                    peer.timed_out = true;
                    true
                }
                _ => false,
            }
        };
        if fired {
            warn!(peer_id = ?peer_id, timeout = ?self.config.peer_timeout, "peer idle timeout");
            self.send_error(peer_id, "peer did not send us anything").await;
        }
    }

    /// Flag busy peers whose receive rate stalled, then sweep out every
    /// tombstoned peer.
    async fn sweep_timed_out_peers(&self) {
        let mut stalled = Vec::new();
        {
            let mut inner = self.inner.write();
            let min_rate = self.config.min_recv_rate;
            for peer in inner.peers.values_mut() {
                if peer.timed_out || peer.in_flight == 0 {
                    continue;
                }
                let rate = peer.recv_monitor.rate();
                if rate != 0.0 && rate < min_rate {
                    warn!(
                        peer_id = ?peer.id,
                        rate_bps = rate,
                        min_rate_bps = min_rate,
                        "peer receive rate below minimum"
                    );
                    peer.timed_out = true;
                    stalled.push(peer.id);
                }
            }
            let tombstoned: Vec<PeerId> = inner
                .peers
                .values()
                .filter(|peer| peer.timed_out)
                .map(|peer| peer.id)
                .collect();
            for peer_id in tombstoned {
                self.remove_peer_locked(&mut inner, peer_id);
            }
        }
        for peer_id in stalled {
            self.send_error(peer_id, "peer is not sending us data fast enough")
                .await;
        }
    }

    /// Track the next height above the current frontier, if any peer
    /// advertises it. Returns false when the frontier already covers the best
    /// tip.
    fn make_next_requester(&self) -> bool {
        let Some(pool) = self.weak_self.upgrade() else {
            return false;
        };
        let mut inner = self.inner.write();
        let next_height = inner.height + inner.requesters.len() as u64;
        if inner.max_peer_height == 0 || next_height > inner.max_peer_height {
            return false;
        }
        debug!(height = next_height, "tracking new height");

        let (requester, mailbox) = BlockRequester::new(next_height);
        let (witness, witness_mailbox) = WitnessRequester::new(next_height);
        inner.requesters.insert(next_height, Arc::clone(&requester));
        inner
            .witness_requesters
            .insert(next_height, Arc::clone(&witness));
        self.num_pending.fetch_add(1, Ordering::SeqCst);

        requester.start(Arc::clone(&pool), mailbox, self.shutdown_tx.subscribe());
        witness.start(pool, witness_mailbox, self.shutdown_tx.subscribe());
        true
    }
}

fn release_peer_reservation(inner: &mut PoolInner, peer_id: PeerId) {
    if let Some(peer) = inner.peers.get_mut(&peer_id) {
        if peer.release_request() {
            peer.invalidate_timer();
        }
    }
}

/// Scheduler worker: grow the requester window while under the pending and
/// total caps, otherwise back off briefly and sweep for dead peers.
async fn scheduler_loop(pool: Arc<BlockPool>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        let (_, num_pending, num_requesters) = pool.status();
        let saturated = num_pending >= pool.config().max_pending_requests as i64
            || num_requesters >= pool.config().max_total_requesters;
        if saturated || !pool.make_next_requester() {
            tokio::select! {
                _ = tokio::time::sleep(pool.config().request_interval) => {}
                _ = stopped(&mut shutdown_rx) => return,
            }
            pool.sweep_timed_out_peers().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, B256};
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        pool: Arc<BlockPool>,
        requests_rx: mpsc::Receiver<BlockRequest>,
        witness_rx: mpsc::Receiver<HeaderRequest>,
        errors_rx: mpsc::Receiver<PeerError>,
    }

    fn fixture(start: u64, config: PoolConfig) -> Fixture {
        let (requests_tx, requests_rx) = mpsc::channel(config.max_total_requesters.max(1));
        let (witness_tx, witness_rx) = mpsc::channel(config.max_total_requesters.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(config.max_peer_err_buffer);
        let pool = BlockPool::new(config, start, requests_tx, witness_tx, errors_tx);
        Fixture {
            pool,
            requests_rx,
            witness_rx,
            errors_rx,
        }
    }

    fn test_config() -> PoolConfig {
        PoolConfig::default()
    }

    fn peer(n: u8) -> PeerId {
        PeerId::repeat_byte(n)
    }

    fn header(height: u64) -> Header {
        Header {
            height,
            hash: B256::repeat_byte(height as u8),
            parent_hash: B256::repeat_byte(height.wrapping_sub(1) as u8),
            last_commit_hash: B256::ZERO,
            time_ms: height * 1_000,
        }
    }

    fn block(height: u64) -> Block {
        Block {
            header: header(height),
            data: Bytes::from(vec![0u8; 64]),
        }
    }

    async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
        timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("channel receive timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn happy_path_downloads_in_order_and_catches_up() {
        let mut fx = fixture(1, test_config());
        let a = peer(0xaa);
        fx.pool.set_peer_range(a, 1, 3);
        fx.pool.start();

        let mut heights = Vec::new();
        for _ in 0..3 {
            let request = recv(&mut fx.requests_rx).await;
            assert_eq!(request.peer_id, a);
            heights.push(request.height);
        }
        heights.sort_unstable();
        assert_eq!(heights, vec![1, 2, 3]);

        for height in 1..=3 {
            let delivered = block(height);
            let size = delivered.encoded_len();
            fx.pool.add_block(a, delivered, size).await;
        }

        let (first, second) = fx.pool.peek_two_blocks();
        assert_eq!(first.expect("block at base").height(), 1);
        assert_eq!(second.expect("block above base").height(), 2);

        for _ in 0..3 {
            fx.pool.pop_request();
        }
        let (height, num_pending, num_requesters) = fx.pool.status();
        assert_eq!(height, 4);
        assert_eq!(num_pending, 0);
        assert_eq!(num_requesters, 0);
        assert!(fx.pool.is_caught_up());
        fx.pool.stop();
    }

    #[tokio::test]
    async fn block_from_wrong_peer_is_rejected() {
        let config = PoolConfig {
            max_total_requesters: 1,
            max_pending_requests: 1,
            ..test_config()
        };
        let mut fx = fixture(1, config);
        let a = peer(0x0a);
        let b = peer(0x0b);
        fx.pool.set_peer_range(a, 1, 5);
        fx.pool.start();

        let request = recv(&mut fx.requests_rx).await;
        assert_eq!(
            request,
            BlockRequest {
                height: 1,
                peer_id: a
            }
        );

        fx.pool.set_peer_range(b, 1, 5);
        let delivered = block(1);
        let size = delivered.encoded_len();
        fx.pool.add_block(b, delivered, size).await;

        let error = recv(&mut fx.errors_rx).await;
        assert_eq!(error.peer_id, b);
        assert!(fx.pool.peek_block().is_none());
    }

    #[tokio::test]
    async fn removing_a_peer_reassigns_its_heights() {
        let config = PoolConfig {
            max_total_requesters: 5,
            max_pending_requests: 5,
            ..test_config()
        };
        let mut fx = fixture(1, config);
        let a = peer(0x0a);
        let b = peer(0x0b);
        fx.pool.set_peer_range(a, 1, 10);
        fx.pool.start();

        let mut first = Vec::new();
        for _ in 0..5 {
            let request = recv(&mut fx.requests_rx).await;
            assert_eq!(request.peer_id, a);
            first.push(request.height);
        }
        first.sort_unstable();
        assert_eq!(first, vec![1, 2, 3, 4, 5]);

        fx.pool.set_peer_range(b, 1, 10);
        fx.pool.remove_peer(a);

        let mut second = Vec::new();
        for _ in 0..5 {
            let request = recv(&mut fx.requests_rx).await;
            assert_eq!(request.peer_id, b);
            second.push(request.height);
        }
        second.sort_unstable();
        assert_eq!(second, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_heights_reassign() {
        let config = PoolConfig {
            peer_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        };
        let mut fx = fixture(1, config);
        let a = peer(0x0a);
        fx.pool.set_peer_range(a, 1, 2);
        fx.pool.start();

        for _ in 0..2 {
            let request = recv(&mut fx.requests_rx).await;
            assert_eq!(request.peer_id, a);
        }

        let error = recv(&mut fx.errors_rx).await;
        assert_eq!(error.peer_id, a);
        assert!(error.reason.contains("did not send"));

        // The sweep reclaims the tombstoned peer; a fresh peer picks the
        // heights back up without supervisor help.
        let b = peer(0x0b);
        fx.pool.set_peer_range(b, 1, 2);
        for _ in 0..2 {
            let request = recv(&mut fx.requests_rx).await;
            assert_eq!(request.peer_id, b);
        }
    }

    #[tokio::test]
    async fn slow_peer_is_evicted() {
        let config = PoolConfig {
            recv_rate_window: Duration::from_millis(10),
            peer_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let mut fx = fixture(1, config);
        let a = peer(0x0a);
        fx.pool.set_peer_range(a, 1, 3);
        fx.pool.start();

        for _ in 0..3 {
            let request = recv(&mut fx.requests_rx).await;
            assert_eq!(request.peer_id, a);
        }

        // A trickle of bytes, far below the minimum acceptable rate.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered = block(1);
        fx.pool.add_block(a, delivered, 16).await;

        let error = recv(&mut fx.errors_rx).await;
        assert_eq!(error.peer_id, a);
        assert!(error.reason.contains("fast enough"));
    }

    #[tokio::test]
    async fn unexpected_blocks_far_from_base_raise_errors() {
        let config = PoolConfig {
            max_total_requesters: 5,
            max_pending_requests: 5,
            ..test_config()
        };
        let mut fx = fixture(100, config);
        let a = peer(0x0a);
        fx.pool.set_peer_range(a, 100, 300);
        fx.pool.start();

        let request = recv(&mut fx.requests_rx).await;
        assert_eq!(request.peer_id, a);

        // 150 heights above the base: protocol violation.
        fx.pool.add_block(a, block(250), 64).await;
        let error = recv(&mut fx.errors_rx).await;
        assert_eq!(error.peer_id, a);

        // 50 above: just a stale response, dropped without an error.
        fx.pool.add_block(a, block(150), 64).await;
        assert!(timeout(Duration::from_millis(100), fx.errors_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn witness_uses_a_different_peer_than_the_block() {
        let config = PoolConfig {
            max_total_requesters: 1,
            max_pending_requests: 1,
            ..test_config()
        };
        let mut fx = fixture(1, config);
        fx.pool.set_peer_range(peer(0x0a), 1, 5);
        fx.pool.set_peer_range(peer(0x0b), 1, 5);
        fx.pool.start();

        let block_request = recv(&mut fx.requests_rx).await;
        let witness_request = recv(&mut fx.witness_rx).await;
        assert_eq!(block_request.height, 1);
        assert_eq!(witness_request.height, 1);
        assert_ne!(witness_request.peer_id, block_request.peer_id);
    }

    #[tokio::test]
    async fn block_redo_never_settles_on_the_witness_peer() {
        let config = PoolConfig {
            max_total_requesters: 1,
            max_pending_requests: 1,
            ..test_config()
        };
        let mut fx = fixture(1, config);
        fx.pool.set_peer_range(peer(0x0a), 1, 5);
        fx.pool.set_peer_range(peer(0x0b), 1, 5);
        fx.pool.start();

        let block_request = recv(&mut fx.requests_rx).await;
        let witness_request = recv(&mut fx.witness_rx).await;
        assert_ne!(block_request.peer_id, witness_request.peer_id);

        // Removing the block's peer leaves only the witness's peer eligible:
        // the block takes it over and the witness has to reselect.
        fx.pool.remove_peer(block_request.peer_id);
        let reassigned = recv(&mut fx.requests_rx).await;
        assert_eq!(reassigned.peer_id, witness_request.peer_id);

        // The displaced witness waits for a source other than the block's,
        // and lands on the next peer to show up.
        let c = peer(0x0c);
        fx.pool.set_peer_range(c, 1, 5);
        let rewitnessed = recv(&mut fx.witness_rx).await;
        assert_eq!(rewitnessed.peer_id, c);
        assert_ne!(rewitnessed.peer_id, reassigned.peer_id);
    }

    #[tokio::test]
    async fn header_delivery_fills_the_witness_slot_once() {
        let config = PoolConfig {
            max_total_requesters: 1,
            max_pending_requests: 1,
            ..test_config()
        };
        let mut fx = fixture(1, config);
        fx.pool.set_peer_range(peer(0x0a), 1, 5);
        fx.pool.set_peer_range(peer(0x0b), 1, 5);
        fx.pool.start();

        let _ = recv(&mut fx.requests_rx).await;
        let witness_request = recv(&mut fx.witness_rx).await;
        assert_eq!(witness_request.height, 1);

        fx.pool.add_header(header(1));
        // Duplicates and headers nobody asked for are dropped quietly.
        fx.pool.add_header(header(1));
        fx.pool.add_header(header(42));
        assert!(timeout(Duration::from_millis(50), fx.errors_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn redo_request_removes_the_assigned_peer() {
        let config = PoolConfig {
            max_total_requesters: 1,
            max_pending_requests: 1,
            ..test_config()
        };
        let mut fx = fixture(1, config);
        let a = peer(0x0a);
        fx.pool.set_peer_range(a, 1, 5);
        fx.pool.start();

        let request = recv(&mut fx.requests_rx).await;
        assert_eq!(request.peer_id, a);

        assert_eq!(fx.pool.redo_request(1), Some(a));
        assert_eq!(fx.pool.max_peer_height(), 0);

        let b = peer(0x0b);
        fx.pool.set_peer_range(b, 1, 5);
        let request = recv(&mut fx.requests_rx).await;
        assert_eq!(request.peer_id, b);
    }

    #[tokio::test]
    async fn redo_request_on_an_untracked_height_is_a_noop() {
        let fx = fixture(1, test_config());
        assert_eq!(fx.pool.redo_request(99), None);
    }

    #[tokio::test]
    #[should_panic(expected = "no requester at height")]
    async fn pop_without_a_requester_panics() {
        let fx = fixture(1, test_config());
        fx.pool.pop_request();
    }

    #[test]
    fn peer_ranges_track_the_best_tip() {
        let fx = fixture(1, test_config());
        assert_eq!(fx.pool.max_peer_height(), 0);
        assert_eq!(fx.pool.target_blocks(), 0);

        fx.pool.set_peer_range(peer(1), 1, 10);
        fx.pool.set_peer_range(peer(2), 1, 20);
        assert_eq!(fx.pool.max_peer_height(), 20);
        assert_eq!(fx.pool.target_blocks(), 20);

        fx.pool.remove_peer(peer(2));
        assert_eq!(fx.pool.max_peer_height(), 10);
        fx.pool.remove_peer(peer(1));
        assert_eq!(fx.pool.max_peer_height(), 0);
    }

    #[test]
    fn caught_up_needs_a_peer_and_proximity_to_the_best_tip() {
        let fx = fixture(10, test_config());
        assert!(!fx.pool.is_caught_up());

        fx.pool.set_peer_range(peer(1), 1, 11);
        assert!(fx.pool.is_caught_up());

        fx.pool.set_peer_range(peer(2), 1, 40);
        assert!(!fx.pool.is_caught_up());
    }
}
