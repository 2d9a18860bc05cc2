//! Per-height requester state machines.
//!
//! A block requester owns one height: it picks an eligible peer, emits a
//! request on the block-request sink, and waits for either the delivery pulse
//! or a redo naming its current peer. A redo only takes effect while the
//! requester is still assigned to the named peer; anything else is a stale
//! signal about an assignment that has already been replaced. A witness
//! requester runs the same loop for the header, sourced from a peer different
//! from the one serving the block.

use crate::pool::BlockPool;
use crate::types::{Block, Header, PeerId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Resolves once the pool's stop flag flips (or the pool is gone).
pub(crate) async fn stopped(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Receiver halves of a requester's single-slot signals, handed to its worker
/// task at start.
pub(crate) struct Mailbox {
    redo_rx: mpsc::Receiver<PeerId>,
    delivered_rx: mpsc::Receiver<()>,
}

#[derive(Debug)]
struct Assignment<T> {
    peer_id: Option<PeerId>,
    payload: Option<T>,
}

impl<T> Default for Assignment<T> {
    fn default() -> Self {
        Self {
            peer_id: None,
            payload: None,
        }
    }
}

/// Coordinator for the block at one height.
pub(crate) struct BlockRequester {
    height: u64,
    state: Mutex<Assignment<Block>>,
    redo_tx: mpsc::Sender<PeerId>,
    delivered_tx: mpsc::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BlockRequester {
    pub(crate) fn new(height: u64) -> (Arc<Self>, Mailbox) {
        let (redo_tx, redo_rx) = mpsc::channel(1);
        let (delivered_tx, delivered_rx) = mpsc::channel(1);
        let requester = Arc::new(Self {
            height,
            state: Mutex::new(Assignment::default()),
            redo_tx,
            delivered_tx,
            task: Mutex::new(None),
        });
        (
            requester,
            Mailbox {
                redo_rx,
                delivered_rx,
            },
        )
    }

    pub(crate) fn start(
        self: &Arc<Self>,
        pool: Arc<BlockPool>,
        mailbox: Mailbox,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let handle = tokio::spawn(block_request_loop(
            pool,
            Arc::clone(self),
            mailbox,
            shutdown_rx,
        ));
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn peer_id(&self) -> Option<PeerId> {
        self.state.lock().peer_id
    }

    pub(crate) fn block(&self) -> Option<Block> {
        self.state.lock().payload.clone()
    }

    /// The peer still owing us a response, if any.
    pub(crate) fn outstanding(&self) -> Option<PeerId> {
        let state = self.state.lock();
        if state.payload.is_none() {
            state.peer_id
        } else {
            None
        }
    }

    /// Store a delivered block. Accepts only the first delivery, and only from
    /// the currently assigned peer.
    pub(crate) fn set_block(&self, block: Block, from: PeerId) -> bool {
        let mut state = self.state.lock();
        if state.payload.is_some() || state.peer_id != Some(from) {
            return false;
        }
        state.payload = Some(block);
        drop(state);
        let _ = self.delivered_tx.try_send(());
        true
    }

    /// Ask the worker to drop its assignment if it still points at `peer_id`.
    /// Non-blocking; a redo already pending absorbs this one.
    pub(crate) fn redo(&self, peer_id: PeerId) {
        let _ = self.redo_tx.try_send(peer_id);
    }

    /// Abort the worker task. Idempotent.
    pub(crate) fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Clear the assignment after an effective redo. A block that had already
    /// been stored goes back into the pool's pending count.
    fn reset(&self, pool: &BlockPool) {
        let mut state = self.state.lock();
        if state.payload.is_some() {
            pool.restore_pending();
        }
        state.peer_id = None;
        state.payload = None;
    }
}

async fn block_request_loop(
    pool: Arc<BlockPool>,
    requester: Arc<BlockRequester>,
    mailbox: Mailbox,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Mailbox {
        mut redo_rx,
        mut delivered_rx,
    } = mailbox;
    let height = requester.height;

    'assign: loop {
        // Pick a peer to send the request to.
        let peer_id = loop {
            if *shutdown_rx.borrow() {
                return;
            }
            if let Some(peer_id) = pool.pick_available_peer(height) {
                break peer_id;
            }
            tokio::select! {
                _ = tokio::time::sleep(pool.config().request_interval) => {}
                _ = stopped(&mut shutdown_rx) => return,
            }
        };
        requester.state.lock().peer_id = Some(peer_id);

        tokio::select! {
            sent = pool.send_block_request(height, peer_id) => {
                if !sent {
                    return;
                }
            }
            _ = stopped(&mut shutdown_rx) => return,
        }

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown_rx) => return,
                redo = redo_rx.recv() => match redo {
                    Some(from) if requester.peer_id() == Some(from) => {
                        requester.reset(&pool);
                        continue 'assign;
                    }
                    // Stale redo about a peer we already left.
                    Some(_) => {}
                    None => return,
                },
                // Delivered; park here until a redo or teardown.
                _ = delivered_rx.recv() => {}
            }
        }
    }
}

/// Coordinator for the witness header at one height. Must source the header
/// from a peer other than the one assigned to the block requester.
pub(crate) struct WitnessRequester {
    height: u64,
    state: Mutex<Assignment<Header>>,
    redo_tx: mpsc::Sender<PeerId>,
    delivered_tx: mpsc::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WitnessRequester {
    pub(crate) fn new(height: u64) -> (Arc<Self>, Mailbox) {
        let (redo_tx, redo_rx) = mpsc::channel(1);
        let (delivered_tx, delivered_rx) = mpsc::channel(1);
        let requester = Arc::new(Self {
            height,
            state: Mutex::new(Assignment::default()),
            redo_tx,
            delivered_tx,
            task: Mutex::new(None),
        });
        (
            requester,
            Mailbox {
                redo_rx,
                delivered_rx,
            },
        )
    }

    pub(crate) fn start(
        self: &Arc<Self>,
        pool: Arc<BlockPool>,
        mailbox: Mailbox,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let handle = tokio::spawn(witness_request_loop(
            pool,
            Arc::clone(self),
            mailbox,
            shutdown_rx,
        ));
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn peer_id(&self) -> Option<PeerId> {
        self.state.lock().peer_id
    }

    /// The peer still owing us a header, if any.
    pub(crate) fn outstanding(&self) -> Option<PeerId> {
        let state = self.state.lock();
        if state.payload.is_none() {
            state.peer_id
        } else {
            None
        }
    }

    /// Store a delivered header. Only the first delivery is kept; the header's
    /// signatures are checked downstream.
    pub(crate) fn set_header(&self, header: Header) -> bool {
        let mut state = self.state.lock();
        if state.payload.is_some() {
            return false;
        }
        state.payload = Some(header);
        drop(state);
        let _ = self.delivered_tx.try_send(());
        true
    }

    /// Ask the worker to drop its assignment if it still points at `peer_id`.
    pub(crate) fn redo(&self, peer_id: PeerId) {
        let _ = self.redo_tx.try_send(peer_id);
    }

    /// Abort the worker task. Idempotent.
    pub(crate) fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.peer_id = None;
        state.payload = None;
    }
}

async fn witness_request_loop(
    pool: Arc<BlockPool>,
    requester: Arc<WitnessRequester>,
    mailbox: Mailbox,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Mailbox {
        mut redo_rx,
        mut delivered_rx,
    } = mailbox;
    let height = requester.height;

    'assign: loop {
        let peer_id = loop {
            if *shutdown_rx.borrow() {
                return;
            }
            if let Some(peer_id) = pool.pick_available_witness_peer(height) {
                break peer_id;
            }
            tokio::select! {
                _ = tokio::time::sleep(pool.config().request_interval) => {}
                _ = stopped(&mut shutdown_rx) => return,
            }
        };
        requester.state.lock().peer_id = Some(peer_id);

        tokio::select! {
            sent = pool.send_header_request(height, peer_id) => {
                if !sent {
                    return;
                }
            }
            _ = stopped(&mut shutdown_rx) => return,
        }

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown_rx) => return,
                redo = redo_rx.recv() => match redo {
                    Some(from) if requester.peer_id() == Some(from) => {
                        requester.reset();
                        continue 'assign;
                    }
                    Some(_) => {}
                    None => return,
                },
                _ = delivered_rx.recv() => {}
            }
        }
    }
}
