//! Peer-driven block pool for catching a replicated node up to the chain tip.
//!
//! Peers self-report the block range they hold. Starting from the pool's base
//! height, a requester task per height picks an eligible peer, solicits the
//! block over the block-request sink, and waits for the delivery. Completed
//! blocks are handed to the consumer in strict ascending order with a
//! two-block lookahead, because validating block H requires the commit carried
//! by block H+1.
//!
//! # Protocol Overview
//!
//! 1. **Peer discovery**: the transport reports each peer's available range
//!    via [`BlockPool::set_peer_range`]; the pool tracks the best tip.
//!
//! 2. **Parallel fetching**: a scheduler worker grows a contiguous window of
//!    tracked heights upward from the base; each height is driven by its own
//!    requester, balanced across peers under per-peer and global caps.
//!
//! 3. **Witness cross-check**: for every height a second requester fetches the
//!    header from a peer *different* from the one serving the block, so the
//!    consumer can cross-check the two sources.
//!
//! 4. **Misbehaviour handling**: slow, silent, or protocol-violating peers are
//!    reported on the peer-error sink. The surrounding supervisor is expected
//!    to disconnect them via [`BlockPool::remove_peer`], which reassigns all
//!    of their outstanding heights to other peers.
//!
//! The pool owns no transport, storage, or verification logic; it only
//! schedules. Requests and errors flow out over bounded channels handed in at
//! construction, and responses flow back in through [`BlockPool::add_block`]
//! and [`BlockPool::add_header`].

mod config;
mod peer;
mod pool;
mod requester;
mod stats;
mod types;

pub use config::PoolConfig;
pub use pool::BlockPool;
pub use types::{Block, BlockRequest, Header, HeaderRequest, PeerError, PeerId};
