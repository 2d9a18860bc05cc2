//! Shared types for the block pool.

use alloy_primitives::{Bytes, B256, B512};
use serde::{Deserialize, Serialize};

/// Network-layer peer identifier.
pub type PeerId = B512;

/// Block header, also exchanged on its own for witness cross-checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub height: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub last_commit_hash: B256,
    /// Block time in unix milliseconds.
    pub time_ms: u64,
}

impl Header {
    /// Serialized size, used for receive-rate accounting.
    pub fn encoded_len(&self) -> usize {
        // height + three hashes + time
        8 + 32 * 3 + 8
    }
}

/// Full block as delivered by peers. The pool never inspects the payload;
/// verification happens downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub data: Bytes,
}

impl Block {
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Serialized size, used for receive-rate accounting.
    pub fn encoded_len(&self) -> usize {
        self.header.encoded_len() + self.data.len()
    }
}

/// Ask a peer for the block at a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub height: u64,
    pub peer_id: PeerId,
}

/// Ask a peer for the header at a height. Sent to a peer different from the
/// one serving the block so the two can be cross-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRequest {
    pub height: u64,
    pub peer_id: PeerId,
}

/// Advisory misbehaviour report. The supervisor draining this sink is
/// expected to disconnect the peer and call `remove_peer` on the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerError {
    pub peer_id: PeerId,
    pub reason: String,
}
