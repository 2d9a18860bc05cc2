//! End-to-end exercise of the block pool against simulated peers.
//!
//! Builds a synthetic chain, spawns a set of in-process peers with fixed
//! latencies (optionally some that accept requests and never answer), and
//! drives a full sync to caught-up. Prints a single-line JSON summary.

use alloy_primitives::{Bytes, B256};
use blocksync::{
    Block, BlockPool, BlockRequest, Header, HeaderRequest, PeerError, PeerId, PoolConfig,
};
use eyre::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
struct SimPeer {
    latency: Duration,
    /// Accepts requests and never answers; the pool should evict it.
    silent: bool,
}

fn parse_arg(position: usize, default: u64) -> u64 {
    std::env::args()
        .nth(position)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn hash_from_u64(value: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&value.to_be_bytes());
    B256::from(bytes)
}

fn build_chain(blocks: u64) -> Arc<Vec<Block>> {
    let mut chain = Vec::with_capacity(blocks as usize);
    let mut parent_hash = B256::ZERO;
    for height in 1..=blocks {
        let hash = hash_from_u64(height);
        let header = Header {
            height,
            hash,
            parent_hash,
            last_commit_hash: hash_from_u64(height.saturating_sub(1)),
            time_ms: height * 500,
        };
        parent_hash = hash;
        chain.push(Block {
            header,
            data: Bytes::from(vec![0u8; 512]),
        });
    }
    Arc::new(chain)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let blocks = parse_arg(1, 1_500);
    let peer_count = parse_arg(2, 6).max(2);
    let silent_count = parse_arg(3, 1).min(peer_count - 1);

    let chain = build_chain(blocks);
    let mut peers: HashMap<PeerId, SimPeer> = HashMap::new();
    for index in 0..peer_count {
        let id = PeerId::repeat_byte(index as u8 + 1);
        peers.insert(
            id,
            SimPeer {
                latency: Duration::from_millis(1 + index % 5),
                silent: index >= peer_count - silent_count,
            },
        );
    }

    let config = PoolConfig {
        // The simulated silent peers should be evicted well within the run.
        peer_timeout: Duration::from_secs(2),
        ..PoolConfig::default()
    };
    let (requests_tx, mut requests_rx) = mpsc::channel::<BlockRequest>(config.max_total_requesters);
    let (witness_tx, mut witness_rx) = mpsc::channel::<HeaderRequest>(config.max_total_requesters);
    let (errors_tx, mut errors_rx) = mpsc::channel::<PeerError>(config.max_peer_err_buffer);
    let pool = BlockPool::new(config, 1, requests_tx, witness_tx, errors_tx);

    for id in peers.keys() {
        pool.set_peer_range(*id, 1, blocks);
    }
    info!(blocks, peer_count, silent_count, "starting simulated sync");
    pool.start();

    // Transport: answer block requests after the peer's simulated latency.
    let block_pool = Arc::clone(&pool);
    let block_chain = Arc::clone(&chain);
    let block_peers = peers.clone();
    tokio::spawn(async move {
        while let Some(BlockRequest { height, peer_id }) = requests_rx.recv().await {
            let Some(peer) = block_peers.get(&peer_id).copied() else {
                continue;
            };
            if peer.silent {
                continue;
            }
            let pool = Arc::clone(&block_pool);
            let block = block_chain[(height - 1) as usize].clone();
            tokio::spawn(async move {
                tokio::time::sleep(peer.latency).await;
                let size = block.encoded_len();
                pool.add_block(peer_id, block, size).await;
            });
        }
    });

    // Transport: answer witness header requests the same way.
    let header_pool = Arc::clone(&pool);
    let header_chain = Arc::clone(&chain);
    let header_peers = peers.clone();
    tokio::spawn(async move {
        while let Some(HeaderRequest { height, peer_id }) = witness_rx.recv().await {
            let Some(peer) = header_peers.get(&peer_id).copied() else {
                continue;
            };
            if peer.silent {
                continue;
            }
            let pool = Arc::clone(&header_pool);
            let header = header_chain[(height - 1) as usize].header.clone();
            tokio::spawn(async move {
                tokio::time::sleep(peer.latency).await;
                pool.add_header(header);
            });
        }
    });

    // Supervisor: disconnect peers the pool complains about.
    let supervisor_pool = Arc::clone(&pool);
    let evicted = Arc::new(AtomicU64::new(0));
    let evicted_total = Arc::clone(&evicted);
    tokio::spawn(async move {
        while let Some(PeerError { peer_id, reason }) = errors_rx.recv().await {
            warn!(peer_id = ?peer_id, reason = %reason, "peer error; disconnecting");
            supervisor_pool.remove_peer(peer_id);
            evicted_total.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Consumer: drain blocks in order until the pool reports caught-up.
    let started = Instant::now();
    let mut popped = 0u64;
    let mut expected_height = 1u64;
    loop {
        let (first, second) = pool.peek_two_blocks();
        if let (Some(first), Some(_second)) = (first, second) {
            assert_eq!(first.height(), expected_height, "blocks must pop in order");
            expected_height += 1;
            pool.pop_request();
            popped += 1;
            continue;
        }
        if pool.is_caught_up() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let elapsed = started.elapsed();

    info!(
        popped,
        elapsed_ms = elapsed.as_millis() as u64,
        last_sync_rate = pool.last_sync_rate(),
        "sync caught up"
    );
    let summary = json!({
        "blocks_popped": popped,
        "target_blocks": pool.target_blocks(),
        "elapsed_ms": elapsed.as_millis() as u64,
        "last_sync_rate": pool.last_sync_rate(),
        "peers_evicted": evicted.load(Ordering::SeqCst),
    });
    println!("{summary}");

    pool.stop();
    Ok(())
}
