//! Deterministic peer subset selection.
//!
//! Rendezvous hashing: every (CoValue, peer) pair gets a BLAKE3 weight and
//! the heaviest `n` peers are asked. Every node picks the same peers for the
//! same CoValue, and adding a peer only moves the CoValues it wins.

use covalue_core::{CoValueId, PeerId};

/// Weight of `peer` for `id`.
pub fn peer_weight(id: &CoValueId, peer: &PeerId) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"covalue-peer-select-v0:");
    hasher.update(id.as_bytes());
    hasher.update(peer.as_str().as_bytes());
    let mut weight = [0u8; 8];
    weight.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_be_bytes(weight)
}

/// At most `n` peers for `id`, heaviest first.
pub fn select_peers<'a>(
    id: &CoValueId,
    peers: impl IntoIterator<Item = &'a PeerId>,
    n: usize,
) -> Vec<PeerId> {
    let mut weighted: Vec<(u64, &PeerId)> = peers
        .into_iter()
        .map(|peer| (peer_weight(id, peer), peer))
        .collect();
    weighted.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    weighted.dedup_by(|a, b| a.1 == b.1);
    weighted
        .into_iter()
        .take(n)
        .map(|(_, peer)| peer.clone())
        .collect()
}
