//! Gossip target selection.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Peer {
    pub id: String,
}

impl Peer {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Strategy for picking the next gossip target.
pub trait PeerSelector {
    fn peers(&self) -> &[Peer];
    /// Remember the last contacted peer so it can be avoided next round.
    fn update_last(&mut self, peer: &str);
    fn next(&mut self) -> Option<Peer>;
}

/// Uniform choice over the peer set, excluding self and — when more than
/// one candidate remains — the last contacted peer.
pub struct RandomPeerSelector {
    peers: Vec<Peer>,
    last: Option<String>,
    rng: StdRng,
}

impl RandomPeerSelector {
    pub fn new(participants: &[Peer], local_id: &str) -> Self {
        Self::with_rng(participants, local_id, StdRng::from_entropy())
    }

    /// Seeded variant for deterministic tests.
    pub fn with_seed(participants: &[Peer], local_id: &str, seed: u64) -> Self {
        Self::with_rng(participants, local_id, StdRng::seed_from_u64(seed))
    }

    fn with_rng(participants: &[Peer], local_id: &str, rng: StdRng) -> Self {
        let peers = participants
            .iter()
            .filter(|p| p.id != local_id)
            .cloned()
            .collect();
        Self {
            peers,
            last: None,
            rng,
        }
    }
}

impl PeerSelector for RandomPeerSelector {
    fn peers(&self) -> &[Peer] {
        &self.peers
    }

    fn update_last(&mut self, peer: &str) {
        self.last = Some(peer.to_string());
    }

    fn next(&mut self) -> Option<Peer> {
        let selectable: Vec<&Peer> = if self.peers.len() > 1 {
            self.peers
                .iter()
                .filter(|p| Some(&p.id) != self.last.as_ref())
                .collect()
        } else {
            self.peers.iter().collect()
        };
        if selectable.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..selectable.len());
        Some(selectable[i].clone())
    }
}
