//! Peer tracking: last contact, last replicated index, liveness and
//! quorum arithmetic.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::codec::PeerId;

/// Public view of one tracked peer.
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: PeerId,
    /// Caught up, or is the leader itself.
    pub current: bool,
    /// When we last heard from this peer. `None` means never.
    pub last: Option<Instant>,
    /// How many committed entries the peer is behind.
    pub lag: u64,
}

/// Last contact time and last replicated index for one peer.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PeerTrack {
    pub ts: Option<Instant>,
    pub li: u64,
}

/// Tracks group membership. The expected cluster size can exceed the
/// number of peers heard from so far; quorum is always computed against
/// the expected size.
#[derive(Debug)]
pub(crate) struct PeerMap {
    peers: HashMap<PeerId, PeerTrack>,
    cluster_size: usize,
    quorum: usize,
}

impl PeerMap {
    pub fn new(cluster_size: usize) -> PeerMap {
        PeerMap {
            peers: HashMap::new(),
            cluster_size,
            quorum: cluster_size / 2 + 1,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn quorum_needed(&self) -> usize {
        self.quorum
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerTrack> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerTrack> {
        self.peers.get_mut(id)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerTrack)> {
        self.peers.iter()
    }

    /// Stamps the peer as heard from now, inserting it if unknown.
    pub fn observe(&mut self, id: PeerId) {
        self.peers.entry(id).or_default().ts = Some(Instant::now());
    }

    /// Registers a peer without any contact yet.
    pub fn insert_silent(&mut self, id: PeerId) {
        self.peers.entry(id).or_default();
    }

    /// Admits a committed new member, growing the expected cluster size.
    pub fn add_member(&mut self, id: PeerId) {
        self.cluster_size += 1;
        self.quorum = self.cluster_size / 2 + 1;
        self.peers.insert(
            id,
            PeerTrack {
                ts: Some(Instant::now()),
                li: 0,
            },
        );
    }

    /// Removes a committed member, shrinking the expected cluster size.
    pub fn remove_member(&mut self, id: &PeerId) {
        if self.peers.remove(id).is_some() {
            self.cluster_size -= 1;
            self.quorum = self.cluster_size / 2 + 1;
        }
    }

    /// Replaces membership with the leader's view, preserving contact
    /// history for peers we already track.
    pub fn reset_members(&mut self, ids: &[PeerId], cluster_size: usize) {
        let old = std::mem::take(&mut self.peers);
        for id in ids {
            let track = old.get(id).copied().unwrap_or_default();
            self.peers.insert(*id, track);
        }
        self.cluster_size = cluster_size;
        self.quorum = cluster_size / 2 + 1;
    }

    /// Counts nodes alive within `window`, starting at one for ourselves;
    /// `myself` is skipped while iterating so we never count twice.
    pub fn alive_count(&self, myself: &PeerId, window: Duration) -> usize {
        let mut alive = 1;
        for (id, track) in &self.peers {
            if id == myself {
                continue;
            }
            if let Some(ts) = track.ts {
                if ts.elapsed() < window {
                    alive += 1;
                }
            }
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(b: &[u8; 8]) -> PeerId {
        PeerId(*b)
    }

    #[test]
    fn quorum_is_majority_of_expected_size() {
        assert_eq!(PeerMap::new(2).quorum_needed(), 2);
        assert_eq!(PeerMap::new(3).quorum_needed(), 2);
        assert_eq!(PeerMap::new(4).quorum_needed(), 3);
        assert_eq!(PeerMap::new(5).quorum_needed(), 3);
    }

    #[test]
    fn alive_count_includes_self_once() {
        let me = pid(b"aaaaaaaa");
        let other = pid(b"bbbbbbbb");
        let mut peers = PeerMap::new(3);
        peers.observe(me);
        peers.insert_silent(other);

        let window = Duration::from_millis(750);
        // Only ourselves alive: the self entry must not be double counted.
        assert_eq!(peers.alive_count(&me, window), 1);

        peers.observe(other);
        assert_eq!(peers.alive_count(&me, window), 2);
    }

    #[test]
    fn membership_changes_recompute_quorum() {
        let mut peers = PeerMap::new(3);
        peers.add_member(pid(b"dddddddd"));
        assert_eq!(peers.cluster_size(), 4);
        assert_eq!(peers.quorum_needed(), 3);

        peers.remove_member(&pid(b"dddddddd"));
        assert_eq!(peers.cluster_size(), 3);
        assert_eq!(peers.quorum_needed(), 2);

        // Removing an untracked peer changes nothing.
        peers.remove_member(&pid(b"eeeeeeee"));
        assert_eq!(peers.cluster_size(), 3);
    }

    #[test]
    fn reset_members_keeps_contact_history() {
        let known = pid(b"aaaaaaaa");
        let fresh = pid(b"bbbbbbbb");
        let mut peers = PeerMap::new(2);
        peers.observe(known);
        let before = peers.get(&known).and_then(|t| t.ts);

        peers.reset_members(&[known, fresh], 3);
        assert_eq!(peers.cluster_size(), 3);
        assert_eq!(peers.get(&known).and_then(|t| t.ts), before);
        assert!(peers.get(&fresh).and_then(|t| t.ts).is_none());
    }
}
