//! Log replication: the leader's append path and the follower's
//! append-entry state machine, including commit-quorum tracking and the
//! hand-off of committed entries to the apply stream.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, warn};

use crate::codec::{self, AppendEntry, AppendEntryResponse, Entry, EntryKind, PeerId, PeerState};
use crate::error::RaftError;
use crate::node::{CommittedEntry, NodeState, Raft, RaftState};
use crate::storage;
use crate::transport::SubscriptionId;
use crate::wal::WalError;

impl Raft {
    pub(crate) fn build_append_entry(&self, st: &NodeState, entries: Vec<Entry>) -> AppendEntry {
        AppendEntry {
            leader: self.id,
            term: st.term,
            commit: st.commit,
            pterm: st.pterm,
            pindex: st.pindex,
            entries,
            reply: String::new(),
            buf: Vec::new(),
        }
    }

    /// Appends an encoded record to the WAL and advances our tail to
    /// match. The store assigning any sequence other than `pindex + 1` is
    /// a programmer bug and fails loudly.
    pub(crate) fn store_to_wal(
        &self,
        st: &mut NodeState,
        ae: &AppendEntry,
    ) -> Result<(), RaftError> {
        debug_assert!(!ae.buf.is_empty(), "append entry was not encoded");
        let seq = self.wal.append(&ae.buf)?;

        if ae.pindex != seq - 1 {
            panic!(
                "[{} - {}] record placed at wrong index, seq {} with pindex {} (node pindex {}, wal {:?})",
                self.id, self.group, seq, ae.pindex, st.pindex, self.wal.state(),
            );
        }

        st.pterm = ae.term;
        st.pindex = seq;
        Ok(())
    }

    /// Builds, stores and broadcasts one append-entry record. An empty
    /// entry list is a heartbeat and skips the WAL.
    pub(crate) fn send_append_entry(&self, entries: Vec<Entry>) {
        let mut st = self.state.write();
        let mut ae = self.build_append_entry(&st, entries);
        ae.buf = ae.encode();

        if !ae.entries.is_empty() {
            match self.store_to_wal(&mut st, &ae) {
                Ok(()) => {}
                Err(RaftError::Wal(WalError::Closed)) => return,
                Err(err) => panic!("error storing to WAL: {err}"),
            }
            // We count ourselves.
            let pindex = st.pindex;
            st.acks.insert(pindex, HashSet::from([self.id]));
            st.active = Instant::now();
        }
        drop(st);
        self.send_rpc(&self.asubj, &self.areply, &ae.buf);
    }

    pub(crate) fn send_heartbeat(&self) {
        self.send_append_entry(Vec::new());
    }

    /// Broadcasts our current view of the membership to the group.
    pub(crate) fn send_peer_state(&self) {
        let encoded = {
            let st = self.state.read();
            self.encoded_peer_state(&st)
        };
        self.send_append_entry(vec![Entry::new(EntryKind::PeerState, encoded)]);
    }

    /// Transport callback for append entries, on the group subject, a
    /// catchup inbox, or a startup replay (`sub == None`).
    pub(crate) fn handle_append_entry(
        &self,
        sub: SubscriptionId,
        _subject: &str,
        reply: &str,
        msg: &[u8],
    ) {
        let Some(ae) = AppendEntry::decode(msg, reply) else {
            warn!(target: "raft", group = %self.group, "received malformed append entry");
            return;
        };
        self.process_append_entry(ae, Some(sub));
    }

    /// The follower-side append-entry state machine. Runs under the node
    /// lock; responses go out through the send queue after it drops.
    pub(crate) fn process_append_entry(&self, mut ae: AppendEntry, sub: Option<SubscriptionId>) {
        let mut st = self.state.write();

        if st.state == RaftState::Closed {
            return;
        }

        // Are we receiving from another leader.
        if st.state == RaftState::Leader {
            if ae.term > st.term {
                st.term = ae.term;
                st.vote = None;
                self.write_term_vote(&st);
                debug!(target: "raft", group = %self.group, leader = %ae.leader, "received append entry from another leader, stepping down");
                self.attempt_step_down(Some(ae.leader));
            } else {
                // Let them know we are the leader.
                let ar = AppendEntryResponse::new(st.term, st.pindex, self.id, false);
                drop(st);
                debug!(target: "raft", group = %self.group, "append entry ignoring old term from another leader");
                self.send_rpc(&ae.reply, "", &ar.encode());
                return;
            }
        }

        // If we received an append entry as a candidate we should convert
        // to a follower.
        if st.state == RaftState::Candidate {
            debug!(target: "raft", group = %self.group, leader = %ae.leader, "received append entry in candidate state, converting to follower");
            if st.term < ae.term {
                st.term = ae.term;
                st.vote = None;
                self.write_term_vote(&st);
            }
            self.attempt_step_down(Some(ae.leader));
        }

        self.reset_election_timeout(&mut st);

        let catching_up = st.catchup.is_some();
        // A fresh entry arrives on the group subscription; everything else
        // is a replay or a catchup delivery.
        let is_new = sub.is_some() && sub == st.aesub;

        // Track leader directly.
        if is_new {
            st.peers.observe(ae.leader);
        }

        // Ignore old terms.
        if is_new && ae.term < st.term {
            let ar = AppendEntryResponse::new(st.term, st.pindex, self.id, false);
            drop(st);
            debug!(target: "raft", group = %self.group, "append entry ignoring old term");
            self.send_rpc(&ae.reply, "", &ar.encode());
            return;
        }

        // This could happen when we stall or cancel a catchup.
        if !is_new {
            if let Some(cs) = &st.catchup {
                if sub != Some(cs.sub) {
                    debug!(target: "raft", group = %self.group, "append entry ignoring old entry from previous catchup");
                    return;
                }
            }
        }

        if catching_up {
            let caught = st
                .catchup
                .as_ref()
                .map(|cs| st.pterm >= cs.cterm && st.pindex >= cs.cindex)
                .unwrap_or(false);
            if caught {
                // If we are here we are good, so if we have a catchup
                // pending we can cancel.
                self.cancel_catchup(&mut st);
            } else if is_new {
                // Check to see if we are stalled. If so recreate our
                // catchup state and resend our response.
                let mut response = None;
                if self.catchup_stalled(&mut st) {
                    debug!(target: "raft", group = %self.group, "catchup may be stalled, will request again");
                    let inbox = self.create_catchup(&mut st, &ae);
                    let ar = AppendEntryResponse::new(st.pterm, st.pindex, self.id, false);
                    response = Some((inbox, ar));
                }
                drop(st);
                if let Some((inbox, ar)) = response {
                    self.send_rpc(&ae.reply, &inbox, &ar.encode());
                }
                // Ignore new while catching up or replaying.
                return;
            }
        }

        // If this term is greater than ours.
        if ae.term > st.term {
            st.term = ae.term;
            st.vote = None;
            self.write_term_vote(&st);
            if st.state != RaftState::Follower {
                debug!(target: "raft", group = %self.group, state = %st.state, leader = %ae.leader, "term higher than ours and we are not a follower, stepping down");
                self.attempt_step_down(Some(ae.leader));
            }
        }

        if is_new && st.leader != Some(ae.leader) && st.state == RaftState::Follower {
            debug!(target: "raft", group = %self.group, leader = %ae.leader, "append entry updating leader");
            st.leader = Some(ae.leader);
            self.write_term_vote(&st);
            self.reset_election_timeout(&mut st);
            self.update_lead_change(false);
        }

        if ae.pterm != st.pterm || ae.pindex != st.pindex {
            // If this is a lower index than what we were expecting.
            if ae.pindex < st.pindex {
                let mut ar = None;
                if let Ok(eae) = self.load_entry(ae.pindex) {
                    if ae.pterm > eae.pterm {
                        // Terms mismatched: delete that entry and all
                        // others past it.
                        let _ = self.wal.truncate(ae.pindex);
                        st.pindex = ae.pindex;
                        st.pterm = ae.pterm;
                        ar = Some(AppendEntryResponse::new(st.pterm, st.pindex, self.id, false));
                    } else {
                        ar = Some(AppendEntryResponse::new(ae.pterm, ae.pindex, self.id, true));
                    }
                }
                drop(st);
                if let Some(ar) = ar {
                    self.send_rpc(&ae.reply, "", &ar.encode());
                }
                return;
            }

            if catching_up {
                // A leader catching us up always sends the snapshot and
                // peer state together as the first entry.
                if ae.entries.len() != 2
                    || ae.entries[0].kind != EntryKind::Snapshot
                    || ae.entries[1].kind != EntryKind::PeerState
                {
                    warn!(target: "raft", group = %self.group, "expected first catchup entry to be a snapshot and peerstate, will retry");
                    self.cancel_catchup(&mut st);
                    return;
                }

                match codec::decode_peer_state(&ae.entries[1].data) {
                    Ok(ps) => self.process_peer_state(&mut st, &ps),
                    Err(_) => {
                        warn!(target: "raft", group = %self.group, "could not parse snapshot peerstate correctly");
                        self.cancel_catchup(&mut st);
                        return;
                    }
                }

                st.pindex = ae.pindex;
                st.pterm = ae.pterm;
                st.commit = ae.pindex;
                let _ = self.wal.compact(st.pindex + 1);

                // Send the snapshot upward, not the peerstate entry.
                let snap = ae.entries.swap_remove(0);
                let delivered = CommittedEntry {
                    index: st.commit,
                    entries: vec![snap],
                };
                if self.applyc.try_send(Some(delivered)).is_err() {
                    debug!(target: "raft", group = %self.group, "failed to place snapshot entry onto our apply channel");
                    st.commit -= 1;
                }
                return;
            } else {
                debug!(
                    target: "raft",
                    group = %self.group,
                    ae_pterm = ae.pterm, ae_pindex = ae.pindex,
                    pterm = st.pterm, pindex = st.pindex,
                    "append entry did not match"
                );
                // Reset our term.
                st.term = st.pterm;
                if ae.pindex > st.pindex {
                    // Setup our state for catching up.
                    let inbox = self.create_catchup(&mut st, &ae);
                    let ar = AppendEntryResponse::new(st.pterm, st.pindex, self.id, false);
                    drop(st);
                    self.send_rpc(&ae.reply, &inbox, &ar.encode());
                    return;
                }
            }
        }

        // Save to our WAL if we have entries.
        if !ae.entries.is_empty() {
            if sub.is_some() {
                // Only store an original; replays already live in the WAL.
                if let Err(err) = self.store_to_wal(&mut st, &ae) {
                    if matches!(err, RaftError::Wal(WalError::Closed)) {
                        return;
                    }
                    warn!(target: "raft", group = %self.group, %err, "error storing entry to WAL");
                    let ar = AppendEntryResponse::new(st.term, st.pindex, self.id, false);
                    drop(st);
                    self.send_rpc(&ae.reply, "", &ar.encode());
                    return;
                }
            } else {
                // This is a replay on startup so just take the append
                // entry version.
                st.pterm = ae.term;
                st.pindex = ae.pindex + 1;
            }

            // Check to see if we have any related entries to process here.
            for e in &ae.entries {
                match e.kind {
                    EntryKind::LeaderTransfer if is_new => {
                        if let Some(peer) = PeerId::from_bytes(&e.data) {
                            if peer == self.id {
                                let _ = self.campaign_locked(&mut st);
                            }
                        }
                    }
                    EntryKind::AddPeer => {
                        if let Some(peer) = PeerId::from_bytes(&e.data) {
                            // Track directly.
                            st.peers.observe(peer);
                        }
                    }
                    _ => {}
                }
            }
        }

        // Apply anything we need here.
        if ae.commit > st.commit {
            if st.paused {
                st.hcommit = ae.commit;
                debug!(target: "raft", group = %self.group, commit = ae.commit, "paused, not applying");
            } else {
                for index in st.commit + 1..=ae.commit {
                    if self.apply_commit(&mut st, index).is_err() {
                        break;
                    }
                }
            }
        }

        let ar = AppendEntryResponse::new(st.pterm, st.pindex, self.id, true);
        drop(st);

        // Success. Send our response.
        self.send_rpc(&ae.reply, "", &ar.encode());
    }

    /// Advances the commit index to `index` and hands the record's
    /// entries to the apply stream, processing membership entries inline.
    pub(crate) fn apply_commit(&self, st: &mut NodeState, index: u64) -> Result<(), RaftError> {
        if st.state == RaftState::Closed {
            return Err(RaftError::NodeClosed);
        }
        if index <= st.commit {
            debug!(target: "raft", group = %self.group, index, "ignoring apply commit, already processed");
            return Ok(());
        }
        let original = st.commit;
        st.commit = index;

        if st.state == RaftState::Leader {
            st.acks.remove(&index);
        }

        let ae = match self.load_entry(index) {
            Ok(ae) => ae,
            Err(err) => {
                if !matches!(err, RaftError::Wal(WalError::Closed)) {
                    warn!(target: "raft", group = %self.group, index, %err, "got an error loading apply entry");
                }
                st.commit = original;
                return Err(RaftError::EntryLoadFailed);
            }
        };

        let mut committed = Vec::new();
        for e in ae.entries {
            match e.kind {
                EntryKind::Normal => committed.push(e),
                EntryKind::OldSnapshot => {
                    // Surfaced upward as a plain snapshot.
                    committed.push(Entry::new(EntryKind::Snapshot, e.data));
                }
                EntryKind::Snapshot => committed.push(e),
                EntryKind::PeerState => {
                    if st.state != RaftState::Leader {
                        if let Ok(ps) = codec::decode_peer_state(&e.data) {
                            self.process_peer_state(st, &ps);
                        }
                    }
                }
                EntryKind::AddPeer => {
                    if let Some(peer) = PeerId::from_bytes(&e.data) {
                        debug!(target: "raft", group = %self.group, peer = %peer, "added peer");
                        if !st.peers.contains(&peer) {
                            // Not tracked yet, so the cluster grows.
                            debug!(
                                target: "raft",
                                group = %self.group,
                                from = st.peers.cluster_size(),
                                to = st.peers.cluster_size() + 1,
                                "expanding our clustersize"
                            );
                            st.peers.add_member(peer);
                        }
                        let _ = storage::write_peer_state(&self.sd, &self.current_peer_state(st));
                    }
                }
                EntryKind::RemovePeer => {
                    if let Some(peer) = PeerId::from_bytes(&e.data) {
                        debug!(target: "raft", group = %self.group, peer = %peer, "removing peer");
                        if st.peers.contains(&peer) {
                            debug!(
                                target: "raft",
                                group = %self.group,
                                from = st.peers.cluster_size(),
                                to = st.peers.cluster_size() - 1,
                                "decreasing our clustersize"
                            );
                            st.peers.remove_member(&peer);
                        }
                        let _ = storage::write_peer_state(&self.sd, &self.current_peer_state(st));
                    }
                    // We pass these up as well.
                    committed.push(e);
                }
                EntryKind::LeaderTransfer => {}
            }
        }

        if !committed.is_empty() {
            let delivered = CommittedEntry {
                index,
                entries: committed,
            };
            if self.applyc.try_send(Some(delivered)).is_err() {
                debug!(target: "raft", group = %self.group, index, "failed to place committed entry onto our apply channel");
                st.commit = original;
                return Err(RaftError::FailedToApply);
            }
        } else {
            // If we processed inline update our applied index.
            st.applied = index;
        }
        Ok(())
    }

    /// Accounts a success response, advancing the commit index once a
    /// quorum has acknowledged an index.
    pub(crate) fn track_response(&self, ar: &AppendEntryResponse) {
        let mut st = self.state.write();

        // Update peer's last index.
        if let Some(track) = st.peers.get_mut(&ar.peer) {
            if ar.index > track.li {
                track.li = ar.index;
            }
        }

        // If we are catching this peer up, feed its progress.
        if let Some(updates) = st.progress.get(&ar.peer) {
            let _ = updates.send(ar.index);
        }

        // Ignore items already committed.
        if ar.index <= st.commit {
            return;
        }

        // See if we have items to apply.
        let mut send_hb = false;

        let needed = st.peers.quorum_needed();
        let quorum = match st.acks.get_mut(&ar.index) {
            Some(results) => {
                results.insert(ar.peer);
                results.len() >= needed
            }
            None => false,
        };
        if quorum {
            for index in st.commit + 1..=ar.index {
                if self.apply_commit(&mut st, index).is_err() {
                    break;
                }
            }
            // Heartbeat to propagate the new commit index right away if
            // nothing else is queued to go out.
            send_hb = self.propc.capacity() == self.propc.max_capacity();
        }
        drop(st);

        if send_hb {
            self.send_heartbeat();
        }
    }

    /// Tracks interactions with a peer. On the leader an unknown peer is
    /// admitted only while the cluster has room for it.
    pub(crate) fn track_peer(&self, peer: PeerId) -> Result<(), RaftError> {
        let mut st = self.state.write();
        let mut need_peer_update = false;
        if st.state == RaftState::Leader && !st.peers.contains(&peer) {
            // Someone new. If we have registered all of the peers already
            // this is an error.
            if st.peers.len() >= st.peers.cluster_size() {
                return Err(RaftError::UnknownPeer);
            }
            need_peer_update = true;
        }
        st.peers.observe(peer);
        drop(st);

        if need_peer_update {
            self.send_peer_state();
        }
        Ok(())
    }

    /// Adopts the leader's view of the membership.
    pub(crate) fn process_peer_state(&self, st: &mut NodeState, ps: &PeerState) {
        st.peers.reset_members(&ps.known_peers, ps.cluster_size);
        debug!(target: "raft", group = %self.group, cluster_size = ps.cluster_size, peers = ps.known_peers.len(), "update peers from leader");
        let _ = storage::write_peer_state(&self.sd, ps);
    }

    /// Transport callback for append-entry responses on the leader's
    /// private reply inbox.
    pub(crate) fn handle_append_entry_response(
        &self,
        _sub: SubscriptionId,
        _subject: &str,
        reply: &str,
        msg: &[u8],
    ) {
        // Ignore if not the leader.
        if !self.is_leader() {
            debug!(target: "raft", group = %self.group, "ignoring append entry response, no longer leader");
            return;
        }
        let Some(mut ar) = AppendEntryResponse::decode(msg) else {
            warn!(target: "raft", group = %self.group, "received malformed append entry response");
            return;
        };
        if !reply.is_empty() {
            ar.reply = reply.to_string();
        }
        let _ = self.track_peer(ar.peer);

        if ar.success {
            self.track_response(&ar);
        } else if ar.term > self.current_term() {
            // They have a higher term; step down.
            let mut st = self.state.write();
            st.term = ar.term;
            st.vote = None;
            self.write_term_vote(&st);
            self.attempt_step_down(None);
        } else if !ar.reply.is_empty() {
            self.catchup_follower(&ar);
        }
    }

    /// Transport callback for proposals forwarded by followers.
    pub(crate) fn handle_forwarded_proposal(
        &self,
        _sub: SubscriptionId,
        _subject: &str,
        _reply: &str,
        msg: &[u8],
    ) {
        if !self.is_leader() {
            debug!(target: "raft", group = %self.group, "ignoring forwarded proposal, not leader");
            return;
        }
        // Copy out of the transport-owned buffer.
        if let Err(err) = self.propose(msg.to_vec()) {
            warn!(target: "raft", group = %self.group, %err, "got error processing forwarded proposal");
        }
    }

    /// Transport callback for forwarded remove-peer proposals.
    pub(crate) fn handle_forwarded_remove_peer_proposal(
        &self,
        _sub: SubscriptionId,
        _subject: &str,
        _reply: &str,
        msg: &[u8],
    ) {
        debug!(target: "raft", group = %self.group, "received forwarded remove peer proposal");
        if !self.is_leader() {
            debug!(target: "raft", group = %self.group, "ignoring forwarded peer removal proposal, not leader");
            return;
        }
        let Some(peer) = PeerId::from_bytes(msg) else {
            warn!(target: "raft", group = %self.group, "received invalid peer name for remove proposal");
            return;
        };
        if self
            .propc
            .try_send(Entry::new(EntryKind::RemovePeer, peer.as_bytes().to_vec()))
            .is_err()
        {
            warn!(target: "raft", group = %self.group, "failed to place peer removal proposal onto propose chan");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::config::{RaftConfig, RaftTuning};
    use crate::transport::MemBus;
    use crate::wal::{MemWal, Wal};

    fn pid(tag: u8) -> PeerId {
        PeerId([b'p', tag, b'0', b'0', b'0', b'0', b'0', b'0'])
    }

    // Election timeouts far in the future keep the driver quiet while the
    // tests drive the append-entry path by hand.
    fn quiet_tuning() -> RaftTuning {
        RaftTuning {
            min_election_ms: 60_000,
            max_election_ms: 120_000,
            ..RaftTuning::default()
        }
    }

    struct Fixture {
        node: Arc<Raft>,
        wal: Arc<MemWal>,
        _store: TempDir,
    }

    fn start_follower(group: &str) -> Fixture {
        let store = tempfile::tempdir().expect("tempdir");
        let cfg = RaftConfig {
            group: group.to_string(),
            store: store.path().to_path_buf(),
            id: pid(b'a'),
            tuning: quiet_tuning(),
        };
        Raft::bootstrap(&cfg, &[pid(b'a'), pid(b'b'), pid(b'c')], None).expect("bootstrap");
        let wal = Arc::new(MemWal::new());
        let bus = MemBus::new();
        let node =
            Raft::start(cfg, wal.clone(), Arc::new(bus.client())).expect("start");
        Fixture {
            node,
            wal,
            _store: store,
        }
    }

    fn record(
        leader: PeerId,
        term: u64,
        commit: u64,
        pterm: u64,
        pindex: u64,
        entries: Vec<Entry>,
    ) -> AppendEntry {
        let mut ae = AppendEntry {
            leader,
            term,
            commit,
            pterm,
            pindex,
            entries,
            reply: String::new(),
            buf: Vec::new(),
        };
        ae.buf = ae.encode();
        ae
    }

    fn deliver(node: &Raft, ae: AppendEntry) {
        let sub = node.state.read().aesub;
        node.process_append_entry(ae, sub);
    }

    #[tokio::test]
    async fn follower_appends_matching_entries() {
        let f = start_follower("repl-append");
        let leader = pid(b'b');

        deliver(&f.node, record(leader, 1, 0, 0, 0, vec![Entry::normal(b"one".to_vec())]));
        deliver(&f.node, record(leader, 1, 0, 1, 1, vec![Entry::normal(b"two".to_vec())]));

        let (next, commit, _) = f.node.progress();
        assert_eq!(next, 3);
        assert_eq!(commit, 0);
        assert_eq!(f.wal.state().last_seq, 2);

        let st = f.node.state.read();
        assert_eq!(st.pterm, 1);
        assert_eq!(st.leader, Some(leader));
    }

    #[tokio::test]
    async fn follower_advances_commit_and_delivers_upward() {
        let f = start_follower("repl-commit");
        let leader = pid(b'b');
        let mut applies = f.node.apply_stream().expect("stream");
        assert_eq!(applies.recv().await, Some(None), "end-of-replay sentinel");

        deliver(&f.node, record(leader, 1, 0, 0, 0, vec![Entry::normal(b"x".to_vec())]));
        // Heartbeat carrying the new commit index.
        deliver(&f.node, record(leader, 1, 1, 1, 1, Vec::new()));

        let (_, commit, _) = f.node.progress();
        assert_eq!(commit, 1);
        let committed = applies.recv().await.flatten().expect("committed entry");
        assert_eq!(committed.index, 1);
        assert_eq!(committed.entries, vec![Entry::normal(b"x".to_vec())]);
    }

    #[tokio::test]
    async fn conflicting_suffix_is_truncated() {
        let f = start_follower("repl-truncate");
        let old_leader = pid(b'b');
        let new_leader = pid(b'c');

        for i in 0..3u64 {
            deliver(
                &f.node,
                record(old_leader, 1, 0, if i == 0 { 0 } else { 1 }, i, vec![Entry::normal(vec![i as u8])]),
            );
        }
        assert_eq!(f.node.progress().0, 4);

        // A new leader in term 2 whose log diverges at index 3: its record
        // at index 2 carries a strictly higher previous term.
        deliver(&f.node, record(new_leader, 2, 0, 2, 2, Vec::new()));

        let st = f.node.state.read();
        assert_eq!(st.pindex, 2);
        assert_eq!(st.pterm, 2);
        assert_eq!(f.wal.state().last_seq, 2);
    }

    #[tokio::test]
    async fn higher_term_resets_vote() {
        let f = start_follower("repl-term");
        let leader = pid(b'b');

        {
            let mut st = f.node.state.write();
            st.term = 1;
            st.vote = Some(pid(b'c'));
        }
        deliver(&f.node, record(leader, 5, 0, 0, 0, Vec::new()));

        let st = f.node.state.read();
        assert_eq!(st.term, 5);
        assert_eq!(st.vote, None);
    }

    #[tokio::test]
    async fn stale_term_is_rejected_without_append() {
        let f = start_follower("repl-stale");
        let leader = pid(b'b');

        deliver(&f.node, record(leader, 3, 0, 0, 0, vec![Entry::normal(b"a".to_vec())]));
        // An append from a deposed leader in an older term.
        deliver(&f.node, record(pid(b'c'), 2, 0, 1, 1, vec![Entry::normal(b"b".to_vec())]));

        assert_eq!(f.node.progress().0, 2);
        assert_eq!(f.wal.state().last_seq, 1);
    }

    #[tokio::test]
    async fn replay_restores_log_position_and_commits() {
        let store = tempfile::tempdir().expect("tempdir");
        let cfg = RaftConfig {
            group: "repl-replay".to_string(),
            store: store.path().to_path_buf(),
            id: pid(b'a'),
            tuning: quiet_tuning(),
        };
        Raft::bootstrap(&cfg, &[pid(b'a'), pid(b'b')], None).expect("bootstrap");

        let leader = pid(b'b');
        let wal = Arc::new(MemWal::new());
        wal.append(&record(leader, 1, 0, 0, 0, vec![Entry::normal(b"a".to_vec())]).buf)
            .expect("seed");
        wal.append(&record(leader, 1, 0, 1, 1, vec![Entry::normal(b"b".to_vec())]).buf)
            .expect("seed");
        wal.append(&record(leader, 1, 2, 1, 2, vec![Entry::normal(b"c".to_vec())]).buf)
            .expect("seed");

        let bus = MemBus::new();
        let node = Raft::start(cfg, wal, Arc::new(bus.client())).expect("start");

        let (next, commit, _) = node.progress();
        assert_eq!(next, 4);
        assert_eq!(commit, 2);

        let mut applies = node.apply_stream().expect("stream");
        let first = applies.recv().await.flatten().expect("first commit");
        assert_eq!(first.index, 1);
        let second = applies.recv().await.flatten().expect("second commit");
        assert_eq!(second.index, 2);
        assert_eq!(applies.recv().await, Some(None), "sentinel after replay");
    }

    #[tokio::test]
    async fn replay_truncates_at_corruption() {
        let store = tempfile::tempdir().expect("tempdir");
        let cfg = RaftConfig {
            group: "repl-corrupt".to_string(),
            store: store.path().to_path_buf(),
            id: pid(b'a'),
            tuning: quiet_tuning(),
        };
        Raft::bootstrap(&cfg, &[pid(b'a'), pid(b'b')], None).expect("bootstrap");

        let leader = pid(b'b');
        let wal = Arc::new(MemWal::new());
        wal.append(&record(leader, 1, 0, 0, 0, vec![Entry::normal(b"a".to_vec())]).buf)
            .expect("seed");
        wal.append(&record(leader, 1, 0, 1, 1, vec![Entry::normal(b"b".to_vec())]).buf)
            .expect("seed");
        wal.append(b"garbage that does not decode").expect("seed");

        let bus = MemBus::new();
        let node = Raft::start(cfg, wal.clone(), Arc::new(bus.client())).expect("start");

        assert_eq!(node.progress().0, 3, "replay stops at the last good record");
        assert_eq!(wal.state().last_seq, 2, "corrupt suffix is truncated");
    }

    #[tokio::test]
    async fn paused_apply_accumulates_then_resumes() {
        let f = start_follower("repl-pause");
        let leader = pid(b'b');
        let mut applies = f.node.apply_stream().expect("stream");
        assert_eq!(applies.recv().await, Some(None));

        f.node.pause_apply();
        deliver(&f.node, record(leader, 1, 0, 0, 0, vec![Entry::normal(b"x".to_vec())]));
        deliver(&f.node, record(leader, 1, 1, 1, 1, vec![Entry::normal(b"y".to_vec())]));
        assert_eq!(f.node.progress().1, 0, "commit does not advance while paused");
        assert!(applies.try_recv().is_err());

        f.node.resume_apply();
        assert_eq!(f.node.progress().1, 1);
        let committed = applies.recv().await.flatten().expect("committed entry");
        assert_eq!(committed.index, 1);
    }

    #[tokio::test]
    async fn leader_admits_new_peers_only_while_cluster_has_room() {
        let f = start_follower("repl-admission");
        {
            let mut st = f.node.state.write();
            st.state = RaftState::Leader;
        }

        // Bootstrap seeded the two other members; the map never tracks
        // the local node itself.
        let ids: Vec<PeerId> = f.node.peers().iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&pid(b'a')));

        // One seat in the cluster is still unclaimed, so a peer making
        // first contact is admitted.
        f.node
            .track_peer(pid(b'd'))
            .expect("admitted while below cluster size");
        assert!(f.node.peers().iter().any(|p| p.id == pid(b'd')));

        // The membership is now fully known; growth past the cluster
        // size is rejected rather than silent.
        let err = f.node.track_peer(pid(b'e')).expect_err("cluster is full");
        assert!(matches!(err, RaftError::UnknownPeer));
        assert!(!f.node.peers().iter().any(|p| p.id == pid(b'e')));

        // What we persist and broadcast stays free of our own id.
        let st = f.node.state.read();
        let ps = f.node.current_peer_state(&st);
        assert_eq!(ps.cluster_size, 3);
        assert!(!ps.known_peers.contains(&pid(b'a')));
        assert!(ps.known_peers.contains(&pid(b'd')));
    }
}
