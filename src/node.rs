//! The consensus node: a guarded mutable record plus the channels that
//! feed its driver task. Public operations take the lock briefly and never
//! block on a mailbox; everything that can fill up is a bounded channel
//! with drop-and-warn semantics.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::catchup::CatchupState;
use crate::codec::{self, AppendEntry, Entry, EntryKind, PeerId, PeerState, VoteRequest, VoteResponse};
use crate::config::{RaftConfig, RaftTuning};
use crate::driver::{self, Mailboxes};
use crate::error::RaftError;
use crate::peers::{Peer, PeerMap};
use crate::registry;
use crate::snapshot;
use crate::storage::{self, PEER_STATE_FILE, SNAPSHOTS_DIR, TERM_VOTE_FILE};
use crate::transport::{MessageHandler, SubscriptionId, Transport};
use crate::wal::Wal;

/// Allowable states for a consensus group node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftState {
    Follower,
    Leader,
    Candidate,
    /// Reserved; currently runs the follower loop.
    Observer,
    Closed,
}

impl std::fmt::Display for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RaftState::Follower => "FOLLOWER",
            RaftState::Leader => "LEADER",
            RaftState::Candidate => "CANDIDATE",
            RaftState::Observer => "OBSERVER",
            RaftState::Closed => "CLOSED",
        })
    }
}

/// A committed record handed to the upper-layer state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedEntry {
    pub index: u64,
    pub entries: Vec<Entry>,
}

/// Outbound publish, drained by a dedicated task so no lock is ever held
/// across transport I/O.
pub(crate) struct PubMsg {
    pub subject: String,
    pub reply: String,
    pub payload: Vec<u8>,
}

/// The node's guarded mutable fields.
pub(crate) struct NodeState {
    pub state: RaftState,

    /// Latest term this node has seen (increases monotonically, persisted
    /// before any RPC that depends on it).
    pub term: u64,

    /// Peer that received our vote in the current term, if any. Persisted
    /// together with the term.
    pub vote: Option<PeerId>,

    /// Last observed leader for the current term.
    pub leader: Option<PeerId>,

    /// Term and index of the last record in the WAL. The WAL is the
    /// authority; these mirror its tail.
    pub pterm: u64,
    pub pindex: u64,

    /// Highest index known replicated on a quorum.
    pub commit: u64,

    /// Highest index the FSM has acknowledged applying.
    pub applied: u64,

    pub peers: PeerMap,

    /// Outstanding acknowledgements per in-flight index, self included.
    pub acks: HashMap<u64, std::collections::HashSet<PeerId>>,

    /// When we last sent an append entry as leader.
    pub active: Instant,

    pub elect_deadline: tokio::time::Instant,

    pub snapfile: Option<std::path::PathBuf>,

    /// Follower-side catchup in progress, if any.
    pub catchup: Option<CatchupState>,

    /// Leader-side catchup progress channels, one per follower.
    pub progress: HashMap<PeerId, mpsc::UnboundedSender<u64>>,

    /// While paused, committed indices accumulate in `hcommit` instead of
    /// being delivered upward.
    pub paused: bool,
    pub hcommit: u64,

    /// The group append-entry subscription; anything arriving on another
    /// subscription is a replay or catchup delivery.
    pub aesub: Option<SubscriptionId>,
    pub subs: Vec<SubscriptionId>,
}

#[derive(Clone, Copy)]
pub(crate) enum SubKind {
    VoteRequest,
    VoteResponse,
    AppendEntry,
    AppendEntryResponse,
    ForwardedProposal,
    ForwardedRemovePeer,
}

/// A raft consensus group node.
pub struct Raft {
    pub(crate) created: SystemTime,
    pub(crate) group: String,
    pub(crate) sd: std::path::PathBuf,
    pub(crate) id: PeerId,
    pub(crate) tuning: RaftTuning,
    pub(crate) wal: Arc<dyn Wal>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) key: [u64; 4],

    // Subjects for votes, appends, forwarded proposals, and our replies.
    pub(crate) vsubj: String,
    pub(crate) asubj: String,
    pub(crate) psubj: String,
    pub(crate) rpsubj: String,
    pub(crate) vreply: String,
    pub(crate) areply: String,

    pub(crate) propc: mpsc::Sender<Entry>,
    pub(crate) applyc: mpsc::Sender<Option<CommittedEntry>>,
    pub(crate) reqs_tx: mpsc::Sender<VoteRequest>,
    pub(crate) votes_tx: mpsc::Sender<VoteResponse>,
    pub(crate) leadc: mpsc::Sender<bool>,
    pub(crate) stepdown_tx: mpsc::Sender<Option<PeerId>>,
    pub(crate) sendq: mpsc::UnboundedSender<PubMsg>,
    pub(crate) quit_tx: watch::Sender<bool>,
    pub(crate) elect_notify: Notify,

    pub(crate) state: RwLock<NodeState>,
    pub(crate) weak: OnceCell<Weak<Raft>>,

    apply_rx: Mutex<Option<mpsc::Receiver<Option<CommittedEntry>>>>,
    leadc_rx: Mutex<Option<mpsc::Receiver<bool>>>,
}

fn new_inbox() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("$NRG.R.{suffix}")
}

impl Raft {
    /// Writes the initial peer state for a group into its store directory.
    /// Called once before the group's first start.
    pub fn bootstrap(
        cfg: &RaftConfig,
        known_peers: &[PeerId],
        expected_size: Option<usize>,
    ) -> Result<(), RaftError> {
        let mut expected = expected_size.unwrap_or(known_peers.len());
        if expected < 2 {
            debug!(target: "raft", group = %cfg.group, "adjusting expected peer set size to 2");
            expected = 2;
        }
        fs::create_dir_all(&cfg.store)?;
        storage::write_peer_state(
            &cfg.store,
            &PeerState {
                known_peers: known_peers.to_vec(),
                cluster_size: expected,
            },
        )
    }

    /// Starts a node: loads peer state, recovers the latest snapshot,
    /// replays the WAL, subscribes on the wire, and spawns the driver.
    /// Must be called from within a tokio runtime.
    pub fn start(
        cfg: RaftConfig,
        wal: Arc<dyn Wal>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Raft>, RaftError> {
        fs::create_dir_all(cfg.store.join(SNAPSHOTS_DIR))?;
        let ps = storage::read_peer_state(&cfg.store)?;
        if ps.cluster_size < 2 {
            return Err(RaftError::ClusterTooSmall);
        }

        // Startup replay happens in place, so the apply channel needs room
        // for every stored record plus the snapshot and the sentinel.
        let wal_state = wal.state();
        let apply_cap = std::cmp::max(512, wal_state.msgs as usize + 2);

        let (propc, propc_rx) = mpsc::channel(256);
        let (applyc, apply_rx) = mpsc::channel(apply_cap);
        let (reqs_tx, reqs_rx) = mpsc::channel(8);
        let (votes_tx, votes_rx) = mpsc::channel(32);
        let (leadc, leadc_rx) = mpsc::channel(8);
        let (stepdown_tx, stepdown_rx) = mpsc::channel(8);
        let (sendq, sendq_rx) = mpsc::unbounded_channel();
        let (quit_tx, quit_rx) = watch::channel(false);

        let (term, vote) = storage::read_term_vote(&cfg.store).unwrap_or((0, None));

        // The map only ever tracks the other members; liveness accounting
        // counts ourselves separately.
        let mut peers = PeerMap::new(ps.cluster_size);
        for peer in &ps.known_peers {
            if *peer != cfg.id {
                peers.insert_silent(*peer);
            }
        }

        let group = cfg.group;
        let node = Arc::new(Raft {
            created: SystemTime::now(),
            key: snapshot::checksum_key(&group),
            vsubj: format!("$NRG.V.{group}"),
            asubj: format!("$NRG.AE.{group}"),
            psubj: format!("$NRG.P.{group}"),
            rpsubj: format!("$NRG.RP.{group}"),
            vreply: new_inbox(),
            areply: new_inbox(),
            sd: cfg.store,
            id: cfg.id,
            tuning: cfg.tuning.clone(),
            wal,
            transport,
            propc,
            applyc,
            reqs_tx,
            votes_tx,
            leadc,
            stepdown_tx,
            sendq,
            quit_tx,
            elect_notify: Notify::new(),
            state: RwLock::new(NodeState {
                state: RaftState::Follower,
                term,
                vote,
                leader: None,
                pterm: 0,
                pindex: 0,
                commit: 0,
                applied: 0,
                peers,
                acks: HashMap::new(),
                active: Instant::now(),
                elect_deadline: tokio::time::Instant::now()
                    + cfg.tuning.rand_election_timeout(),
                snapfile: None,
                catchup: None,
                progress: HashMap::new(),
                paused: false,
                hcommit: 0,
                aesub: None,
                subs: Vec::new(),
            }),
            weak: OnceCell::new(),
            apply_rx: Mutex::new(Some(apply_rx)),
            leadc_rx: Mutex::new(Some(leadc_rx)),
            group,
        });
        let _ = node.weak.set(Arc::downgrade(&node));

        node.setup_last_snapshot();

        let state = node.wal.state();
        if state.msgs > 0 {
            if let Ok(first) = node.load_first_entry() {
                let mut st = node.state.write();
                st.pterm = first.pterm;
                st.pindex = first.pindex;
                if first.commit > 0 && first.commit > st.commit {
                    st.commit = first.commit;
                }
            }
            // Replay through the normal append-entry path. Any record that
            // fails to load or does not chain onto its predecessor marks
            // the truncation point.
            for index in state.first_seq..=state.last_seq {
                match node.load_entry(index) {
                    Ok(ae) if ae.pindex == index - 1 => node.process_append_entry(ae, None),
                    _ => {
                        warn!(target: "raft", group = %node.group, index, "corrupt WAL, truncating");
                        let _ = node.wal.truncate(index - 1);
                        break;
                    }
                }
            }
        }

        // Signal the upper layer that replay is done.
        let _ = node.applyc.try_send(None);

        node.create_internal_subs();

        {
            let mut st = node.state.write();
            node.reset_election_timeout(&mut st);
        }

        debug!(target: "raft", group = %node.group, id = %node.id, "started");

        registry::register(&node.group, node.clone());

        let mailboxes = Mailboxes {
            propc: propc_rx,
            reqs: reqs_rx,
            votes: votes_rx,
            stepdown: stepdown_rx,
            quit: quit_rx,
        };
        tokio::spawn(driver::run(node.clone(), mailboxes));
        tokio::spawn(driver::run_sendq(
            node.clone(),
            sendq_rx,
            node.quit_tx.subscribe(),
        ));

        Ok(node)
    }

    // Formal API

    /// Proposes a new entry to the group. Only valid on the leader.
    pub fn propose(&self, data: Vec<u8>) -> Result<(), RaftError> {
        {
            let st = self.state.read();
            if st.state != RaftState::Leader {
                debug!(target: "raft", group = %self.group, "proposal ignored, not leader");
                return Err(RaftError::NotLeader);
            }
        }
        if self.propc.try_send(Entry::normal(data)).is_err() {
            warn!(target: "raft", group = %self.group, "proposal failed to be placed on internal channel");
            return Err(RaftError::ProposalFailed);
        }
        Ok(())
    }

    /// Forwards a proposal to the leader over the group's proposal
    /// subject. On the leader this is the same as [`Raft::propose`].
    pub fn forward_proposal(&self, entry: Vec<u8>) -> Result<(), RaftError> {
        if self.leader() {
            return self.propose(entry);
        }
        self.send_rpc(&self.psubj, "", &entry);
        Ok(())
    }

    /// Proposes adding a peer to the group. Only valid on the leader.
    pub fn propose_add_peer(&self, peer: PeerId) -> Result<(), RaftError> {
        {
            let st = self.state.read();
            if st.state != RaftState::Leader {
                return Err(RaftError::NotLeader);
            }
        }
        self.propc
            .try_send(Entry::new(EntryKind::AddPeer, peer.as_bytes().to_vec()))
            .map_err(|_| RaftError::ProposalFailed)
    }

    /// Proposes removing a peer. A follower forwards the request; a leader
    /// asked to remove itself steps down first.
    pub fn propose_remove_peer(&self, peer: PeerId) -> Result<(), RaftError> {
        let (is_us, is_leader) = {
            let st = self.state.read();
            (peer == self.id, st.state == RaftState::Leader)
        };

        if is_leader {
            if is_us {
                let _ = self.step_down(&[]);
            } else {
                return self
                    .propc
                    .try_send(Entry::new(EntryKind::RemovePeer, peer.as_bytes().to_vec()))
                    .map_err(|_| RaftError::ProposalFailed);
            }
        }

        self.send_rpc(&self.rpsubj, "", peer.as_bytes());
        Ok(())
    }

    /// Pauses delivery of committed entries to the apply stream.
    pub fn pause_apply(&self) {
        let mut st = self.state.write();
        debug!(target: "raft", group = %self.group, "pausing apply channel");
        st.paused = true;
        st.hcommit = st.commit;
    }

    /// Resumes delivery, catching up everything committed while paused.
    pub fn resume_apply(&self) {
        let mut st = self.state.write();
        debug!(target: "raft", group = %self.group, "resuming apply channel");
        st.paused = false;
        if st.hcommit > st.commit {
            debug!(target: "raft", group = %self.group, replays = st.hcommit + 1 - st.commit, "resuming replays");
            for index in st.commit + 1..=st.hcommit {
                if self.apply_commit(&mut st, index).is_err() {
                    break;
                }
            }
        }
        st.hcommit = 0;
    }

    /// Compacts the WAL through `index`. For when the state up to `index`
    /// is known to be on stable storage, e.g. after a snapshot.
    pub fn compact(&self, index: u64) -> Result<(), RaftError> {
        let _st = self.state.write();
        self.wal.compact(index)?;
        Ok(())
    }

    /// Reports that the FSM has applied entries through `index`.
    pub fn applied(&self, index: u64) {
        let mut st = self.state.write();
        if index > st.applied {
            st.applied = index;
        }
    }

    /// Current state of this node.
    pub fn state(&self) -> RaftState {
        self.state.read().state
    }

    /// The next index a leader would assign, the commit index, and the
    /// applied index.
    pub fn progress(&self) -> (u64, u64, u64) {
        let st = self.state.read();
        (st.pindex + 1, st.commit, st.applied)
    }

    /// Number of entries and total bytes in the WAL.
    pub fn size(&self) -> (u64, u64) {
        let state = self.wal.state();
        (state.msgs, state.bytes)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Whether this node is the group leader.
    pub fn leader(&self) -> bool {
        self.state.read().state == RaftState::Leader
    }

    /// The current leader of the group, if known.
    pub fn group_leader(&self) -> Option<PeerId> {
        self.state.read().leader
    }

    /// Whether a quorum of the group has been heard from recently. Also
    /// meaningful on former leaders.
    pub fn quorum(&self) -> bool {
        let st = self.state.read();
        st.peers
            .alive_count(&self.id, self.tuning.lost_quorum_interval())
            >= st.peers.quorum_needed()
    }

    /// Whether this node is the leader or an up-to-date follower.
    pub fn current(&self) -> bool {
        let mut st = self.state.write();
        self.is_current(&mut st)
    }

    /// Everything we track about our peers.
    pub fn peers(&self) -> Vec<Peer> {
        let st = self.state.read();
        st.peers
            .iter()
            .map(|(id, track)| Peer {
                id: *id,
                current: Some(*id) == st.leader || track.li >= st.applied,
                last: track.ts,
                lag: st.commit.saturating_sub(track.li),
            })
            .collect()
    }

    /// Asks the leader to step down, optionally transferring leadership
    /// to at most one preferred peer.
    pub fn step_down(&self, preferred: &[PeerId]) -> Result<(), RaftError> {
        if preferred.len() > 1 {
            return Err(RaftError::TooManyPrefs);
        }

        let mut selected: Option<PeerId> = None;
        {
            let st = self.state.read();
            if st.state != RaftState::Leader {
                return Err(RaftError::NotLeader);
            }
            debug!(target: "raft", group = %self.group, "being asked to stepdown");

            // See if we have an up-to-date follower to hand off to.
            let window = self.tuning.lost_quorum_interval();
            for (peer, track) in st.peers.iter() {
                if *peer == self.id {
                    continue;
                }
                let Some(ts) = track.ts else { continue };
                if ts.elapsed() >= window {
                    continue;
                }
                if let Some(pref) = preferred.first() {
                    if pref != peer {
                        continue;
                    }
                }
                selected = Some(*peer);
                break;
            }
        }

        if !preferred.is_empty() && selected.is_none() {
            return Err(RaftError::StepdownNoPeer);
        }

        if let Some(peer) = selected {
            debug!(target: "raft", group = %self.group, peer = %peer, "stepping down, selected new leader");
            self.send_append_entry(vec![Entry::new(
                EntryKind::LeaderTransfer,
                peer.as_bytes().to_vec(),
            )]);
        }

        // Force the stepdown here.
        self.stepdown_tx
            .try_send(None)
            .map_err(|_| RaftError::StepdownFailed)
    }

    /// Starts a leadership vote after a short randomized delay.
    pub fn campaign(&self) -> Result<(), RaftError> {
        let mut st = self.state.write();
        self.campaign_locked(&mut st)
    }

    /// The stream of committed entries for the FSM. `None` marks the end
    /// of startup replay. Take-once; later calls return `None`.
    pub fn apply_stream(&self) -> Option<mpsc::Receiver<Option<CommittedEntry>>> {
        self.apply_rx.lock().take()
    }

    /// The stream of leadership-change notifications. Take-once.
    pub fn lead_changes(&self) -> Option<mpsc::Receiver<bool>> {
        self.leadc_rx.lock().take()
    }

    /// A receiver that observes node shutdown.
    pub fn quit_signal(&self) -> watch::Receiver<bool> {
        self.quit_tx.subscribe()
    }

    pub fn stop(&self) {
        self.shutdown(false);
    }

    /// Stops the node and removes its persistent state.
    pub fn delete(&self) {
        self.shutdown(true);
    }

    // Internal plumbing

    fn shutdown(&self, should_delete: bool) {
        let mut st = self.state.write();
        if st.state == RaftState::Closed {
            return;
        }
        st.state = RaftState::Closed;
        let _ = self.quit_tx.send(true);

        for sid in st.subs.drain(..) {
            self.transport.unsubscribe(sid);
        }
        if let Some(sid) = st.aesub.take() {
            self.transport.unsubscribe(sid);
        }
        if let Some(cs) = st.catchup.take() {
            self.transport.unsubscribe(cs.sub);
        }

        if should_delete {
            let _ = fs::remove_file(self.sd.join(PEER_STATE_FILE));
            let _ = fs::remove_file(self.sd.join(TERM_VOTE_FILE));
            let _ = fs::remove_dir_all(self.sd.join(SNAPSHOTS_DIR));
        }
        drop(st);

        registry::unregister(&self.group);
        if should_delete {
            debug!(target: "raft", group = %self.group, "deleted");
            self.wal.delete();
        } else {
            debug!(target: "raft", group = %self.group, "shutdown");
            self.wal.stop();
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Raft>> {
        self.weak.get().and_then(Weak::upgrade)
    }

    pub(crate) fn current_term(&self) -> u64 {
        self.state.read().term
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.leader()
    }

    /// Whether enough of the heartbeat interval has passed without any
    /// append entry being sent.
    pub(crate) fn not_active(&self) -> bool {
        self.state.read().active.elapsed() > self.tuning.heartbeat()
    }

    pub(crate) fn lost_quorum(&self) -> bool {
        let st = self.state.read();
        self.lost_quorum_locked(&st)
    }

    pub(crate) fn lost_quorum_locked(&self, st: &NodeState) -> bool {
        st.peers
            .alive_count(&self.id, self.tuning.lost_quorum_interval())
            < st.peers.quorum_needed()
    }

    fn is_current(&self, st: &mut NodeState) -> bool {
        // First check if we match commit and applied.
        if st.commit != st.applied {
            debug!(target: "raft", group = %self.group, commit = st.commit, applied = st.applied, "not current");
            return false;
        }
        if st.state == RaftState::Leader {
            return true;
        }

        let (pterm, pindex) = (st.pterm, st.pindex);
        let caught = st
            .catchup
            .as_ref()
            .map(|cs| pterm >= cs.cterm && pindex >= cs.cindex)
            .unwrap_or(false);
        if caught {
            self.cancel_catchup(st);
        }

        // Have we heard from the current leader lately?
        if let Some(leader) = st.leader {
            if leader != self.id && st.catchup.is_none() {
                let ok_interval = self.tuning.heartbeat() * 2;
                if let Some(track) = st.peers.get(&leader) {
                    if let Some(ts) = track.ts {
                        if ts.elapsed() <= ok_interval {
                            return true;
                        }
                    }
                }
                debug!(target: "raft", group = %self.group, "not current, no recent leader contact");
            }
        }
        if let Some(cs) = &st.catchup {
            debug!(target: "raft", group = %self.group, pindex = st.pindex, cindex = cs.cindex, "not current, still catching up");
        }
        false
    }

    pub(crate) fn load_entry(&self, index: u64) -> Result<AppendEntry, RaftError> {
        let msg = self.wal.load(index)?;
        AppendEntry::decode(&msg, "").ok_or(RaftError::EntryLoadFailed)
    }

    pub(crate) fn load_first_entry(&self) -> Result<AppendEntry, RaftError> {
        self.load_entry(self.wal.state().first_seq)
    }

    pub(crate) fn send_rpc(&self, subject: &str, reply: &str, msg: &[u8]) {
        let _ = self.sendq.send(PubMsg {
            subject: subject.to_string(),
            reply: reply.to_string(),
            payload: msg.to_vec(),
        });
    }

    pub(crate) fn send_reply(&self, subject: &str, msg: &[u8]) {
        self.send_rpc(subject, "", msg);
    }

    pub(crate) fn new_catchup_inbox(&self) -> String {
        new_inbox()
    }

    pub(crate) fn subscribe_node(&self, subject: &str, kind: SubKind) -> SubscriptionId {
        let weak = self.weak.get().cloned().unwrap_or_default();
        let handler: MessageHandler = Arc::new(move |sid, subject, reply, msg| {
            let Some(node) = weak.upgrade() else { return };
            match kind {
                SubKind::VoteRequest => node.handle_vote_request(sid, subject, reply, msg),
                SubKind::VoteResponse => node.handle_vote_response(sid, subject, reply, msg),
                SubKind::AppendEntry => node.handle_append_entry(sid, subject, reply, msg),
                SubKind::AppendEntryResponse => {
                    node.handle_append_entry_response(sid, subject, reply, msg)
                }
                SubKind::ForwardedProposal => {
                    node.handle_forwarded_proposal(sid, subject, reply, msg)
                }
                SubKind::ForwardedRemovePeer => {
                    node.handle_forwarded_remove_peer_proposal(sid, subject, reply, msg)
                }
            }
        });
        self.transport.subscribe(subject, handler)
    }

    fn create_internal_subs(&self) {
        let vote_resp = self.subscribe_node(&self.vreply, SubKind::VoteResponse);
        let vote_req = self.subscribe_node(&self.vsubj, SubKind::VoteRequest);
        let ae_resp = self.subscribe_node(&self.areply, SubKind::AppendEntryResponse);
        let ae = self.subscribe_node(&self.asubj, SubKind::AppendEntry);

        let mut st = self.state.write();
        st.subs.extend([vote_resp, vote_req, ae_resp]);
        st.aesub = Some(ae);
    }

    pub(crate) fn current_peer_state(&self, st: &NodeState) -> PeerState {
        PeerState {
            known_peers: st.peers.ids(),
            cluster_size: st.peers.cluster_size(),
        }
    }

    pub(crate) fn encoded_peer_state(&self, st: &NodeState) -> Vec<u8> {
        codec::encode_peer_state(&self.current_peer_state(st))
    }

    /// Records the current term and vote on stable storage.
    pub(crate) fn write_term_vote(&self, st: &NodeState) {
        if let Err(err) = storage::write_term_vote(&self.sd, st.term, st.vote) {
            warn!(target: "raft", group = %self.group, %err, "failed to write term and vote");
        }
    }

    pub(crate) fn update_lead_change(&self, is_leader: bool) {
        if self.leadc.try_send(is_leader).is_err() {
            warn!(target: "raft", group = %self.group, is_leader, "failed to post lead change");
        }
    }

    pub(crate) fn attempt_step_down(&self, new_leader: Option<PeerId>) {
        if self.stepdown_tx.try_send(new_leader).is_err() {
            debug!(target: "raft", group = %self.group, "failed to place stepdown");
        }
    }

    fn switch_state(&self, st: &mut NodeState, to: RaftState) {
        if st.state == RaftState::Closed {
            return;
        }

        self.reset_election_timeout(st);

        if st.state == RaftState::Leader && to != RaftState::Leader {
            self.update_lead_change(false);
        } else if to == RaftState::Leader && st.state != RaftState::Leader {
            self.update_lead_change(true);
        }

        st.state = to;
        self.write_term_vote(st);
    }

    pub(crate) fn switch_to_follower(&self, leader: Option<PeerId>) {
        let mut st = self.state.write();
        if st.state == RaftState::Closed {
            return;
        }
        debug!(target: "raft", group = %self.group, "switching to follower");
        st.leader = leader;
        self.switch_state(&mut st, RaftState::Follower);
    }

    pub(crate) fn switch_to_candidate(&self) {
        let mut st = self.state.write();
        if st.state == RaftState::Closed {
            return;
        }
        if st.state != RaftState::Candidate {
            debug!(target: "raft", group = %self.group, "switching to candidate");
        } else if self.lost_quorum_locked(&st) {
            // Let the upper layers know so they can alert on lost quorum.
            self.update_lead_change(false);
        }
        st.term += 1;
        st.leader = None;
        self.switch_state(&mut st, RaftState::Candidate);
    }

    pub(crate) fn switch_to_leader(&self) {
        let mut st = self.state.write();
        if st.state == RaftState::Closed {
            return;
        }
        debug!(target: "raft", group = %self.group, "switching to leader");
        st.leader = Some(self.id);
        self.switch_state(&mut st, RaftState::Leader);
    }
}
