//! Catchup of lagging followers.
//!
//! The leader streams missing records, optionally prefixed by its current
//! snapshot, to a follower's private inbox, keeping a bounded number of
//! bytes in flight. The follower tracks the catchup target and tears the
//! session down when it stalls, re-signalling the leader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, error, warn};

use crate::codec::{AppendEntry, AppendEntryResponse, Entry, EntryKind};
use crate::error::RaftError;
use crate::node::{NodeState, Raft, SubKind};
use crate::transport::SubscriptionId;
use crate::wal::WalError;

/// Follower-side catchup state: the append entry that triggered it, our
/// position when it began, the private inbox, and a stall clock.
pub(crate) struct CatchupState {
    pub sub: SubscriptionId,
    /// Term and index of the entry that opened this catchup.
    pub cterm: u64,
    pub cindex: u64,
    /// Our last position, used to detect a stalled session.
    pub pterm: u64,
    pub pindex: u64,
    pub active: Instant,
}

impl Raft {
    pub(crate) fn cancel_catchup(&self, st: &mut NodeState) {
        debug!(target: "raft", group = %self.group, "canceling catchup subscription since we are now up to date");
        if let Some(cs) = st.catchup.take() {
            self.transport.unsubscribe(cs.sub);
        }
    }

    /// Called on a new entry from the leader while catching up: a session
    /// whose position has not moved recently has stalled.
    pub(crate) fn catchup_stalled(&self, st: &mut NodeState) -> bool {
        let pindex = st.pindex;
        let activity = self.tuning.catchup_activity();
        match st.catchup.as_mut() {
            None => false,
            Some(cs) => {
                if cs.pindex == pindex {
                    return cs.active.elapsed() > activity;
                }
                cs.pindex = pindex;
                cs.active = Instant::now();
                false
            }
        }
    }

    /// Opens a catchup session with a fresh private inbox and returns the
    /// inbox subject for the leader.
    pub(crate) fn create_catchup(&self, st: &mut NodeState, ae: &AppendEntry) -> String {
        // Cleanup any old ones.
        if let Some(cs) = st.catchup.take() {
            self.transport.unsubscribe(cs.sub);
        }
        let inbox = self.new_catchup_inbox();
        let sub = self.subscribe_node(&inbox, SubKind::AppendEntry);
        st.catchup = Some(CatchupState {
            sub,
            cterm: ae.pterm,
            cindex: ae.pindex,
            pterm: st.pterm,
            pindex: st.pindex,
            active: Instant::now(),
        });
        inbox
    }

    /// Leader side: sends the current snapshot and peer state as one
    /// append entry to the follower's inbox, returning the snapshot's
    /// last index.
    fn send_snapshot_to_follower(
        &self,
        st: &mut NodeState,
        subject: &str,
    ) -> Result<u64, RaftError> {
        let snap = self.load_last_snapshot(st)?;
        let mut ae = self.build_append_entry(
            st,
            vec![
                Entry::new(EntryKind::Snapshot, snap.data),
                Entry::new(EntryKind::PeerState, snap.peer_state),
            ],
        );
        ae.pterm = snap.last_term;
        ae.pindex = snap.last_index;
        let buf = ae.encode();
        self.send_rpc(subject, &self.areply, &buf);
        Ok(snap.last_index)
    }

    /// Leader side: opens a catchup task for one follower, starting just
    /// past its acknowledged index, or from a snapshot when the WAL no
    /// longer reaches back that far.
    pub(crate) fn catchup_follower(&self, ar: &AppendEntryResponse) {
        debug!(target: "raft", group = %self.group, peer = %ar.peer, "being asked to catch up follower");
        let mut st = self.state.write();

        if let Some(updates) = st.progress.remove(&ar.peer) {
            debug!(target: "raft", group = %self.group, peer = %ar.peer, "will cancel existing catchup entry");
            let _ = updates.send(st.pindex);
        }

        // Check to make sure we have this entry.
        let mut start = ar.index + 1;
        let wal_state = self.wal.state();

        if start < wal_state.first_seq {
            debug!(target: "raft", group = %self.group, peer = %ar.peer, "need to send snapshot to follower");
            match self.send_snapshot_to_follower(&mut st, &ar.reply) {
                Ok(last_index) => {
                    debug!(target: "raft", group = %self.group, last_index, "snapshot sent, reset first catchup entry");
                    start = last_index;
                }
                Err(err) => {
                    error!(target: "raft", group = %self.group, peer = %ar.peer, %err, "error sending snapshot to follower");
                    self.attempt_step_down(None);
                    return;
                }
            }
        }

        let ae = match self
            .load_entry(start)
            .or_else(|_| self.load_first_entry())
        {
            Ok(ae) => ae,
            Err(err) => {
                debug!(target: "raft", group = %self.group, %err, "could not find a starting entry for catchup");
                return;
            }
        };
        if ae.pindex != ar.index || ae.pterm != ar.term {
            debug!(target: "raft", group = %self.group, peer = %ar.peer, "our first entry does not match request from follower");
        }

        // A channel for delivering progress from responses, primed with
        // where the stream starts.
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ae.pindex);
        st.progress.insert(ar.peer, tx);
        let last = st.pindex;
        drop(st);

        if let Some(node) = self.upgrade() {
            let ar = ar.clone();
            tokio::spawn(run_catchup(node, ar, rx, last));
        }
    }
}

/// Streams WAL records to one follower until it has caught up, the
/// session stalls, or we are no longer leader.
async fn run_catchup(
    node: Arc<Raft>,
    ar: AppendEntryResponse,
    mut updates: mpsc::UnboundedReceiver<u64>,
    last: u64,
) {
    let peer = ar.peer;
    let subj = ar.reply.clone();
    debug!(target: "raft", group = %node.group, peer = %peer, "running catchup");

    let max_outstanding = node.tuning.max_catchup_outstanding;
    let activity = node.tuning.catchup_activity();

    let mut next = 0u64;
    let mut total = 0usize;
    let mut outstanding: HashMap<u64, usize> = HashMap::new();

    // Sends records until the outstanding-byte budget is spent. Returns
    // true once the stream is done.
    let send_next = |next: &mut u64, total: &mut usize, outstanding: &mut HashMap<u64, usize>| {
        while *total <= max_outstanding {
            *next += 1;
            if *next > last {
                return true;
            }
            match node.load_entry(*next) {
                Ok(ae) => {
                    outstanding.insert(*next, ae.buf.len());
                    *total += ae.buf.len();
                    node.send_rpc(&subj, &node.areply, &ae.buf);
                }
                Err(err) => {
                    if !matches!(err, RaftError::Wal(WalError::Eof)) {
                        warn!(target: "raft", group = %node.group, index = *next, %err, "got an error loading catchup index");
                    }
                    return true;
                }
            }
        }
        false
    };

    let mut quit = node.quit_signal();
    let timeout = time::sleep(activity);
    tokio::pin!(timeout);
    let mut step_check = time::interval(Duration::from_millis(100));

    'catchup: while node.is_leader() {
        tokio::select! {
            _ = quit.changed() => break 'catchup,
            _ = step_check.tick() => {
                if !node.is_leader() {
                    debug!(target: "raft", group = %node.group, peer = %peer, "catching up canceled, no longer leader");
                    break 'catchup;
                }
            }
            _ = &mut timeout => {
                debug!(target: "raft", group = %node.group, peer = %peer, "catching up stalled");
                break 'catchup;
            }
            Some(index) = updates.recv() => {
                // Update our activity timer.
                timeout.as_mut().reset(tokio::time::Instant::now() + activity);
                // Update the outstanding total.
                if let Some(size) = outstanding.remove(&index) {
                    total = total.saturating_sub(size);
                }
                // Still have more catching up to do.
                if next < index {
                    debug!(target: "raft", group = %node.group, from = next, to = index, "adjusting next");
                    next = index;
                }
                let finished = index > last;
                if finished || send_next(&mut next, &mut total, &mut outstanding) {
                    debug!(target: "raft", group = %node.group, peer = %peer, "finished catching up");
                    break 'catchup;
                }
            }
        }
    }

    let known = {
        let mut st = node.state.write();
        st.progress.remove(&peer);
        st.peers.contains(&peer)
    };
    // A brand-new peer that just finished catching up gets proposed into
    // the membership.
    if !known {
        debug!(target: "raft", group = %node.group, peer = %peer, "catchup done, will add into peers");
        let _ = node.propose_add_peer(peer);
    }
}
