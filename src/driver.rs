//! The driver: one task per node that dispatches per-state loops over a
//! single set of mailboxes. Each loop returns whenever the state changes
//! and the outer dispatch re-enters the right one.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::codec::{Entry, EntryKind, PeerId, VoteRequest, VoteResponse};
use crate::node::{PubMsg, Raft, RaftState, SubKind};

/// Receivers owned by the driver task.
pub(crate) struct Mailboxes {
    pub propc: mpsc::Receiver<Entry>,
    pub reqs: mpsc::Receiver<VoteRequest>,
    pub votes: mpsc::Receiver<VoteResponse>,
    pub stepdown: mpsc::Receiver<Option<PeerId>>,
    pub quit: watch::Receiver<bool>,
}

pub(crate) async fn run(node: Arc<Raft>, mut mb: Mailboxes) {
    loop {
        match node.state() {
            RaftState::Follower => run_as_follower(&node, &mut mb).await,
            RaftState::Candidate => run_as_candidate(&node, &mut mb).await,
            RaftState::Leader => run_as_leader(&node, &mut mb).await,
            // Observer is reserved and currently behaves as a follower.
            RaftState::Observer => run_as_follower(&node, &mut mb).await,
            RaftState::Closed => return,
        }
    }
}

/// Drains the outbound queue onto the transport, away from any lock.
pub(crate) async fn run_sendq(
    node: Arc<Raft>,
    mut sendq: mpsc::UnboundedReceiver<PubMsg>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            msg = sendq.recv() => match msg {
                Some(msg) => {
                    if !msg.subject.is_empty() {
                        node.transport.publish(&msg.subject, &msg.reply, &msg.payload);
                    }
                }
                None => return,
            }
        }
    }
}

async fn run_as_follower(node: &Arc<Raft>, mb: &mut Mailboxes) {
    loop {
        let deadline = node.election_deadline();
        tokio::select! {
            _ = mb.quit.changed() => return,
            _ = time::sleep_until(deadline) => {
                if node.election_deadline_reached() {
                    node.switch_to_candidate();
                    return;
                }
            }
            _ = node.elect_notify.notified() => {
                // Deadline moved; re-arm the sleep.
            }
            Some(vreq) = mb.reqs.recv() => {
                let _ = node.process_vote_request(vreq);
            }
            Some(new_leader) = mb.stepdown.recv() => {
                node.switch_to_follower(new_leader);
                return;
            }
        }
    }
}

async fn run_as_candidate(node: &Arc<Raft>, mb: &mut Mailboxes) {
    // Drain old vote responses.
    while mb.votes.try_recv().is_ok() {}

    // Send out our request for votes.
    node.request_vote();

    // We vote for ourselves.
    let mut votes = 1;

    loop {
        let deadline = node.election_deadline();
        tokio::select! {
            _ = mb.quit.changed() => return,
            _ = time::sleep_until(deadline) => {
                if node.election_deadline_reached() {
                    // Campaign again in a higher term.
                    node.switch_to_candidate();
                    return;
                }
            }
            _ = node.elect_notify.notified() => {}
            Some(vresp) = mb.votes.recv() => {
                let _ = node.track_peer(vresp.peer);
                if vresp.granted && node.current_term() >= vresp.term {
                    votes += 1;
                    if node.won_election(votes) {
                        node.switch_to_leader();
                        return;
                    }
                }
            }
            Some(vreq) = mb.reqs.recv() => {
                let _ = node.process_vote_request(vreq);
            }
            Some(new_leader) = mb.stepdown.recv() => {
                node.switch_to_follower(new_leader);
                return;
            }
        }
    }
}

async fn run_as_leader(node: &Arc<Raft>, mb: &mut Mailboxes) {
    if node.state() == RaftState::Closed {
        return;
    }

    // While we lead we also accept forwarded proposals.
    let fsub = node.subscribe_node(&node.psubj, SubKind::ForwardedProposal);
    let rpsub = node.subscribe_node(&node.rpsubj, SubKind::ForwardedRemovePeer);

    // Assert leadership right away, then share our view of the group.
    node.send_heartbeat();
    node.send_peer_state();

    let hb = node.tuning.heartbeat();
    let mut heartbeat = time::interval_at(time::Instant::now() + hb, hb);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = mb.quit.changed() => break,
            Some(entry) = mb.propc.recv() => {
                let mut entries = vec![entry];
                // Gather more normal proposals without blocking, within
                // the batch byte budget.
                if entries[0].kind == EntryKind::Normal {
                    let mut size = 0;
                    while size < node.tuning.max_batch_bytes {
                        match mb.propc.try_recv() {
                            Ok(e) => {
                                size += e.data.len() + 1;
                                entries.push(e);
                            }
                            Err(_) => break,
                        }
                    }
                }
                node.send_append_entry(entries);
            }
            _ = heartbeat.tick() => {
                if node.not_active() {
                    node.send_heartbeat();
                }
                if node.lost_quorum() {
                    debug!(target: "raft", group = %node.group, "lost quorum, stepping down");
                    node.switch_to_follower(None);
                    break;
                }
            }
            Some(vresp) = mb.votes.recv() => {
                if vresp.term > node.current_term() {
                    node.switch_to_follower(None);
                    break;
                }
                let _ = node.track_peer(vresp.peer);
            }
            Some(vreq) = mb.reqs.recv() => {
                let _ = node.process_vote_request(vreq);
            }
            Some(new_leader) = mb.stepdown.recv() => {
                node.switch_to_follower(new_leader);
                break;
            }
        }
    }

    node.transport.unsubscribe(fsub);
    node.transport.unsubscribe(rpsub);
}
