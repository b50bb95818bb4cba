//! Elections: the randomized election timer, campaigns, and vote
//! request/response processing.

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::codec::{VoteRequest, VoteResponse};
use crate::error::RaftError;
use crate::node::{NodeState, Raft, RaftState};
use crate::transport::SubscriptionId;

impl Raft {
    /// Arms the election timer with a fresh randomized timeout.
    pub(crate) fn reset_election_timeout(&self, st: &mut NodeState) {
        self.reset_elect(st, self.tuning.rand_election_timeout());
    }

    /// Moves the election deadline and nudges the driver so a shortened
    /// deadline takes effect immediately.
    pub(crate) fn reset_elect(&self, st: &mut NodeState, timeout: Duration) {
        st.elect_deadline = tokio::time::Instant::now() + timeout;
        self.elect_notify.notify_one();
    }

    pub(crate) fn election_deadline(&self) -> tokio::time::Instant {
        self.state.read().elect_deadline
    }

    /// The timer may have been pushed out while the driver slept; only a
    /// deadline that is still due counts as fired.
    pub(crate) fn election_deadline_reached(&self) -> bool {
        tokio::time::Instant::now() >= self.state.read().elect_deadline
    }

    /// Schedules an orderly campaign with the short randomized delay.
    pub(crate) fn campaign_locked(&self, st: &mut NodeState) -> Result<(), RaftError> {
        debug!(target: "raft", group = %self.group, "starting campaign");
        if st.state == RaftState::Leader {
            return Err(RaftError::AlreadyLeader);
        }
        self.reset_elect(st, self.tuning.rand_campaign_timeout());
        Ok(())
    }

    /// Votes for ourselves and broadcasts a vote request carrying our log
    /// position.
    pub(crate) fn request_vote(&self) {
        let vr = {
            let mut st = self.state.write();
            if st.state != RaftState::Candidate {
                return;
            }
            st.vote = Some(self.id);
            self.write_term_vote(&st);
            VoteRequest {
                term: st.term,
                last_term: st.pterm,
                last_index: st.pindex,
                candidate: self.id,
                reply: String::new(),
            }
        };

        debug!(target: "raft", group = %self.group, term = vr.term, "sending out vote request");
        self.send_rpc(&self.vsubj, &self.vreply, &vr.encode());
    }

    pub(crate) fn won_election(&self, votes: usize) -> bool {
        votes >= self.quorum_needed()
    }

    pub(crate) fn quorum_needed(&self) -> usize {
        self.state.read().peers.quorum_needed()
    }

    /// Processes one vote request: adopt a higher term, then grant iff we
    /// have not voted for anyone else this term and the candidate's log is
    /// at least as current as ours.
    pub(crate) fn process_vote_request(&self, vr: VoteRequest) -> Result<(), RaftError> {
        debug!(target: "raft", group = %self.group, candidate = %vr.candidate, term = vr.term, "received a vote request");

        self.track_peer(vr.candidate)?;

        let mut st = self.state.write();
        self.reset_election_timeout(&mut st);

        let mut vresp = VoteResponse {
            term: st.term,
            peer: self.id,
            granted: false,
        };

        // Ignore if we are newer.
        if vr.term < st.term {
            drop(st);
            self.send_reply(&vr.reply, &vresp.encode());
            return Ok(());
        }

        // If this is a higher term go ahead and stepdown.
        if vr.term > st.term {
            st.term = vr.term;
            st.vote = None;
            self.write_term_vote(&st);
            if st.state != RaftState::Follower {
                debug!(target: "raft", group = %self.group, state = %st.state, term = vr.term, "stepping down, detected higher term");
                self.attempt_step_down(None);
            }
        }

        // Only way we get to yes is through here.
        let vote_ok = st.vote.is_none() || st.vote == Some(vr.candidate);
        if vote_ok && vr.last_term >= st.pterm && vr.last_index >= st.pindex {
            vresp.granted = true;
            st.vote = Some(vr.candidate);
            self.write_term_vote(&st);
        }
        drop(st);

        debug!(target: "raft", group = %self.group, candidate = %vr.candidate, granted = vresp.granted, "sending a vote response");
        self.send_reply(&vr.reply, &vresp.encode());
        Ok(())
    }

    /// Transport callback for vote requests on the group vote subject.
    pub(crate) fn handle_vote_request(
        &self,
        _sub: SubscriptionId,
        _subject: &str,
        reply: &str,
        msg: &[u8],
    ) {
        let Some(vr) = VoteRequest::decode(msg, reply) else {
            error!(target: "raft", group = %self.group, "received malformed vote request");
            return;
        };
        if self.reqs_tx.try_send(vr).is_err() {
            error!(target: "raft", group = %self.group, "failed to place vote request on chan");
        }
    }

    /// Transport callback for vote responses on our private reply inbox.
    pub(crate) fn handle_vote_response(
        &self,
        _sub: SubscriptionId,
        _subject: &str,
        _reply: &str,
        msg: &[u8],
    ) {
        let Some(vr) = VoteResponse::decode(msg) else {
            error!(target: "raft", group = %self.group, "received malformed vote response");
            return;
        };
        debug!(target: "raft", group = %self.group, peer = %vr.peer, granted = vr.granted, "received a vote response");

        let state = self.state();
        if state != RaftState::Candidate && state != RaftState::Leader {
            debug!(target: "raft", group = %self.group, "ignoring old vote response, we have stepped down");
            return;
        }

        if self.votes_tx.try_send(vr).is_err() {
            warn!(target: "raft", group = %self.group, "failed to place vote response on chan");
        }
    }
}
