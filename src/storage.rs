//! On-disk artifacts under the group's store directory: the peer state
//! file and the term+vote file. Snapshots live in their own subdirectory,
//! handled by the snapshot module.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use bytes::{Buf, BufMut};

use crate::codec::{self, PeerId, PeerState, ID_LEN};
use crate::error::RaftError;

pub(crate) const PEER_STATE_FILE: &str = "peers.idx";
pub(crate) const TERM_VOTE_FILE: &str = "tav.idx";
pub(crate) const SNAPSHOTS_DIR: &str = "snapshots";

const TERM_VOTE_LEN: usize = 8 + ID_LEN;

pub(crate) fn write_peer_state(store: &Path, ps: &PeerState) -> Result<(), RaftError> {
    fs::write(store.join(PEER_STATE_FILE), codec::encode_peer_state(ps))?;
    Ok(())
}

pub(crate) fn read_peer_state(store: &Path) -> Result<PeerState, RaftError> {
    let buf = fs::read(store.join(PEER_STATE_FILE))?;
    codec::decode_peer_state(&buf)
}

/// Records the largest term seen and who we voted for in it.
/// Layout: `term[8] | vote[0..8]`; a missing vote is simply absent.
pub(crate) fn write_term_vote(
    store: &Path,
    term: u64,
    vote: Option<PeerId>,
) -> Result<(), RaftError> {
    let mut buf = Vec::with_capacity(TERM_VOTE_LEN);
    buf.put_u64_le(term);
    if let Some(vote) = vote {
        buf.put_slice(vote.as_bytes());
    }
    fs::write(store.join(TERM_VOTE_FILE), buf)?;
    Ok(())
}

/// Reads the persisted term and vote. A missing or short file reads as no
/// recorded state.
pub(crate) fn read_term_vote(store: &Path) -> Result<(u64, Option<PeerId>), RaftError> {
    let buf = match fs::read(store.join(TERM_VOTE_FILE)) {
        Ok(buf) => buf,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok((0, None)),
        Err(err) => return Err(err.into()),
    };
    if buf.len() < 8 {
        return Ok((0, None));
    }
    let mut b = buf.as_slice();
    let term = b.get_u64_le();
    let vote = if b.remaining() >= ID_LEN {
        PeerId::from_bytes(&b[..ID_LEN])
    } else {
        None
    };
    Ok((term, vote))
}
