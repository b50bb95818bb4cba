//! Fixed-layout wire records.
//!
//! Every record the group exchanges has a fixed little-endian layout; the
//! single-byte entry tag is part of the stored log format and must stay
//! stable across versions. Decoders always copy out of the transport-owned
//! buffer because the payload does not survive the delivery callback.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::RaftError;

/// Length of a group-scoped node id on the wire.
pub const ID_LEN: usize = 8;

const APPEND_ENTRY_BASE_LEN: usize = ID_LEN + 4 * 8 + 2;
const APPEND_ENTRY_RESPONSE_LEN: usize = 24 + 1;
const VOTE_REQUEST_LEN: usize = 24 + ID_LEN;
const VOTE_RESPONSE_LEN: usize = 8 + 8 + 1;

/// A group-scoped node identity. Eight bytes, assigned by the server from
/// its own identity hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; ID_LEN]);

impl PeerId {
    /// Reads an id from a wire buffer. Returns `None` unless exactly
    /// [`ID_LEN`] bytes are present.
    pub fn from_bytes(buf: &[u8]) -> Option<PeerId> {
        let bytes: [u8; ID_LEN] = buf.try_into().ok()?;
        Some(PeerId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl From<[u8; ID_LEN]> for PeerId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        PeerId(bytes)
    }
}

/// Kinds of log entries. The discriminant is the on-wire tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    Normal = 0,
    OldSnapshot = 1,
    PeerState = 2,
    AddPeer = 3,
    RemovePeer = 4,
    LeaderTransfer = 5,
    Snapshot = 6,
}

impl EntryKind {
    pub(crate) fn from_u8(tag: u8) -> Option<EntryKind> {
        Some(match tag {
            0 => EntryKind::Normal,
            1 => EntryKind::OldSnapshot,
            2 => EntryKind::PeerState,
            3 => EntryKind::AddPeer,
            4 => EntryKind::RemovePeer,
            5 => EntryKind::LeaderTransfer,
            6 => EntryKind::Snapshot,
            _ => return None,
        })
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryKind::Normal => "Normal",
            EntryKind::OldSnapshot => "OldSnapshot",
            EntryKind::PeerState => "PeerState",
            EntryKind::AddPeer => "AddPeer",
            EntryKind::RemovePeer => "RemovePeer",
            EntryKind::LeaderTransfer => "LeaderTransfer",
            EntryKind::Snapshot => "Snapshot",
        };
        f.write_str(name)
    }
}

/// A single tagged payload inside an append-entry record.
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(kind: EntryKind, data: Vec<u8>) -> Entry {
        Entry { kind, data }
    }

    pub fn normal(data: Vec<u8>) -> Entry {
        Entry::new(EntryKind::Normal, data)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}([u8; {}])", self.kind, self.data.len())
    }
}

/// The atomic replication unit. One record, possibly batching several
/// entries, is what gets appended to the WAL and broadcast to the group.
///
/// `pterm`/`pindex` name the record preceding this one in the leader's log.
#[derive(Clone, Debug)]
pub(crate) struct AppendEntry {
    pub leader: PeerId,
    pub term: u64,
    pub commit: u64,
    pub pterm: u64,
    pub pindex: u64,
    pub entries: Vec<Entry>,
    // Internal use only: reply subject it arrived with, and the encoded
    // form, kept so storing and re-sending never re-encode.
    pub reply: String,
    pub buf: Vec<u8>,
}

impl PartialEq for AppendEntry {
    fn eq(&self, other: &Self) -> bool {
        // Wire fields only; reply and buf are delivery bookkeeping.
        self.leader == other.leader
            && self.term == other.term
            && self.commit == other.commit
            && self.pterm == other.pterm
            && self.pindex == other.pindex
            && self.entries == other.entries
    }
}

impl AppendEntry {
    pub fn encode(&self) -> Vec<u8> {
        let elen: usize = self.entries.iter().map(|e| e.data.len() + 1 + 4).sum();
        let mut buf = Vec::with_capacity(APPEND_ENTRY_BASE_LEN + elen);
        buf.put_slice(&self.leader.0);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.commit);
        buf.put_u64_le(self.pterm);
        buf.put_u64_le(self.pindex);
        buf.put_u16_le(self.entries.len() as u16);
        for e in &self.entries {
            buf.put_u32_le(e.data.len() as u32 + 1);
            buf.put_u8(e.kind as u8);
            buf.put_slice(&e.data);
        }
        buf
    }

    pub fn decode(msg: &[u8], reply: &str) -> Option<AppendEntry> {
        if msg.len() < APPEND_ENTRY_BASE_LEN {
            return None;
        }
        let mut b = msg;
        let mut leader = [0u8; ID_LEN];
        b.copy_to_slice(&mut leader);
        let term = b.get_u64_le();
        let commit = b.get_u64_le();
        let pterm = b.get_u64_le();
        let pindex = b.get_u64_le();
        let ne = b.get_u16_le() as usize;

        let mut entries = Vec::with_capacity(ne);
        for _ in 0..ne {
            if b.remaining() < 4 {
                return None;
            }
            let elen = b.get_u32_le() as usize;
            if elen == 0 || b.remaining() < elen {
                return None;
            }
            let kind = EntryKind::from_u8(b[0])?;
            entries.push(Entry::new(kind, b[1..elen].to_vec()));
            b.advance(elen);
        }

        Some(AppendEntry {
            leader: PeerId(leader),
            term,
            commit,
            pterm,
            pindex,
            entries,
            reply: reply.to_string(),
            buf: msg.to_vec(),
        })
    }
}

/// Response to an append-entry record. A non-empty reply subject on a
/// failed response asks the leader to run a catchup to that inbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AppendEntryResponse {
    pub term: u64,
    pub index: u64,
    pub peer: PeerId,
    pub success: bool,
    // Internal use only.
    pub reply: String,
}

impl AppendEntryResponse {
    pub fn new(term: u64, index: u64, peer: PeerId, success: bool) -> AppendEntryResponse {
        AppendEntryResponse {
            term,
            index,
            peer,
            success,
            reply: String::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(APPEND_ENTRY_RESPONSE_LEN);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.index);
        buf.put_slice(&self.peer.0);
        buf.put_u8(self.success as u8);
        buf
    }

    pub fn decode(msg: &[u8]) -> Option<AppendEntryResponse> {
        if msg.len() != APPEND_ENTRY_RESPONSE_LEN {
            return None;
        }
        let mut b = msg;
        let term = b.get_u64_le();
        let index = b.get_u64_le();
        let peer = PeerId::from_bytes(&b[..ID_LEN])?;
        b.advance(ID_LEN);
        let success = b.get_u8() == 1;
        Some(AppendEntryResponse {
            term,
            index,
            peer,
            success,
            reply: String::new(),
        })
    }
}

/// A candidate's request for a vote, carrying its log position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct VoteRequest {
    pub term: u64,
    pub last_term: u64,
    pub last_index: u64,
    pub candidate: PeerId,
    // Internal use only.
    pub reply: String,
}

impl VoteRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VOTE_REQUEST_LEN);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.last_term);
        buf.put_u64_le(self.last_index);
        buf.put_slice(&self.candidate.0);
        buf
    }

    pub fn decode(msg: &[u8], reply: &str) -> Option<VoteRequest> {
        if msg.len() != VOTE_REQUEST_LEN {
            return None;
        }
        let mut b = msg;
        let term = b.get_u64_le();
        let last_term = b.get_u64_le();
        let last_index = b.get_u64_le();
        let candidate = PeerId::from_bytes(&b[..ID_LEN])?;
        Some(VoteRequest {
            term,
            last_term,
            last_index,
            candidate,
            reply: reply.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct VoteResponse {
    pub term: u64,
    pub peer: PeerId,
    pub granted: bool,
}

impl VoteResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VOTE_RESPONSE_LEN);
        buf.put_u64_le(self.term);
        buf.put_slice(&self.peer.0);
        buf.put_u8(self.granted as u8);
        buf
    }

    pub fn decode(msg: &[u8]) -> Option<VoteResponse> {
        if msg.len() != VOTE_RESPONSE_LEN {
            return None;
        }
        let mut b = msg;
        let term = b.get_u64_le();
        let peer = PeerId::from_bytes(&b[..ID_LEN])?;
        b.advance(ID_LEN);
        let granted = b.get_u8() == 1;
        Some(VoteResponse { term, peer, granted })
    }
}

/// Group membership as known to the leader: the expected cluster size and
/// the ids it is tracking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PeerState {
    pub known_peers: Vec<PeerId>,
    pub cluster_size: usize,
}

pub(crate) fn encode_peer_state(ps: &PeerState) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 4 + ID_LEN * ps.known_peers.len());
    buf.put_u32_le(ps.cluster_size as u32);
    buf.put_u32_le(ps.known_peers.len() as u32);
    for peer in &ps.known_peers {
        buf.put_slice(&peer.0);
    }
    buf
}

pub(crate) fn decode_peer_state(buf: &[u8]) -> Result<PeerState, RaftError> {
    if buf.len() < 8 {
        return Err(RaftError::CorruptPeers);
    }
    let mut b = buf;
    let cluster_size = b.get_u32_le() as usize;
    let expected = b.get_u32_le() as usize;
    let mut known_peers = Vec::with_capacity(expected);
    while known_peers.len() < expected && b.remaining() >= ID_LEN {
        let peer = PeerId::from_bytes(&b[..ID_LEN]).ok_or(RaftError::CorruptPeers)?;
        b.advance(ID_LEN);
        known_peers.push(peer);
    }
    if known_peers.len() != expected {
        return Err(RaftError::CorruptPeers);
    }
    Ok(PeerState {
        known_peers,
        cluster_size,
    })
}
