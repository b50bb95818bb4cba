//! Snapshots: an encoded point-in-time state produced by the upper layer,
//! stored as a single file with an embedded peer state and a trailing
//! keyed checksum, and streamed to lagging followers ahead of log catchup.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use highway::{HighwayHash, HighwayHasher, Key};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::codec::{Entry, EntryKind};
use crate::error::RaftError;
use crate::node::{CommittedEntry, NodeState, Raft, RaftState};
use crate::storage::SNAPSHOTS_DIR;

const MIN_SNAPSHOT_LEN: usize = 28;

/// Data captured for one snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub last_term: u64,
    pub last_index: u64,
    pub peer_state: Vec<u8>,
    pub data: Vec<u8>,
}

/// Derives the group's checksum key from its name.
pub(crate) fn checksum_key(group: &str) -> [u64; 4] {
    let digest = Sha256::digest(group.as_bytes());
    let mut key = [0u64; 4];
    for (i, chunk) in digest.chunks_exact(8).enumerate() {
        let mut b = chunk;
        key[i] = b.get_u64_le();
    }
    key
}

fn checksum(key: [u64; 4], buf: &[u8]) -> u64 {
    let mut hasher = HighwayHasher::new(Key(key));
    hasher.append(buf);
    hasher.finalize64()
}

pub(crate) fn encode_snapshot(key: [u64; 4], snap: &Snapshot) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(MIN_SNAPSHOT_LEN + snap.peer_state.len() + snap.data.len());
    buf.put_u64_le(snap.last_term);
    buf.put_u64_le(snap.last_index);
    buf.put_u32_le(snap.peer_state.len() as u32);
    buf.put_slice(&snap.peer_state);
    buf.put_slice(&snap.data);
    let sum = checksum(key, &buf);
    buf.put_u64_le(sum);
    buf
}

/// Decodes a snapshot buffer, verifying the trailing checksum over the
/// prefix.
pub(crate) fn decode_snapshot(key: [u64; 4], buf: &[u8]) -> Result<Snapshot, RaftError> {
    if buf.len() < MIN_SNAPSHOT_LEN {
        return Err(RaftError::SnapshotCorrupt);
    }
    let hoff = buf.len() - 8;
    let stored = (&buf[hoff..]).get_u64_le();
    if stored != checksum(key, &buf[..hoff]) {
        return Err(RaftError::SnapshotCorrupt);
    }
    let mut b = &buf[..hoff];
    let last_term = b.get_u64_le();
    let last_index = b.get_u64_le();
    let ps_len = b.get_u32_le() as usize;
    if b.remaining() < ps_len {
        return Err(RaftError::SnapshotCorrupt);
    }
    let peer_state = b[..ps_len].to_vec();
    b.advance(ps_len);
    let data = b.to_vec();
    Ok(Snapshot {
        last_term,
        last_index,
        peer_state,
        data,
    })
}

pub(crate) fn snap_file_name(term: u64, index: u64) -> String {
    format!("snap.{term}.{index}")
}

/// Recovers `(term, index)` from a snapshot file name.
pub(crate) fn term_and_index_from_snap_file(name: &str) -> Result<(u64, u64), RaftError> {
    let rest = name.strip_prefix("snap.").ok_or(RaftError::BadSnapName)?;
    let (term, index) = rest.split_once('.').ok_or(RaftError::BadSnapName)?;
    let term = term.parse().map_err(|_| RaftError::BadSnapName)?;
    let index = index.parse().map_err(|_| RaftError::BadSnapName)?;
    Ok((term, index))
}

impl Raft {
    /// Discovers the newest snapshot on startup, removes everything else
    /// in the snapshots directory, and installs its state.
    pub(crate) fn setup_last_snapshot(&self) {
        let snap_dir = self.sd.join(SNAPSHOTS_DIR);
        let entries = match fs::read_dir(&snap_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let mut latest: Option<(u64, u64, PathBuf)> = None;
        let mut all = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            match term_and_index_from_snap_file(&name) {
                Ok((term, index)) => {
                    all.push(path.clone());
                    let newer = match &latest {
                        Some((lt, li, _)) => term > *lt || (term == *lt && index > *li),
                        None => true,
                    };
                    if newer {
                        latest = Some((term, index, path));
                    }
                }
                Err(_) => {
                    debug!(target: "raft", group = %self.group, file = %name, "removing snapshot, can't parse name");
                    let _ = fs::remove_file(path);
                }
            }
        }

        let Some((_, _, latest)) = latest else { return };
        for path in all {
            if path != latest {
                debug!(target: "raft", group = %self.group, file = %path.display(), "removing old snapshot");
                let _ = fs::remove_file(path);
            }
        }

        let mut st = self.state.write();
        st.snapfile = Some(latest);
        match self.load_last_snapshot(&mut st) {
            Ok(snap) => {
                st.pindex = snap.last_index;
                st.pterm = snap.last_term;
                st.commit = snap.last_index;
                let delivered = CommittedEntry {
                    index: st.commit,
                    entries: vec![Entry::new(EntryKind::Snapshot, snap.data)],
                };
                if self.applyc.try_send(Some(delivered)).is_err() {
                    warn!(target: "raft", group = %self.group, "failed to deliver recovered snapshot upward");
                }
                let _ = self.wal.compact(snap.last_index + 1);
            }
            Err(_) => {
                if let Some(path) = st.snapfile.take() {
                    let _ = fs::remove_file(path);
                }
            }
        }
    }

    /// Loads and verifies the active snapshot. A file that cannot be read
    /// or fails its checksum is deleted and reported absent.
    pub(crate) fn load_last_snapshot(&self, st: &mut NodeState) -> Result<Snapshot, RaftError> {
        let Some(path) = st.snapfile.clone() else {
            return Err(RaftError::NoSnapAvailable);
        };
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(err) => {
                warn!(target: "raft", group = %self.group, %err, "error reading snapshot");
                let _ = fs::remove_file(&path);
                st.snapfile = None;
                return Err(err.into());
            }
        };
        match decode_snapshot(self.key, &buf) {
            Ok(snap) => Ok(snap),
            Err(err) => {
                warn!(target: "raft", group = %self.group, "snapshot corrupt, checksums did not match");
                let _ = fs::remove_file(&path);
                st.snapfile = None;
                Err(err)
            }
        }
    }

    /// Installs a snapshot for the applied index: writes the file, then
    /// releases the log prefix it covers. Should not be called with
    /// entries applied to the FSM but not yet applied here.
    pub fn install_snapshot(&self, data: Vec<u8>) -> Result<(), RaftError> {
        debug!(target: "raft", group = %self.group, bytes = data.len(), "installing snapshot");

        let mut st = self.state.write();
        if st.state == RaftState::Closed {
            return Err(RaftError::NodeClosed);
        }

        if self.wal.state().first_seq == st.applied {
            return Ok(());
        }

        let term = match self.load_entry(st.applied) {
            Ok(ae) => ae.term,
            Err(_) => st.term,
        };

        let snap = Snapshot {
            last_term: term,
            last_index: st.applied,
            peer_state: self.encoded_peer_state(&st),
            data,
        };

        let snap_dir = self.sd.join(SNAPSHOTS_DIR);
        let name = snap_file_name(snap.last_term, snap.last_index);
        let sfile = snap_dir.join(&name);
        fs::write(&sfile, encode_snapshot(self.key, &snap))?;

        st.snapfile = Some(sfile);
        let compacted = self.wal.compact(snap.last_index);
        drop(st);

        remove_all_but(&snap_dir, &name);
        compacted?;
        Ok(())
    }

    /// Sends the given snapshot data to the group as a normal append
    /// entry. Only for upper layers that know it reflects current state.
    pub fn send_snapshot(&self, data: Vec<u8>) -> Result<(), RaftError> {
        self.send_append_entry(vec![Entry::new(EntryKind::Snapshot, data)]);
        Ok(())
    }
}

fn remove_all_but(snap_dir: &Path, keep: &str) {
    if let Ok(entries) = fs::read_dir(snap_dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy() != keep {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
