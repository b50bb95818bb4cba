use thiserror::Error;

use crate::wal::WalError;

/// Errors surfaced to callers of a raft node.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("raft: not leader")]
    NotLeader,

    #[error("raft: already leader")]
    AlreadyLeader,

    #[error("raft: proposal failed")]
    ProposalFailed,

    #[error("raft: node is closed")]
    NodeClosed,

    #[error("raft: unknown peer")]
    UnknownPeer,

    #[error("raft: corrupt peer state")]
    CorruptPeers,

    #[error("raft: cluster too small")]
    ClusterTooSmall,

    #[error("raft: stepdown failed")]
    StepdownFailed,

    #[error("raft: stepdown failed, could not match new leader")]
    StepdownNoPeer,

    #[error("raft: stepdown requires at most one preferred new leader")]
    TooManyPrefs,

    #[error("raft: snapshot name could not be parsed")]
    BadSnapName,

    #[error("raft: no snapshot available")]
    NoSnapAvailable,

    #[error("raft: snapshot corrupt")]
    SnapshotCorrupt,

    #[error("raft: could not load entry from WAL")]
    EntryLoadFailed,

    #[error("raft: could not place apply entry")]
    FailedToApply,

    #[error("raft: wal: {0}")]
    Wal(#[from] WalError),

    #[error("raft: i/o: {0}")]
    Io(#[from] std::io::Error),
}
