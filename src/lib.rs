//! Raft consensus groups over a pub/sub message bus.
//!
//! A node participates in a named consensus group, exchanging votes and
//! log replication over an external transport (`$NRG.*` subjects) and
//! persisting its log through an external write-ahead log. Committed
//! entries stream to the upper-layer state machine over a channel; the
//! state machine reports back what it has applied.

mod catchup;
mod codec;
mod config;
mod driver;
mod election;
mod error;
mod node;
mod peers;
mod registry;
mod replication;
mod snapshot;
mod storage;
mod transport;
mod wal;

pub use codec::{Entry, EntryKind, PeerId, ID_LEN};
pub use config::{RaftConfig, RaftTuning};
pub use error::RaftError;
pub use node::{CommittedEntry, Raft, RaftState};
pub use peers::Peer;
pub use registry::{lookup, step_down_all};
pub use transport::{BusClient, MemBus, MessageHandler, SubscriptionId, Transport};
pub use wal::{MemWal, Wal, WalError, WalState};
