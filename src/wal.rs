//! The write-ahead log consumed by a node.
//!
//! The log itself is owned by the embedding server; the node only talks to
//! it through this trait. Sequences are contiguous and assigned by the
//! store: the first append returns 1, compaction moves the floor up,
//! truncation moves the ceiling down.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WalError {
    /// The sequence is below the store's floor (removed or compacted away).
    #[error("no message found")]
    NotFound,

    /// The sequence is past the end of the store.
    #[error("end of store reached")]
    Eof,

    #[error("store is closed")]
    Closed,

    #[error("store i/o failed: {0}")]
    Io(String),
}

/// Summary of the store: sequence floor and ceiling, live message count and
/// total bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalState {
    pub first_seq: u64,
    pub last_seq: u64,
    pub msgs: u64,
    pub bytes: u64,
}

pub trait Wal: Send + Sync {
    /// Appends a record, returning its assigned sequence.
    fn append(&self, payload: &[u8]) -> Result<u64, WalError>;

    /// Loads the record stored at `seq`.
    fn load(&self, seq: u64) -> Result<Vec<u8>, WalError>;

    /// Removes a single record. Returns whether it existed.
    fn remove(&self, seq: u64) -> Result<bool, WalError>;

    /// Drops every record below `seq` and returns the new floor.
    fn compact(&self, seq: u64) -> Result<u64, WalError>;

    /// Drops every record above `seq`, retaining `[first..seq]`.
    fn truncate(&self, seq: u64) -> Result<(), WalError>;

    fn state(&self) -> WalState;

    fn stop(&self);

    /// Stops the store and removes its artifacts.
    fn delete(&self);
}

/// An in-memory store, used by the test suites and example wiring.
#[derive(Default)]
pub struct MemWal {
    inner: Mutex<MemWalInner>,
}

struct MemWalInner {
    entries: BTreeMap<u64, Vec<u8>>,
    first: u64,
    last: u64,
    bytes: u64,
    closed: bool,
}

impl Default for MemWalInner {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            first: 1,
            last: 0,
            bytes: 0,
            closed: false,
        }
    }
}

impl MemWal {
    pub fn new() -> MemWal {
        MemWal::default()
    }
}

impl Wal for MemWal {
    fn append(&self, payload: &[u8]) -> Result<u64, WalError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(WalError::Closed);
        }
        let seq = inner.last + 1;
        inner.entries.insert(seq, payload.to_vec());
        inner.last = seq;
        inner.bytes += payload.len() as u64;
        Ok(seq)
    }

    fn load(&self, seq: u64) -> Result<Vec<u8>, WalError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(WalError::Closed);
        }
        if seq > inner.last {
            return Err(WalError::Eof);
        }
        inner.entries.get(&seq).cloned().ok_or(WalError::NotFound)
    }

    fn remove(&self, seq: u64) -> Result<bool, WalError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(WalError::Closed);
        }
        match inner.entries.remove(&seq) {
            Some(payload) => {
                inner.bytes -= payload.len() as u64;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn compact(&self, seq: u64) -> Result<u64, WalError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(WalError::Closed);
        }
        let keep = inner.entries.split_off(&seq);
        let dropped: u64 = inner.entries.values().map(|p| p.len() as u64).sum();
        inner.entries = keep;
        inner.bytes -= dropped;
        if seq > inner.first {
            inner.first = seq;
        }
        if inner.last < inner.first {
            inner.last = inner.first - 1;
        }
        Ok(inner.first)
    }

    fn truncate(&self, seq: u64) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(WalError::Closed);
        }
        let dropped = inner.entries.split_off(&(seq + 1));
        inner.bytes -= dropped.values().map(|p| p.len() as u64).sum::<u64>();
        if inner.last > seq {
            inner.last = seq;
        }
        Ok(())
    }

    fn state(&self) -> WalState {
        let inner = self.inner.lock();
        WalState {
            first_seq: inner.first,
            last_seq: inner.last,
            msgs: inner.entries.len() as u64,
            bytes: inner.bytes,
        }
    }

    fn stop(&self) {
        self.inner.lock().closed = true;
    }

    fn delete(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
        inner.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_assign_contiguous_sequences() {
        let wal = MemWal::new();
        assert_eq!(wal.append(b"a").unwrap(), 1);
        assert_eq!(wal.append(b"bb").unwrap(), 2);
        assert_eq!(wal.append(b"ccc").unwrap(), 3);
        let state = wal.state();
        assert_eq!(state.first_seq, 1);
        assert_eq!(state.last_seq, 3);
        assert_eq!(state.msgs, 3);
        assert_eq!(state.bytes, 6);
        assert_eq!(wal.load(2).unwrap(), b"bb");
    }

    #[test]
    fn load_distinguishes_eof_from_missing() {
        let wal = MemWal::new();
        wal.append(b"a").unwrap();
        wal.append(b"b").unwrap();
        wal.remove(1).unwrap();
        assert_eq!(wal.load(1), Err(WalError::NotFound));
        assert_eq!(wal.load(3), Err(WalError::Eof));
    }

    #[test]
    fn compact_moves_the_floor_and_keeps_sequencing() {
        let wal = MemWal::new();
        for i in 0..5u8 {
            wal.append(&[i]).unwrap();
        }
        assert_eq!(wal.compact(4).unwrap(), 4);
        let state = wal.state();
        assert_eq!(state.first_seq, 4);
        assert_eq!(state.last_seq, 5);
        assert_eq!(state.msgs, 2);
        assert_eq!(wal.load(3), Err(WalError::NotFound));

        // Compacting past the end empties the store but the next append
        // continues the sequence.
        assert_eq!(wal.compact(6).unwrap(), 6);
        let state = wal.state();
        assert_eq!(state.msgs, 0);
        assert_eq!(state.first_seq, 6);
        assert_eq!(state.last_seq, 5);
        assert_eq!(wal.append(b"next").unwrap(), 6);
    }

    #[test]
    fn truncate_drops_the_suffix() {
        let wal = MemWal::new();
        for i in 0..5u8 {
            wal.append(&[i]).unwrap();
        }
        wal.truncate(2).unwrap();
        let state = wal.state();
        assert_eq!(state.last_seq, 2);
        assert_eq!(state.msgs, 2);
        assert_eq!(wal.load(3), Err(WalError::Eof));
        assert_eq!(wal.append(b"x").unwrap(), 3);
    }

    #[test]
    fn closed_store_rejects_everything() {
        let wal = MemWal::new();
        wal.append(b"a").unwrap();
        wal.stop();
        assert_eq!(wal.append(b"b"), Err(WalError::Closed));
        assert_eq!(wal.load(1), Err(WalError::Closed));
        assert_eq!(wal.truncate(1), Err(WalError::Closed));
    }
}
