//! Process-wide registry of consensus group nodes, guarded independently
//! of any node lock.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::node::Raft;

static NODES: Lazy<RwLock<HashMap<String, Arc<Raft>>>> = Lazy::new(Default::default);

pub(crate) fn register(group: &str, node: Arc<Raft>) {
    NODES.write().insert(group.to_string(), node);
}

pub(crate) fn unregister(group: &str) {
    NODES.write().remove(group);
}

/// Looks up the node registered for a group, if any.
pub fn lookup(group: &str) -> Option<Arc<Raft>> {
    NODES.read().get(group).cloned()
}

/// Asks every registered leader to step down. Used by a server draining
/// before shutdown. Returns whether any transfer was initiated.
pub fn step_down_all() -> bool {
    let nodes: Vec<Arc<Raft>> = NODES.read().values().cloned().collect();
    let mut transferred = false;
    for node in nodes {
        if node.leader() {
            let _ = node.step_down(&[]);
            transferred = true;
        }
    }
    transferred
}
