//! The pub/sub transport consumed by a node.
//!
//! The embedding server hands every node a handle scoped to that node:
//! messages a node publishes are not echoed back to its own
//! subscriptions. Delivery is best effort and unordered across subjects;
//! payload buffers belong to the transport and must not be retained past
//! the callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Identifies one subscription on a transport handle. The append-entry
/// path compares these to tell group traffic from catchup inboxes.
pub type SubscriptionId = u64;

/// Callback invoked with `(subscription, subject, reply, payload)`.
pub type MessageHandler = Arc<dyn Fn(SubscriptionId, &str, &str, &[u8]) + Send + Sync>;

pub trait Transport: Send + Sync {
    fn publish(&self, subject: &str, reply: &str, payload: &[u8]);

    fn subscribe(&self, subject: &str, handler: MessageHandler) -> SubscriptionId;

    fn unsubscribe(&self, sid: SubscriptionId);
}

/// An in-process message bus for tests and examples. Each node takes its
/// own client so published messages skip the publisher's subscriptions.
pub struct MemBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    next_sid: AtomicU64,
    next_client: AtomicU64,
    subs: RwLock<HashMap<String, Vec<BusSub>>>,
}

#[derive(Clone)]
struct BusSub {
    sid: SubscriptionId,
    client: u64,
    handler: MessageHandler,
}

impl MemBus {
    pub fn new() -> MemBus {
        MemBus {
            inner: Arc::new(BusInner::default()),
        }
    }

    pub fn client(&self) -> BusClient {
        BusClient {
            bus: self.inner.clone(),
            client: self.inner.next_client.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for MemBus {
    fn default() -> Self {
        MemBus::new()
    }
}

pub struct BusClient {
    bus: Arc<BusInner>,
    client: u64,
}

impl Transport for BusClient {
    fn publish(&self, subject: &str, reply: &str, payload: &[u8]) {
        // Snapshot matching handlers so callbacks can subscribe or
        // unsubscribe without deadlocking on the bus map.
        let targets: Vec<BusSub> = {
            let subs = self.bus.subs.read();
            match subs.get(subject) {
                Some(list) => list
                    .iter()
                    .filter(|s| s.client != self.client)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };
        for sub in targets {
            (sub.handler)(sub.sid, subject, reply, payload);
        }
    }

    fn subscribe(&self, subject: &str, handler: MessageHandler) -> SubscriptionId {
        let sid = self.bus.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        self.bus
            .subs
            .write()
            .entry(subject.to_string())
            .or_default()
            .push(BusSub {
                sid,
                client: self.client,
                handler,
            });
        sid
    }

    fn unsubscribe(&self, sid: SubscriptionId) {
        let mut subs = self.bus.subs.write();
        for list in subs.values_mut() {
            list.retain(|s| s.sid != sid);
        }
        subs.retain(|_, list| !list.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recording_handler(log: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>) -> MessageHandler {
        Arc::new(move |_sid, subject, reply, payload| {
            log.lock()
                .unwrap()
                .push((subject.to_string(), reply.to_string(), payload.to_vec()));
        })
    }

    #[test]
    fn delivers_to_other_clients_only() {
        let bus = MemBus::new();
        let a = bus.client();
        let b = bus.client();

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        a.subscribe("x", recording_handler(seen_a.clone()));
        b.subscribe("x", recording_handler(seen_b.clone()));

        a.publish("x", "inbox", b"hi");
        assert!(seen_a.lock().unwrap().is_empty(), "no echo to publisher");
        let got = seen_b.lock().unwrap();
        assert_eq!(
            got.as_slice(),
            &[("x".to_string(), "inbox".to_string(), b"hi".to_vec())]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = MemBus::new();
        let a = bus.client();
        let b = bus.client();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sid = b.subscribe("x", recording_handler(seen.clone()));
        a.publish("x", "", b"one");
        b.unsubscribe(sid);
        a.publish("x", "", b"two");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn subjects_are_isolated() {
        let bus = MemBus::new();
        let a = bus.client();
        let b = bus.client();

        let seen = Arc::new(Mutex::new(Vec::new()));
        b.subscribe("x", recording_handler(seen.clone()));
        a.publish("y", "", b"nope");
        assert!(seen.lock().unwrap().is_empty());
    }
}
