//! Multi-node scenarios over the in-process bus: elections, replication,
//! leader transfer, catchup of lagging followers, and quorum loss.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nrg::{
    CommittedEntry, EntryKind, MemBus, MemWal, PeerId, Raft, RaftConfig, RaftError, RaftState,
    RaftTuning, Wal,
};
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

fn pid(n: u8) -> PeerId {
    PeerId([b'n', b'0' + n, b'a', b'a', b'a', b'a', b'a', b'a'])
}

fn fast_tuning() -> RaftTuning {
    RaftTuning {
        heartbeat_ms: 50,
        min_election_ms: 150,
        max_election_ms: 450,
        min_campaign_ms: 10,
        max_campaign_ms: 40,
        catchup_activity_ms: 1000,
        ..RaftTuning::default()
    }
}

struct TestNode {
    node: Arc<Raft>,
    wal: Arc<MemWal>,
    applied: Arc<Mutex<Vec<CommittedEntry>>>,
    _store: TempDir,
}

impl TestNode {
    fn start(bus: &MemBus, group: &str, id: PeerId, peers: &[PeerId]) -> TestNode {
        let store = tempfile::tempdir().expect("tempdir");
        Self::start_in(bus, group, id, peers, store)
    }

    fn start_in(
        bus: &MemBus,
        group: &str,
        id: PeerId,
        peers: &[PeerId],
        store: TempDir,
    ) -> TestNode {
        let cfg = RaftConfig {
            group: group.to_string(),
            store: PathBuf::from(store.path()),
            id,
            tuning: fast_tuning(),
        };
        Raft::bootstrap(&cfg, peers, None).expect("bootstrap");
        let wal = Arc::new(MemWal::new());
        let node = Raft::start(cfg, wal.clone(), Arc::new(bus.client())).expect("start");

        // Pump the apply stream like an FSM would: record the entries and
        // acknowledge every delivered index.
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut stream = node.apply_stream().expect("apply stream");
        {
            let node = node.clone();
            let applied = applied.clone();
            tokio::spawn(async move {
                while let Some(item) = stream.recv().await {
                    if let Some(committed) = item {
                        node.applied(committed.index);
                        applied.lock().unwrap().push(committed);
                    }
                }
            });
        }

        TestNode {
            node,
            wal,
            applied,
            _store: store,
        }
    }

    fn saw_normal(&self, data: &[u8]) -> bool {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .flat_map(|c| c.entries.iter())
            .any(|e| e.kind == EntryKind::Normal && e.data == data)
    }

    fn saw_snapshot(&self, data: &[u8]) -> bool {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .flat_map(|c| c.entries.iter())
            .any(|e| e.kind == EntryKind::Snapshot && e.data == data)
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn leader_index(nodes: &[TestNode]) -> Option<usize> {
    let leaders: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.node.state() == RaftState::Leader)
        .map(|(i, _)| i)
        .collect();
    match leaders.as_slice() {
        [one] => Some(*one),
        _ => None,
    }
}

fn start_cluster(bus: &MemBus, group: &str, n: u8) -> Vec<TestNode> {
    let ids: Vec<PeerId> = (0..n).map(pid).collect();
    ids.iter()
        .map(|id| TestNode::start(bus, group, *id, &ids))
        .collect()
}

async fn wait_for_leader(nodes: &[TestNode]) -> usize {
    wait_until("a single leader", || {
        leader_index(nodes).is_some_and(|i| {
            let leader = nodes[i].node.id();
            nodes
                .iter()
                .all(|n| n.node.group_leader() == Some(leader))
        })
    })
    .await;
    leader_index(nodes).expect("leader")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn elects_a_single_leader() {
    let bus = MemBus::new();
    let nodes = start_cluster(&bus, "t-elect", 3);

    let leader = wait_for_leader(&nodes).await;
    for (i, n) in nodes.iter().enumerate() {
        if i == leader {
            assert_eq!(n.node.state(), RaftState::Leader);
        } else {
            assert_eq!(n.node.state(), RaftState::Follower);
            assert_eq!(n.node.group_leader(), Some(nodes[leader].node.id()));
        }
    }
    assert!(nodes[leader].node.quorum());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proposals_commit_on_every_node() {
    let bus = MemBus::new();
    let nodes = start_cluster(&bus, "t-commit", 3);
    let leader = wait_for_leader(&nodes).await;

    nodes[leader].node.propose(b"payload-1".to_vec()).expect("propose");
    nodes[leader].node.propose(b"payload-2".to_vec()).expect("propose");

    wait_until("all nodes apply both entries", || {
        nodes
            .iter()
            .all(|n| n.saw_normal(b"payload-1") && n.saw_normal(b"payload-2"))
    })
    .await;

    // Commit never runs ahead of the local log, and applied tracks commit.
    for n in &nodes {
        let (next, commit, applied) = n.node.progress();
        assert!(applied <= commit, "applied {applied} > commit {commit}");
        assert!(commit < next, "commit {commit} >= next index {next}");
        assert_eq!(n.wal.state().last_seq + 1, next);
    }

    wait_until("every node becomes current", || {
        nodes.iter().all(|n| n.node.current())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proposals_are_rejected_on_followers() {
    let bus = MemBus::new();
    let nodes = start_cluster(&bus, "t-notleader", 3);
    let leader = wait_for_leader(&nodes).await;

    let follower = (leader + 1) % nodes.len();
    let err = nodes[follower]
        .node
        .propose(b"nope".to_vec())
        .expect_err("proposal on a follower");
    assert!(matches!(err, RaftError::NotLeader));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwarded_proposals_reach_the_leader() {
    let bus = MemBus::new();
    let nodes = start_cluster(&bus, "t-forward", 3);
    let leader = wait_for_leader(&nodes).await;

    let follower = (leader + 1) % nodes.len();
    nodes[follower]
        .node
        .forward_proposal(b"via-follower".to_vec())
        .expect("forward");

    wait_until("forwarded proposal commits everywhere", || {
        nodes.iter().all(|n| n.saw_normal(b"via-follower"))
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfers_to_preferred_peer() {
    let bus = MemBus::new();
    let nodes = start_cluster(&bus, "t-transfer", 3);
    let leader = wait_for_leader(&nodes).await;

    // Give the leader a moment to hear from everyone.
    nodes[leader].node.propose(b"warmup".to_vec()).expect("propose");
    wait_until("warmup commits", || {
        nodes.iter().all(|n| n.saw_normal(b"warmup"))
    })
    .await;

    let target = (leader + 1) % nodes.len();
    let target_id = nodes[target].node.id();
    nodes[leader].node.step_down(&[target_id]).expect("stepdown");

    wait_until("preferred peer takes over", || {
        nodes[target].node.state() == RaftState::Leader
            && nodes[leader].node.state() == RaftState::Follower
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stepdown_demands_at_most_one_preference() {
    let bus = MemBus::new();
    let nodes = start_cluster(&bus, "t-prefs", 3);
    let leader = wait_for_leader(&nodes).await;

    let a = nodes[(leader + 1) % 3].node.id();
    let b = nodes[(leader + 2) % 3].node.id();
    let err = nodes[leader].node.step_down(&[a, b]).expect_err("two prefs");
    assert!(matches!(err, RaftError::TooManyPrefs));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lead_change_stream_reports_transitions() {
    let bus = MemBus::new();
    let group = "t-leadc";
    let ids: Vec<PeerId> = (0..3).map(pid).collect();
    let nodes: Vec<TestNode> = ids
        .iter()
        .map(|id| TestNode::start(&bus, group, *id, &ids))
        .collect();

    let leader = wait_for_leader(&nodes).await;
    let mut leadc = nodes[leader].node.lead_changes().expect("lead changes");
    // The eventual leader may have observed another leader first; the
    // last transition it reported must be gaining leadership.
    loop {
        match leadc.recv().await {
            Some(true) => break,
            Some(false) => continue,
            None => panic!("lead change stream closed"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_follower_catches_up_from_the_log() {
    let bus = MemBus::new();
    let group = "t-catchup";
    let ids: Vec<PeerId> = (0..3).map(pid).collect();

    // Only two of three members start; quorum is still reachable.
    let mut nodes: Vec<TestNode> = ids[..2]
        .iter()
        .map(|id| TestNode::start(&bus, group, *id, &ids))
        .collect();
    let leader = wait_for_leader(&nodes).await;

    for i in 0..10u8 {
        nodes[leader]
            .node
            .propose(format!("entry-{i}").into_bytes())
            .expect("propose");
    }
    wait_until("both nodes apply everything", || {
        nodes.iter().all(|n| n.saw_normal(b"entry-9"))
    })
    .await;

    // The third member joins late and must be caught up from the log.
    nodes.push(TestNode::start(&bus, group, ids[2], &ids));
    wait_until("late follower applies the full log", || {
        (0..10u8).all(|i| nodes[2].saw_normal(format!("entry-{i}").as_bytes()))
    })
    .await;

    wait_until("late follower becomes current", || nodes[2].node.current()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn far_behind_follower_gets_a_snapshot_first() {
    let bus = MemBus::new();
    let group = "t-snap";
    let ids: Vec<PeerId> = (0..2).map(pid).collect();

    let nodes: Vec<TestNode> = ids
        .iter()
        .map(|id| TestNode::start(&bus, group, *id, &ids))
        .collect();
    let leader = wait_for_leader(&nodes).await;

    for i in 0..8u8 {
        nodes[leader]
            .node
            .propose(format!("pre-snap-{i}").into_bytes())
            .expect("propose");
    }
    wait_until("all entries applied on the leader", || {
        let (_, commit, applied) = nodes[leader].node.progress();
        commit == applied && nodes[leader].saw_normal(b"pre-snap-7")
    })
    .await;

    // Snapshot and release the log prefix.
    nodes[leader]
        .node
        .install_snapshot(b"fsm-image".to_vec())
        .expect("install snapshot");
    assert!(nodes[leader].wal.state().first_seq > 1, "log prefix released");

    // A brand-new peer joins; its first catchup delivery must be the
    // snapshot, then the remaining log.
    let joiner = TestNode::start(&bus, group, pid(7), &ids);
    wait_until("joiner installs the snapshot", || {
        joiner.saw_snapshot(b"fsm-image")
    })
    .await;

    wait_until("joiner is proposed into the membership", || {
        nodes[leader]
            .node
            .peers()
            .iter()
            .any(|p| p.id == pid(7))
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_steps_down_when_quorum_is_lost() {
    let bus = MemBus::new();
    let nodes = start_cluster(&bus, "t-quorum", 2);
    let leader = wait_for_leader(&nodes).await;
    let follower = (leader + 1) % 2;

    nodes[follower].node.stop();

    wait_until("leader loses quorum and steps down", || {
        nodes[leader].node.state() != RaftState::Leader
    })
    .await;
    assert!(!nodes[leader].node.quorum());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_removes_persistent_state() {
    let bus = MemBus::new();
    let nodes = start_cluster(&bus, "t-delete", 2);
    wait_for_leader(&nodes).await;

    let store = PathBuf::from(nodes[0]._store.path());
    assert!(store.join("peers.idx").exists());
    nodes[0].node.delete();
    assert!(!store.join("peers.idx").exists());
    assert!(!store.join("tav.idx").exists());
    assert!(!store.join("snapshots").exists());
    assert_eq!(nodes[0].node.state(), RaftState::Closed);
}
