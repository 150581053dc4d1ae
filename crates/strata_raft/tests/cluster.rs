//! In-process cluster tests: election, replication under partition, and
//! divergent-log repair.
//!
//! The mesh transport routes RPCs straight into peer handlers; blocking a
//! node drops its traffic in both directions, which models a partitioned
//! peer (calls fail fast and count as negative replies).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use strata_raft::{
    AppendEntriesReq, AppendEntriesResp, EntryKind, LogEntry, PeerInfo, PersistentState, RaftLog,
    RaftNode, RaftTransport, RequestVoteReq, RequestVoteResp, Role,
};

#[derive(Default)]
struct Mesh {
    nodes: Mutex<HashMap<u32, Arc<RaftNode>>>,
    blocked: Mutex<HashSet<u32>>,
}

impl Mesh {
    fn register(&self, id: u32, node: Arc<RaftNode>) {
        self.nodes.lock().unwrap().insert(id, node);
    }

    fn block(&self, id: u32) {
        self.blocked.lock().unwrap().insert(id);
    }

    fn unblock(&self, id: u32) {
        self.blocked.lock().unwrap().remove(&id);
    }

    fn reachable(&self, from: u32, to: u32) -> bool {
        let blocked = self.blocked.lock().unwrap();
        !blocked.contains(&from) && !blocked.contains(&to)
    }

    fn node(&self, id: u32) -> Option<Arc<RaftNode>> {
        self.nodes.lock().unwrap().get(&id).cloned()
    }
}

struct MeshTransport {
    mesh: Arc<Mesh>,
    from: u32,
}

impl RaftTransport for MeshTransport {
    fn append_entries(
        &self,
        peer_id: u32,
        req: AppendEntriesReq,
    ) -> anyhow::Result<AppendEntriesResp> {
        anyhow::ensure!(self.mesh.reachable(self.from, peer_id), "link down");
        let node = self
            .mesh
            .node(peer_id)
            .ok_or_else(|| anyhow::anyhow!("no such peer"))?;
        Ok(node.handle_append_entries(req))
    }

    fn request_vote(&self, peer_id: u32, req: RequestVoteReq) -> anyhow::Result<RequestVoteResp> {
        anyhow::ensure!(self.mesh.reachable(self.from, peer_id), "link down");
        let node = self
            .mesh
            .node(peer_id)
            .ok_or_else(|| anyhow::anyhow!("no such peer"))?;
        Ok(node.handle_request_vote(req))
    }
}

type AppliedLog = Arc<Mutex<Vec<(u64, LogEntry)>>>;

struct Cluster {
    mesh: Arc<Mesh>,
    nodes: Vec<Arc<RaftNode>>,
    applied: Vec<AppliedLog>,
    _dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
    /// Build and start `n` nodes with fresh (or pre-seeded) log directories.
    fn start(n: u32, seed: impl Fn(u32, &std::path::Path)) -> Self {
        let mesh = Arc::new(Mesh::default());
        let mut nodes = Vec::new();
        let mut applied = Vec::new();
        let mut dirs = Vec::new();
        for id in 1..=n {
            let dir = tempfile::tempdir().unwrap();
            seed(id, dir.path());

            let peers: Vec<PeerInfo> = (1..=n)
                .filter(|p| *p != id)
                .map(|p| PeerInfo {
                    id: p,
                    address: format!("127.0.0.1:{}", 7400 + p),
                })
                .collect();
            let log: AppliedLog = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&log);
            let node = RaftNode::new(
                id,
                peers,
                dir.path(),
                Arc::new(MeshTransport {
                    mesh: Arc::clone(&mesh),
                    from: id,
                }),
                Box::new(move |index, entry| {
                    sink.lock().unwrap().push((index, entry.clone()));
                }),
            )
            .unwrap();
            mesh.register(id, Arc::clone(&node));
            nodes.push(node);
            applied.push(log);
            dirs.push(dir);
        }
        for node in &nodes {
            node.start();
        }
        Self {
            mesh,
            nodes,
            applied,
            _dirs: dirs,
        }
    }

    fn node(&self, id: u32) -> &Arc<RaftNode> {
        &self.nodes[(id - 1) as usize]
    }

    fn leaders(&self, skip: &[u32]) -> Vec<u32> {
        self.nodes
            .iter()
            .filter(|n| !skip.contains(&n.id()))
            .filter(|n| n.status().role == Role::Leader)
            .map(|n| n.id())
            .collect()
    }

    fn stop(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

fn wait_for_single_leader(cluster: &Cluster, skip: &[u32]) -> u32 {
    assert!(
        wait_until(Duration::from_secs(5), || cluster.leaders(skip).len() == 1),
        "no single leader emerged"
    );
    cluster.leaders(skip)[0]
}

#[test]
fn three_nodes_elect_exactly_one_leader_and_recover_from_leader_loss() {
    let cluster = Cluster::start(3, |_, _| {});
    let first_leader = wait_for_single_leader(&cluster, &[]);
    let first_term = cluster.node(first_leader).status().term;

    // No term may ever report two leaders.
    let mut leaders_by_term: HashMap<u64, HashSet<u32>> = HashMap::new();
    for _ in 0..20 {
        for node in &cluster.nodes {
            let status = node.status();
            if status.role == Role::Leader {
                leaders_by_term.entry(status.term).or_default().insert(status.id);
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    for (term, ids) in &leaders_by_term {
        assert!(ids.len() <= 1, "term {term} saw leaders {ids:?}");
    }

    // Kill the leader; a survivor takes over with a strictly greater term.
    cluster.node(first_leader).shutdown();
    cluster.mesh.block(first_leader);
    let second_leader = wait_for_single_leader(&cluster, &[first_leader]);
    assert_ne!(second_leader, first_leader);
    let second_term = cluster.node(second_leader).status().term;
    assert!(
        second_term > first_term,
        "new leader term {second_term} not greater than {first_term}"
    );
    cluster.stop();
}

#[test]
fn replication_catches_up_a_partitioned_follower() {
    let cluster = Cluster::start(3, |_, _| {});
    let leader_id = wait_for_single_leader(&cluster, &[]);
    let partitioned = (1..=3).find(|id| *id != leader_id).unwrap();
    cluster.mesh.block(partitioned);

    // All 100 proposals commit on the connected majority.
    let leader = cluster.node(leader_id);
    let mut last_index = 0;
    for i in 0..100 {
        let result = leader.propose(format!("cmd-{i}").into_bytes()).unwrap();
        assert!(result.accepted, "leader refused proposal {i}");
        last_index = result.index;
    }
    assert!(
        wait_until(Duration::from_secs(5), || {
            leader.status().commit_index >= last_index
        }),
        "proposals failed to commit with a majority"
    );
    assert!(cluster.node(partitioned).status().last_index < last_index);

    // Reconnect: the follower converges to the current leader's log. The
    // partitioned node may force a re-election through its inflated term,
    // but it cannot win with a stale log.
    cluster.mesh.unblock(partitioned);
    assert!(
        wait_until(Duration::from_secs(10), || {
            let current_leader = match cluster.leaders(&[]).first() {
                Some(id) => *id,
                None => return false,
            };
            let leader_status = cluster.node(current_leader).status();
            let follower_status = cluster.node(partitioned).status();
            current_leader != partitioned
                && leader_status.last_index >= last_index
                && follower_status.last_index == leader_status.last_index
                && follower_status.commit_index >= last_index
        }),
        "partitioned follower never caught up"
    );
    cluster.stop();
}

#[test]
fn leader_repairs_a_divergent_follower_suffix() {
    // Shared prefix: five entries in term 1. Nodes 1 and 3 then hold three
    // entries from term 3; node 2 holds a five-entry divergent suffix from
    // term 2 that must be truncated and replaced.
    let prefix: Vec<LogEntry> = (1..=5)
        .map(|index| LogEntry {
            term: 1,
            index,
            kind: EntryKind::Normal,
            command: format!("base-{index}").into_bytes(),
        })
        .collect();
    let good_suffix: Vec<LogEntry> = (6..=8)
        .map(|index| LogEntry {
            term: 3,
            index,
            kind: EntryKind::Normal,
            command: format!("good-{index}").into_bytes(),
        })
        .collect();
    let divergent_suffix: Vec<LogEntry> = (6..=10)
        .map(|index| LogEntry {
            term: 2,
            index,
            kind: EntryKind::Normal,
            command: format!("stale-{index}").into_bytes(),
        })
        .collect();

    let cluster = Cluster::start(3, |id, dir| {
        let log = RaftLog::open(dir).unwrap();
        log.append_batch(&prefix).unwrap();
        match id {
            2 => {
                log.append_batch(&divergent_suffix).unwrap();
                log.set_state(PersistentState {
                    current_term: 2,
                    voted_for: -1,
                })
                .unwrap();
            }
            _ => {
                log.append_batch(&good_suffix).unwrap();
                log.set_state(PersistentState {
                    current_term: 3,
                    voted_for: -1,
                })
                .unwrap();
            }
        }
    });

    let leader_id = wait_for_single_leader(&cluster, &[]);
    assert_ne!(leader_id, 2, "a stale log must not win the election");

    let leader = cluster.node(leader_id);
    assert!(
        wait_until(Duration::from_secs(5), || {
            let follower = cluster.node(2).status();
            follower.last_index == leader.status().last_index
        }),
        "divergent follower never converged"
    );

    // The five stale entries are gone; the replacement carries term 3.
    let follower_log = RaftLogProbe::new(cluster.node(2));
    for index in 6..=8 {
        assert_eq!(follower_log.term_at(index), 3, "index {index}");
        assert_eq!(
            follower_log.command_at(index),
            format!("good-{index}").into_bytes()
        );
    }
    let last = cluster.node(2).status().last_index;
    assert!(last >= 9, "leader noop missing");
    for index in 9..=last {
        assert!(follower_log.term_at(index) > 3, "index {index} kept a stale term");
    }
    cluster.stop();
}

/// Reads a follower's log through the replication-facing status surface.
struct RaftLogProbe<'a> {
    node: &'a Arc<RaftNode>,
}

impl<'a> RaftLogProbe<'a> {
    fn new(node: &'a Arc<RaftNode>) -> Self {
        Self { node }
    }

    fn term_at(&self, index: u64) -> u64 {
        self.node.log_entry(index).map(|e| e.term).unwrap_or(0)
    }

    fn command_at(&self, index: u64) -> Vec<u8> {
        self.node
            .log_entry(index)
            .map(|e| e.command)
            .unwrap_or_default()
    }
}

#[test]
fn applier_feeds_entries_in_order_without_gaps() {
    let cluster = Cluster::start(3, |_, _| {});
    let leader_id = wait_for_single_leader(&cluster, &[]);
    let leader = cluster.node(leader_id);

    let mut last_index = 0;
    for i in 0..20 {
        let result = leader.propose(format!("apply-{i}").into_bytes()).unwrap();
        assert!(result.accepted);
        last_index = result.index;
    }
    assert!(
        wait_until(Duration::from_secs(5), || {
            cluster
                .nodes
                .iter()
                .all(|n| n.status().last_applied >= last_index)
        }),
        "entries never applied everywhere"
    );

    for (node_idx, log) in cluster.applied.iter().enumerate() {
        let applied = log.lock().unwrap();
        assert!(!applied.is_empty());
        assert_eq!(applied[0].0, 1, "node {} applied from {}", node_idx + 1, applied[0].0);
        for window in applied.windows(2) {
            assert_eq!(
                window[1].0,
                window[0].0 + 1,
                "node {} applied out of order",
                node_idx + 1
            );
        }
    }

    // Committed prefixes agree byte for byte across nodes.
    let reference = cluster.applied[0].lock().unwrap().clone();
    for log in &cluster.applied[1..] {
        let other = log.lock().unwrap();
        let common = reference.len().min(other.len());
        for i in 0..common {
            assert_eq!(reference[i].0, other[i].0);
            assert_eq!(reference[i].1.command, other[i].1.command);
        }
    }
    cluster.stop();
}
