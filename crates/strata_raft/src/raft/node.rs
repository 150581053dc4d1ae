//! Raft role state machine: election, replication, commit advancement, apply.
//!
//! Two background workers drive the node: a ticker (10 ms) that sends
//! replication rounds as leader or starts elections as follower, and an
//! applier (5 ms) that feeds committed entries to the apply callback in
//! order. The state mutex is never held across a transport send: requests
//! are built under the lock, sent without it, and replies are validated
//! against the current role and term before they are used.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use super::log::RaftLog;
use super::types::{
    AppendEntriesReq, AppendEntriesResp, EntryKind, LogEntry, PeerInfo, PersistentState,
    ProposeResult, RaftTransport, RequestVoteReq, RequestVoteResp, Role,
};

const TICK_INTERVAL: Duration = Duration::from_millis(10);
const APPLY_INTERVAL: Duration = Duration::from_millis(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
const ELECTION_TIMEOUT_MS: std::ops::RangeInclusive<u64> = 150..=300;

/// Replication batch cap per AppendEntries round.
const REPLICATION_BATCH: u64 = 100;

/// Callback invoked with each committed entry, in index order, exactly once
/// per process lifetime.
pub type ApplyFn = Box<dyn Fn(u64, &LogEntry) + Send + Sync>;

struct Volatile {
    role: Role,
    current_term: u64,
    voted_for: i32,
    leader_id: i32,
    commit_index: u64,
    last_applied: u64,
    next_index: HashMap<u32, u64>,
    match_index: HashMap<u32, u64>,
    election_deadline: Instant,
    next_heartbeat: Instant,
    votes_received: usize,
}

/// Point-in-time view of the node for stats surfaces and tests.
#[derive(Clone, Debug)]
pub struct RaftStatus {
    pub id: u32,
    pub role: Role,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_index: u64,
    pub leader_hint: Option<String>,
}

pub struct RaftNode {
    id: u32,
    peers: Vec<PeerInfo>,
    majority: usize,
    log: RaftLog,
    transport: Arc<dyn RaftTransport>,
    apply: ApplyFn,
    state: Mutex<Volatile>,
    shutdown: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Self-handle for worker and election threads; workers hold weak
    /// references so an unstarted or dropped node still tears down.
    weak_self: Weak<RaftNode>,
}

impl RaftNode {
    /// Build a node over its durable log. `peers` lists the other cluster
    /// members; majority counts this node.
    pub fn new(
        id: u32,
        peers: Vec<PeerInfo>,
        log_dir: impl AsRef<Path>,
        transport: Arc<dyn RaftTransport>,
        apply: ApplyFn,
    ) -> anyhow::Result<Arc<Self>> {
        let log = RaftLog::open(log_dir)?;
        let persisted = log.state();
        let majority = (peers.len() + 1) / 2 + 1;
        let node = Arc::new_cyclic(|weak| Self {
            id,
            peers,
            majority,
            log,
            transport,
            apply,
            state: Mutex::new(Volatile {
                role: Role::Follower,
                current_term: persisted.current_term,
                voted_for: persisted.voted_for,
                leader_id: -1,
                commit_index: 0,
                last_applied: 0,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                election_deadline: Instant::now() + random_election_timeout(),
                next_heartbeat: Instant::now(),
                votes_received: 0,
            }),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        });
        Ok(node)
    }

    /// Spawn the ticker and applier workers.
    pub fn start(&self) {
        let ticker = {
            let weak = self.weak_self.clone();
            thread::Builder::new()
                .name(format!("raft-ticker-{}", self.id))
                .spawn(move || loop {
                    thread::sleep(TICK_INTERVAL);
                    let Some(node) = weak.upgrade() else {
                        break;
                    };
                    if node.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    node.tick();
                })
                .expect("spawn raft ticker")
        };
        let applier = {
            let weak = self.weak_self.clone();
            thread::Builder::new()
                .name(format!("raft-applier-{}", self.id))
                .spawn(move || loop {
                    thread::sleep(APPLY_INTERVAL);
                    let Some(node) = weak.upgrade() else {
                        break;
                    };
                    if node.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    node.apply_committed();
                })
                .expect("spawn raft applier")
        };
        let mut threads = self.threads.lock().unwrap();
        threads.push(ticker);
        threads.push(applier);
    }

    /// Stop the workers and wait for them. Idempotent. A worker that ends
    /// up dropping the last handle itself must not join its own thread.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            let _ = handle.join();
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().unwrap().role == Role::Leader
    }

    /// Durable log entry at `index`, for introspection surfaces.
    pub fn log_entry(&self, index: u64) -> Option<LogEntry> {
        self.log.entry(index)
    }

    pub fn status(&self) -> RaftStatus {
        let state = self.state.lock().unwrap();
        RaftStatus {
            id: self.id,
            role: state.role,
            term: state.current_term,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_index: self.log.last_index(),
            leader_hint: self.leader_hint_locked(&state),
        }
    }

    /// Propose a Normal entry. Leaders append locally and return the slot;
    /// replication happens on the next ticker round.
    pub fn propose(&self, command: Vec<u8>) -> anyhow::Result<ProposeResult> {
        self.propose_entry(EntryKind::Normal, command)
    }

    /// Propose an entry of an explicit kind (ShardMove, Config).
    pub fn propose_entry(&self, kind: EntryKind, command: Vec<u8>) -> anyhow::Result<ProposeResult> {
        let state = self.state.lock().unwrap();
        if state.role != Role::Leader {
            return Ok(ProposeResult {
                accepted: false,
                index: 0,
                term: state.current_term,
                leader_hint: self.leader_hint_locked(&state),
            });
        }
        let index = self.log.last_index() + 1;
        let term = state.current_term;
        self.log.append(LogEntry {
            term,
            index,
            kind,
            command,
        })?;
        Ok(ProposeResult {
            accepted: true,
            index,
            term,
            leader_hint: None,
        })
    }

    // ── RPC handlers ──

    pub fn handle_append_entries(&self, req: AppendEntriesReq) -> AppendEntriesResp {
        let mut state = self.state.lock().unwrap();
        let mut resp = AppendEntriesResp {
            term: state.current_term,
            ..Default::default()
        };

        if req.term < state.current_term {
            return resp;
        }
        if req.term > state.current_term {
            self.step_down_locked(&mut state, req.term);
        }
        state.role = Role::Follower;
        state.leader_id = req.leader_id as i32;
        state.election_deadline = Instant::now() + random_election_timeout();
        resp.term = state.current_term;

        if req.prev_log_index > 0 {
            let local_term = self.log.term_at(req.prev_log_index);
            if local_term == 0 {
                // Slot missing entirely.
                resp.conflict_index = self.log.last_index() + 1;
                resp.conflict_term = 0;
                return resp;
            }
            if local_term != req.prev_log_term {
                resp.conflict_term = local_term;
                let mut conflict_index = req.prev_log_index;
                while conflict_index > self.log.first_index()
                    && self.log.term_at(conflict_index - 1) == local_term
                {
                    conflict_index -= 1;
                }
                resp.conflict_index = conflict_index;
                return resp;
            }
        }

        let mut to_append = Vec::new();
        for entry in &req.entries {
            let existing = self.log.term_at(entry.index);
            if existing != 0 && existing != entry.term {
                if let Err(err) = self.log.truncate_from(entry.index) {
                    tracing::error!(error = ?err, index = entry.index, "raft log truncate failed");
                    resp.conflict_index = self.log.last_index() + 1;
                    return resp;
                }
            }
            if entry.index > self.log.last_index() + to_append.len() as u64 {
                to_append.push(entry.clone());
            }
        }
        if let Err(err) = self.log.append_batch(&to_append) {
            tracing::error!(error = ?err, "raft log append failed");
            resp.conflict_index = self.log.last_index() + 1;
            return resp;
        }

        if req.leader_commit > state.commit_index {
            state.commit_index = req.leader_commit.min(self.log.last_index());
        }

        resp.success = true;
        resp.match_index = self.log.last_index();
        resp
    }

    pub fn handle_request_vote(&self, req: RequestVoteReq) -> RequestVoteResp {
        let mut state = self.state.lock().unwrap();
        let mut resp = RequestVoteResp {
            term: state.current_term,
            vote_granted: false,
        };

        if req.term < state.current_term {
            return resp;
        }
        if req.term > state.current_term {
            self.step_down_locked(&mut state, req.term);
        }
        resp.term = state.current_term;

        let can_vote = state.voted_for == -1 || state.voted_for == req.candidate_id as i32;
        let log_ok = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index());

        if can_vote && log_ok {
            let previous = state.voted_for;
            state.voted_for = req.candidate_id as i32;
            if self.persist_locked(&state) {
                state.election_deadline = Instant::now() + random_election_timeout();
                resp.vote_granted = true;
            } else {
                // The vote is a commitment; without durability it is not made.
                state.voted_for = previous;
            }
        }
        resp
    }

    // ── Ticker ──

    fn tick(&self) {
        enum Action {
            None,
            Replicate(Vec<(u32, AppendEntriesReq)>),
            Election(RequestVoteReq),
        }

        let action = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            match state.role {
                Role::Leader => {
                    if now >= state.next_heartbeat {
                        state.next_heartbeat = now + HEARTBEAT_INTERVAL;
                        self.advance_commit_locked(&mut state);
                        Action::Replicate(self.build_replication_round_locked(&state))
                    } else {
                        Action::None
                    }
                }
                Role::Follower | Role::Candidate => {
                    if now >= state.election_deadline {
                        match self.begin_election_locked(&mut state) {
                            Some(req) => Action::Election(req),
                            None => Action::None,
                        }
                    } else {
                        Action::None
                    }
                }
            }
        };

        match action {
            Action::None => {}
            Action::Replicate(requests) => {
                for (peer_id, req) in requests {
                    self.send_append(peer_id, req);
                }
            }
            Action::Election(req) => {
                for peer in &self.peers {
                    let Some(node) = self.weak_self.upgrade() else {
                        return;
                    };
                    let peer_id = peer.id;
                    let vote_req = req;
                    let spawned = thread::Builder::new()
                        .name(format!("raft-vote-{}-{}", self.id, peer_id))
                        .spawn(move || node.send_vote(peer_id, vote_req));
                    if let Err(err) = spawned {
                        tracing::error!(error = ?err, peer = peer_id, "spawn vote thread failed");
                    }
                }
            }
        }
    }

    fn build_replication_round_locked(&self, state: &Volatile) -> Vec<(u32, AppendEntriesReq)> {
        let last = self.log.last_index();
        let mut requests = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let next = state.next_index.get(&peer.id).copied().unwrap_or(last + 1);
            let prev = next.saturating_sub(1);
            let entries = if next <= last {
                self.log.slice(next, last.min(next + REPLICATION_BATCH - 1))
            } else {
                Vec::new()
            };
            requests.push((
                peer.id,
                AppendEntriesReq {
                    term: state.current_term,
                    leader_id: self.id,
                    prev_log_index: prev,
                    prev_log_term: self.log.term_at(prev),
                    entries,
                    leader_commit: state.commit_index,
                },
            ));
        }
        requests
    }

    /// Send one AppendEntries and fold the reply back in, provided the node
    /// is still the same leader in the same term.
    fn send_append(&self, peer_id: u32, req: AppendEntriesReq) {
        let sent_term = req.term;
        let resp = match self.transport.append_entries(peer_id, req) {
            Ok(resp) => resp,
            // Unreachable peer: negative reply, retried next round.
            Err(_) => return,
        };

        let mut state = self.state.lock().unwrap();
        if state.role != Role::Leader || state.current_term != sent_term {
            return;
        }
        if resp.term > state.current_term {
            self.step_down_locked(&mut state, resp.term);
            return;
        }
        if resp.success {
            state.match_index.insert(peer_id, resp.match_index);
            state.next_index.insert(peer_id, resp.match_index + 1);
            self.advance_commit_locked(&mut state);
        } else {
            state.next_index.insert(peer_id, resp.conflict_index.max(1));
        }
    }

    // ── Election ──

    fn begin_election_locked(&self, state: &mut Volatile) -> Option<RequestVoteReq> {
        state.current_term += 1;
        state.role = Role::Candidate;
        state.voted_for = self.id as i32;
        if !self.persist_locked(state) {
            return None;
        }
        state.election_deadline = Instant::now() + random_election_timeout();
        state.votes_received = 1;
        tracing::debug!(id = self.id, term = state.current_term, "starting election");

        if state.votes_received >= self.majority {
            // Single-node cluster: the self vote already carries the majority.
            self.become_leader_locked(state);
            return None;
        }

        Some(RequestVoteReq {
            term: state.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    fn send_vote(&self, peer_id: u32, req: RequestVoteReq) {
        let resp = match self.transport.request_vote(peer_id, req) {
            Ok(resp) => resp,
            // Unreachable peer: counts as no vote.
            Err(_) => return,
        };

        let mut state = self.state.lock().unwrap();
        if state.role != Role::Candidate || state.current_term != req.term {
            return;
        }
        if resp.term > state.current_term {
            self.step_down_locked(&mut state, resp.term);
            return;
        }
        if resp.vote_granted {
            state.votes_received += 1;
            if state.votes_received >= self.majority {
                self.become_leader_locked(&mut state);
            }
        }
    }

    fn become_leader_locked(&self, state: &mut Volatile) {
        state.role = Role::Leader;
        state.leader_id = self.id as i32;
        let last = self.log.last_index();
        state.next_index.clear();
        state.match_index.clear();
        for peer in &self.peers {
            state.next_index.insert(peer.id, last + 1);
            state.match_index.insert(peer.id, 0);
        }
        // Noop in the new term commits entries from prior terms once it
        // replicates (leader completeness).
        let noop = LogEntry {
            term: state.current_term,
            index: last + 1,
            kind: EntryKind::Noop,
            command: Vec::new(),
        };
        if let Err(err) = self.log.append(noop) {
            tracing::error!(error = ?err, "failed to append leader noop");
        }
        // Immediate heartbeat round on the next tick.
        state.next_heartbeat = Instant::now();
        tracing::info!(id = self.id, term = state.current_term, "became leader");
    }

    // ── Commit / apply ──

    fn advance_commit_locked(&self, state: &mut Volatile) {
        let last = self.log.last_index();
        let mut n = last;
        while n > state.commit_index {
            if self.log.term_at(n) == state.current_term {
                let mut count = 1; // self
                for peer in &self.peers {
                    if state.match_index.get(&peer.id).copied().unwrap_or(0) >= n {
                        count += 1;
                    }
                }
                if count >= self.majority {
                    state.commit_index = n;
                    break;
                }
            }
            n -= 1;
        }
    }

    /// Applier body: hand each newly committed entry to the callback in
    /// order. The callback runs without the state lock so a slow apply does
    /// not stall replication acknowledgments.
    fn apply_committed(&self) {
        let batch = {
            let state = self.state.lock().unwrap();
            if state.last_applied >= state.commit_index {
                return;
            }
            self.log.slice(state.last_applied + 1, state.commit_index)
        };
        if batch.is_empty() {
            return;
        }
        let mut applied_to = 0;
        for entry in &batch {
            (self.apply)(entry.index, entry);
            applied_to = entry.index;
        }
        let mut state = self.state.lock().unwrap();
        state.last_applied = state.last_applied.max(applied_to);
    }

    // ── Helpers ──

    fn step_down_locked(&self, state: &mut Volatile, new_term: u64) {
        state.current_term = new_term;
        state.role = Role::Follower;
        state.voted_for = -1;
        if !self.persist_locked(state) {
            tracing::error!(id = self.id, term = new_term, "failed to persist step-down");
        }
        state.election_deadline = Instant::now() + random_election_timeout();
    }

    fn persist_locked(&self, state: &Volatile) -> bool {
        let result = self.log.set_state(PersistentState {
            current_term: state.current_term,
            voted_for: state.voted_for,
        });
        if let Err(err) = &result {
            tracing::error!(error = ?err, "failed to persist raft state");
        }
        result.is_ok()
    }

    fn leader_hint_locked(&self, state: &Volatile) -> Option<String> {
        if state.leader_id < 0 || state.leader_id == self.id as i32 {
            return None;
        }
        self.peers
            .iter()
            .find(|p| p.id == state.leader_id as u32)
            .map(|p| p.address.clone())
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn random_election_timeout() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(ELECTION_TIMEOUT_MS))
}
