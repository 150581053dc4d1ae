//! Shared Raft types: log entries, persistent state, RPC payloads, and the
//! transport seam implemented by the (external) RPC layer.

/// Kind of a replicated log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Opaque state-machine command.
    Normal = 0,
    /// Cluster configuration payload.
    Config = 1,
    /// Shard migration authorization.
    ShardMove = 2,
    /// Leader no-op appended at the start of a term.
    Noop = 3,
}

impl EntryKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Config),
            2 => Some(Self::ShardMove),
            3 => Some(Self::Noop),
            _ => None,
        }
    }
}

/// One replicated log entry. Indices are contiguous starting at 1; terms are
/// non-decreasing along the index axis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub kind: EntryKind,
    pub command: Vec<u8>,
}

/// Durable (term, vote) pair. Persisted synchronously before any RPC response
/// that could turn the vote or term into a commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistentState {
    pub current_term: u64,
    /// Candidate voted for in `current_term`; -1 means none.
    pub voted_for: i32,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: -1,
        }
    }
}

/// Role of a node within the current term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

/// Identity and address of one cluster member (excluding self).
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: u32,
    pub address: String,
}

#[derive(Clone, Debug, Default)]
pub struct AppendEntriesReq {
    pub term: u64,
    pub leader_id: u32,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AppendEntriesResp {
    pub term: u64,
    pub success: bool,
    /// Last index of the follower's log after a successful append.
    pub match_index: u64,
    /// On rejection: where the leader should back `next_index` up to.
    pub conflict_index: u64,
    /// On rejection: term of the conflicting slot, 0 when the slot is missing.
    pub conflict_term: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RequestVoteReq {
    pub term: u64,
    pub candidate_id: u32,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RequestVoteResp {
    pub term: u64,
    pub vote_granted: bool,
}

/// Outcome of a client proposal.
#[derive(Clone, Debug)]
pub struct ProposeResult {
    /// True iff this node was leader and appended the entry.
    pub accepted: bool,
    pub index: u64,
    pub term: u64,
    /// Address of the last-known leader when the proposal was rejected.
    pub leader_hint: Option<String>,
}

/// Network seam. A failed or timed-out call is treated by the node as a
/// negative reply (no vote, no ack); it never aborts the state machine.
pub trait RaftTransport: Send + Sync + 'static {
    fn append_entries(&self, peer_id: u32, req: AppendEntriesReq)
        -> anyhow::Result<AppendEntriesResp>;
    fn request_vote(&self, peer_id: u32, req: RequestVoteReq) -> anyhow::Result<RequestVoteResp>;
}
