//! Raft consensus for a fixed-size cluster.
//!
//! The crate is split the same way the node uses it:
//! - [`types`] — log entries, RPC payloads, the transport seam.
//! - [`log`] — the durable entry log plus persistent term/vote state.
//! - [`node`] — the role state machine (election, replication, apply).

pub mod log;
pub mod node;
pub mod types;

pub use log::RaftLog;
pub use node::{RaftNode, RaftStatus};
pub use types::{
    AppendEntriesReq, AppendEntriesResp, EntryKind, LogEntry, PeerInfo, PersistentState,
    ProposeResult, RaftTransport, RequestVoteReq, RequestVoteResp, Role,
};
