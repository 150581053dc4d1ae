pub mod raft;

pub use raft::{
    AppendEntriesReq, AppendEntriesResp, EntryKind, LogEntry, PeerInfo, PersistentState,
    ProposeResult, RaftLog, RaftNode, RaftStatus, RaftTransport, RequestVoteReq, RequestVoteResp,
    Role,
};
