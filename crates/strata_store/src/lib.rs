//! Shard-aware replicated key-value store.
//!
//! The node is three subsystems behind one coordinator: an LSM storage
//! engine (WAL, skip-list memtable, sorted on-disk runs, leveled
//! compaction), a Raft consensus module (`strata_raft`) that totally orders
//! writes, and a physics-informed load predictor that forecasts per-shard
//! pressure and recommends migrations over a consistent-hash ring.

pub mod backend;
pub mod coordinator;
pub mod load;
pub mod lsm;
pub mod memtable;
pub mod pinn;
pub mod ring;
pub mod sharder;
pub mod sstable;
pub mod tensor;
pub mod wal;

pub use backend::{MemoryBackend, StorageBackend};
pub use coordinator::{
    Coordinator, DisconnectedTransport, GetResult, NodeConfig, NodeStats, WriteOutcome,
};
pub use lsm::{LsmConfig, LsmEngine};
pub use ring::{ConsistentHashRing, ShardInfo};
pub use sharder::{MigrationRecommendation, PredictiveSharder, SharderConfig};
