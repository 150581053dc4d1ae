//! Node coordinator: routes client operations, proposes writes through the
//! consensus log, applies committed entries to the storage engine, feeds
//! telemetry to the predictor, and turns its recommendations into shard-move
//! proposals.
//!
//! The apply callback is the storage engine's only writer: client `put` and
//! `delete` merely encode a command and hand it to the leader's log.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use strata_raft::{
    AppendEntriesReq, AppendEntriesResp, EntryKind, LogEntry, PeerInfo, RaftNode, RaftTransport,
    RequestVoteReq, RequestVoteResp,
};

use crate::backend::StorageBackend;
use crate::load::ShardLoadTracker;
use crate::lsm::{LsmConfig, LsmEngine, LsmStatsSnapshot};
use crate::ring::{ConsistentHashRing, RingStats, ShardInfo};
use crate::sharder::{MigrationRecommendation, PredictiveSharder, SharderConfig, SharderStats};

const OP_PUT: u8 = 0x01;
const OP_DELETE: u8 = 0x02;

const REBALANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Node configuration; all fields beyond identity have defaults.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: u32,
    pub address: String,
    pub peers: Vec<PeerInfo>,
    pub data_dir: PathBuf,
    pub num_shards: usize,
    pub memtable_size: usize,
    pub pressure_threshold: f32,
    pub vnodes_per_shard: usize,
    pub train_interval: Duration,
}

impl NodeConfig {
    pub fn new(node_id: u32, address: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            address: address.into(),
            peers: Vec::new(),
            data_dir: data_dir.into(),
            num_shards: 8,
            memtable_size: 4 * 1024 * 1024,
            pressure_threshold: 0.8,
            vnodes_per_shard: 150,
            train_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of a read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetResult {
    Found(Vec<u8>),
    NotFound,
}

/// Outcome of a write. Acceptance means the leader appended the command;
/// durability follows once the commit index passes `index`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted { index: u64, term: u64 },
    NotLeader { leader_hint: Option<String> },
}

#[derive(Clone, Debug, Serialize)]
pub struct RaftView {
    pub role: String,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_index: u64,
    pub leader_hint: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PredictorView {
    #[serde(flatten)]
    pub stats: SharderStats,
    pub forecast: Vec<f32>,
}

/// Full stats surface handed to external collaborators (dashboards map this
/// to their wire format).
#[derive(Clone, Debug, Serialize)]
pub struct NodeStats {
    pub node_id: u32,
    pub is_leader: bool,
    pub storage: LsmStatsSnapshot,
    pub ring: RingStats,
    pub raft: RaftView,
    pub predictor: PredictorView,
}

pub struct Coordinator {
    config: NodeConfig,
    engine: Arc<LsmEngine>,
    backend: Arc<dyn StorageBackend>,
    ring: Arc<ConsistentHashRing>,
    sharder: Arc<PredictiveSharder>,
    raft: Arc<RaftNode>,
    load: Arc<ShardLoadTracker>,
    shutdown: AtomicBool,
    rebalancer: Mutex<Option<thread::JoinHandle<()>>>,
    weak_self: Weak<Coordinator>,
}

impl Coordinator {
    /// Build the node: storage engine, ring, predictor, then the consensus
    /// node wired to the apply callback.
    pub fn new(config: NodeConfig, transport: Arc<dyn RaftTransport>) -> anyhow::Result<Arc<Self>> {
        let mut lsm_config = LsmConfig::new(&config.data_dir);
        lsm_config.memtable_size = config.memtable_size;
        let engine = LsmEngine::open(lsm_config)?;
        let backend: Arc<dyn StorageBackend> = engine.clone();

        let ring = Arc::new(ConsistentHashRing::new(config.vnodes_per_shard));
        for shard in 0..config.num_shards as u32 {
            ring.add_shard(ShardInfo {
                id: shard,
                node_id: config.node_id,
                node_address: config.address.clone(),
                ..Default::default()
            });
        }

        let mut sharder_config = SharderConfig::new(config.num_shards);
        sharder_config.train_interval = config.train_interval;
        let sharder = PredictiveSharder::new(sharder_config);

        let load = Arc::new(ShardLoadTracker::new(config.num_shards));

        let apply_backend = Arc::clone(&backend);
        let apply_ring = Arc::clone(&ring);
        let raft = RaftNode::new(
            config.node_id,
            config.peers.clone(),
            config.data_dir.join("raft"),
            transport,
            Box::new(move |index, entry| {
                apply_entry(apply_backend.as_ref(), &apply_ring, index, entry);
            }),
        )?;

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            engine,
            backend,
            ring,
            sharder,
            raft,
            load,
            shutdown: AtomicBool::new(false),
            rebalancer: Mutex::new(None),
            weak_self: weak.clone(),
        }))
    }

    /// Start the consensus node, the predictor trainer, and the rebalance
    /// ticker.
    pub fn start(&self) {
        self.raft.start();
        self.sharder.start();

        let weak = self.weak_self.clone();
        let handle = thread::Builder::new()
            .name("rebalance-ticker".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                loop {
                    thread::sleep(Duration::from_millis(100));
                    let Some(coordinator) = weak.upgrade() else {
                        break;
                    };
                    if coordinator.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    if last.elapsed() >= REBALANCE_INTERVAL {
                        last = Instant::now();
                        if let Err(err) = coordinator.rebalance_once() {
                            tracing::warn!(error = ?err, "rebalance pass failed");
                        }
                    }
                }
            })
            .expect("spawn rebalance ticker");
        *self.rebalancer.lock().unwrap() = Some(handle);
        tracing::info!(
            node_id = self.config.node_id,
            address = %self.config.address,
            shards = self.config.num_shards,
            "coordinator started"
        );
    }

    /// Stop in dependency order: predictor, consensus, storage.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handle) = self.rebalancer.lock().unwrap().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.sharder.stop();
        self.raft.shutdown();
        self.engine.close()?;
        tracing::info!(node_id = self.config.node_id, "coordinator shut down");
        Ok(())
    }

    // ── Client operations ──

    pub fn get(&self, key: &[u8]) -> anyhow::Result<GetResult> {
        anyhow::ensure!(!key.is_empty(), "empty key");
        let shard = self.ring.get_shard(key);
        let start = Instant::now();
        let value = self.backend.load(key)?;
        let latency_ms = start.elapsed().as_secs_f32() * 1000.0;

        self.load.record_get(shard, value.is_some());
        self.sharder.record_telemetry(
            shard,
            self.load.normalized_load(shard),
            self.load.hit_rate(shard),
            latency_ms,
        );

        Ok(match value {
            Some(value) => GetResult::Found(value),
            None => GetResult::NotFound,
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<WriteOutcome> {
        anyhow::ensure!(!key.is_empty(), "empty key");
        let shard = self.ring.get_shard(key);
        let start = Instant::now();
        let result = self.raft.propose(encode_put(key, value))?;
        if !result.accepted {
            return Ok(WriteOutcome::NotLeader {
                leader_hint: result.leader_hint,
            });
        }
        let latency_ms = start.elapsed().as_secs_f32() * 1000.0;

        self.load.record_put(shard);
        self.sharder.record_telemetry(
            shard,
            self.load.normalized_load(shard),
            self.load.hit_rate(shard),
            latency_ms,
        );

        Ok(WriteOutcome::Accepted {
            index: result.index,
            term: result.term,
        })
    }

    pub fn delete(&self, key: &[u8]) -> anyhow::Result<WriteOutcome> {
        anyhow::ensure!(!key.is_empty(), "empty key");
        let shard = self.ring.get_shard(key);
        let start = Instant::now();
        let result = self.raft.propose(encode_delete(key))?;
        if !result.accepted {
            return Ok(WriteOutcome::NotLeader {
                leader_hint: result.leader_hint,
            });
        }
        let latency_ms = start.elapsed().as_secs_f32() * 1000.0;

        self.load.record_delete(shard);
        self.sharder.record_telemetry(
            shard,
            self.load.normalized_load(shard),
            self.load.hit_rate(shard),
            latency_ms,
        );

        Ok(WriteOutcome::Accepted {
            index: result.index,
            term: result.term,
        })
    }

    // ── Rebalancing ──

    /// One leader-side pass: at most one shard-move proposal per cycle so
    /// competing moves never pile up.
    pub fn rebalance_once(&self) -> anyhow::Result<Option<MigrationRecommendation>> {
        if !self.raft.is_leader() {
            return Ok(None);
        }
        let recommendations = self
            .sharder
            .migration_recommendations(self.config.pressure_threshold);
        let Some(recommendation) = recommendations.first().copied() else {
            return Ok(None);
        };
        tracing::info!(
            from = recommendation.from_shard,
            to = recommendation.to_shard,
            predicted_from = recommendation.predicted_load_from,
            predicted_to = recommendation.predicted_load_to,
            confidence = recommendation.confidence,
            "proposing shard move"
        );
        // The key-range transfer itself runs out of band; the committed entry
        // authorizes it and flags both shards.
        let command =
            encode_shard_move(recommendation.from_shard, recommendation.to_shard, b"", b"");
        let result = self.raft.propose_entry(EntryKind::ShardMove, command)?;
        if !result.accepted {
            return Ok(None);
        }
        Ok(Some(recommendation))
    }

    // ── Introspection / passthrough ──

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn node_id(&self) -> u32 {
        self.config.node_id
    }

    pub fn engine(&self) -> &Arc<LsmEngine> {
        &self.engine
    }

    pub fn ring(&self) -> &Arc<ConsistentHashRing> {
        &self.ring
    }

    pub fn sharder(&self) -> &Arc<PredictiveSharder> {
        &self.sharder
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn stats(&self) -> NodeStats {
        let raft = self.raft.status();
        NodeStats {
            node_id: self.config.node_id,
            is_leader: raft.role == strata_raft::Role::Leader,
            storage: self.engine.stats(),
            ring: self.ring.stats(),
            raft: RaftView {
                role: raft.role.name().to_string(),
                term: raft.term,
                commit_index: raft.commit_index,
                last_applied: raft.last_applied,
                last_index: raft.last_index,
                leader_hint: raft.leader_hint,
            },
            predictor: PredictorView {
                stats: self.sharder.stats(),
                forecast: self.sharder.predict_loads(1.0),
            },
        }
    }

    pub fn handle_append_entries(&self, req: AppendEntriesReq) -> AppendEntriesResp {
        self.raft.handle_append_entries(req)
    }

    pub fn handle_request_vote(&self, req: RequestVoteReq) -> RequestVoteResp {
        self.raft.handle_request_vote(req)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Acquire) {
            let _ = self.shutdown();
        }
    }
}

/// Transport for a node with no reachable peers (single-node deployments).
/// Every call reads as a lost message.
pub struct DisconnectedTransport;

impl RaftTransport for DisconnectedTransport {
    fn append_entries(
        &self,
        peer_id: u32,
        _req: AppendEntriesReq,
    ) -> anyhow::Result<AppendEntriesResp> {
        anyhow::bail!("peer {peer_id} unreachable")
    }

    fn request_vote(&self, peer_id: u32, _req: RequestVoteReq) -> anyhow::Result<RequestVoteResp> {
        anyhow::bail!("peer {peer_id} unreachable")
    }
}

// ── Command codec ──

pub fn encode_put(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + key.len() + 4 + value.len());
    out.push(OP_PUT);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    out
}

pub fn encode_delete(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + key.len());
    out.push(OP_DELETE);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out
}

pub fn encode_shard_move(from: u32, to: u32, start_key: &[u8], end_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + 4 + start_key.len() + 4 + end_key.len());
    out.extend_from_slice(&from.to_be_bytes());
    out.extend_from_slice(&to.to_be_bytes());
    out.extend_from_slice(&(start_key.len() as u32).to_be_bytes());
    out.extend_from_slice(start_key);
    out.extend_from_slice(&(end_key.len() as u32).to_be_bytes());
    out.extend_from_slice(end_key);
    out
}

enum KvCommand {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

fn decode_kv_command(data: &[u8]) -> anyhow::Result<KvCommand> {
    anyhow::ensure!(!data.is_empty(), "empty command");
    let mut offset = 1usize;
    match data[0] {
        OP_PUT => {
            let key = read_chunk(data, &mut offset)
                .ok_or_else(|| anyhow::anyhow!("truncated command key"))?;
            let value = read_chunk(data, &mut offset)
                .ok_or_else(|| anyhow::anyhow!("truncated command value"))?;
            Ok(KvCommand::Put { key, value })
        }
        OP_DELETE => {
            let key = read_chunk(data, &mut offset)
                .ok_or_else(|| anyhow::anyhow!("truncated command key"))?;
            Ok(KvCommand::Delete { key })
        }
        other => anyhow::bail!("unknown command opcode {other:#04x}"),
    }
}

struct ShardMoveCommand {
    from: u32,
    to: u32,
    start_key: Vec<u8>,
    end_key: Vec<u8>,
}

fn decode_shard_move(data: &[u8]) -> anyhow::Result<ShardMoveCommand> {
    anyhow::ensure!(data.len() >= 8, "short shard-move command");
    let from = u32::from_be_bytes(data[..4].try_into().unwrap());
    let to = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let mut offset = 8usize;
    let start_key = read_chunk(data, &mut offset)
        .ok_or_else(|| anyhow::anyhow!("truncated shard-move start key"))?;
    let end_key = read_chunk(data, &mut offset)
        .ok_or_else(|| anyhow::anyhow!("truncated shard-move end key"))?;
    Ok(ShardMoveCommand {
        from,
        to,
        start_key,
        end_key,
    })
}

fn read_chunk(data: &[u8], offset: &mut usize) -> Option<Vec<u8>> {
    let len_end = offset.checked_add(4)?;
    let len = u32::from_be_bytes(data.get(*offset..len_end)?.try_into().ok()?) as usize;
    let end = len_end.checked_add(len)?;
    let chunk = data.get(len_end..end)?.to_vec();
    *offset = end;
    Some(chunk)
}

/// Apply one committed entry. Malformed commands are logged and skipped so a
/// bad entry can never wedge the applier.
fn apply_entry(backend: &dyn StorageBackend, ring: &ConsistentHashRing, index: u64, entry: &LogEntry) {
    match entry.kind {
        EntryKind::Noop | EntryKind::Config => {}
        EntryKind::Normal => match decode_kv_command(&entry.command) {
            Ok(KvCommand::Put { key, value }) => {
                if let Err(err) = backend.store(&key, &value) {
                    tracing::error!(error = ?err, index, "apply put failed");
                }
            }
            Ok(KvCommand::Delete { key }) => {
                if let Err(err) = backend.remove(&key) {
                    tracing::error!(error = ?err, index, "apply delete failed");
                }
            }
            Err(err) => {
                tracing::warn!(error = ?err, index, "skipping malformed command");
            }
        },
        EntryKind::ShardMove => match decode_shard_move(&entry.command) {
            Ok(cmd) => {
                // Commit authorizes the move; routing follows the override
                // until the transfer reconciles it.
                ring.migrate_key_range(&cmd.start_key, &cmd.end_key, cmd.from, cmd.to);
                tracing::info!(from = cmd.from, to = cmd.to, index, "shard move committed");
            }
            Err(err) => {
                tracing::warn!(error = ?err, index, "skipping malformed shard move");
            }
        },
    }
}
