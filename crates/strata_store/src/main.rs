//! Node binary: parse arguments, start a coordinator, park until shutdown.
//!
//! The wire protocol and dashboard live in external collaborators; this
//! binary only stands the core up. Without a registered transport the node
//! runs single-node (a one-member cluster elects itself).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use strata_raft::PeerInfo;
use strata_store::{Coordinator, DisconnectedTransport, NodeConfig};

#[derive(Debug, Parser)]
#[command(name = "strata-store-node", about = "Shard-aware replicated KV node")]
struct NodeArgs {
    /// Integer cluster identity of this node.
    #[arg(long, default_value_t = 1)]
    node_id: u32,

    /// Address this node advertises to peers.
    #[arg(long, default_value = "127.0.0.1:7400")]
    address: String,

    /// Other cluster members as `id@host:port`, repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Root directory for WAL, tables, and the consensus log.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Initial shard count.
    #[arg(long, default_value_t = 8)]
    num_shards: usize,

    /// Memtable flush threshold in bytes.
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    memtable_size: usize,

    /// Predicted load above which a shard counts as overloaded.
    #[arg(long, default_value_t = 0.8)]
    pressure_threshold: f32,
}

fn parse_peer(spec: &str) -> anyhow::Result<PeerInfo> {
    let (id, address) = spec
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("peer `{spec}` is not id@host:port"))?;
    Ok(PeerInfo {
        id: id.parse()?,
        address: address.to_string(),
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    let mut config = NodeConfig::new(args.node_id, args.address, args.data_dir);
    config.num_shards = args.num_shards.max(1);
    config.memtable_size = args.memtable_size;
    config.pressure_threshold = args.pressure_threshold;
    config.peers = args
        .peers
        .iter()
        .map(|spec| parse_peer(spec))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let coordinator = Coordinator::new(config, Arc::new(DisconnectedTransport))?;
    coordinator.start();

    let stop = Arc::new(AtomicBool::new(false));
    watch_for_shutdown({
        let stop = Arc::clone(&stop);
        move || stop.store(true, Ordering::Release)
    });
    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(200));
    }

    coordinator.shutdown()
}

/// Trigger shutdown once stdin reaches EOF. Signal handling proper belongs
/// to the supervising transport layer.
fn watch_for_shutdown(on_stop: impl Fn() + Send + 'static) {
    std::thread::Builder::new()
        .name("shutdown-watch".to_string())
        .spawn(move || {
            use std::io::Read;
            let mut buf = [0u8; 256];
            let mut stdin = std::io::stdin();
            while let Ok(n) = stdin.read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
            on_stop();
        })
        .expect("spawn shutdown watcher");
}
