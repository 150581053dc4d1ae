//! Consistent-hash ring with virtual nodes and migration overrides.
//!
//! Hashes are FNV-1a over deterministic inputs, so placement agrees across
//! processes. During an active migration an explicit key-range override is
//! consulted before the ring; a committed shard move reconciles (removes)
//! its overrides.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::Serialize;

/// Descriptor for one shard.
#[derive(Clone, Debug, Default)]
pub struct ShardInfo {
    pub id: u32,
    pub node_id: u32,
    pub node_address: String,
    pub key_count: u64,
    pub byte_size: u64,
    pub migrating: bool,
}

#[derive(Clone, Debug)]
struct OverrideEntry {
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    source_shard: u32,
    target_shard: u32,
}

struct RingState {
    ring: BTreeMap<u64, u32>,
    shards: HashMap<u32, ShardInfo>,
    overrides: Vec<OverrideEntry>,
}

/// Summary for the stats surface.
#[derive(Clone, Debug, Serialize)]
pub struct RingStats {
    pub shard_count: usize,
    pub vnode_count: usize,
    pub override_count: usize,
    pub migrating_shards: usize,
}

pub struct ConsistentHashRing {
    vnodes_per_shard: usize,
    state: RwLock<RingState>,
}

impl ConsistentHashRing {
    pub fn new(vnodes_per_shard: usize) -> Self {
        Self {
            vnodes_per_shard: vnodes_per_shard.max(1),
            state: RwLock::new(RingState {
                ring: BTreeMap::new(),
                shards: HashMap::new(),
                overrides: Vec::new(),
            }),
        }
    }

    pub fn add_shard(&self, shard: ShardInfo) {
        let mut state = self.state.write().unwrap();
        for vnode in 0..self.vnodes_per_shard {
            state.ring.insert(vnode_hash(shard.id, vnode), shard.id);
        }
        state.shards.insert(shard.id, shard);
    }

    pub fn remove_shard(&self, shard_id: u32) {
        let mut state = self.state.write().unwrap();
        state.shards.remove(&shard_id);
        for vnode in 0..self.vnodes_per_shard {
            state.ring.remove(&vnode_hash(shard_id, vnode));
        }
    }

    /// Route a key: overrides first, then the first vnode clockwise from the
    /// key's hash.
    pub fn get_shard(&self, key: &[u8]) -> u32 {
        let state = self.state.read().unwrap();
        for entry in &state.overrides {
            if key >= entry.start_key.as_slice() && key < entry.end_key.as_slice() {
                return entry.target_shard;
            }
        }
        if state.ring.is_empty() {
            return 0;
        }
        let hash = key_hash(key);
        match state.ring.range(hash..).next() {
            Some((_, shard)) => *shard,
            // Wrap around to the first vnode on the ring.
            None => *state.ring.values().next().unwrap(),
        }
    }

    /// Install a redirect for `[start_key, end_key)` and flag both shards as
    /// migrating. The redirect persists until the move reconciles.
    pub fn migrate_key_range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        source_shard: u32,
        target_shard: u32,
    ) {
        let mut state = self.state.write().unwrap();
        if start_key < end_key {
            state.overrides.push(OverrideEntry {
                start_key: start_key.to_vec(),
                end_key: end_key.to_vec(),
                source_shard,
                target_shard,
            });
        }
        if let Some(shard) = state.shards.get_mut(&source_shard) {
            shard.migrating = true;
        }
        if let Some(shard) = state.shards.get_mut(&target_shard) {
            shard.migrating = true;
        }
    }

    /// Reconciliation step once a move completes: drop the move's overrides
    /// and clear the migrating flags.
    pub fn complete_migration(&self, source_shard: u32, target_shard: u32) {
        let mut state = self.state.write().unwrap();
        state
            .overrides
            .retain(|o| !(o.source_shard == source_shard && o.target_shard == target_shard));
        if let Some(shard) = state.shards.get_mut(&source_shard) {
            shard.migrating = false;
        }
        if let Some(shard) = state.shards.get_mut(&target_shard) {
            shard.migrating = false;
        }
    }

    pub fn shard_info(&self, shard_id: u32) -> Option<ShardInfo> {
        self.state.read().unwrap().shards.get(&shard_id).cloned()
    }

    pub fn list_shards(&self) -> Vec<ShardInfo> {
        let state = self.state.read().unwrap();
        let mut shards: Vec<ShardInfo> = state.shards.values().cloned().collect();
        shards.sort_by_key(|s| s.id);
        shards
    }

    pub fn shard_count(&self) -> usize {
        self.state.read().unwrap().shards.len()
    }

    pub fn stats(&self) -> RingStats {
        let state = self.state.read().unwrap();
        RingStats {
            shard_count: state.shards.len(),
            vnode_count: state.ring.len(),
            override_count: state.overrides.len(),
            migrating_shards: state.shards.values().filter(|s| s.migrating).count(),
        }
    }
}

fn key_hash(key: &[u8]) -> u64 {
    fnv1a64(key)
}

fn vnode_hash(shard_id: u32, vnode: usize) -> u64 {
    fnv1a64(format!("shard:{shard_id}:vn:{vnode}").as_bytes())
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: u32) -> ShardInfo {
        ShardInfo {
            id,
            node_id: 1,
            node_address: "127.0.0.1:7000".to_string(),
            ..Default::default()
        }
    }

    fn ring_with(shards: u32) -> ConsistentHashRing {
        let ring = ConsistentHashRing::new(150);
        for id in 0..shards {
            ring.add_shard(shard(id));
        }
        ring
    }

    #[test]
    fn routing_is_deterministic_across_instances() {
        let a = ring_with(8);
        let b = ring_with(8);
        for i in 0..200 {
            let key = format!("key-{i}");
            assert_eq!(a.get_shard(key.as_bytes()), b.get_shard(key.as_bytes()));
        }
    }

    #[test]
    fn every_shard_receives_traffic() {
        let ring = ring_with(8);
        let mut counts = vec![0usize; 8];
        for i in 0..4000 {
            let key = format!("user:{i}");
            counts[ring.get_shard(key.as_bytes()) as usize] += 1;
        }
        for (id, count) in counts.iter().enumerate() {
            assert!(*count > 0, "shard {id} never selected");
        }
    }

    #[test]
    fn overrides_dominate_exactly_in_range() {
        let ring = ring_with(4);
        let inside = b"mkey";
        let below = b"aaa";
        let natural_inside = ring.get_shard(inside);
        let natural_below = ring.get_shard(below);

        ring.migrate_key_range(b"m", b"n", natural_inside, 3);
        assert_eq!(ring.get_shard(inside), 3);
        assert_eq!(ring.get_shard(below), natural_below);
        assert_eq!(ring.get_shard(b"n-outside"), {
            // End of the half-open range is excluded.
            let ring2 = ring_with(4);
            ring2.get_shard(b"n-outside")
        });

        assert!(ring.shard_info(3).unwrap().migrating);
        ring.complete_migration(natural_inside, 3);
        assert_eq!(ring.get_shard(inside), natural_inside);
        assert!(!ring.shard_info(3).unwrap().migrating);
    }

    #[test]
    fn remove_shard_reroutes_its_keys() {
        let ring = ring_with(4);
        let key = b"stable-key";
        let owner = ring.get_shard(key);
        ring.remove_shard(owner);
        let rerouted = ring.get_shard(key);
        assert_ne!(rerouted, owner);
        assert!(ring.shard_info(owner).is_none());
        assert_eq!(ring.shard_count(), 3);
    }

    #[test]
    fn stats_count_vnodes_and_overrides() {
        let ring = ring_with(2);
        ring.migrate_key_range(b"a", b"b", 0, 1);
        let stats = ring.stats();
        assert_eq!(stats.shard_count, 2);
        assert_eq!(stats.vnode_count, 300);
        assert_eq!(stats.override_count, 1);
        assert_eq!(stats.migrating_shards, 2);
    }
}
