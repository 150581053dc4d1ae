//! Lightweight per-shard operation counters.
//!
//! All counters are lock-free atomics indexed by shard id. The coordinator
//! records one increment per client operation and derives the normalized
//! load and hit-rate figures that feed the predictor's telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time read of the per-shard counters.
#[derive(Clone, Debug)]
pub struct ShardLoadSnapshot {
    pub get_ops: Vec<u64>,
    pub put_ops: Vec<u64>,
    pub delete_ops: Vec<u64>,
    pub get_hits: Vec<u64>,
}

pub struct ShardLoadTracker {
    get_ops: Vec<AtomicU64>,
    put_ops: Vec<AtomicU64>,
    delete_ops: Vec<AtomicU64>,
    get_hits: Vec<AtomicU64>,
}

impl ShardLoadTracker {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        let make = || (0..shards).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
        Self {
            get_ops: make(),
            put_ops: make(),
            delete_ops: make(),
            get_hits: make(),
        }
    }

    pub fn shards(&self) -> usize {
        self.get_ops.len()
    }

    pub fn record_get(&self, shard: u32, hit: bool) {
        if let Some(counter) = self.get_ops.get(shard as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if hit {
            if let Some(counter) = self.get_hits.get(shard as usize) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_put(&self, shard: u32) {
        if let Some(counter) = self.put_ops.get(shard as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_delete(&self, shard: u32) {
        if let Some(counter) = self.delete_ops.get(shard as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fraction of all recorded operations that landed on `shard`.
    pub fn normalized_load(&self, shard: u32) -> f32 {
        let total: u64 = self.totals().iter().sum();
        if total == 0 {
            return 0.0;
        }
        let shard_total = self.shard_total(shard);
        shard_total as f32 / total as f32
    }

    /// Hits over gets for `shard`; 1.0 before any get lands.
    pub fn hit_rate(&self, shard: u32) -> f32 {
        let gets = self
            .get_ops
            .get(shard as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0);
        if gets == 0 {
            return 1.0;
        }
        let hits = self
            .get_hits
            .get(shard as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0);
        hits as f32 / gets as f32
    }

    pub fn snapshot(&self) -> ShardLoadSnapshot {
        let read = |v: &Vec<AtomicU64>| {
            v.iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect::<Vec<_>>()
        };
        ShardLoadSnapshot {
            get_ops: read(&self.get_ops),
            put_ops: read(&self.put_ops),
            delete_ops: read(&self.delete_ops),
            get_hits: read(&self.get_hits),
        }
    }

    fn shard_total(&self, shard: u32) -> u64 {
        let idx = shard as usize;
        let load = |v: &Vec<AtomicU64>| {
            v.get(idx)
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0)
        };
        load(&self.get_ops) + load(&self.put_ops) + load(&self.delete_ops)
    }

    fn totals(&self) -> Vec<u64> {
        (0..self.shards() as u32)
            .map(|shard| self.shard_total(shard))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_load_tracks_skew() {
        let tracker = ShardLoadTracker::new(4);
        for _ in 0..90 {
            tracker.record_put(2);
        }
        for shard in [0, 1, 3].iter() {
            for _ in 0..3 {
                tracker.record_put(*shard);
            }
        }
        assert!(tracker.normalized_load(2) > 0.8);
        assert!(tracker.normalized_load(0) < 0.1);
    }

    #[test]
    fn hit_rate_counts_hits_over_gets() {
        let tracker = ShardLoadTracker::new(2);
        assert_eq!(tracker.hit_rate(0), 1.0);
        tracker.record_get(0, true);
        tracker.record_get(0, true);
        tracker.record_get(0, false);
        tracker.record_get(0, false);
        assert!((tracker.hit_rate(0) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn out_of_range_shards_are_ignored() {
        let tracker = ShardLoadTracker::new(2);
        tracker.record_put(9);
        tracker.record_get(9, true);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.put_ops, vec![0, 0]);
        assert_eq!(snapshot.get_ops, vec![0, 0]);
    }
}
