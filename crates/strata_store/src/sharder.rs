//! Predictive sharder: rolling telemetry, periodic training, forecasts,
//! migration recommendations.
//!
//! Telemetry lands in a fixed-capacity ring buffer stamped with normalized
//! time from an injectable clock (tests drive it deterministically; the
//! default is seconds since start over one hour). A trainer thread takes the
//! most recent batch once per interval and runs one optimization step.
//! Model and buffer share one mutex, held across the training step, so
//! readers never observe partially updated parameters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;

use crate::pinn::{PinnConfig, PinnModel};
use crate::tensor::Tensor;

const TELEMETRY_CAPACITY: usize = 1024;
const TRAIN_BATCH_SIZE: usize = 64;
const MIN_TRAIN_SAMPLES: usize = 8;
const COLLOCATION_POINTS: usize = 16;

/// Trainer shutdown poll granularity.
const TRAINER_POLL: Duration = Duration::from_millis(50);

pub type Clock = Arc<dyn Fn() -> f32 + Send + Sync>;

#[derive(Clone, Debug)]
pub struct SharderConfig {
    pub num_shards: usize,
    pub train_interval: Duration,
    pub pinn: PinnConfig,
}

impl SharderConfig {
    pub fn new(num_shards: usize) -> Self {
        Self {
            num_shards: num_shards.max(1),
            train_interval: Duration::from_secs(5),
            pinn: PinnConfig::default(),
        }
    }
}

/// One telemetry observation.
#[derive(Clone, Copy, Debug)]
pub struct TelemetrySample {
    pub shard_id: u32,
    pub load: f32,
    pub hit_rate: f32,
    pub latency_ms: f32,
    pub timestamp: f32,
}

/// Advisory shard move suggestion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MigrationRecommendation {
    pub from_shard: u32,
    pub to_shard: u32,
    pub predicted_load_from: f32,
    pub predicted_load_to: f32,
    pub confidence: f32,
}

#[derive(Clone, Debug, Serialize)]
pub struct SharderStats {
    pub training_steps: u64,
    pub data_loss: f32,
    pub pde_loss: f32,
    pub total_loss: f32,
    pub parameters: usize,
    pub telemetry_samples: usize,
}

struct SharderInner {
    model: PinnModel,
    samples: Vec<TelemetrySample>,
    head: usize,
}

pub struct PredictiveSharder {
    config: SharderConfig,
    inner: Mutex<SharderInner>,
    clock: Clock,
    shutdown: AtomicBool,
    trainer: Mutex<Option<thread::JoinHandle<()>>>,
    weak_self: Weak<PredictiveSharder>,
}

impl PredictiveSharder {
    pub fn new(config: SharderConfig) -> Arc<Self> {
        let start = Instant::now();
        // Normalized wall clock: one hour maps to 1.0.
        let clock: Clock = Arc::new(move || start.elapsed().as_secs_f32() / 3600.0);
        Self::with_clock(config, clock)
    }

    pub fn with_clock(config: SharderConfig, clock: Clock) -> Arc<Self> {
        let model = PinnModel::new(config.pinn.clone());
        Arc::new_cyclic(|weak| Self {
            config,
            inner: Mutex::new(SharderInner {
                model,
                samples: Vec::with_capacity(TELEMETRY_CAPACITY),
                head: 0,
            }),
            clock,
            shutdown: AtomicBool::new(false),
            trainer: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    /// Spawn the background trainer.
    pub fn start(&self) {
        let weak = self.weak_self.clone();
        let interval = self.config.train_interval;
        let handle = thread::Builder::new()
            .name("predictor-trainer".to_string())
            .spawn(move || {
                let mut last_train = Instant::now();
                loop {
                    thread::sleep(TRAINER_POLL);
                    let Some(sharder) = weak.upgrade() else {
                        break;
                    };
                    if sharder.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    if last_train.elapsed() >= interval {
                        last_train = Instant::now();
                        sharder.train_once();
                    }
                }
            })
            .expect("spawn predictor trainer");
        *self.trainer.lock().unwrap() = Some(handle);
    }

    /// Stop and join the trainer. Idempotent.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.trainer.lock().unwrap().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn record_telemetry(&self, shard_id: u32, load: f32, hit_rate: f32, latency_ms: f32) {
        let timestamp = (self.clock)();
        let sample = TelemetrySample {
            shard_id,
            load,
            hit_rate,
            latency_ms,
            timestamp,
        };
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.head % TELEMETRY_CAPACITY;
        if inner.samples.len() < TELEMETRY_CAPACITY {
            inner.samples.push(sample);
        } else {
            inner.samples[slot] = sample;
        }
        inner.head += 1;
    }

    /// One training step over the most recent batch. Returns false when too
    /// few samples have been recorded.
    pub fn train_once(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.samples.len();
        if count < MIN_TRAIN_SAMPLES {
            return false;
        }
        let take = count.min(TRAIN_BATCH_SIZE);
        let num_shards = self.config.num_shards as f32;

        let mut xs = Vec::with_capacity(take * 2);
        let mut ys = Vec::with_capacity(take);
        let mut t_min = f32::MAX;
        let mut t_max = f32::MIN;
        for i in 0..take {
            let absolute = inner.head - take + i;
            let sample = inner.samples[absolute % TELEMETRY_CAPACITY];
            xs.extend_from_slice(&[sample.shard_id as f32 / num_shards, sample.timestamp]);
            ys.push(sample.load);
            t_min = t_min.min(sample.timestamp);
            t_max = t_max.max(sample.timestamp);
        }
        let data_x = Tensor::from_vec(take, 2, xs);
        let data_y = Tensor::from_vec(take, 1, ys);

        // Collocation points span the observed window.
        let mut rng = rand::thread_rng();
        let t_span = (t_max - t_min).max(1e-3);
        let collocation: Vec<(f32, f32)> = (0..COLLOCATION_POINTS)
            .map(|_| {
                (
                    rng.gen_range(0.0f32..1.0),
                    rng.gen_range(t_min..t_min + t_span),
                )
            })
            .collect();

        inner.model.train_step(&data_x, &data_y, &collocation);
        true
    }

    /// Forecast vector for every shard at now + `t_offset`.
    pub fn predict_loads(&self, t_offset: f32) -> Vec<f32> {
        let t = (self.clock)() + t_offset;
        let inner = self.inner.lock().unwrap();
        inner.model.predict_all_shards(self.config.num_shards, t)
    }

    pub fn predict_shard_load(&self, shard_id: u32, t_offset: f32) -> f32 {
        let t = (self.clock)() + t_offset;
        let x = shard_id as f32 / self.config.num_shards as f32;
        self.inner.lock().unwrap().model.predict(x, t)
    }

    /// For every shard forecast above `threshold`, suggest moving load to
    /// the least-loaded shard, provided that shard sits below the mean.
    /// Advisory: callers decide whether to act.
    pub fn migration_recommendations(&self, threshold: f32) -> Vec<MigrationRecommendation> {
        let loads = self.predict_loads(1.0);
        if loads.is_empty() {
            return Vec::new();
        }
        let mean = loads.iter().sum::<f32>() / loads.len() as f32;
        let mut recommendations = Vec::new();
        for (shard, &load) in loads.iter().enumerate() {
            if load <= threshold {
                continue;
            }
            let (coldest, coldest_load) = loads
                .iter()
                .copied()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .unwrap();
            if coldest != shard && coldest_load < mean {
                recommendations.push(MigrationRecommendation {
                    from_shard: shard as u32,
                    to_shard: coldest as u32,
                    predicted_load_from: load,
                    predicted_load_to: coldest_load,
                    confidence: ((load - coldest_load) / threshold).clamp(0.0, 1.0),
                });
            }
        }
        recommendations
    }

    pub fn stats(&self) -> SharderStats {
        let inner = self.inner.lock().unwrap();
        let loss = inner.model.last_loss();
        SharderStats {
            training_steps: inner.model.train_steps(),
            data_loss: loss.data_loss,
            pde_loss: loss.pde_loss,
            total_loss: loss.total_loss,
            parameters: inner.model.parameter_count(),
            telemetry_samples: inner.samples.len(),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.config.num_shards
    }
}

impl Drop for PredictiveSharder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinn::PinnConfig;
    use std::sync::atomic::AtomicU32;

    fn tiny_sharder_config(num_shards: usize) -> SharderConfig {
        SharderConfig {
            num_shards,
            train_interval: Duration::from_secs(1),
            pinn: PinnConfig {
                hidden_layers: 2,
                hidden_dim: 16,
                learning_rate: 2e-2,
                lambda_pde: 0.1,
                ..Default::default()
            },
        }
    }

    /// Clock backed by an atomic so tests can move time explicitly.
    fn manual_clock() -> (Clock, Arc<AtomicU32>) {
        let bits = Arc::new(AtomicU32::new(0.0f32.to_bits()));
        let shared = Arc::clone(&bits);
        let clock: Clock = Arc::new(move || f32::from_bits(shared.load(Ordering::Relaxed)));
        (clock, bits)
    }

    #[test]
    fn training_needs_minimum_samples() {
        let (clock, _) = manual_clock();
        let sharder = PredictiveSharder::with_clock(tiny_sharder_config(4), clock);
        for _ in 0..7 {
            sharder.record_telemetry(0, 0.5, 1.0, 1.0);
        }
        assert!(!sharder.train_once());
        sharder.record_telemetry(0, 0.5, 1.0, 1.0);
        assert!(sharder.train_once());
        assert_eq!(sharder.stats().training_steps, 1);
    }

    #[test]
    fn telemetry_ring_buffer_wraps() {
        let (clock, _) = manual_clock();
        let sharder = PredictiveSharder::with_clock(tiny_sharder_config(4), clock);
        for i in 0..(TELEMETRY_CAPACITY + 500) {
            sharder.record_telemetry((i % 4) as u32, 0.1, 1.0, 1.0);
        }
        assert_eq!(sharder.stats().telemetry_samples, TELEMETRY_CAPACITY);
    }

    #[test]
    fn forecast_length_matches_shard_count() {
        let (clock, _) = manual_clock();
        let sharder = PredictiveSharder::with_clock(tiny_sharder_config(6), clock);
        let forecast = sharder.predict_loads(0.5);
        assert_eq!(forecast.len(), 6);
        assert!(forecast.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn hotspot_drives_forecast_and_recommendation() {
        let (clock, bits) = manual_clock();
        let sharder = PredictiveSharder::with_clock(tiny_sharder_config(8), clock);

        // Record a sustained hotspot on shard 4 at t = 1.0.
        bits.store(1.0f32.to_bits(), Ordering::Relaxed);
        for _ in 0..40 {
            for shard in 0..8u32 {
                let load = if shard == 4 { 0.9 } else { 0.1 };
                sharder.record_telemetry(shard, load, 1.0, 1.0);
            }
        }
        for _ in 0..500 {
            assert!(sharder.train_once());
        }

        // Probe the trained time region: with the clock at 0, the one-step
        // forecast lands exactly on t = 1.0.
        bits.store(0.0f32.to_bits(), Ordering::Relaxed);
        let hot = sharder.predict_shard_load(4, 1.0);
        for shard in (0..8u32).filter(|s| *s != 4) {
            assert!(
                hot > sharder.predict_shard_load(shard, 1.0),
                "shard 4 ({hot}) not hotter than shard {shard}"
            );
        }

        let recommendations = sharder.migration_recommendations(0.5);
        assert!(
            recommendations.iter().any(|r| r.from_shard == 4),
            "no recommendation away from the hotspot: {recommendations:?}"
        );
        for rec in &recommendations {
            assert!(rec.confidence >= 0.0 && rec.confidence <= 1.0);
        }
    }

    #[test]
    fn background_trainer_runs_and_stops() {
        let (clock, _) = manual_clock();
        let mut config = tiny_sharder_config(4);
        config.train_interval = Duration::from_millis(100);
        let sharder = PredictiveSharder::with_clock(config, clock);
        for _ in 0..32 {
            sharder.record_telemetry(1, 0.4, 1.0, 1.0);
        }
        sharder.start();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sharder.stats().training_steps == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        sharder.stop();
        assert!(sharder.stats().training_steps > 0, "trainer never ran");
    }
}
