//! Physics-informed load regressor.
//!
//! A small feed-forward network maps (x, t) — normalized shard position and
//! time — to a predicted load. Training minimizes a data loss plus a
//! Burgers'-equation residual loss, r = u_t + u*u_x - nu*u_xx, with the
//! derivatives taken by central finite differences on the network output.
//! Gradients flow by reverse-mode backprop: the data batch directly, and
//! each finite-difference stencil evaluation with its chain-rule
//! coefficient. Optimized with Adam.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::tensor::{AdamState, Tensor};

#[derive(Clone, Debug)]
pub struct PinnConfig {
    pub hidden_layers: usize,
    pub hidden_dim: usize,
    pub viscosity: f32,
    pub learning_rate: f32,
    pub lambda_pde: f32,
    pub fd_epsilon: f32,
    pub seed: u64,
}

impl Default for PinnConfig {
    fn default() -> Self {
        Self {
            hidden_layers: 4,
            hidden_dim: 64,
            viscosity: 0.01,
            learning_rate: 1e-3,
            lambda_pde: 1.0,
            fd_epsilon: 1e-2,
            seed: 42,
        }
    }
}

/// Loss components from one training step.
#[derive(Clone, Copy, Debug, Default)]
pub struct LossSnapshot {
    pub data_loss: f32,
    pub pde_loss: f32,
    pub total_loss: f32,
}

struct DenseLayer {
    weights: Tensor,
    bias: Tensor,
    activation: bool,
    w_adam: AdamState,
    b_adam: AdamState,
}

impl DenseLayer {
    fn new(fan_in: usize, fan_out: usize, activation: bool, rng: &mut StdRng) -> Self {
        let mut weights = Tensor::zeros(fan_in, fan_out);
        weights.xavier_init(fan_in, fan_out, rng);
        Self {
            weights,
            bias: Tensor::zeros(1, fan_out),
            activation,
            w_adam: AdamState::new(fan_in, fan_out),
            b_adam: AdamState::new(1, fan_out),
        }
    }
}

struct LayerGrads {
    w: Tensor,
    b: Tensor,
}

pub struct PinnModel {
    config: PinnConfig,
    layers: Vec<DenseLayer>,
    train_steps: u64,
    last_loss: LossSnapshot,
}

impl PinnModel {
    pub fn new(config: PinnConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut layers = Vec::with_capacity(config.hidden_layers + 1);
        let mut fan_in = 2;
        for _ in 0..config.hidden_layers {
            layers.push(DenseLayer::new(fan_in, config.hidden_dim, true, &mut rng));
            fan_in = config.hidden_dim;
        }
        layers.push(DenseLayer::new(fan_in, 1, false, &mut rng));
        Self {
            config,
            layers,
            train_steps: 0,
            last_loss: LossSnapshot::default(),
        }
    }

    pub fn config(&self) -> &PinnConfig {
        &self.config
    }

    pub fn train_steps(&self) -> u64 {
        self.train_steps
    }

    pub fn last_loss(&self) -> LossSnapshot {
        self.last_loss
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.bias.len())
            .sum()
    }

    /// Predicted load at one (x, t).
    pub fn predict(&self, x: f32, t: f32) -> f32 {
        let input = Tensor::from_vec(1, 2, vec![x, t]);
        self.forward(&input).get(0, 0)
    }

    /// Forecast for every shard at time `t`, x = shard / num_shards.
    pub fn predict_all_shards(&self, num_shards: usize, t: f32) -> Vec<f32> {
        (0..num_shards)
            .map(|shard| self.predict(shard as f32 / num_shards as f32, t))
            .collect()
    }

    pub fn forward(&self, input: &Tensor) -> Tensor {
        let mut h = input.clone();
        for layer in &self.layers {
            let z = h.matmul(&layer.weights).add_bias(&layer.bias);
            h = if layer.activation { z.tanh() } else { z };
        }
        h
    }

    /// Burgers' residual and its ingredients at one point, by central
    /// finite differences.
    pub fn residual(&self, x: f32, t: f32) -> f32 {
        let eps = self.config.fd_epsilon;
        let nu = self.config.viscosity;
        let u0 = self.predict(x, t);
        let uxp = self.predict(x + eps, t);
        let uxm = self.predict(x - eps, t);
        let utp = self.predict(x, t + eps);
        let utm = self.predict(x, t - eps);
        let u_t = (utp - utm) / (2.0 * eps);
        let u_x = (uxp - uxm) / (2.0 * eps);
        let u_xx = (uxp - 2.0 * u0 + uxm) / (eps * eps);
        u_t + u0 * u_x - nu * u_xx
    }

    /// One Adam step over a data batch plus collocation points. Returns the
    /// losses measured before the update.
    pub fn train_step(
        &mut self,
        data_x: &Tensor,
        data_y: &Tensor,
        collocation: &[(f32, f32)],
    ) -> LossSnapshot {
        assert_eq!(data_x.cols(), 2, "data input must be (x, t)");
        assert_eq!(data_x.rows(), data_y.rows(), "batch size mismatch");

        let mut grads: Vec<LayerGrads> = self
            .layers
            .iter()
            .map(|l| LayerGrads {
                w: Tensor::zeros(l.weights.rows(), l.weights.cols()),
                b: Tensor::zeros(1, l.bias.cols()),
            })
            .collect();

        // Data fidelity term.
        let n = data_x.rows();
        let trace = self.forward_trace(data_x);
        let pred = trace.last().unwrap();
        let err = pred.sub(data_y);
        let data_loss = err.mean_squared();
        let out_grad = err.scale(2.0 / n as f32);
        self.backward(&trace, &out_grad, &mut grads);

        // PDE residual term over the five-point stencil per collocation
        // point: (x,t), (x+e,t), (x-e,t), (x,t+e), (x,t-e).
        let mut pde_loss = 0.0f32;
        if !collocation.is_empty() && self.config.lambda_pde > 0.0 {
            let m = collocation.len();
            let eps = self.config.fd_epsilon;
            let nu = self.config.viscosity;
            let mut stencil = Vec::with_capacity(5 * m * 2);
            for &(x, t) in collocation {
                stencil.extend_from_slice(&[x, t]);
                stencil.extend_from_slice(&[x + eps, t]);
                stencil.extend_from_slice(&[x - eps, t]);
                stencil.extend_from_slice(&[x, t + eps]);
                stencil.extend_from_slice(&[x, t - eps]);
            }
            let stencil = Tensor::from_vec(5 * m, 2, stencil);
            let trace = self.forward_trace(&stencil);
            let u = trace.last().unwrap();

            let mut out_grad = Tensor::zeros(5 * m, 1);
            for j in 0..m {
                let u0 = u.get(5 * j, 0);
                let uxp = u.get(5 * j + 1, 0);
                let uxm = u.get(5 * j + 2, 0);
                let utp = u.get(5 * j + 3, 0);
                let utm = u.get(5 * j + 4, 0);
                let u_t = (utp - utm) / (2.0 * eps);
                let u_x = (uxp - uxm) / (2.0 * eps);
                let u_xx = (uxp - 2.0 * u0 + uxm) / (eps * eps);
                let r = u_t + u0 * u_x - nu * u_xx;
                pde_loss += r * r;

                let c = self.config.lambda_pde * 2.0 * r / m as f32;
                out_grad.set(5 * j, 0, c * (u_x + 2.0 * nu / (eps * eps)));
                out_grad.set(5 * j + 1, 0, c * (u0 / (2.0 * eps) - nu / (eps * eps)));
                out_grad.set(5 * j + 2, 0, c * (-u0 / (2.0 * eps) - nu / (eps * eps)));
                out_grad.set(5 * j + 3, 0, c / (2.0 * eps));
                out_grad.set(5 * j + 4, 0, -c / (2.0 * eps));
            }
            pde_loss /= m as f32;
            self.backward(&trace, &out_grad, &mut grads);
        }

        let learning_rate = self.config.learning_rate;
        for (layer, grad) in self.layers.iter_mut().zip(grads.iter()) {
            layer.weights.adam_update(&grad.w, &mut layer.w_adam, learning_rate);
            layer.bias.adam_update(&grad.b, &mut layer.b_adam, learning_rate);
        }

        self.train_steps += 1;
        self.last_loss = LossSnapshot {
            data_loss,
            pde_loss,
            total_loss: data_loss + self.config.lambda_pde * pde_loss,
        };
        self.last_loss
    }

    /// Forward pass keeping every activation: trace[0] is the input,
    /// trace[i + 1] the output of layer i.
    fn forward_trace(&self, input: &Tensor) -> Vec<Tensor> {
        let mut trace = Vec::with_capacity(self.layers.len() + 1);
        trace.push(input.clone());
        for layer in &self.layers {
            let z = trace
                .last()
                .unwrap()
                .matmul(&layer.weights)
                .add_bias(&layer.bias);
            trace.push(if layer.activation { z.tanh() } else { z });
        }
        trace
    }

    /// Accumulate parameter gradients for dL/d(output) = `out_grad`.
    fn backward(&self, trace: &[Tensor], out_grad: &Tensor, grads: &mut [LayerGrads]) {
        let mut delta = out_grad.clone();
        for l in (0..self.layers.len()).rev() {
            let layer = &self.layers[l];
            let dz = if layer.activation {
                delta.mul(&trace[l + 1].tanh_grad_from_activation())
            } else {
                delta
            };
            grads[l].w.add_in_place(&trace[l].transpose().matmul(&dz));
            grads[l].b.add_in_place(&dz.column_sums());
            if l > 0 {
                delta = dz.matmul(&layer.weights.transpose());
            } else {
                delta = dz;
            }
        }
        let _ = delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> PinnConfig {
        PinnConfig {
            hidden_layers: 2,
            hidden_dim: 16,
            learning_rate: 1e-2,
            ..Default::default()
        }
    }

    fn fixed_batch() -> (Tensor, Tensor, Vec<(f32, f32)>) {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for i in 0..16 {
            let x = (i % 8) as f32 / 8.0;
            let t = (i / 8) as f32 * 0.1;
            xs.extend_from_slice(&[x, t]);
            // Gentle ramp in x: near-zero Burgers residual, so the data and
            // PDE terms pull in compatible directions.
            ys.push(0.2 + 0.3 * x);
        }
        let collocation = (0..8)
            .map(|i| (i as f32 / 8.0, 0.05f32))
            .collect::<Vec<_>>();
        (
            Tensor::from_vec(16, 2, xs),
            Tensor::from_vec(16, 1, ys),
            collocation,
        )
    }

    #[test]
    fn overfitting_one_batch_decreases_loss() {
        let (x, y, collocation) = fixed_batch();
        let mut model = PinnModel::new(tiny_config());
        let first = model.train_step(&x, &y, &collocation);
        let mut last = first;
        for _ in 0..200 {
            last = model.train_step(&x, &y, &collocation);
        }
        assert!(
            last.total_loss < first.total_loss * 0.5,
            "loss did not converge: first {} last {}",
            first.total_loss,
            last.total_loss
        );
        assert_eq!(model.train_steps(), 201);
    }

    #[test]
    fn default_topology_trains_too() {
        let (x, y, collocation) = fixed_batch();
        let mut model = PinnModel::new(PinnConfig::default());
        assert!(model.parameter_count() > 10_000);
        let first = model.train_step(&x, &y, &collocation);
        let mut last = first;
        for _ in 0..50 {
            last = model.train_step(&x, &y, &collocation);
        }
        assert!(
            last.total_loss < first.total_loss,
            "loss did not decrease: first {} last {}",
            first.total_loss,
            last.total_loss
        );
    }

    #[test]
    fn data_only_training_fits_constant_target() {
        let mut config = tiny_config();
        config.lambda_pde = 0.0;
        let mut model = PinnModel::new(config);
        let x = Tensor::from_vec(4, 2, vec![0.1, 0.0, 0.3, 0.0, 0.6, 0.0, 0.9, 0.0]);
        let y = Tensor::from_vec(4, 1, vec![0.5, 0.5, 0.5, 0.5]);
        for _ in 0..300 {
            model.train_step(&x, &y, &[]);
        }
        for probe in [0.1f32, 0.3, 0.6, 0.9] {
            assert!((model.predict(probe, 0.0) - 0.5).abs() < 0.1);
        }
    }

    #[test]
    fn residual_is_finite_and_small_for_flat_network() {
        let model = PinnModel::new(tiny_config());
        let r = model.residual(0.5, 0.1);
        assert!(r.is_finite());
        // A freshly initialized network is smooth; the residual magnitude
        // stays well below the pathological range.
        assert!(r.abs() < 100.0);
    }

    #[test]
    fn predict_all_shards_has_expected_length() {
        let model = PinnModel::new(tiny_config());
        let forecast = model.predict_all_shards(8, 0.2);
        assert_eq!(forecast.len(), 8);
        assert!(forecast.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn deterministic_initialization_from_seed() {
        let a = PinnModel::new(tiny_config());
        let b = PinnModel::new(tiny_config());
        assert_eq!(a.predict(0.3, 0.7), b.predict(0.3, 0.7));
    }
}
