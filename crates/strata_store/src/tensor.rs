//! Dense row-major f32 matrix used by the load predictor.
//!
//! Just enough linear algebra for a small feed-forward network: matmul,
//! broadcast bias, tanh and its derivative, reductions, and SGD/Adam
//! parameter updates.

use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), rows * cols, "tensor shape mismatch");
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.cols + col] = value;
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn matmul(&self, rhs: &Tensor) -> Tensor {
        assert_eq!(self.cols, rhs.rows, "matmul shape mismatch");
        let mut out = Tensor::zeros(self.rows, rhs.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a_ik = self.get(i, k);
                if a_ik == 0.0 {
                    continue;
                }
                for j in 0..rhs.cols {
                    out.data[i * rhs.cols + j] += a_ik * rhs.get(k, j);
                }
            }
        }
        out
    }

    /// Add a 1 x cols bias row to every row.
    pub fn add_bias(&self, bias: &Tensor) -> Tensor {
        assert_eq!(bias.rows, 1, "bias must be a single row");
        assert_eq!(bias.cols, self.cols, "bias width mismatch");
        let mut out = self.clone();
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.data[i * self.cols + j] += bias.data[j];
            }
        }
        out
    }

    pub fn add(&self, rhs: &Tensor) -> Tensor {
        self.zip(rhs, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> Tensor {
        self.zip(rhs, |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Tensor) -> Tensor {
        self.zip(rhs, |a, b| a * b)
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        let mut out = self.clone();
        for v in &mut out.data {
            *v *= factor;
        }
        out
    }

    pub fn tanh(&self) -> Tensor {
        let mut out = self.clone();
        for v in &mut out.data {
            *v = v.tanh();
        }
        out
    }

    /// Derivative of tanh given the *activated* values: 1 - a^2.
    pub fn tanh_grad_from_activation(&self) -> Tensor {
        let mut out = self.clone();
        for v in &mut out.data {
            *v = 1.0 - *v * *v;
        }
        out
    }

    pub fn transpose(&self) -> Tensor {
        let mut out = Tensor::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.data[j * self.rows + i] = self.get(i, j);
            }
        }
        out
    }

    pub fn column(&self, col: usize) -> Tensor {
        let mut out = Tensor::zeros(self.rows, 1);
        for i in 0..self.rows {
            out.data[i] = self.get(i, col);
        }
        out
    }

    /// Sum of each column as a 1 x cols row (bias gradients).
    pub fn column_sums(&self) -> Tensor {
        let mut out = Tensor::zeros(1, self.cols);
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.data[j] += self.get(i, j);
            }
        }
        out
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn mean_squared(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|v| v * v).sum::<f32>() / self.data.len() as f32
    }

    pub fn zero_fill(&mut self) {
        self.data.fill(0.0);
    }

    pub fn add_in_place(&mut self, rhs: &Tensor) {
        assert_eq!(self.data.len(), rhs.data.len(), "shape mismatch");
        for (a, b) in self.data.iter_mut().zip(rhs.data.iter()) {
            *a += b;
        }
    }

    /// Xavier/Glorot uniform init: +-sqrt(6 / (fan_in + fan_out)).
    pub fn xavier_init(&mut self, fan_in: usize, fan_out: usize, rng: &mut impl Rng) {
        let scale = (6.0f32 / (fan_in + fan_out) as f32).sqrt();
        for v in &mut self.data {
            *v = rng.gen_range(-scale..scale);
        }
    }

    pub fn sgd_update(&mut self, grad: &Tensor, learning_rate: f32) {
        assert_eq!(self.data.len(), grad.data.len(), "shape mismatch");
        for (p, g) in self.data.iter_mut().zip(grad.data.iter()) {
            *p -= learning_rate * g;
        }
    }

    pub fn adam_update(&mut self, grad: &Tensor, state: &mut AdamState, learning_rate: f32) {
        assert_eq!(self.data.len(), grad.data.len(), "shape mismatch");
        const BETA1: f32 = 0.9;
        const BETA2: f32 = 0.999;
        const EPS: f32 = 1e-8;
        state.step += 1;
        let bias1 = 1.0 - BETA1.powi(state.step);
        let bias2 = 1.0 - BETA2.powi(state.step);
        for i in 0..self.data.len() {
            let g = grad.data[i];
            state.m.data[i] = BETA1 * state.m.data[i] + (1.0 - BETA1) * g;
            state.v.data[i] = BETA2 * state.v.data[i] + (1.0 - BETA2) * g * g;
            let m_hat = state.m.data[i] / bias1;
            let v_hat = state.v.data[i] / bias2;
            self.data[i] -= learning_rate * m_hat / (v_hat.sqrt() + EPS);
        }
    }

    fn zip(&self, rhs: &Tensor, f: impl Fn(f32, f32) -> f32) -> Tensor {
        assert_eq!(self.rows, rhs.rows, "shape mismatch");
        assert_eq!(self.cols, rhs.cols, "shape mismatch");
        let data = self
            .data
            .iter()
            .zip(rhs.data.iter())
            .map(|(a, b)| f(*a, *b))
            .collect();
        Tensor {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }
}

/// First/second moment buffers for Adam.
#[derive(Clone, Debug)]
pub struct AdamState {
    m: Tensor,
    v: Tensor,
    step: i32,
}

impl AdamState {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            m: Tensor::zeros(rows, cols),
            v: Tensor::zeros(rows, cols),
            step: 0,
        }
    }
}
