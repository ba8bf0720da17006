//! The closed set of numeric primitives every sub-network is built from.
//!
//! Both the trainer-side model and the graph executor call into these functions, and all
//! of them accumulate left to right in `f32`, so two hosts replaying the same operations
//! on the same parameters agree bit for bit.

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::error::{ModelError, Result};

/// Affine layer stored the way the training framework keeps it: `weight` is row-major
/// `[out_features][in_features]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    in_features: usize,
    out_features: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl Linear {
    /// Fresh layer drawn from `U(-1/sqrt(in), 1/sqrt(in))` for weights and bias.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let weight = (0..in_features * out_features)
            .map(|_| dist.sample(rng))
            .collect();
        let bias = (0..out_features).map(|_| dist.sample(rng)).collect();
        Self {
            in_features,
            out_features,
            weight,
            bias,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    pub fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        debug_assert_eq!(input.len(), self.in_features);
        self.weight
            .chunks_exact(self.in_features)
            .zip(&self.bias)
            .map(|(row, &b)| {
                let mut acc = 0.0f32;
                for (&x, &w) in input.iter().zip(row) {
                    acc += x * w;
                }
                acc + b
            })
            .collect()
    }

    /// The weights as an `[in][out]` kernel, so that `output = input · kernel + bias`.
    pub fn kernel(&self) -> Vec<Vec<f32>> {
        (0..self.in_features)
            .map(|i| {
                (0..self.out_features)
                    .map(|o| self.weight[o * self.in_features + i])
                    .collect()
            })
            .collect()
    }

    /// Overwrite weights from an `[in][out]` kernel. Shapes must match this layer exactly.
    pub fn assign_kernel(&mut self, key: &str, kernel: &[Vec<f32>], bias: &[f32]) -> Result<()> {
        if kernel.len() != self.in_features {
            return Err(ModelError::shape(format!("{key}.kernel rows"), kernel.len(), self.in_features));
        }
        if bias.len() != self.out_features {
            return Err(ModelError::shape(format!("{key}.bias"), bias.len(), self.out_features));
        }
        for (i, row) in kernel.iter().enumerate() {
            if row.len() != self.out_features {
                return Err(ModelError::shape(format!("{key}.kernel[{i}]"), row.len(), self.out_features));
            }
            for (o, &w) in row.iter().enumerate() {
                self.weight[o * self.in_features + i] = w;
            }
        }
        self.bias.copy_from_slice(bias);
        Ok(())
    }
}

/// Per-example layer normalization with a learned affine correction.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    gamma: Vec<f32>,
    beta: Vec<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(features: usize, eps: f32) -> Self {
        Self {
            gamma: vec![1.0; features],
            beta: vec![0.0; features],
            eps,
        }
    }

    pub fn features(&self) -> usize {
        self.gamma.len()
    }

    pub fn gamma(&self) -> &[f32] {
        &self.gamma
    }

    pub fn beta(&self) -> &[f32] {
        &self.beta
    }

    pub fn parameter_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        layer_norm(input, &self.gamma, &self.beta, self.eps)
    }

    pub fn assign(&mut self, key: &str, gamma: &[f32], beta: &[f32]) -> Result<()> {
        if gamma.len() != self.gamma.len() {
            return Err(ModelError::shape(format!("{key}.gamma"), gamma.len(), self.gamma.len()));
        }
        if beta.len() != self.beta.len() {
            return Err(ModelError::shape(format!("{key}.beta"), beta.len(), self.beta.len()));
        }
        self.gamma.copy_from_slice(gamma);
        self.beta.copy_from_slice(beta);
        Ok(())
    }
}

/// `output[o] = sum_i input[i] * kernel[i * out + o] + bias[o]` over a row-major
/// `[in][out]` kernel.
pub fn affine(input: &[f32], kernel: &[f32], bias: &[f32]) -> Vec<f32> {
    let out = bias.len();
    debug_assert_eq!(kernel.len(), input.len() * out);
    if out == 0 {
        return Vec::new();
    }
    let mut acc = vec![0.0f32; out];
    for (&x, row) in input.iter().zip(kernel.chunks_exact(out)) {
        for (a, &w) in acc.iter_mut().zip(row) {
            *a += x * w;
        }
    }
    for (a, &b) in acc.iter_mut().zip(bias) {
        *a += b;
    }
    acc
}

/// Standardize `input` by its own mean and biased variance, then scale and shift.
pub fn layer_norm(input: &[f32], gamma: &[f32], beta: &[f32], eps: f32) -> Vec<f32> {
    let n = input.len() as f32;
    let mut sum = 0.0f32;
    for &x in input {
        sum += x;
    }
    let mean = sum / n;
    let mut sq = 0.0f32;
    for &x in input {
        let d = x - mean;
        sq += d * d;
    }
    let inv_std = 1.0 / (sq / n + eps).sqrt();
    input
        .iter()
        .zip(gamma.iter().zip(beta))
        .map(|(&x, (&g, &b))| (x - mean) * inv_std * g + b)
        .collect()
}

pub fn relu(values: &mut [f32]) {
    for v in values {
        *v = v.max(0.0);
    }
}

pub fn tanh(values: &mut [f32]) {
    for v in values {
        *v = v.tanh();
    }
}
