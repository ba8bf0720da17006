use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::features::{ActionBatch, StateVector};

/// Raw output of one forward pass: per-action scores aligned with the batch (masked
/// slots hold `-inf`) and the value estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredBatch {
    pub scores: Vec<f32>,
    pub value: f32,
}

/// Shape of the object handed to the search agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkPrediction {
    /// Probability per action in the batch; exactly 0 on padded slots.
    pub policy: Vec<f32>,
    /// Scalar evaluation in [-1.0, 1.0] from the perspective of the side to move.
    pub value: f32,
}

/// Anything that can run the policy/value forward pass: the trainer-side network and
/// the archive-driven graph executor both implement this.
pub trait PolicyValueEvaluator {
    fn score_and_evaluate(&self, state: &StateVector, batch: &ActionBatch) -> Result<ScoredBatch>;

    /// Softmax over the masked scores, plus the value.
    fn policy(&self, state: &StateVector, batch: &ActionBatch) -> Result<NetworkPrediction> {
        let ScoredBatch { scores, value } = self.score_and_evaluate(state, batch)?;
        Ok(NetworkPrediction {
            policy: masked_softmax(&scores),
            value,
        })
    }
}

/// Overwrite every padded slot with `-inf` so it can never receive probability.
pub fn apply_mask(scores: &mut [f32], mask: &[bool]) {
    for (score, &valid) in scores.iter_mut().zip(mask) {
        if !valid {
            *score = f32::NEG_INFINITY;
        }
    }
}

/// Normalized exponential over `scores`, shifted by the largest finite score.
///
/// `-inf` entries map to exactly 0. If no entry is finite the result is all zeros.
pub fn masked_softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .fold(None, |best: Option<f32>, s| Some(best.map_or(s, |b| b.max(s))));
    let Some(max) = max else {
        return vec![0.0; scores.len()];
    };

    let mut probs: Vec<f32> = scores
        .iter()
        .map(|&s| {
            if s == f32::NEG_INFINITY {
                0.0
            } else {
                (s - max).exp()
            }
        })
        .collect();
    let mut sum = 0.0f32;
    for &p in &probs {
        sum += p;
    }
    for p in &mut probs {
        *p /= sum;
    }
    probs
}
