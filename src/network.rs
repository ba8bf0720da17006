//! Trainer-side policy/value network.
//!
//! The layout mirrors the training code one to one so that parameter keys line up:
//!
//! * state encoder (policy) and value state encoder: `501 → 512 → 256`, each affine
//!   layer followed by layer norm and ReLU
//! * action encoder: `54 → 128 → 64`, the last affine layer left linear
//! * action scorer: `concat(256, 64) → 128 → 1`
//! * value head: `256 → 128 → 1`, ReLU between the affine layers, tanh at the end
//!
//! The two state encoders are separate instances of [`StateEncoder`] so that the policy
//! and value objectives never share upstream weights.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::config::NetworkConfig;
use crate::error::{ModelError, Result};
use crate::features::{ActionBatch, StateVector, ACTION_SIZE, STATE_SIZE};
use crate::layers::{self, LayerNorm, Linear};
use crate::predictor::{apply_mask, PolicyValueEvaluator, ScoredBatch};

pub const STATE_ENCODER: &str = "state_encoder";
pub const VALUE_STATE_ENCODER: &str = "value_state_encoder";
pub const ACTION_ENCODER: &str = "action_encoder";
pub const ACTION_SCORER: &str = "action_scorer";
pub const VALUE_HEAD: &str = "value_head";

/// Borrowed view of one learnable layer, in execution order.
#[derive(Debug, Clone, Copy)]
pub enum LayerRef<'a> {
    Linear(&'a Linear),
    Norm(&'a LayerNorm),
}

#[derive(Debug)]
pub enum LayerMut<'a> {
    Linear(&'a mut Linear),
    Norm(&'a mut LayerNorm),
}

/// A stack of learnable layers that can be walked by name.
pub trait SubNetwork {
    /// Learnable layers with their local names, in the order the forward pass runs them.
    fn layers(&self) -> Vec<(&'static str, LayerRef<'_>)>;

    fn layers_mut(&mut self) -> Vec<(&'static str, LayerMut<'_>)>;

    fn parameter_count(&self) -> usize {
        self.layers()
            .iter()
            .map(|(_, layer)| match layer {
                LayerRef::Linear(l) => l.parameter_count(),
                LayerRef::Norm(n) => n.parameter_count(),
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateEncoder {
    fc1: Linear,
    ln1: LayerNorm,
    fc2: Linear,
    ln2: LayerNorm,
}

impl StateEncoder {
    pub fn new<R: Rng + ?Sized>(hidden: usize, embed: usize, eps: f32, rng: &mut R) -> Self {
        Self {
            fc1: Linear::new(STATE_SIZE, hidden, rng),
            ln1: LayerNorm::new(hidden, eps),
            fc2: Linear::new(hidden, embed, rng),
            ln2: LayerNorm::new(embed, eps),
        }
    }

    pub fn forward(&self, state: &[f32]) -> Vec<f32> {
        let mut x = self.ln1.forward(&self.fc1.forward(state));
        layers::relu(&mut x);
        let mut x = self.ln2.forward(&self.fc2.forward(&x));
        layers::relu(&mut x);
        x
    }
}

impl SubNetwork for StateEncoder {
    fn layers(&self) -> Vec<(&'static str, LayerRef<'_>)> {
        vec![
            ("fc1", LayerRef::Linear(&self.fc1)),
            ("ln1", LayerRef::Norm(&self.ln1)),
            ("fc2", LayerRef::Linear(&self.fc2)),
            ("ln2", LayerRef::Norm(&self.ln2)),
        ]
    }

    fn layers_mut(&mut self) -> Vec<(&'static str, LayerMut<'_>)> {
        vec![
            ("fc1", LayerMut::Linear(&mut self.fc1)),
            ("ln1", LayerMut::Norm(&mut self.ln1)),
            ("fc2", LayerMut::Linear(&mut self.fc2)),
            ("ln2", LayerMut::Norm(&mut self.ln2)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionEncoder {
    fc1: Linear,
    ln1: LayerNorm,
    fc2: Linear,
}

impl ActionEncoder {
    pub fn new<R: Rng + ?Sized>(hidden: usize, embed: usize, eps: f32, rng: &mut R) -> Self {
        Self {
            fc1: Linear::new(ACTION_SIZE, hidden, rng),
            ln1: LayerNorm::new(hidden, eps),
            fc2: Linear::new(hidden, embed, rng),
        }
    }

    pub fn forward(&self, action: &[f32]) -> Vec<f32> {
        let mut x = self.ln1.forward(&self.fc1.forward(action));
        layers::relu(&mut x);
        self.fc2.forward(&x)
    }
}

impl SubNetwork for ActionEncoder {
    fn layers(&self) -> Vec<(&'static str, LayerRef<'_>)> {
        vec![
            ("fc1", LayerRef::Linear(&self.fc1)),
            ("ln1", LayerRef::Norm(&self.ln1)),
            ("fc2", LayerRef::Linear(&self.fc2)),
        ]
    }

    fn layers_mut(&mut self) -> Vec<(&'static str, LayerMut<'_>)> {
        vec![
            ("fc1", LayerMut::Linear(&mut self.fc1)),
            ("ln1", LayerMut::Norm(&mut self.ln1)),
            ("fc2", LayerMut::Linear(&mut self.fc2)),
        ]
    }
}

/// Scores one `(state embedding, action embedding)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionScorer {
    fc1: Linear,
    ln1: LayerNorm,
    fc2: Linear,
}

impl ActionScorer {
    pub fn new<R: Rng + ?Sized>(
        state_dim: usize,
        action_dim: usize,
        hidden: usize,
        eps: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            fc1: Linear::new(state_dim + action_dim, hidden, rng),
            ln1: LayerNorm::new(hidden, eps),
            fc2: Linear::new(hidden, 1, rng),
        }
    }

    pub fn forward(&self, state_embed: &[f32], action_embed: &[f32]) -> f32 {
        let mut joint = Vec::with_capacity(state_embed.len() + action_embed.len());
        joint.extend_from_slice(state_embed);
        joint.extend_from_slice(action_embed);
        let mut x = self.ln1.forward(&self.fc1.forward(&joint));
        layers::relu(&mut x);
        self.fc2.forward(&x)[0]
    }
}

impl SubNetwork for ActionScorer {
    fn layers(&self) -> Vec<(&'static str, LayerRef<'_>)> {
        vec![
            ("fc1", LayerRef::Linear(&self.fc1)),
            ("ln1", LayerRef::Norm(&self.ln1)),
            ("fc2", LayerRef::Linear(&self.fc2)),
        ]
    }

    fn layers_mut(&mut self) -> Vec<(&'static str, LayerMut<'_>)> {
        vec![
            ("fc1", LayerMut::Linear(&mut self.fc1)),
            ("ln1", LayerMut::Norm(&mut self.ln1)),
            ("fc2", LayerMut::Linear(&mut self.fc2)),
        ]
    }
}

/// Predicts the game outcome from the value-path state embedding. No normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueHead {
    fc1: Linear,
    fc2: Linear,
}

impl ValueHead {
    pub fn new<R: Rng + ?Sized>(state_dim: usize, hidden: usize, rng: &mut R) -> Self {
        Self {
            fc1: Linear::new(state_dim, hidden, rng),
            fc2: Linear::new(hidden, 1, rng),
        }
    }

    pub fn forward(&self, state_embed: &[f32]) -> f32 {
        let mut x = self.fc1.forward(state_embed);
        layers::relu(&mut x);
        let mut out = self.fc2.forward(&x);
        layers::tanh(&mut out);
        out[0]
    }
}

impl SubNetwork for ValueHead {
    fn layers(&self) -> Vec<(&'static str, LayerRef<'_>)> {
        vec![
            ("fc1", LayerRef::Linear(&self.fc1)),
            ("fc2", LayerRef::Linear(&self.fc2)),
        ]
    }

    fn layers_mut(&mut self) -> Vec<(&'static str, LayerMut<'_>)> {
        vec![
            ("fc1", LayerMut::Linear(&mut self.fc1)),
            ("fc2", LayerMut::Linear(&mut self.fc2)),
        ]
    }
}

/// The full network. Given a state and its legal actions it produces one score per
/// action and a scalar value in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyValueNetwork {
    config: NetworkConfig,
    state_encoder: StateEncoder,
    value_state_encoder: StateEncoder,
    action_encoder: ActionEncoder,
    action_scorer: ActionScorer,
    value_head: ValueHead,
}

impl PolicyValueNetwork {
    /// Build with parameters drawn from a seeded, platform-independent generator.
    pub fn new(config: NetworkConfig, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        Self::with_rng(config, &mut rng)
    }

    pub fn with_rng<R: Rng + ?Sized>(config: NetworkConfig, rng: &mut R) -> Self {
        let eps = config.layer_norm_eps;
        let state_encoder = StateEncoder::new(config.state_hidden, config.state_embed, eps, rng);
        let value_state_encoder =
            StateEncoder::new(config.state_hidden, config.state_embed, eps, rng);
        let action_encoder = ActionEncoder::new(config.action_hidden, config.action_embed, eps, rng);
        let action_scorer = ActionScorer::new(
            config.state_embed,
            config.action_embed,
            config.scorer_hidden,
            eps,
            rng,
        );
        let value_head = ValueHead::new(config.state_embed, config.value_hidden, rng);
        Self {
            config,
            state_encoder,
            value_state_encoder,
            action_encoder,
            action_scorer,
            value_head,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Sub-networks by name, in manifest order.
    pub fn components(&self) -> [(&'static str, &dyn SubNetwork); 5] {
        [
            (STATE_ENCODER, &self.state_encoder),
            (VALUE_STATE_ENCODER, &self.value_state_encoder),
            (ACTION_ENCODER, &self.action_encoder),
            (ACTION_SCORER, &self.action_scorer),
            (VALUE_HEAD, &self.value_head),
        ]
    }

    pub fn components_mut(&mut self) -> [(&'static str, &mut dyn SubNetwork); 5] {
        [
            (STATE_ENCODER, &mut self.state_encoder),
            (VALUE_STATE_ENCODER, &mut self.value_state_encoder),
            (ACTION_ENCODER, &mut self.action_encoder),
            (ACTION_SCORER, &mut self.action_scorer),
            (VALUE_HEAD, &mut self.value_head),
        ]
    }

    pub fn parameter_count(&self) -> usize {
        self.components()
            .iter()
            .map(|(_, component)| component.parameter_count())
            .sum()
    }
}

impl PolicyValueEvaluator for PolicyValueNetwork {
    fn score_and_evaluate(&self, state: &StateVector, batch: &ActionBatch) -> Result<ScoredBatch> {
        if batch.valid_count() == 0 {
            return Err(ModelError::EmptyActionBatch);
        }
        let state_embed = self.state_encoder.forward(state.as_slice());
        let value_embed = self.value_state_encoder.forward(state.as_slice());

        let mut scores: Vec<f32> = batch
            .actions()
            .iter()
            .map(|action| {
                let action_embed = self.action_encoder.forward(action.as_slice());
                self.action_scorer.forward(&state_embed, &action_embed)
            })
            .collect();
        apply_mask(&mut scores, batch.mask());

        let value = self.value_head.forward(&value_embed);
        Ok(ScoredBatch { scores, value })
    }
}
