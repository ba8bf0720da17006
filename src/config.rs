use serde::{Deserialize, Serialize};

/// Layer widths of the policy/value network.
///
/// Only the trainer-side model reads these. An executor built from an archive recovers
/// every width from the stored tensors instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Hidden width of both state encoders.
    #[serde(default = "default_state_hidden")]
    pub state_hidden: usize,
    /// Embedding width produced by both state encoders.
    #[serde(default = "default_state_embed")]
    pub state_embed: usize,
    #[serde(default = "default_action_hidden")]
    pub action_hidden: usize,
    #[serde(default = "default_action_embed")]
    pub action_embed: usize,
    #[serde(default = "default_scorer_hidden")]
    pub scorer_hidden: usize,
    #[serde(default = "default_value_hidden")]
    pub value_hidden: usize,
    /// Added to the variance inside every layer normalization.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

fn default_state_hidden() -> usize {
    512
}
fn default_state_embed() -> usize {
    256
}
fn default_action_hidden() -> usize {
    128
}
fn default_action_embed() -> usize {
    64
}
fn default_scorer_hidden() -> usize {
    128
}
fn default_value_hidden() -> usize {
    128
}
pub(crate) fn default_layer_norm_eps() -> f32 {
    1e-5
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            state_hidden: default_state_hidden(),
            state_embed: default_state_embed(),
            action_hidden: default_action_hidden(),
            action_embed: default_action_embed(),
            scorer_hidden: default_scorer_hidden(),
            value_hidden: default_value_hidden(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

/// Knobs of the cross-runtime acceptance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Seed for the reference model's parameter initialization.
    #[serde(default = "default_init_seed")]
    pub init_seed: u64,
    /// Seed for the generated state and action inputs.
    #[serde(default = "default_input_seed")]
    pub input_seed: u64,
    /// Number of (all valid) actions in the generated batch.
    #[serde(default = "default_num_actions")]
    pub num_actions: usize,
    #[serde(default = "default_tolerance")]
    pub score_tolerance: f32,
    #[serde(default = "default_tolerance")]
    pub value_tolerance: f32,
    #[serde(default = "default_tolerance")]
    pub policy_tolerance: f32,
}

fn default_init_seed() -> u64 {
    42
}
fn default_input_seed() -> u64 {
    123
}
fn default_num_actions() -> usize {
    5
}
fn default_tolerance() -> f32 {
    1e-5
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            init_seed: default_init_seed(),
            input_seed: default_input_seed(),
            num_actions: default_num_actions(),
            score_tolerance: default_tolerance(),
            value_tolerance: default_tolerance(),
            policy_tolerance: default_tolerance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let network: NetworkConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(network, NetworkConfig::default());
        assert_eq!(network.state_hidden, 512);
        assert_eq!(network.action_embed, 64);

        let verify: VerifyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(verify.input_seed, 123);
        assert_eq!(verify.num_actions, 5);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let verify: VerifyConfig =
            serde_json::from_str(r#"{"num_actions": 3, "policy_tolerance": 0.001}"#).unwrap();
        assert_eq!(verify.num_actions, 3);
        assert_eq!(verify.policy_tolerance, 0.001);
        assert_eq!(verify.score_tolerance, 1e-5);
    }
}
