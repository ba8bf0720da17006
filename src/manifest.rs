//! Architecture as data: the ordered list of operations each sub-network runs.
//!
//! On the wire an operation is `{"op": "linear", "key": "state_encoder_fc1"}`,
//! `{"op": "layernorm", "key": ...}`, `{"op": "relu"}` or `{"op": "tanh"}`. An executor
//! replays every list front to back; normalization and the nonlinearities do not commute
//! with the affine layers, so nothing may be reordered.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::network::{LayerRef, PolicyValueNetwork, VALUE_HEAD};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// `x · kernel + bias` with the parameters stored under `key`.
    #[serde(rename = "linear")]
    Affine { key: String },
    /// Layer normalization with the `gamma`/`beta` stored under `key`.
    #[serde(rename = "layernorm")]
    Normalize { key: String },
    Relu,
    Tanh,
}

impl Operation {
    /// Parameter key, for the two operations that carry one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Operation::Affine { key } | Operation::Normalize { key } => Some(key),
            Operation::Relu | Operation::Tanh => None,
        }
    }
}

/// Sub-network name to its operations, in execution order.
pub type GraphManifest = BTreeMap<String, Vec<Operation>>;

/// Parameter key of layer `layer` inside `component`.
pub fn parameter_key(component: &str, layer: &str) -> String {
    format!("{component}_{layer}")
}

/// Walk the network once and describe its forward pass.
///
/// Every layer norm is followed by a ReLU. The value head has no layer norm: it gets a
/// ReLU after each affine layer but the last, and one trailing tanh.
pub fn build_graph_manifest(network: &PolicyValueNetwork) -> GraphManifest {
    let mut graph = GraphManifest::new();
    for (component, sub) in network.components() {
        let layers = sub.layers();
        let mut ops = Vec::with_capacity(layers.len() * 2);
        if component == VALUE_HEAD {
            let last_linear = layers
                .iter()
                .rposition(|(_, layer)| matches!(layer, LayerRef::Linear(_)));
            for (index, (name, layer)) in layers.iter().enumerate() {
                let key = parameter_key(component, name);
                match layer {
                    LayerRef::Linear(_) => {
                        ops.push(Operation::Affine { key });
                        if Some(index) != last_linear {
                            ops.push(Operation::Relu);
                        }
                    }
                    LayerRef::Norm(_) => ops.push(Operation::Normalize { key }),
                }
            }
            ops.push(Operation::Tanh);
        } else {
            for (name, layer) in &layers {
                let key = parameter_key(component, name);
                match layer {
                    LayerRef::Linear(_) => ops.push(Operation::Affine { key }),
                    LayerRef::Norm(_) => {
                        ops.push(Operation::Normalize { key });
                        ops.push(Operation::Relu);
                    }
                }
            }
        }
        graph.insert(component.to_string(), ops);
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn affine(key: &str) -> Operation {
        Operation::Affine { key: key.into() }
    }

    fn norm(key: &str) -> Operation {
        Operation::Normalize { key: key.into() }
    }

    #[test]
    fn manifest_matches_forward_pass_order() {
        let net = PolicyValueNetwork::new(NetworkConfig::default(), 0);
        let graph = build_graph_manifest(&net);
        assert_eq!(graph.len(), 5);

        assert_eq!(
            graph["state_encoder"],
            vec![
                affine("state_encoder_fc1"),
                norm("state_encoder_ln1"),
                Operation::Relu,
                affine("state_encoder_fc2"),
                norm("state_encoder_ln2"),
                Operation::Relu,
            ]
        );
        assert_eq!(graph["value_state_encoder"][0], affine("value_state_encoder_fc1"));
        assert_eq!(
            graph["action_encoder"],
            vec![
                affine("action_encoder_fc1"),
                norm("action_encoder_ln1"),
                Operation::Relu,
                affine("action_encoder_fc2"),
            ]
        );
        assert_eq!(
            graph["action_scorer"],
            vec![
                affine("action_scorer_fc1"),
                norm("action_scorer_ln1"),
                Operation::Relu,
                affine("action_scorer_fc2"),
            ]
        );
    }

    #[test]
    fn value_head_ends_in_tanh_without_normalization() {
        let net = PolicyValueNetwork::new(NetworkConfig::default(), 0);
        let graph = build_graph_manifest(&net);
        assert_eq!(
            graph["value_head"],
            vec![
                affine("value_head_fc1"),
                Operation::Relu,
                affine("value_head_fc2"),
                Operation::Tanh,
            ]
        );
    }

    #[test]
    fn manifest_is_independent_of_weights() {
        let a = build_graph_manifest(&PolicyValueNetwork::new(NetworkConfig::default(), 1));
        let b = build_graph_manifest(&PolicyValueNetwork::new(NetworkConfig::default(), 2));
        assert_eq!(a, b);
    }

    #[test]
    fn operations_use_the_wire_names() {
        let json = serde_json::to_string(&vec![
            affine("k1"),
            norm("k2"),
            Operation::Relu,
            Operation::Tanh,
        ])
        .unwrap();
        assert_eq!(
            json,
            r#"[{"op":"linear","key":"k1"},{"op":"layernorm","key":"k2"},{"op":"relu"},{"op":"tanh"}]"#
        );

        let parsed: Vec<Operation> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[1].key(), Some("k2"));
        assert_eq!(parsed[2].key(), None);
        assert!(serde_json::from_str::<Operation>(r#"{"op":"sigmoid"}"#).is_err());
    }
}
