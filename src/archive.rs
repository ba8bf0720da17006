//! Weight interchange: every learnable tensor, keyed by the names the graph manifest
//! uses, stored independently of any framework's internal layout.
//!
//! Affine layers are written as `{"kernel": [in][out], "bias": [out]}` so that
//! `output = input · kernel + bias` holds for the reader; the network itself keeps its
//! weights `[out][in]`, so export and import transpose. Layer norms are written as
//! `{"gamma": [n], "beta": [n]}`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{default_layer_norm_eps, NetworkConfig};
use crate::error::{ModelError, Result};
use crate::features::{ACTION_SIZE, STATE_SIZE};
use crate::manifest::{build_graph_manifest, parameter_key, GraphManifest};
use crate::network::{LayerMut, LayerRef, PolicyValueNetwork, VALUE_STATE_ENCODER};

/// Layout version written to `_meta.version`. Readers refuse anything else.
pub const ARCHIVE_VERSION: u32 = 2;

/// Sub-networks an archive may omit. Older snapshots predate the separate value encoder.
pub const OPTIONAL_COMPONENTS: &[&str] = &[VALUE_STATE_ENCODER];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub version: u32,
    pub state_size: usize,
    pub action_size: usize,
    pub graph: GraphManifest,
    /// Epsilon every `layernorm` op adds to the variance. Archives written before this
    /// field existed were all exported with the default.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterRecord {
    Affine { kernel: Vec<Vec<f32>>, bias: Vec<f32> },
    Norm { gamma: Vec<f32>, beta: Vec<f32> },
}

/// One exported model snapshot. Never edited after export; a new snapshot is a new
/// archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightArchive {
    #[serde(rename = "_meta")]
    pub meta: ArchiveMeta,
    #[serde(flatten)]
    pub parameters: BTreeMap<String, ParameterRecord>,
}

impl WeightArchive {
    /// Parse an archive, checking the version before trusting the rest of the layout.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        let version = raw
            .get("_meta")
            .and_then(|meta| meta.get("version"))
            .and_then(serde_json::Value::as_u64)
            .ok_or(ModelError::UnknownGraphVersion(0))?;
        let version = u32::try_from(version).map_err(|_| ModelError::UnknownGraphVersion(u32::MAX))?;
        if version != ARCHIVE_VERSION {
            return Err(ModelError::UnknownGraphVersion(version));
        }
        let archive: WeightArchive = serde_json::from_value(raw)?;
        archive.validate()?;
        Ok(archive)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Version and feature-contract checks shared by every reader.
    pub fn validate(&self) -> Result<()> {
        if self.meta.version != ARCHIVE_VERSION {
            return Err(ModelError::UnknownGraphVersion(self.meta.version));
        }
        if self.meta.state_size != STATE_SIZE {
            return Err(ModelError::SizeMismatch {
                field: "state_size",
                got: self.meta.state_size,
                expected: STATE_SIZE,
            });
        }
        if self.meta.action_size != ACTION_SIZE {
            return Err(ModelError::SizeMismatch {
                field: "action_size",
                got: self.meta.action_size,
                expected: ACTION_SIZE,
            });
        }
        let eps = self.meta.layer_norm_eps;
        if !eps.is_finite() || eps < 0.0 {
            return Err(ModelError::InvalidParameter {
                key: "_meta.layer_norm_eps".to_string(),
                expected: "finite non-negative epsilon",
            });
        }
        Ok(())
    }

    pub fn graph(&self) -> &GraphManifest {
        &self.meta.graph
    }

    pub fn parameter(&self, key: &str) -> Option<&ParameterRecord> {
        self.parameters.get(key)
    }
}

/// Snapshot the network: its graph manifest plus a copy of every parameter.
pub fn export_weights(network: &PolicyValueNetwork) -> WeightArchive {
    let mut parameters = BTreeMap::new();
    for (component, sub) in network.components() {
        for (name, layer) in sub.layers() {
            let record = match layer {
                LayerRef::Linear(linear) => ParameterRecord::Affine {
                    kernel: linear.kernel(),
                    bias: linear.bias().to_vec(),
                },
                LayerRef::Norm(norm) => ParameterRecord::Norm {
                    gamma: norm.gamma().to_vec(),
                    beta: norm.beta().to_vec(),
                },
            };
            parameters.insert(parameter_key(component, name), record);
        }
    }
    info!(
        "exported {} parameter tensors ({} values, graph v{ARCHIVE_VERSION})",
        parameters.len(),
        network.parameter_count()
    );
    WeightArchive {
        meta: ArchiveMeta {
            version: ARCHIVE_VERSION,
            state_size: STATE_SIZE,
            action_size: ACTION_SIZE,
            graph: build_graph_manifest(network),
            layer_norm_eps: network.config().layer_norm_eps,
        },
        parameters,
    }
}

/// What an import actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameter keys copied into the network.
    pub loaded: Vec<String>,
    /// Optional sub-networks missing from the archive that kept their initial values.
    pub fallbacks: Vec<String>,
}

impl LoadReport {
    pub fn used_fallback(&self) -> bool {
        !self.fallbacks.is_empty()
    }
}

/// Copy every parameter from `archive` into `network`.
///
/// The import is all or nothing: values are staged on a copy and only swapped in once
/// every key has been found and shape-checked. A missing optional sub-network is
/// reported in [`LoadReport::fallbacks`] and logged; any other missing key is fatal.
pub fn load_weights(network: &mut PolicyValueNetwork, archive: &WeightArchive) -> Result<LoadReport> {
    archive.validate()?;
    let eps = network.config().layer_norm_eps;
    if archive.meta.layer_norm_eps.to_bits() != eps.to_bits() {
        return Err(ModelError::EpsilonMismatch {
            archive: archive.meta.layer_norm_eps,
            network: eps,
        });
    }
    let mut staged = network.clone();
    let mut report = LoadReport::default();

    for (component, sub) in staged.components_mut() {
        let mut layers = sub.layers_mut();
        let present = layers
            .iter()
            .filter(|(name, _)| archive.parameters.contains_key(&parameter_key(component, name)))
            .count();
        if present == 0 && OPTIONAL_COMPONENTS.contains(&component) {
            warn!("{component} not found in archive, keeping its initial parameters");
            report.fallbacks.push(component.to_string());
            continue;
        }

        for (name, layer) in layers.iter_mut() {
            let key = parameter_key(component, name);
            let record = archive
                .parameter(&key)
                .ok_or_else(|| ModelError::MissingParameter(key.clone()))?;
            match (layer, record) {
                (LayerMut::Linear(linear), ParameterRecord::Affine { kernel, bias }) => {
                    linear.assign_kernel(&key, kernel, bias)?
                }
                (LayerMut::Norm(norm), ParameterRecord::Norm { gamma, beta }) => {
                    norm.assign(&key, gamma, beta)?
                }
                (LayerMut::Linear(_), _) => {
                    return Err(ModelError::InvalidParameter {
                        key,
                        expected: "kernel/bias",
                    })
                }
                (LayerMut::Norm(_), _) => {
                    return Err(ModelError::InvalidParameter {
                        key,
                        expected: "gamma/beta",
                    })
                }
            }
            report.loaded.push(key);
        }
    }

    *network = staged;
    info!(
        "loaded {} parameter tensors, {} fallback(s)",
        report.loaded.len(),
        report.fallbacks.len()
    );
    Ok(report)
}

/// Build a fresh network of the given shape and populate it from `archive`. `seed`
/// only matters for sub-networks that fall back to their initial values. The
/// normalization epsilon is taken from the archive, not from `config`.
pub fn import_network(
    archive: &WeightArchive,
    mut config: NetworkConfig,
    seed: u64,
) -> Result<(PolicyValueNetwork, LoadReport)> {
    config.layer_norm_eps = archive.meta.layer_norm_eps;
    let mut network = PolicyValueNetwork::new(config, seed);
    let report = load_weights(&mut network, archive)?;
    Ok((network, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{ActionBatch, ActionVector, StateVector};
    use crate::predictor::PolicyValueEvaluator;

    fn small_config() -> NetworkConfig {
        NetworkConfig {
            state_hidden: 16,
            state_embed: 8,
            action_hidden: 8,
            action_embed: 4,
            scorer_hidden: 8,
            value_hidden: 8,
            ..NetworkConfig::default()
        }
    }

    fn inputs() -> (StateVector, ActionBatch) {
        let state = StateVector::new((0..STATE_SIZE).map(|i| (i as f32 * 0.37).sin()).collect()).unwrap();
        let actions = (0..3)
            .map(|a| {
                ActionVector::new((0..ACTION_SIZE).map(|i| ((a * 7 + i) as f32 * 0.11).cos()).collect())
                    .unwrap()
            })
            .collect();
        (state, ActionBatch::all_valid(actions).unwrap())
    }

    #[test]
    fn export_stores_transposed_kernels() {
        let net = PolicyValueNetwork::new(small_config(), 1);
        let archive = export_weights(&net);
        match archive.parameter("state_encoder_fc1").unwrap() {
            ParameterRecord::Affine { kernel, bias } => {
                assert_eq!(kernel.len(), STATE_SIZE);
                assert_eq!(kernel[0].len(), 16);
                assert_eq!(bias.len(), 16);
            }
            other => panic!("unexpected record {other:?}"),
        }
        assert!(matches!(
            archive.parameter("action_scorer_ln1"),
            Some(ParameterRecord::Norm { .. })
        ));
        // 4 + 4 + 3 + 3 + 2 layers
        assert_eq!(archive.parameters.len(), 16);
    }

    #[test]
    fn json_roundtrip_reproduces_outputs() {
        let source = PolicyValueNetwork::new(small_config(), 1);
        let json = export_weights(&source).to_json().unwrap();
        assert!(json.starts_with(r#"{"_meta":{"version":2"#));

        let archive = WeightArchive::from_json(&json).unwrap();
        let (restored, report) = import_network(&archive, small_config(), 99).unwrap();
        assert!(!report.used_fallback());
        assert_eq!(report.loaded.len(), 16);
        assert_eq!(restored, source);

        let (state, batch) = inputs();
        assert_eq!(
            source.score_and_evaluate(&state, &batch).unwrap(),
            restored.score_and_evaluate(&state, &batch).unwrap()
        );
    }

    #[test]
    fn missing_value_encoder_falls_back_observably() {
        let source = PolicyValueNetwork::new(small_config(), 1);
        let mut archive = export_weights(&source);
        archive
            .parameters
            .retain(|key, _| !key.starts_with("value_state_encoder_"));

        let mut target = PolicyValueNetwork::new(small_config(), 2);
        let before = target.clone();
        let report = load_weights(&mut target, &archive).unwrap();
        assert_eq!(report.fallbacks, vec!["value_state_encoder".to_string()]);
        assert!(report.used_fallback());
        assert_eq!(report.loaded.len(), 12);

        let value_encoder = |net: &PolicyValueNetwork| {
            net.components()[1]
                .1
                .layers()
                .iter()
                .map(|(_, layer)| match layer {
                    LayerRef::Linear(l) => l.kernel(),
                    LayerRef::Norm(n) => vec![n.gamma().to_vec()],
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(value_encoder(&target), value_encoder(&before));
        assert_ne!(target, before);
    }

    #[test]
    fn missing_mandatory_key_fails_without_touching_network() {
        let source = PolicyValueNetwork::new(small_config(), 1);
        let mut archive = export_weights(&source);
        archive.parameters.remove("value_head_fc2");

        let mut target = PolicyValueNetwork::new(small_config(), 2);
        let before = target.clone();
        let err = load_weights(&mut target, &archive).unwrap_err();
        assert!(matches!(err, ModelError::MissingParameter(ref key) if key == "value_head_fc2"));
        assert_eq!(target, before);
    }

    #[test]
    fn partially_exported_value_encoder_is_fatal() {
        let source = PolicyValueNetwork::new(small_config(), 1);
        let mut archive = export_weights(&source);
        archive.parameters.remove("value_state_encoder_ln2");
        let mut target = PolicyValueNetwork::new(small_config(), 2);
        assert!(matches!(
            load_weights(&mut target, &archive),
            Err(ModelError::MissingParameter(_))
        ));
    }

    #[test]
    fn unknown_version_fails_every_time() {
        let source = PolicyValueNetwork::new(small_config(), 1);
        let mut archive = export_weights(&source);
        archive.meta.version = 3;
        let json = archive.to_json().unwrap();
        for _ in 0..3 {
            assert!(matches!(
                WeightArchive::from_json(&json),
                Err(ModelError::UnknownGraphVersion(3))
            ));
        }

        let mut target = PolicyValueNetwork::new(small_config(), 2);
        let before = target.clone();
        assert!(matches!(
            load_weights(&mut target, &archive),
            Err(ModelError::UnknownGraphVersion(3))
        ));
        assert_eq!(target, before);

        assert!(matches!(
            WeightArchive::from_json(r#"{"_meta": {}}"#),
            Err(ModelError::UnknownGraphVersion(0))
        ));
    }

    #[test]
    fn wrong_shapes_and_record_kinds_are_rejected() {
        let source = PolicyValueNetwork::new(small_config(), 1);
        let archive = export_weights(&source);

        let mut wider = PolicyValueNetwork::new(NetworkConfig::default(), 2);
        assert!(matches!(
            load_weights(&mut wider, &archive),
            Err(ModelError::ShapeMismatch { .. })
        ));

        let mut swapped = archive.clone();
        let norm = swapped.parameters["state_encoder_ln1"].clone();
        swapped.parameters.insert("state_encoder_fc1".into(), norm);
        let mut target = PolicyValueNetwork::new(small_config(), 2);
        assert!(matches!(
            load_weights(&mut target, &swapped),
            Err(ModelError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn mismatched_feature_sizes_are_rejected() {
        let source = PolicyValueNetwork::new(small_config(), 1);
        let mut archive = export_weights(&source);
        archive.meta.state_size = 500;
        let json = archive.to_json().unwrap();
        assert!(matches!(
            WeightArchive::from_json(&json),
            Err(ModelError::SizeMismatch { field: "state_size", .. })
        ));
    }

    #[test]
    fn epsilon_is_exported_and_enforced_on_import() {
        let custom = NetworkConfig {
            layer_norm_eps: 1e-3,
            ..small_config()
        };
        let source = PolicyValueNetwork::new(custom, 1);
        let archive = WeightArchive::from_json(&export_weights(&source).to_json().unwrap()).unwrap();
        assert_eq!(archive.meta.layer_norm_eps, 1e-3);

        let mut target = PolicyValueNetwork::new(small_config(), 2);
        let before = target.clone();
        assert!(matches!(
            load_weights(&mut target, &archive),
            Err(ModelError::EpsilonMismatch { .. })
        ));
        assert_eq!(target, before);

        let (restored, _) = import_network(&archive, small_config(), 2).unwrap();
        assert_eq!(restored, source);
        assert_eq!(restored.config().layer_norm_eps, 1e-3);
    }

    #[test]
    fn archives_without_epsilon_use_the_default() {
        let archive = export_weights(&PolicyValueNetwork::new(small_config(), 1));
        let mut value: serde_json::Value = serde_json::from_str(&archive.to_json().unwrap()).unwrap();
        value["_meta"].as_object_mut().unwrap().remove("layer_norm_eps");
        let legacy = WeightArchive::from_json(&value.to_string()).unwrap();
        assert_eq!(legacy.meta.layer_norm_eps, 1e-5);

        let mut negative = archive;
        negative.meta.layer_norm_eps = -1.0;
        assert!(matches!(
            negative.validate(),
            Err(ModelError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn save_and_load_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let archive = export_weights(&PolicyValueNetwork::new(small_config(), 4));
        archive.save(&path).unwrap();
        assert_eq!(WeightArchive::load(&path).unwrap(), archive);
    }
}
