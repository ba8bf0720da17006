//! Generic forward-pass interpreter driven only by a [`WeightArchive`].
//!
//! The executor knows the *roles* of the five sub-networks (which one encodes the state,
//! which one scores pairs, ...) but nothing about their depth, widths or where the
//! nonlinearities sit: it replays each operation list from the archive's graph and
//! discovers every width from the stored tensors. All shapes are checked once when the
//! executor is built, so a forward pass either succeeds completely or fails on its
//! inputs before any arithmetic runs.

use hashbrown::HashMap;
use log::{info, warn};
use smallvec::{smallvec, SmallVec};
use wasm_bindgen::prelude::*;

use crate::archive::{ParameterRecord, WeightArchive};
use crate::config::VerifyConfig;
use crate::error::{ModelError, Result};
use crate::features::{ActionBatch, StateVector, ACTION_SIZE, STATE_SIZE};
use crate::layers;
use crate::manifest::{GraphManifest, Operation};
use crate::network::{ACTION_ENCODER, ACTION_SCORER, STATE_ENCODER, VALUE_HEAD, VALUE_STATE_ENCODER};
use crate::predictor::{apply_mask, PolicyValueEvaluator, ScoredBatch};
use crate::verify::{verify_test_vector, TestVector};

/// Dense row-major tensor.
#[derive(Debug, Clone)]
struct Tensor {
    shape: SmallVec<[usize; 2]>,
    data: Vec<f32>,
}

impl Tensor {
    fn vector(values: &[f32]) -> Self {
        Self {
            shape: smallvec![values.len()],
            data: values.to_vec(),
        }
    }

    fn matrix(key: &str, rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(ModelError::shape(format!("{key}.kernel[{i}]"), row.len(), cols));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            shape: smallvec![rows.len(), cols],
            data,
        })
    }

    fn rows(&self) -> usize {
        self.shape[0]
    }

    fn cols(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(1)
    }
}

#[derive(Debug, Clone)]
enum Param {
    Affine { kernel: Tensor, bias: Tensor },
    Norm { gamma: Tensor, beta: Tensor },
}

/// A loaded archive, ready to run.
#[derive(Debug, Clone)]
pub struct GraphExecutor {
    graph: GraphManifest,
    params: HashMap<String, Param>,
    eps: f32,
    value_encoder: &'static str,
    state_embed: usize,
    action_embed: usize,
}

impl GraphExecutor {
    pub fn from_archive(archive: &WeightArchive) -> Result<Self> {
        archive.validate()?;
        let graph = archive.graph().clone();
        for required in [STATE_ENCODER, ACTION_ENCODER, ACTION_SCORER, VALUE_HEAD] {
            if !graph.contains_key(required) {
                return Err(ModelError::UnknownSubNetwork(required.to_string()));
            }
        }

        let value_encoder = match graph.get(VALUE_STATE_ENCODER) {
            Some(ops) if ops.iter().filter_map(Operation::key).any(|k| archive.parameter(k).is_some()) => {
                VALUE_STATE_ENCODER
            }
            _ => {
                warn!("{VALUE_STATE_ENCODER} missing from archive, value head reads the {STATE_ENCODER} embedding");
                STATE_ENCODER
            }
        };

        let mut params = HashMap::new();
        for component in [STATE_ENCODER, value_encoder, ACTION_ENCODER, ACTION_SCORER, VALUE_HEAD] {
            for op in &graph[component] {
                let (key, param) = match op {
                    Operation::Affine { key } => match archive.parameter(key) {
                        Some(ParameterRecord::Affine { kernel, bias }) => (
                            key,
                            Param::Affine {
                                kernel: Tensor::matrix(key, kernel)?,
                                bias: Tensor::vector(bias),
                            },
                        ),
                        Some(_) => {
                            return Err(ModelError::InvalidParameter {
                                key: key.clone(),
                                expected: "kernel/bias",
                            })
                        }
                        None => return Err(ModelError::MissingParameter(key.clone())),
                    },
                    Operation::Normalize { key } => match archive.parameter(key) {
                        Some(ParameterRecord::Norm { gamma, beta }) => (
                            key,
                            Param::Norm {
                                gamma: Tensor::vector(gamma),
                                beta: Tensor::vector(beta),
                            },
                        ),
                        Some(_) => {
                            return Err(ModelError::InvalidParameter {
                                key: key.clone(),
                                expected: "gamma/beta",
                            })
                        }
                        None => return Err(ModelError::MissingParameter(key.clone())),
                    },
                    Operation::Relu | Operation::Tanh => continue,
                };
                params.insert(key.clone(), param);
            }
        }

        let mut executor = Self {
            graph,
            params,
            eps: archive.meta.layer_norm_eps,
            value_encoder,
            state_embed: 0,
            action_embed: 0,
        };
        executor.state_embed = executor.output_width(STATE_ENCODER, STATE_SIZE)?;
        executor.action_embed = executor.output_width(ACTION_ENCODER, ACTION_SIZE)?;
        let value_embed = executor.output_width(value_encoder, STATE_SIZE)?;
        let score_width =
            executor.output_width(ACTION_SCORER, executor.state_embed + executor.action_embed)?;
        if score_width != 1 {
            return Err(ModelError::shape(ACTION_SCORER, score_width, 1));
        }
        let value_width = executor.output_width(VALUE_HEAD, value_embed)?;
        if value_width != 1 {
            return Err(ModelError::shape(VALUE_HEAD, value_width, 1));
        }

        info!(
            "graph executor ready: {} tensors, state embed {}, action embed {}",
            executor.params.len(),
            executor.state_embed,
            executor.action_embed
        );
        Ok(executor)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_archive(&WeightArchive::from_json(json)?)
    }

    pub fn state_embed_width(&self) -> usize {
        self.state_embed
    }

    pub fn action_embed_width(&self) -> usize {
        self.action_embed
    }

    /// True when the archive carried its own value-path state encoder.
    pub fn has_value_encoder(&self) -> bool {
        self.value_encoder == VALUE_STATE_ENCODER
    }

    pub fn parameter_count(&self) -> usize {
        self.params
            .values()
            .map(|param| match param {
                Param::Affine { kernel, bias } => kernel.data.len() + bias.data.len(),
                Param::Norm { gamma, beta } => gamma.data.len() + beta.data.len(),
            })
            .sum()
    }

    /// Walk a sub-network's operations symbolically and return its output width.
    fn output_width(&self, component: &str, input: usize) -> Result<usize> {
        let mut width = input;
        for op in self.operations(component)? {
            match op {
                Operation::Affine { key } => {
                    let Some(Param::Affine { kernel, bias }) = self.params.get(key) else {
                        return Err(ModelError::MissingParameter(key.clone()));
                    };
                    if kernel.rows() != width {
                        return Err(ModelError::shape(format!("{key}.kernel rows"), kernel.rows(), width));
                    }
                    if kernel.cols() == 0 {
                        return Err(ModelError::shape(format!("{key}.kernel columns"), 0, 1));
                    }
                    if bias.rows() != kernel.cols() {
                        return Err(ModelError::shape(format!("{key}.bias"), bias.rows(), kernel.cols()));
                    }
                    width = kernel.cols();
                }
                Operation::Normalize { key } => {
                    let Some(Param::Norm { gamma, beta }) = self.params.get(key) else {
                        return Err(ModelError::MissingParameter(key.clone()));
                    };
                    if width == 0 {
                        return Err(ModelError::shape(format!("{key}.gamma"), 0, 1));
                    }
                    if gamma.rows() != width {
                        return Err(ModelError::shape(format!("{key}.gamma"), gamma.rows(), width));
                    }
                    if beta.rows() != width {
                        return Err(ModelError::shape(format!("{key}.beta"), beta.rows(), width));
                    }
                }
                Operation::Relu | Operation::Tanh => {}
            }
        }
        Ok(width)
    }

    fn operations(&self, component: &str) -> Result<&[Operation]> {
        self.graph
            .get(component)
            .map(Vec::as_slice)
            .ok_or_else(|| ModelError::UnknownSubNetwork(component.to_string()))
    }

    /// Replay one sub-network on `input`.
    pub fn run(&self, component: &str, input: &[f32]) -> Result<Vec<f32>> {
        let mut x = input.to_vec();
        for op in self.operations(component)? {
            match op {
                Operation::Affine { key } => {
                    let Some(Param::Affine { kernel, bias }) = self.params.get(key) else {
                        return Err(ModelError::MissingParameter(key.clone()));
                    };
                    if x.len() != kernel.rows() {
                        return Err(ModelError::shape(format!("{key} input"), x.len(), kernel.rows()));
                    }
                    x = layers::affine(&x, &kernel.data, &bias.data);
                }
                Operation::Normalize { key } => {
                    let Some(Param::Norm { gamma, beta }) = self.params.get(key) else {
                        return Err(ModelError::MissingParameter(key.clone()));
                    };
                    if x.len() != gamma.rows() {
                        return Err(ModelError::shape(format!("{key} input"), x.len(), gamma.rows()));
                    }
                    x = layers::layer_norm(&x, &gamma.data, &beta.data, self.eps);
                }
                Operation::Relu => layers::relu(&mut x),
                Operation::Tanh => layers::tanh(&mut x),
            }
        }
        Ok(x)
    }
}

impl PolicyValueEvaluator for GraphExecutor {
    fn score_and_evaluate(&self, state: &StateVector, batch: &ActionBatch) -> Result<ScoredBatch> {
        if batch.valid_count() == 0 {
            return Err(ModelError::EmptyActionBatch);
        }
        let state_embed = self.run(STATE_ENCODER, state.as_slice())?;
        let value_embed = if self.has_value_encoder() {
            self.run(VALUE_STATE_ENCODER, state.as_slice())?
        } else {
            state_embed.clone()
        };

        let mut joint = Vec::with_capacity(self.state_embed + self.action_embed);
        let mut scores = Vec::with_capacity(batch.len());
        for action in batch.actions() {
            let action_embed = self.run(ACTION_ENCODER, action.as_slice())?;
            joint.clear();
            joint.extend_from_slice(&state_embed);
            joint.extend_from_slice(&action_embed);
            scores.push(self.run(ACTION_SCORER, &joint)?[0]);
        }
        apply_mask(&mut scores, batch.mask());

        let value = self.run(VALUE_HEAD, &value_embed)?[0];
        Ok(ScoredBatch { scores, value })
    }
}

fn to_js(err: ModelError) -> JsValue {
    JsValue::from_str(&err.to_string())
}

/// JavaScript handle on a loaded archive.
#[wasm_bindgen]
pub struct PolicyValueExecutor {
    inner: GraphExecutor,
}

#[wasm_bindgen]
impl PolicyValueExecutor {
    /// Parse an archive (the JSON text of `test_weights.json`) and validate it fully.
    #[wasm_bindgen(constructor)]
    pub fn new(archive_json: &str) -> std::result::Result<PolicyValueExecutor, JsValue> {
        let inner = GraphExecutor::from_json(archive_json).map_err(to_js)?;
        Ok(Self { inner })
    }

    /// Raw scores and value: `{ scores: number[], value: number }`. Padded slots score
    /// `-Infinity`. `actions` is an array of 54-entry arrays; `mask` defaults to all
    /// valid.
    #[wasm_bindgen(js_name = scoreActions)]
    pub fn score_actions(
        &self,
        state: Vec<f32>,
        actions: js_sys::Array,
        mask: Option<Vec<u8>>,
    ) -> std::result::Result<JsValue, JsValue> {
        let (state, batch) = js_inputs(state, actions, mask).map_err(to_js)?;
        let scored = self.inner.score_and_evaluate(&state, &batch).map_err(to_js)?;
        serde_wasm_bindgen::to_value(&scored).map_err(JsValue::from)
    }

    /// Policy and value: `{ policy: number[], value: number }`.
    pub fn predict(
        &self,
        state: Vec<f32>,
        actions: js_sys::Array,
        mask: Option<Vec<u8>>,
    ) -> std::result::Result<JsValue, JsValue> {
        let (state, batch) = js_inputs(state, actions, mask).map_err(to_js)?;
        let prediction = self.inner.policy(&state, &batch).map_err(to_js)?;
        serde_wasm_bindgen::to_value(&prediction).map_err(JsValue::from)
    }

    /// Replay a test vector and return the verification report. `config` may be
    /// `undefined` for the default tolerances.
    pub fn verify(&self, test_vector_json: &str, config: JsValue) -> std::result::Result<JsValue, JsValue> {
        let cfg: VerifyConfig = if config.is_undefined() || config.is_null() {
            VerifyConfig::default()
        } else {
            serde_wasm_bindgen::from_value(config)?
        };
        let test_vector = TestVector::from_json(test_vector_json).map_err(to_js)?;
        let report = verify_test_vector(&self.inner, &test_vector, &cfg).map_err(to_js)?;
        serde_wasm_bindgen::to_value(&report).map_err(JsValue::from)
    }

    #[wasm_bindgen(js_name = parameterCount)]
    pub fn parameter_count(&self) -> usize {
        self.inner.parameter_count()
    }

    #[wasm_bindgen(js_name = hasValueEncoder)]
    pub fn has_value_encoder(&self) -> bool {
        self.inner.has_value_encoder()
    }
}

fn js_inputs(
    state: Vec<f32>,
    actions: js_sys::Array,
    mask: Option<Vec<u8>>,
) -> Result<(StateVector, ActionBatch)> {
    let rows = actions
        .iter()
        .map(|action| js_sys::Float32Array::new(&action).to_vec())
        .collect();
    host_inputs(state, rows, mask)
}

/// Check host-supplied buffers and assemble them into a state and a padded batch.
/// A missing mask means every action is real; any non-zero mask byte marks a real action.
fn host_inputs(
    state: Vec<f32>,
    actions: Vec<Vec<f32>>,
    mask: Option<Vec<u8>>,
) -> Result<(StateVector, ActionBatch)> {
    let state = StateVector::new(state)?;
    let mut flat = Vec::with_capacity(actions.len() * ACTION_SIZE);
    for (i, values) in actions.iter().enumerate() {
        if values.len() != ACTION_SIZE {
            return Err(ModelError::shape(format!("action {i}"), values.len(), ACTION_SIZE));
        }
        flat.extend_from_slice(values);
    }
    let mask: Vec<bool> = match mask {
        Some(bytes) => bytes.into_iter().map(|b| b != 0).collect(),
        None => vec![true; actions.len()],
    };
    if mask.len() != actions.len() {
        return Err(ModelError::shape("action mask", mask.len(), actions.len()));
    }
    Ok((state, ActionBatch::from_flat(&flat, mask)?))
}
