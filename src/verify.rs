//! Cross-runtime acceptance check.
//!
//! A reference bundle is a weight archive plus a test vector: fixed-seed inputs and the
//! outputs the exporting runtime produced for them. Any executor that loads the archive
//! and replays the inputs must land within tolerance of those outputs. Mismatches are
//! collected in a [`VerificationReport`] rather than raised as errors.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{error, info};
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::archive::{export_weights, WeightArchive};
use crate::config::{NetworkConfig, VerifyConfig};
use crate::error::{ModelError, Result};
use crate::executor::GraphExecutor;
use crate::features::{ActionBatch, ActionVector, StateVector, ACTION_SIZE, STATE_SIZE};
use crate::network::PolicyValueNetwork;
use crate::predictor::PolicyValueEvaluator;

pub const WEIGHTS_FILE: &str = "test_weights.json";
pub const TEST_CASE_FILE: &str = "test_case.json";

/// Inputs and expected outputs for one all-valid batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVector {
    pub state: Vec<f32>,
    pub actions: Vec<Vec<f32>>,
    pub expected_scores: Vec<f32>,
    pub expected_value: f32,
    pub expected_policy: Vec<f32>,
}

impl TestVector {
    /// The stored inputs, checked against the feature contracts.
    pub fn inputs(&self) -> Result<(StateVector, ActionBatch)> {
        let state = StateVector::new(self.state.clone())?;
        let actions = self
            .actions
            .iter()
            .map(|action| ActionVector::new(action.clone()))
            .collect::<Result<Vec<_>>>()?;
        if self.expected_scores.len() != actions.len() {
            return Err(ModelError::shape("expected_scores", self.expected_scores.len(), actions.len()));
        }
        if self.expected_policy.len() != actions.len() {
            return Err(ModelError::shape("expected_policy", self.expected_policy.len(), actions.len()));
        }
        Ok((state, ActionBatch::all_valid(actions)?))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// Standard-normal state and action features from a platform-independent generator.
pub fn generate_inputs(seed: u64, num_actions: usize) -> Result<(StateVector, ActionBatch)> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut draw = |n: usize| -> Vec<f32> { (0..n).map(|_| StandardNormal.sample(&mut rng)).collect() };
    let state = StateVector::new(draw(STATE_SIZE))?;
    let actions = (0..num_actions)
        .map(|_| ActionVector::new(draw(ACTION_SIZE)))
        .collect::<Result<Vec<_>>>()?;
    Ok((state, ActionBatch::all_valid(actions)?))
}

/// Run `evaluator` once on seeded inputs and record what it produced.
pub fn generate_test_vector<E: PolicyValueEvaluator + ?Sized>(
    evaluator: &E,
    seed: u64,
    num_actions: usize,
) -> Result<TestVector> {
    let (state, batch) = generate_inputs(seed, num_actions)?;
    let scored = evaluator.score_and_evaluate(&state, &batch)?;
    let prediction = evaluator.policy(&state, &batch)?;
    Ok(TestVector {
        state: state.as_slice().to_vec(),
        actions: batch.actions().iter().map(|a| a.as_slice().to_vec()).collect(),
        expected_scores: scored.scores,
        expected_value: scored.value,
        expected_policy: prediction.policy,
    })
}

/// One output that landed outside its tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericDivergence {
    /// e.g. `scores[3]`, `value`, `policy[0]`.
    pub output: String,
    pub expected: f32,
    pub actual: f32,
    pub tolerance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub max_score_error: f32,
    pub value_error: f32,
    pub max_policy_error: f32,
    pub divergences: Vec<NumericDivergence>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.divergences.is_empty()
    }

    fn check(&mut self, output: String, expected: f32, actual: f32, tolerance: f32) -> f32 {
        let err = (expected - actual).abs();
        // NaN compares false and must count as a divergence.
        if !(err <= tolerance) && expected != actual {
            self.divergences.push(NumericDivergence {
                output,
                expected,
                actual,
                tolerance,
            });
        }
        if err.is_nan() {
            f32::INFINITY
        } else {
            err
        }
    }
}

/// Replay `test_vector` through `evaluator` and compare every output.
///
/// Returns `Err` only when the test vector itself breaks the feature contracts.
pub fn verify_test_vector<E: PolicyValueEvaluator + ?Sized>(
    evaluator: &E,
    test_vector: &TestVector,
    config: &VerifyConfig,
) -> Result<VerificationReport> {
    let (state, batch) = test_vector.inputs()?;
    let scored = evaluator.score_and_evaluate(&state, &batch)?;
    let prediction = evaluator.policy(&state, &batch)?;

    let mut report = VerificationReport::default();
    for (i, (&expected, &actual)) in test_vector.expected_scores.iter().zip(&scored.scores).enumerate() {
        let err = report.check(format!("scores[{i}]"), expected, actual, config.score_tolerance);
        report.max_score_error = report.max_score_error.max(err);
    }
    report.value_error = report.check(
        "value".to_string(),
        test_vector.expected_value,
        scored.value,
        config.value_tolerance,
    );
    for (i, (&expected, &actual)) in test_vector.expected_policy.iter().zip(&prediction.policy).enumerate() {
        let err = report.check(format!("policy[{i}]"), expected, actual, config.policy_tolerance);
        report.max_policy_error = report.max_policy_error.max(err);
    }

    if report.passed() {
        info!(
            "verification passed: max score err {:.3e}, value err {:.3e}, max policy err {:.3e}",
            report.max_score_error, report.value_error, report.max_policy_error
        );
    } else {
        error!("verification failed with {} divergence(s)", report.divergences.len());
    }
    Ok(report)
}

/// An archive and the test vector produced alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceBundle {
    pub archive: WeightArchive,
    pub test_vector: TestVector,
}

/// Seed a network, export it and record its outputs on seeded inputs.
pub fn build_reference_bundle(network: NetworkConfig, config: &VerifyConfig) -> Result<ReferenceBundle> {
    let model = PolicyValueNetwork::new(network, config.init_seed);
    let archive = export_weights(&model);
    let test_vector = generate_test_vector(&model, config.input_seed, config.num_actions)?;
    Ok(ReferenceBundle { archive, test_vector })
}

/// Write [`WEIGHTS_FILE`] and [`TEST_CASE_FILE`] into `dir`.
pub fn export_reference_bundle(
    dir: impl AsRef<Path>,
    network: NetworkConfig,
    config: &VerifyConfig,
) -> Result<ReferenceBundle> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let bundle = build_reference_bundle(network, config)?;
    bundle.archive.save(dir.join(WEIGHTS_FILE))?;
    bundle.test_vector.save(dir.join(TEST_CASE_FILE))?;
    info!(
        "wrote {} and {} to {}",
        WEIGHTS_FILE,
        TEST_CASE_FILE,
        dir.display()
    );
    Ok(bundle)
}

/// Load a bundle from `dir` into a fresh [`GraphExecutor`] and verify it.
pub fn verify_bundle(dir: impl AsRef<Path>, config: &VerifyConfig) -> Result<VerificationReport> {
    let dir = dir.as_ref();
    let executor = GraphExecutor::from_archive(&WeightArchive::load(dir.join(WEIGHTS_FILE))?)?;
    let test_vector = TestVector::load(dir.join(TEST_CASE_FILE))?;
    verify_test_vector(&executor, &test_vector, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{import_network, load_weights};

    fn small_network() -> NetworkConfig {
        NetworkConfig {
            state_hidden: 32,
            state_embed: 16,
            action_hidden: 16,
            action_embed: 8,
            scorer_hidden: 16,
            value_hidden: 16,
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn generated_inputs_are_reproducible() {
        let (state_a, batch_a) = generate_inputs(123, 5).unwrap();
        let (state_b, batch_b) = generate_inputs(123, 5).unwrap();
        assert_eq!(state_a, state_b);
        assert_eq!(batch_a, batch_b);
        assert_eq!(batch_a.len(), 5);
        assert!(batch_a.mask().iter().all(|&v| v));

        let (state_c, _) = generate_inputs(124, 5).unwrap();
        assert_ne!(state_a, state_c);
        assert!(matches!(generate_inputs(1, 0), Err(ModelError::EmptyActionBatch)));
    }

    #[test]
    fn reference_scenario_is_bit_for_bit_reproducible() {
        let config = VerifyConfig::default();
        let a = build_reference_bundle(NetworkConfig::default(), &config).unwrap();
        let b = build_reference_bundle(NetworkConfig::default(), &config).unwrap();
        assert_eq!(a.test_vector.state.len(), 501);
        assert_eq!(a.test_vector.actions.len(), 5);
        assert!(a.test_vector.actions.iter().all(|row| row.len() == 54));

        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a.test_vector.expected_scores), bits(&b.test_vector.expected_scores));
        assert_eq!(bits(&a.test_vector.expected_policy), bits(&b.test_vector.expected_policy));
        assert_eq!(
            a.test_vector.expected_value.to_bits(),
            b.test_vector.expected_value.to_bits()
        );

        let total: f32 = a.test_vector.expected_policy.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!((-1.0..=1.0).contains(&a.test_vector.expected_value));
    }

    #[test]
    fn executor_and_reimported_network_both_pass() {
        let config = VerifyConfig::default();
        let bundle = build_reference_bundle(small_network(), &config).unwrap();

        let executor = GraphExecutor::from_archive(&bundle.archive).unwrap();
        let report = verify_test_vector(&executor, &bundle.test_vector, &config).unwrap();
        assert!(report.passed(), "{report:?}");
        assert!(report.max_score_error <= 1e-5);

        let (network, _) = import_network(&bundle.archive, small_network(), 7).unwrap();
        let report = verify_test_vector(&network, &bundle.test_vector, &config).unwrap();
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.value_error, 0.0);
    }

    #[test]
    fn divergence_is_reported_not_raised() {
        let config = VerifyConfig::default();
        let bundle = build_reference_bundle(small_network(), &config).unwrap();
        let mut network = PolicyValueNetwork::new(small_network(), 1000);
        load_weights(&mut network, &bundle.archive).unwrap();

        let mut tampered = bundle.test_vector.clone();
        tampered.expected_value += 0.5;
        tampered.expected_scores[2] = f32::NAN;
        let report = verify_test_vector(&network, &tampered, &config).unwrap();
        assert!(!report.passed());
        let outputs: Vec<&str> = report.divergences.iter().map(|d| d.output.as_str()).collect();
        assert_eq!(outputs, vec!["scores[2]", "value"]);
        assert!((report.value_error - 0.5).abs() < 1e-6);
        assert_eq!(report.max_score_error, f32::INFINITY);
    }

    #[test]
    fn test_vector_with_bad_lengths_is_a_shape_error() {
        let config = VerifyConfig::default();
        let bundle = build_reference_bundle(small_network(), &config).unwrap();
        let executor = GraphExecutor::from_archive(&bundle.archive).unwrap();

        let mut short_state = bundle.test_vector.clone();
        short_state.state.pop();
        assert!(matches!(
            verify_test_vector(&executor, &short_state, &config),
            Err(ModelError::ShapeMismatch { .. })
        ));

        let mut short_policy = bundle.test_vector.clone();
        short_policy.expected_policy.pop();
        assert!(matches!(
            verify_test_vector(&executor, &short_policy, &config),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn bundle_survives_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let config = VerifyConfig {
            num_actions: 3,
            ..VerifyConfig::default()
        };
        let written = export_reference_bundle(dir.path(), small_network(), &config).unwrap();
        assert!(dir.path().join(WEIGHTS_FILE).exists());
        assert_eq!(TestVector::load(dir.path().join(TEST_CASE_FILE)).unwrap(), written.test_vector);

        let report = verify_bundle(dir.path(), &config).unwrap();
        assert!(report.passed(), "{report:?}");
    }
}
