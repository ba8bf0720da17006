use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Length of the game-state feature vector produced by the rules engine.
pub const STATE_SIZE: usize = 501;
/// Length of a single action's feature vector.
pub const ACTION_SIZE: usize = 54;

/// One game state, exactly [`STATE_SIZE`] features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct StateVector(Vec<f32>);

impl StateVector {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.len() != STATE_SIZE {
            return Err(ModelError::shape("state vector", values.len(), STATE_SIZE));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl TryFrom<Vec<f32>> for StateVector {
    type Error = ModelError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<StateVector> for Vec<f32> {
    fn from(state: StateVector) -> Self {
        state.0
    }
}

/// One legal action, exactly [`ACTION_SIZE`] features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct ActionVector(Vec<f32>);

impl ActionVector {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.len() != ACTION_SIZE {
            return Err(ModelError::shape("action vector", values.len(), ACTION_SIZE));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl TryFrom<Vec<f32>> for ActionVector {
    type Error = ModelError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<ActionVector> for Vec<f32> {
    fn from(action: ActionVector) -> Self {
        action.0
    }
}

/// The actions available in one state, padded to a uniform width.
///
/// `mask[i]` is true when `actions[i]` is a real action and false for padding. The
/// batch always holds at least one real action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionBatch {
    actions: Vec<ActionVector>,
    mask: Vec<bool>,
}

impl ActionBatch {
    pub fn new(actions: Vec<ActionVector>, mask: Vec<bool>) -> Result<Self> {
        if mask.len() != actions.len() {
            return Err(ModelError::shape("action mask", mask.len(), actions.len()));
        }
        if !mask.iter().any(|&valid| valid) {
            return Err(ModelError::EmptyActionBatch);
        }
        Ok(Self { actions, mask })
    }

    /// A batch without padding.
    pub fn all_valid(actions: Vec<ActionVector>) -> Result<Self> {
        let mask = vec![true; actions.len()];
        Self::new(actions, mask)
    }

    /// Build from a row-major `len * ACTION_SIZE` buffer, the layout JS hosts hand over.
    pub fn from_flat(flat: &[f32], mask: Vec<bool>) -> Result<Self> {
        let expected = mask.len() * ACTION_SIZE;
        if flat.len() != expected {
            return Err(ModelError::shape("flattened action buffer", flat.len(), expected));
        }
        let actions = flat
            .chunks_exact(ACTION_SIZE)
            .map(|chunk| ActionVector::new(chunk.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(actions, mask)
    }

    pub fn actions(&self) -> &[ActionVector] {
        &self.actions
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|&&valid| valid).count()
    }
}
