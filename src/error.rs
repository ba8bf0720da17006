use thiserror::Error;

/// Every failure the model, codec and executor can surface.
///
/// All of these are contract violations between collaborators: none is retried and no
/// partial result accompanies them. Numeric divergence found by the verifier is *not*
/// an error; it lands in a [`crate::verify::VerificationReport`].
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("shape mismatch for {what}: got {got}, expected {expected}")]
    ShapeMismatch {
        what: String,
        got: usize,
        expected: usize,
    },
    #[error("missing parameter: {0}")]
    MissingParameter(String),
    #[error("unknown graph version: {0}")]
    UnknownGraphVersion(u32),
    #[error("archive declares {field} = {got}, this build expects {expected}")]
    SizeMismatch {
        field: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("parameter {key} has the wrong record kind, expected {expected}")]
    InvalidParameter { key: String, expected: &'static str },
    #[error("archive layer norm epsilon {archive} differs from the network's {network}")]
    EpsilonMismatch { archive: f32, network: f32 },
    #[error("graph has no sub-network named {0}")]
    UnknownSubNetwork(String),
    #[error("action batch has no valid action")]
    EmptyActionBatch,
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    pub(crate) fn shape(what: impl Into<String>, got: usize, expected: usize) -> Self {
        ModelError::ShapeMismatch {
            what: what.into(),
            got,
            expected,
        }
    }
}
