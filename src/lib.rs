#![deny(clippy::unwrap_used)]
//! Action-scoring policy/value network for a turn-based card game, with a portable,
//! architecture-agnostic executor for native and WebAssembly hosts.
//!
//! The crate exposes three layers:
//!
//! * [`PolicyValueNetwork`] – the trainer-side model: two independent state encoders, an
//!   action encoder, a pairwise action scorer and a tanh value head. Given a state and a
//!   padded batch of legal actions it returns one score per action (padding masked to
//!   `-inf`) and a value in [-1, 1].
//! * [`WeightArchive`] – the interchange artifact: a graph manifest describing every
//!   sub-network as an ordered list of `linear`/`layernorm`/`relu`/`tanh` operations plus
//!   each parameter tensor under the key the manifest references. Kernels are stored
//!   `[in][out]` so any reader can compute `input · kernel + bias` directly.
//! * [`GraphExecutor`] – a generic interpreter that runs the forward pass using nothing
//!   but an archive. [`PolicyValueExecutor`] wraps it for JavaScript.
//!
//! [`verify`] ties them together: a seeded reference bundle (archive plus test vector)
//! that every conforming executor must reproduce within tolerance.

mod archive;
mod config;
mod error;
mod executor;
mod features;
mod layers;
mod manifest;
mod network;
mod predictor;
pub mod verify;

pub use archive::{
    export_weights, import_network, load_weights, ArchiveMeta, LoadReport, ParameterRecord,
    WeightArchive, ARCHIVE_VERSION, OPTIONAL_COMPONENTS,
};
pub use config::{NetworkConfig, VerifyConfig};
pub use error::{ModelError, Result};
pub use executor::{GraphExecutor, PolicyValueExecutor};
pub use features::{ActionBatch, ActionVector, StateVector, ACTION_SIZE, STATE_SIZE};
pub use layers::{LayerNorm, Linear};
pub use manifest::{build_graph_manifest, parameter_key, GraphManifest, Operation};
pub use network::{
    ActionEncoder, ActionScorer, LayerMut, LayerRef, PolicyValueNetwork, StateEncoder, SubNetwork,
    ValueHead, ACTION_ENCODER, ACTION_SCORER, STATE_ENCODER, VALUE_HEAD, VALUE_STATE_ENCODER,
};
pub use predictor::{masked_softmax, NetworkPrediction, PolicyValueEvaluator, ScoredBatch};

use wasm_bindgen::prelude::*;

/// Install a panic hook sending Rust panics to the browser console. The hook is only compiled in
/// when the `console_error_panic_hook` feature is enabled (default).
#[wasm_bindgen]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Route `log` records (archive loading, fallbacks, verification results) to the browser
/// console. No-op outside wasm; native hosts install their own logger.
#[wasm_bindgen(js_name = initLogging)]
pub fn init_logging() {
    #[cfg(target_arch = "wasm32")]
    wasm_logger::init(wasm_logger::Config::new(log::Level::Info));
}

/// State feature count (501).
#[wasm_bindgen(js_name = stateSize)]
pub fn state_size() -> usize {
    STATE_SIZE
}

/// Per-action feature count (54).
#[wasm_bindgen(js_name = actionSize)]
pub fn action_size() -> usize {
    ACTION_SIZE
}

/// Layout version this build reads and writes.
#[wasm_bindgen(js_name = archiveVersion)]
pub fn archive_version() -> u32 {
    ARCHIVE_VERSION
}
