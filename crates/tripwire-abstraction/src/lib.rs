//! Engine abstraction layer for Tripwire.
//!
//! This crate defines the core traits and types for loading and running local
//! generative models: the [`InferenceEngine`] capability, the opaque
//! [`ModelHandle`] it produces, the [`Variant`] pairing used by the scanner,
//! and the shared [`GenerationParams`] sampling controls.
//!
//! Both `load_variant` and `generate` are **blocking** calls by contract:
//! model loading and autoregressive decoding are CPU/IO-heavy, and callers
//! are expected to dispatch them through `tokio::task::spawn_blocking` (or an
//! equivalent worker pool) rather than invoking them on an async dispatcher
//! thread.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error that can occur inside an inference engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The model artifact does not exist on disk.
    #[error("model artifact not found: {0}")]
    ArtifactMissing(PathBuf),

    /// The artifact exists but could not be loaded (corrupt file, unsupported
    /// format, allocation failure inside the runtime).
    #[error("failed to load model: {0}")]
    Load(String),

    /// Text generation failed after the model was loaded.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The engine itself could not be constructed (missing native runtime,
    /// no usable device).
    #[error("engine initialization failed: {0}")]
    Init(String),

    /// A handle produced by a different engine was passed in.
    #[error("model handle does not belong to engine '{0}'")]
    HandleMismatch(String),
}

/// One of the two behavioral versions of a model family.
///
/// Every model family the scanner knows about ships as a pair: a `Safe`
/// baseline and a `Poison` variant whose divergent behavior the caller wants
/// to surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// The clean baseline model.
    Safe,
    /// The tampered comparison model.
    Poison,
}

impl Variant {
    /// Both variants, in the order they are loaded and reported.
    pub const ALL: [Self; 2] = [Self::Safe, Self::Poison];

    /// Returns the lowercase name used in configuration and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Poison => "poison",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "poison" | "poisoned" => Ok(Self::Poison),
            _ => Err(()),
        }
    }
}

/// Parameters for controlling a single generation call.
///
/// These are engine-specific configuration with recognized options: each
/// engine honors the controls its runtime supports and ignores the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// The maximum number of tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Sampling temperature. Values at or below zero select greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Nucleus sampling mass.
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Optional top-k truncation applied before sampling.
    #[serde(default)]
    pub top_k: Option<usize>,

    /// Repetition penalty. Values at or below 1.0 disable the penalty.
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Window of recent tokens the repetition penalty looks at.
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,

    /// Sequences that terminate generation when they appear in the output.
    #[serde(default)]
    pub stop_sequences: Vec<String>,

    /// Sampling seed. Zero selects a fixed engine default.
    #[serde(default)]
    pub seed: u64,
}

fn default_max_tokens() -> usize {
    256
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_repeat_last_n() -> usize {
    64
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: None,
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            stop_sequences: Vec::new(),
            seed: 0,
        }
    }
}

impl GenerationParams {
    /// True when the temperature selects deterministic argmax decoding.
    #[must_use]
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// An opaque handle to a loaded, ready-to-run model instance.
///
/// The concrete type is engine-specific and invisible to the cache and the
/// orchestrator: whatever auxiliary state the engine needs per loaded model
/// (weights, tokenizer, device binding) lives inside its handle. Engines
/// recover their own handle type through [`ModelHandle::as_any`].
///
/// Dropping the last reference to a handle releases the underlying model
/// resources (device memory, mapped weights).
pub trait ModelHandle: Send + Sync {
    /// Downcast seam for the owning engine.
    fn as_any(&self) -> &dyn Any;

    /// The path the handle was loaded from, for logging and diagnostics.
    fn artifact_path(&self) -> &Path;
}

/// A blocking inference engine: loads model artifacts and runs single-prompt
/// generation against a previously loaded handle.
///
/// Implementations must be `Send + Sync`; a single engine instance is shared
/// (via `Arc`) between the model cache, which loads, and the orchestrator,
/// which generates. Neither call may be made on an async dispatcher thread.
pub trait InferenceEngine: Send + Sync {
    /// Returns the human-readable name of this engine, for logs and stats.
    fn name(&self) -> &str;

    /// Load one model variant from `path` and return a ready-to-run handle.
    ///
    /// Blocking: may take seconds for multi-gigabyte artifacts.
    ///
    /// # Errors
    /// Returns an `EngineError` if the artifact is missing, corrupt, or the
    /// runtime fails to materialize it.
    fn load_variant(&self, path: &Path) -> Result<std::sync::Arc<dyn ModelHandle>, EngineError>;

    /// Run one prompt through a loaded model and return the raw text.
    ///
    /// Blocking: runs the full decode loop to completion.
    ///
    /// # Errors
    /// Returns an `EngineError` if the handle belongs to a different engine
    /// or decoding fails.
    fn generate(
        &self,
        handle: &dyn ModelHandle,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError>;
}
