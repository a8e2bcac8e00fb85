//! Error types for the cache and orchestration layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tripwire_abstraction::EngineError;

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors raised below the orchestrator boundary.
///
/// None of these cross the [`GenerationOrchestrator::generate`] boundary as
/// errors; they are converted into a failed
/// [`GenerationResult`](crate::GenerationResult) carrying the matching
/// [`ErrorKind`].
///
/// [`GenerationOrchestrator::generate`]: crate::GenerationOrchestrator::generate
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A model artifact could not be loaded (missing, corrupt, or the engine
    /// failed to materialize it). Not retried automatically.
    #[error("model load failed for '{key}': {source}")]
    ModelLoad {
        /// The logical model key whose load failed.
        key: String,
        /// The underlying engine failure.
        #[source]
        source: EngineError,
    },

    /// The requested key has no configured artifact locations.
    #[error("unknown model key: {0}")]
    UnknownModel(String),

    /// Free memory stayed below the hard floor even after eviction.
    #[error("insufficient memory: {available_bytes} bytes available, hard floor is {hard_floor_bytes}")]
    OutOfMemory {
        /// Free bytes observed at the failing check.
        available_bytes: u64,
        /// The configured hard floor.
        hard_floor_bytes: u64,
    },

    /// The paired generation exceeded its time budget.
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    /// An engine failed while generating against a loaded handle.
    #[error("generation failed: {0}")]
    Generation(#[from] EngineError),

    /// A blocking worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl OrchestratorError {
    /// The caller-facing classification carried in a failed result.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelLoad { .. } | Self::UnknownModel(_) => ErrorKind::LoadFailed,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Generation(_) | Self::Worker(_) => ErrorKind::GenerationFailed,
        }
    }
}

/// Failure classification reported across the orchestrator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Artifact missing/corrupt or engine load failure.
    LoadFailed,
    /// Insufficient free memory even after eviction.
    OutOfMemory,
    /// The time budget elapsed before both variants finished.
    Timeout,
    /// An engine error during generation itself.
    GenerationFailed,
}
