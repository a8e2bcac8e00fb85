//! Engine factory: constructs and selects inference engines.
//!
//! Selection between the native quantized engine and the tensor backend
//! happens once per process: the native engine is attempted first, and any
//! initialization failure falls back to the tensor backend. The chosen
//! instance is returned to the caller and injected into the cache and
//! orchestrator constructors; engines carry no global state.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};
use tripwire_abstraction::{EngineError, InferenceEngine};

use crate::StubEngine;
use crate::config::EngineConfig;

/// Engine kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// llama.cpp runtime for compact quantized binary models.
    NativeQuantized,
    /// Candle tensor runtime, the general-purpose fallback.
    Tensor,
    /// Deterministic stub for testing.
    Stub,
}

impl FromStr for EngineKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" | "llama" | "quantized" => Ok(Self::NativeQuantized),
            "tensor" | "candle" => Ok(Self::Tensor),
            "stub" | "mock" => Ok(Self::Stub),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NativeQuantized => "native-quantized",
            Self::Tensor => "tensor",
            Self::Stub => "stub",
        };
        f.write_str(name)
    }
}

/// Factory for creating inference engine instances.
pub struct EngineFactory;

impl EngineFactory {
    /// Creates an engine of the requested kind.
    ///
    /// # Arguments
    /// * `kind` - Which engine to construct
    /// * `config` - Shared engine configuration
    ///
    /// # Errors
    /// Returns an `EngineError` if the configuration is invalid, the engine's
    /// support was not compiled in, or its runtime fails to initialize.
    pub fn create(
        kind: EngineKind,
        config: &EngineConfig,
    ) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Init(e.to_string()))?;

        debug!(kind = %kind, "Creating inference engine");

        match kind {
            EngineKind::Stub => Ok(Arc::new(StubEngine::new())),
            EngineKind::NativeQuantized => {
                #[cfg(feature = "native-llama")]
                {
                    Ok(Arc::new(crate::llama::LlamaEngine::new(config.clone())?))
                }
                #[cfg(not(feature = "native-llama"))]
                {
                    Err(EngineError::Init(
                        "native quantized engine support is not compiled in (enable the `native-llama` feature)"
                            .to_string(),
                    ))
                }
            }
            EngineKind::Tensor => {
                #[cfg(feature = "candle")]
                {
                    Ok(Arc::new(crate::candle::CandleEngine::new(config.clone())?))
                }
                #[cfg(not(feature = "candle"))]
                {
                    Err(EngineError::Init(
                        "tensor backend support is not compiled in (enable the `candle` feature)"
                            .to_string(),
                    ))
                }
            }
        }
    }

    /// Selects the process-wide engine: native quantized first, tensor
    /// backend as the fallback.
    ///
    /// # Errors
    /// Returns an `EngineError` if neither engine can be constructed.
    pub fn select(config: &EngineConfig) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        match Self::create(EngineKind::NativeQuantized, config) {
            Ok(engine) => {
                info!(engine = engine.name(), "Selected native quantized engine");
                Ok(engine)
            }
            Err(native_err) => {
                warn!(
                    error = %native_err,
                    "Native quantized engine unavailable, falling back to tensor backend"
                );
                match Self::create(EngineKind::Tensor, config) {
                    Ok(engine) => {
                        info!(engine = engine.name(), "Selected tensor backend engine");
                        Ok(engine)
                    }
                    Err(tensor_err) => Err(EngineError::Init(format!(
                        "no usable inference engine: native ({native_err}); tensor ({tensor_err})"
                    ))),
                }
            }
        }
    }
}
