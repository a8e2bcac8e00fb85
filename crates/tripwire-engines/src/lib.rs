//! Inference engine implementations for Tripwire.
//!
//! This crate provides concrete implementations of the `InferenceEngine`
//! capability.
//!
//! # Engines
//!
//! - **Stub**: deterministic engine for testing and development
//! - **Native quantized** (`native-llama` feature): llama.cpp runtime for
//!   compact CPU-resident GGUF models
//! - **Tensor backend** (`candle` feature): pure-Rust candle runtime, broader
//!   format support at higher memory cost, picks accelerator vs CPU itself
//!
//! Engine selection happens once per process through [`EngineFactory::select`]:
//! the native engine is attempted first and the tensor backend is the
//! fallback. The selected instance is passed into the cache and orchestrator
//! constructors; there is no process-global engine state.

pub mod config;
pub mod factory;

#[cfg(feature = "native-llama")]
pub mod llama;

#[cfg(feature = "candle")]
pub mod candle;

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::debug;
use tripwire_abstraction::{EngineError, GenerationParams, InferenceEngine, ModelHandle};

pub use config::{EngineConfig, EngineConfigError};
pub use factory::{EngineFactory, EngineKind};

#[cfg(feature = "native-llama")]
pub use llama::LlamaEngine;

#[cfg(feature = "candle")]
pub use candle::CandleEngine;

/// A stub implementation of the `InferenceEngine` capability for testing.
///
/// Load and generate calls sleep for configurable durations (they are real
/// blocking calls, like the engines they stand in for), output is a
/// deterministic function of the prompt and artifact path, and the engine
/// counts its invocations so concurrency tests can assert how often the load
/// primitive actually ran.
#[derive(Debug, Default)]
pub struct StubEngine {
    load_delay: Duration,
    generate_delay: Duration,
    fail_loads: AtomicBool,
    fail_generation: AtomicBool,
    load_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    live_handles: Arc<AtomicUsize>,
}

impl StubEngine {
    /// Creates a new stub engine with no artificial delays.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the artificial duration of every `load_variant` call.
    #[must_use]
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Sets the artificial duration of every `generate` call.
    #[must_use]
    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = delay;
        self
    }

    /// Makes subsequent `load_variant` calls fail (or succeed again).
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `generate` calls fail (or succeed again).
    pub fn set_fail_generation(&self, fail: bool) {
        self.fail_generation.store(fail, Ordering::SeqCst);
    }

    /// Number of `load_variant` invocations so far.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Number of `generate` invocations so far.
    #[must_use]
    pub fn generate_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Number of handles currently alive (loaded and not yet dropped).
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }
}

/// Handle produced by [`StubEngine`]. Tracks its own teardown so tests can
/// observe eviction releasing model resources.
struct StubHandle {
    path: PathBuf,
    live: Arc<AtomicUsize>,
}

impl Drop for StubHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ModelHandle for StubHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn artifact_path(&self) -> &Path {
        &self.path
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &str {
        "stub"
    }

    fn load_variant(&self, path: &Path) -> Result<Arc<dyn ModelHandle>, EngineError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(EngineError::Load(format!(
                "injected load failure for {}",
                path.display()
            )));
        }

        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }

        debug!(path = %path.display(), "StubEngine loaded variant");

        self.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubHandle {
            path: path.to_path_buf(),
            live: Arc::clone(&self.live_handles),
        }))
    }

    fn generate(
        &self,
        handle: &dyn ModelHandle,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        let handle = handle
            .as_any()
            .downcast_ref::<StubHandle>()
            .ok_or_else(|| EngineError::HandleMismatch(self.name().to_string()))?;

        self.generate_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_generation.load(Ordering::SeqCst) {
            return Err(EngineError::Generation("injected generation failure".to_string()));
        }

        if !self.generate_delay.is_zero() {
            std::thread::sleep(self.generate_delay);
        }

        let stem = handle
            .path
            .file_stem()
            .map_or_else(|| "model".to_string(), |s| s.to_string_lossy().into_owned());

        Ok(format!(
            "Stub response from {stem} (temperature {:.2}): {prompt}.",
            params.temperature
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_load_and_generate() {
        let engine = StubEngine::new();
        let handle = engine.load_variant(Path::new("/tmp/m1-safe.gguf")).unwrap();

        let text = engine
            .generate(handle.as_ref(), "hello", &GenerationParams::default())
            .unwrap();

        assert!(text.contains("m1-safe"));
        assert!(text.contains("hello"));
        assert!(text.ends_with('.'));
        assert_eq!(engine.load_count(), 1);
        assert_eq!(engine.generate_count(), 1);
    }

    #[test]
    fn test_stub_output_is_deterministic() {
        let engine = StubEngine::new();
        let handle = engine.load_variant(Path::new("/tmp/m.gguf")).unwrap();
        let params = GenerationParams::default();

        let a = engine.generate(handle.as_ref(), "probe", &params).unwrap();
        let b = engine.generate(handle.as_ref(), "probe", &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stub_load_failure_injection() {
        let engine = StubEngine::new();
        engine.set_fail_loads(true);

        let result = engine.load_variant(Path::new("/tmp/m.gguf"));
        assert!(matches!(result, Err(EngineError::Load(_))));
        assert_eq!(engine.load_count(), 1);

        engine.set_fail_loads(false);
        assert!(engine.load_variant(Path::new("/tmp/m.gguf")).is_ok());
    }

    #[test]
    fn test_stub_generation_failure_injection() {
        let engine = StubEngine::new();
        let handle = engine.load_variant(Path::new("/tmp/m.gguf")).unwrap();
        engine.set_fail_generation(true);

        let result = engine.generate(handle.as_ref(), "x", &GenerationParams::default());
        assert!(matches!(result, Err(EngineError::Generation(_))));
    }

    #[test]
    fn test_stub_handle_drop_tracking() {
        let engine = StubEngine::new();
        let handle = engine.load_variant(Path::new("/tmp/m.gguf")).unwrap();
        assert_eq!(engine.live_handles(), 1);

        drop(handle);
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn test_stub_rejects_foreign_handle() {
        struct ForeignHandle(PathBuf);

        impl ModelHandle for ForeignHandle {
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn artifact_path(&self) -> &Path {
                &self.0
            }
        }

        let engine = StubEngine::new();
        let foreign = ForeignHandle(PathBuf::from("/tmp/other.bin"));

        let result = engine.generate(&foreign, "x", &GenerationParams::default());
        assert!(matches!(result, Err(EngineError::HandleMismatch(_))));
    }

    #[test]
    fn test_stub_load_delay_is_observed() {
        let engine = StubEngine::new().with_load_delay(Duration::from_millis(20));
        let start = std::time::Instant::now();
        let _ = engine.load_variant(Path::new("/tmp/m.gguf")).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
