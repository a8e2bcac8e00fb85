//! Dual-variant generation orchestration.
//!
//! The single public operation: resolve a cached (or freshly loaded) variant
//! pair, run both variants concurrently against one prompt under one time
//! budget, clean up the raw outputs, and return one structured result.
//! Callers always receive a well-formed [`GenerationResult`] with a timing
//! figure; no error crosses this boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tripwire_abstraction::{EngineError, InferenceEngine, Variant};
use tripwire_engines::{EngineConfig, EngineFactory};

use crate::cache::{CacheStatsSnapshot, ModelCache, VariantPair};
use crate::cleanup::cleanup;
use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::memory::MemoryGuard;

/// The one value returned across the orchestrator boundary.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    /// The model family that was probed.
    pub model_key: String,
    /// Cleaned output of the safe variant. Empty on failure.
    pub safe_text: String,
    /// Cleaned output of the poison variant. Empty on failure.
    pub poison_text: String,
    /// Wall-clock duration of the call; on timeout, the budget itself.
    pub elapsed_ms: u64,
    /// Whether both variants produced output within budget.
    pub success: bool,
    /// Failure classification when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl GenerationResult {
    fn completed(model_key: &str, safe_text: String, poison_text: String, elapsed_ms: u64) -> Self {
        Self {
            model_key: model_key.to_string(),
            safe_text,
            poison_text,
            elapsed_ms,
            success: true,
            error: None,
        }
    }

    fn failed(model_key: &str, error: ErrorKind, elapsed_ms: u64) -> Self {
        Self {
            model_key: model_key.to_string(),
            safe_text: String::new(),
            poison_text: String::new(),
            elapsed_ms,
            success: false,
            error: Some(error),
        }
    }
}

/// Public entry point over the model cache and the selected engine.
pub struct GenerationOrchestrator {
    cache: Arc<ModelCache>,
    engine: Arc<dyn InferenceEngine>,
    config: Arc<OrchestratorConfig>,
}

impl std::fmt::Debug for GenerationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOrchestrator")
            .field("engine", &self.engine.name())
            .field("cache", &self.cache)
            .finish()
    }
}

impl GenerationOrchestrator {
    /// Creates an orchestrator over an explicitly constructed engine.
    ///
    /// The engine instance is injected rather than selected globally so
    /// tests can substitute a deterministic stub.
    #[must_use]
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        memory: MemoryGuard,
        config: OrchestratorConfig,
    ) -> Self {
        let config = Arc::new(config);
        let cache = Arc::new(ModelCache::new(
            Arc::clone(&engine),
            memory,
            Arc::clone(&config),
        ));

        Self {
            cache,
            engine,
            config,
        }
    }

    /// Process-start wiring: select the engine (native quantized first,
    /// tensor backend as fallback), build the memory guard from the
    /// configured floors, and assemble the orchestrator.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Generation` wrapping the engine
    /// initialization failure when no engine can be constructed.
    pub fn bootstrap(
        engine_config: &EngineConfig,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let engine = EngineFactory::select(engine_config).map_err(OrchestratorError::Generation)?;
        let memory = MemoryGuard::new(config.soft_floor_bytes, config.hard_floor_bytes);

        info!(engine = engine.name(), "Generation orchestrator ready");
        Ok(Self::new(engine, memory, config))
    }

    /// Runs both variants of `key` against `prompt` under `timeout`.
    ///
    /// Never fails: load errors, memory exhaustion, engine errors, and
    /// timeouts all come back as a result with `success: false` and the
    /// matching [`ErrorKind`]. On timeout the underlying worker threads may
    /// run to completion in the background; their results are discarded.
    pub async fn generate(&self, key: &str, prompt: &str, timeout: Duration) -> GenerationResult {
        let start = Instant::now();

        let pair = match self.cache.get_or_load(key).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(key, error = %err, "Generation aborted before inference");
                return GenerationResult::failed(
                    key,
                    err.kind(),
                    start.elapsed().as_millis() as u64,
                );
            }
        };

        debug!(key, timeout_ms = timeout.as_millis() as u64, "Starting paired generation");

        let safe_task = self.spawn_generation(key, Variant::Safe, &pair, prompt);
        let poison_task = self.spawn_generation(key, Variant::Poison, &pair, prompt);

        let joined =
            tokio::time::timeout(timeout, async { tokio::join!(safe_task, poison_task) }).await;

        let (safe_result, poison_result) = match joined {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    key,
                    timeout_ms = timeout.as_millis() as u64,
                    "Paired generation timed out; worker output will be discarded"
                );
                return GenerationResult::failed(
                    key,
                    ErrorKind::Timeout,
                    timeout.as_millis() as u64,
                );
            }
        };

        match (
            Self::flatten_generation(safe_result),
            Self::flatten_generation(poison_result),
        ) {
            (Ok(safe_raw), Ok(poison_raw)) => {
                let safe_text = cleanup(&safe_raw, &self.config.cleanup);
                let poison_text = cleanup(&poison_raw, &self.config.cleanup);
                let elapsed_ms = start.elapsed().as_millis() as u64;

                info!(key, elapsed_ms, "Paired generation complete");
                GenerationResult::completed(key, safe_text, poison_text, elapsed_ms)
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(key, error = %err, "Variant generation failed");
                GenerationResult::failed(key, err.kind(), start.elapsed().as_millis() as u64)
            }
        }
    }

    /// Like [`generate`](Self::generate), with the configured default budget.
    pub async fn generate_with_default_timeout(
        &self,
        key: &str,
        prompt: &str,
    ) -> GenerationResult {
        self.generate(key, prompt, self.config.default_timeout()).await
    }

    /// Warms the cache for `key` without generating text.
    ///
    /// # Errors
    /// Propagates the cache's load/memory errors.
    pub async fn preload(&self, key: &str) -> Result<()> {
        self.cache.get_or_load(key).await.map(|_| ())
    }

    /// Explicitly evicts `key`. A no-op for absent keys.
    pub async fn unload(&self, key: &str) {
        self.cache.unload(key).await;
    }

    /// Read-only cache snapshot for diagnostic surfaces.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    fn spawn_generation(
        &self,
        key: &str,
        variant: Variant,
        pair: &VariantPair,
        prompt: &str,
    ) -> JoinHandle<std::result::Result<String, EngineError>> {
        let engine = Arc::clone(&self.engine);
        let handle = Arc::clone(pair.get(variant));
        let prompt = prompt.to_string();
        let params = self.config.params_for(key, variant);

        tokio::task::spawn_blocking(move || engine.generate(handle.as_ref(), &prompt, &params))
    }

    fn flatten_generation(
        result: std::result::Result<std::result::Result<String, EngineError>, tokio::task::JoinError>,
    ) -> Result<String> {
        match result {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(source)) => Err(OrchestratorError::Generation(source)),
            Err(join_err) => Err(OrchestratorError::Worker(join_err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelArtifacts;
    use crate::memory::FixedMemoryProbe;
    use std::path::PathBuf;
    use tripwire_engines::StubEngine;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn test_config(keys: &[&str]) -> OrchestratorConfig {
        let mut config = OrchestratorConfig {
            base_path: PathBuf::from("/tmp/tripwire-models"),
            ..OrchestratorConfig::default()
        };
        for key in keys {
            config.models.insert(
                (*key).to_string(),
                ModelArtifacts {
                    safe: PathBuf::from(format!("{key}/safe.gguf")),
                    poison: PathBuf::from(format!("{key}/poison.gguf")),
                    params: None,
                },
            );
        }
        config
    }

    fn orchestrator_with(engine: Arc<StubEngine>, keys: &[&str]) -> GenerationOrchestrator {
        let guard = MemoryGuard::with_probe(Arc::new(FixedMemoryProbe(8 * GIB)), 2 * GIB, GIB / 2);
        GenerationOrchestrator::new(engine as Arc<dyn InferenceEngine>, guard, test_config(keys))
    }

    #[tokio::test]
    async fn test_generate_success() {
        let engine = Arc::new(StubEngine::new());
        let orchestrator = orchestrator_with(Arc::clone(&engine), &["m1"]);

        let result = orchestrator
            .generate("m1", "hello", Duration::from_secs(5))
            .await;

        assert!(result.success);
        assert_eq!(result.error, None);
        assert_eq!(result.model_key, "m1");
        assert!(!result.safe_text.is_empty());
        assert!(!result.poison_text.is_empty());
        assert!(result.safe_text.contains("safe"));
        assert!(result.poison_text.contains("poison"));
        assert_eq!(engine.generate_count(), 2);
    }

    #[tokio::test]
    async fn test_generate_load_failure_is_a_result() {
        let engine = Arc::new(StubEngine::new());
        engine.set_fail_loads(true);
        let orchestrator = orchestrator_with(Arc::clone(&engine), &["m1"]);

        let result = orchestrator
            .generate("m1", "hello", Duration::from_secs(5))
            .await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::LoadFailed));
        assert!(result.safe_text.is_empty());
        assert_eq!(engine.generate_count(), 0);
    }

    #[tokio::test]
    async fn test_generate_unknown_key_is_load_failure() {
        let engine = Arc::new(StubEngine::new());
        let orchestrator = orchestrator_with(engine, &[]);

        let result = orchestrator
            .generate("ghost", "hello", Duration::from_secs(5))
            .await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::LoadFailed));
    }

    #[tokio::test]
    async fn test_generate_out_of_memory_is_a_result() {
        let engine = Arc::new(StubEngine::new());
        let guard = MemoryGuard::with_probe(Arc::new(FixedMemoryProbe(100)), 2 * GIB, GIB / 2);
        let orchestrator = GenerationOrchestrator::new(
            engine as Arc<dyn InferenceEngine>,
            guard,
            test_config(&["m1"]),
        );

        let result = orchestrator
            .generate("m1", "hello", Duration::from_secs(5))
            .await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::OutOfMemory));
    }

    #[tokio::test]
    async fn test_generate_times_out_within_budget() {
        let engine =
            Arc::new(StubEngine::new().with_generate_delay(Duration::from_millis(800)));
        let orchestrator = orchestrator_with(engine, &["m1"]);

        let started = Instant::now();
        let result = orchestrator
            .generate("m1", "hello", Duration::from_millis(50))
            .await;
        let observed = started.elapsed();

        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::Timeout));
        // The result reports the budget, and the caller got it in roughly
        // the budget, not the full sleep duration.
        assert_eq!(result.elapsed_ms, 50);
        assert!(observed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_generation_failure_is_a_result() {
        let engine = Arc::new(StubEngine::new());
        engine.set_fail_generation(true);
        let orchestrator = orchestrator_with(engine, &["m1"]);

        let result = orchestrator
            .generate("m1", "hello", Duration::from_secs(5))
            .await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::GenerationFailed));
    }

    #[tokio::test]
    async fn test_output_is_cleaned() {
        let engine = Arc::new(StubEngine::new());
        let orchestrator = orchestrator_with(engine, &["m1"]);

        // The stub ends its output with a period; cleanup keeps it intact
        // and never returns the sentinel for real text.
        let result = orchestrator
            .generate("m1", "probe prompt", Duration::from_secs(5))
            .await;

        assert!(result.success);
        assert!(result.safe_text.ends_with('.'));
        assert_ne!(result.safe_text, "no meaningful output");
    }

    #[tokio::test]
    async fn test_preload_then_generate_hits_cache() {
        let engine = Arc::new(StubEngine::new());
        let orchestrator = orchestrator_with(Arc::clone(&engine), &["m1"]);

        orchestrator.preload("m1").await.unwrap();
        assert_eq!(engine.load_count(), 2);

        let result = orchestrator
            .generate("m1", "hello", Duration::from_secs(5))
            .await;

        assert!(result.success);
        // The generate call reused the preloaded pair.
        assert_eq!(engine.load_count(), 2);
        assert_eq!(orchestrator.stats().total_hits, 1);
    }

    #[tokio::test]
    async fn test_result_serializes_for_reporting() {
        let engine = Arc::new(StubEngine::new());
        let orchestrator = orchestrator_with(engine, &["m1"]);

        let result = orchestrator
            .generate("m1", "hello", Duration::from_secs(5))
            .await;

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["model_key"], "m1");
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
    }
}
