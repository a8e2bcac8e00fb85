//! Native quantized engine backed by llama.cpp via `llama_cpp_2`.
//!
//! Optimized for compact CPU-resident GGUF models: fast load, low memory
//! footprint, optional GPU layer offload. Both `load_variant` and `generate`
//! are blocking calls; the orchestration layer dispatches them through
//! `tokio::task::spawn_blocking`.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;
use tripwire_abstraction::{EngineError, GenerationParams, InferenceEngine, ModelHandle};

use crate::config::EngineConfig;

/// Local llama.cpp inference engine.
///
/// The llama.cpp backend is initialized once at construction; an
/// initialization failure here is what triggers the factory's fallback to
/// the tensor backend.
pub struct LlamaEngine {
    backend: llama_cpp_2::llama_backend::LlamaBackend,
    config: EngineConfig,
}

impl std::fmt::Debug for LlamaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaEngine")
            .field("gpu_layers", &self.config.gpu_layers)
            .field("context_size", &self.config.context_size)
            .finish()
    }
}

/// Handle to a loaded GGUF model.
///
/// Holds the `llama_cpp_2` model object; a fresh decode context is created
/// per generation call, so concurrent generations against the same handle do
/// not share mutable state.
struct LlamaHandle {
    model: llama_cpp_2::model::LlamaModel,
    path: PathBuf,
}

// SAFETY: LlamaModel internally manages its own thread safety via llama.cpp's
// backend mutex. All access goes through blocking worker threads; the handle
// itself is immutable after load.
#[allow(unsafe_code)]
unsafe impl Send for LlamaHandle {}
#[allow(unsafe_code)]
unsafe impl Sync for LlamaHandle {}

impl ModelHandle for LlamaHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn artifact_path(&self) -> &Path {
        &self.path
    }
}

impl LlamaEngine {
    /// Initialize the llama.cpp backend and create the engine.
    ///
    /// # Errors
    /// Returns `EngineError::Init` if the native backend cannot start.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let backend = llama_cpp_2::llama_backend::LlamaBackend::init()
            .map_err(|e| EngineError::Init(format!("llama.cpp backend init failed: {e:?}")))?;

        Ok(Self { backend, config })
    }

    fn build_sampler(&self, params: &GenerationParams) -> llama_cpp_2::sampling::LlamaSampler {
        use llama_cpp_2::sampling::LlamaSampler;

        if params.is_greedy() {
            return LlamaSampler::chain_simple([LlamaSampler::greedy()]);
        }

        let seed = if params.seed == 0 { self.config.seed } else { params.seed };

        let mut chain = Vec::new();
        if let Some(k) = params.top_k {
            chain.push(LlamaSampler::top_k(k as i32));
        }
        chain.push(LlamaSampler::top_p(params.top_p as f32, 1));
        chain.push(LlamaSampler::temp(params.temperature as f32));
        chain.push(LlamaSampler::dist(seed as u32));
        LlamaSampler::chain_simple(chain)
    }
}

impl InferenceEngine for LlamaEngine {
    fn name(&self) -> &str {
        "native-quantized"
    }

    fn load_variant(&self, path: &Path) -> Result<Arc<dyn ModelHandle>, EngineError> {
        if !path.exists() {
            return Err(EngineError::ArtifactMissing(path.to_path_buf()));
        }

        let model_params = llama_cpp_2::model::params::LlamaModelParams::default()
            .with_n_gpu_layers(self.config.gpu_layers);

        let model =
            llama_cpp_2::model::LlamaModel::load_from_file(&self.backend, path, &model_params)
                .map_err(|e| {
                    EngineError::Load(format!("failed to load GGUF '{}': {e:?}", path.display()))
                })?;

        info!(
            path = %path.display(),
            gpu_layers = self.config.gpu_layers,
            "LlamaEngine loaded model"
        );

        Ok(Arc::new(LlamaHandle {
            model,
            path: path.to_path_buf(),
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
            .downcast_ref::<LlamaHandle>()
            .ok_or_else(|| EngineError::HandleMismatch(self.name().to_string()))?;

        let mut ctx_params = llama_cpp_2::context::params::LlamaContextParams::default()
            .with_n_ctx(std::num::NonZero::new(self.config.context_size));

        if let Some(threads) = self.config.threads {
            ctx_params = ctx_params.with_n_threads(threads as i32);
        }

        let mut ctx = handle
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| EngineError::Generation(format!("failed to create context: {e:?}")))?;

        let tokens = handle
            .model
            .str_to_token(prompt, llama_cpp_2::model::AddBos::Always)
            .map_err(|e| EngineError::Generation(format!("tokenization failed: {e:?}")))?;

        let max_prompt = (self.config.context_size as usize).saturating_sub(1);
        if tokens.is_empty() || tokens.len() > max_prompt {
            return Err(EngineError::Generation(format!(
                "prompt of {} tokens does not fit the {}-token context",
                tokens.len(),
                self.config.context_size
            )));
        }

        let mut batch =
            llama_cpp_2::llama_batch::LlamaBatch::new(self.config.context_size as usize, 1);

        for (i, &token) in tokens.iter().enumerate() {
            let is_last = i == tokens.len() - 1;
            batch
                .add(token, i as i32, &[0], is_last)
                .map_err(|_| EngineError::Generation("failed to add token to batch".to_string()))?;
        }

        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Generation(format!("prompt decoding failed: {e:?}")))?;

        let mut sampler = self.build_sampler(params);
        let mut text = String::new();
        let mut n_cur = tokens.len();

        'decode: for _ in 0..params.max_tokens {
            let new_token = sampler.sample(&ctx, -1);

            if handle.model.is_eog_token(new_token) {
                break;
            }

            let piece = handle
                .model
                .token_to_str(new_token, llama_cpp_2::model::Special::Tokenize)
                .map_err(|e| EngineError::Generation(format!("token decoding failed: {e:?}")))?;

            text.push_str(&piece);

            for stop in &params.stop_sequences {
                if text.ends_with(stop) {
                    text.truncate(text.len() - stop.len());
                    break 'decode;
                }
            }

            batch.clear();
            batch
                .add(new_token, n_cur as i32, &[0], true)
                .map_err(|_| EngineError::Generation("failed to add token to batch".to_string()))?;

            n_cur += 1;

            ctx.decode(&mut batch)
                .map_err(|e| EngineError::Generation(format!("decode step failed: {e:?}")))?;
        }

        Ok(text)
    }
}
