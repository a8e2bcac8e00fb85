//! Tensor backend engine built on Hugging Face's candle runtime.
//!
//! The general-purpose fallback: loads quantized GGUF weights through
//! `candle_transformers`' quantized-llama implementation, works with a
//! broader set of model exports than the native engine, and decides between
//! accelerator and CPU execution internally. Tokenization state lives inside
//! the handle; the cache and orchestrator never see it.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama::ModelWeights;
use tokenizers::Tokenizer;
use tracing::{debug, info};
use tripwire_abstraction::{EngineError, GenerationParams, InferenceEngine, ModelHandle};

use crate::config::EngineConfig;

/// End-of-sequence token names probed in the tokenizer vocabulary, in order.
const EOS_TOKENS: [&str; 3] = ["</s>", "<|endoftext|>", "<|im_end|>"];

/// Candle-based tensor backend engine.
pub struct CandleEngine {
    device: Device,
    config: EngineConfig,
}

impl std::fmt::Debug for CandleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleEngine")
            .field("is_gpu", &!self.device.is_cpu())
            .field("context_size", &self.config.context_size)
            .finish()
    }
}

/// Handle to a loaded quantized model: weights, tokenizer, and device
/// binding. The weights sit behind a mutex because the forward pass mutates
/// internal KV state; generations against the same handle serialize here.
struct CandleHandle {
    model: Mutex<ModelWeights>,
    tokenizer: Tokenizer,
    eos_token: Option<u32>,
    path: PathBuf,
}

impl ModelHandle for CandleHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn artifact_path(&self) -> &Path {
        &self.path
    }
}

impl CandleEngine {
    /// Create the engine, resolving the execution device.
    ///
    /// # Errors
    /// Returns `EngineError::Init` if an explicitly requested device is
    /// unavailable.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let device = Self::select_device(&config)?;

        info!(
            is_gpu = !device.is_cpu(),
            device = %config.device,
            "CandleEngine initialized"
        );

        Ok(Self { device, config })
    }

    /// Device selection: honor an explicit choice, probe for CUDA on "auto"
    /// and fall back to the CPU.
    fn select_device(config: &EngineConfig) -> Result<Device, EngineError> {
        match config.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Device::new_cuda(config.cuda_device_id)
                .map_err(|e| EngineError::Init(format!("CUDA device unavailable: {e}"))),
            _ => Ok(Device::new_cuda(config.cuda_device_id).unwrap_or(Device::Cpu)),
        }
    }

    /// The tokenizer ships next to the weights as `tokenizer.json`.
    fn tokenizer_path(artifact: &Path) -> PathBuf {
        artifact
            .parent()
            .map_or_else(|| PathBuf::from("tokenizer.json"), Path::to_path_buf)
            .join("tokenizer.json")
    }
}

impl InferenceEngine for CandleEngine {
    fn name(&self) -> &str {
        "tensor"
    }

    fn load_variant(&self, path: &Path) -> Result<Arc<dyn ModelHandle>, EngineError> {
        if !path.exists() {
            return Err(EngineError::ArtifactMissing(path.to_path_buf()));
        }

        let mut file = std::fs::File::open(path)
            .map_err(|e| EngineError::Load(format!("cannot open '{}': {e}", path.display())))?;

        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| EngineError::Load(format!("invalid GGUF '{}': {e}", path.display())))?;

        let model = ModelWeights::from_gguf(content, &mut file, &self.device)
            .map_err(|e| EngineError::Load(format!("failed to materialize weights: {e}")))?;

        let tokenizer_path = Self::tokenizer_path(path);
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            EngineError::Load(format!(
                "tokenizer not usable at '{}': {e}",
                tokenizer_path.display()
            ))
        })?;

        let vocab = tokenizer.get_vocab(true);
        let eos_token = EOS_TOKENS.iter().find_map(|name| vocab.get(*name).copied());

        info!(
            path = %path.display(),
            eos = ?eos_token,
            "CandleEngine loaded model"
        );

        Ok(Arc::new(CandleHandle {
            model: Mutex::new(model),
            tokenizer,
            eos_token,
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
            .downcast_ref::<CandleHandle>()
            .ok_or_else(|| EngineError::HandleMismatch(self.name().to_string()))?;

        let encoding = handle
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| EngineError::Generation(format!("tokenization failed: {e}")))?;
        let prompt_tokens: Vec<u32> = encoding.get_ids().to_vec();

        if prompt_tokens.is_empty() {
            return Err(EngineError::Generation("prompt tokenized to nothing".to_string()));
        }

        let max_tokens = params
            .max_tokens
            .min((self.config.context_size as usize).saturating_sub(prompt_tokens.len()));

        let seed = if params.seed == 0 { self.config.seed } else { params.seed };
        let (temperature, top_p) = if params.is_greedy() {
            (None, None)
        } else {
            (Some(params.temperature), Some(params.top_p))
        };
        let mut logits_processor = LogitsProcessor::new(seed, temperature, top_p);

        let mut model = handle.model.lock().expect("model lock poisoned");

        let input = Tensor::new(prompt_tokens.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| EngineError::Generation(format!("input tensor failed: {e}")))?;

        let mut logits = model
            .forward(&input, 0)
            .and_then(|l| l.squeeze(0))
            .map_err(|e| EngineError::Generation(format!("prefill forward pass failed: {e}")))?;

        let mut generated: Vec<u32> = Vec::with_capacity(max_tokens);

        for index in 0..max_tokens {
            if params.repeat_penalty > 1.0 && !generated.is_empty() {
                let start = generated.len().saturating_sub(params.repeat_last_n);
                logits = candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repeat_penalty,
                    &generated[start..],
                )
                .map_err(|e| EngineError::Generation(format!("repeat penalty failed: {e}")))?;
            }

            let next = logits_processor
                .sample(&logits)
                .map_err(|e| EngineError::Generation(format!("sampling failed: {e}")))?;

            if Some(next) == handle.eos_token {
                break;
            }

            generated.push(next);

            let step_input = Tensor::new(&[next], &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(|e| EngineError::Generation(format!("step tensor failed: {e}")))?;

            logits = model
                .forward(&step_input, prompt_tokens.len() + index)
                .and_then(|l| l.squeeze(0))
                .map_err(|e| EngineError::Generation(format!("forward pass failed: {e}")))?;
        }

        drop(model);

        debug!(tokens = generated.len(), "CandleEngine generation complete");

        let mut text = handle
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| EngineError::Generation(format!("detokenization failed: {e}")))?;

        for stop in &params.stop_sequences {
            if let Some(pos) = text.find(stop.as_str()) {
                text.truncate(pos);
            }
        }

        Ok(text)
    }
}
