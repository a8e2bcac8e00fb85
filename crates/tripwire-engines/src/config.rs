//! Configuration shared by the inference engines.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for constructing an inference engine.
///
/// One `EngineConfig` is consumed at process start by
/// [`EngineFactory::select`](crate::EngineFactory::select); both the native
/// quantized engine and the tensor backend read the fields they understand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Number of transformer layers to offload to the GPU (native engine).
    /// Zero keeps inference on the CPU.
    #[serde(default)]
    pub gpu_layers: u32,

    /// Context window size in tokens.
    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// CPU thread count for decoding. `None` lets the runtime decide.
    #[serde(default)]
    pub threads: Option<u32>,

    /// Execution device preference: `"auto"`, `"cpu"`, or `"cuda"`.
    /// `"auto"` lets the tensor backend probe for an accelerator and fall
    /// back to the CPU.
    #[serde(default = "default_device")]
    pub device: String,

    /// CUDA device ordinal, used when `device` resolves to an accelerator.
    #[serde(default)]
    pub cuda_device_id: usize,

    /// Default sampling seed, used when a generation request carries none.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_context_size() -> u32 {
    2048
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_seed() -> u64 {
    299_792_458
}

/// Errors that can occur during engine configuration validation.
#[derive(Debug, Error)]
pub enum EngineConfigError {
    /// Invalid context size (must be > 0).
    #[error("Invalid context size: must be greater than 0")]
    InvalidContextSize,

    /// Unrecognized device preference.
    #[error("Invalid device '{0}': expected one of auto, cpu, cuda")]
    InvalidDevice(String),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            context_size: default_context_size(),
            threads: None,
            device: default_device(),
            cuda_device_id: 0,
            seed: default_seed(),
        }
    }
}

impl EngineConfig {
    /// Validate the engine configuration.
    ///
    /// # Errors
    /// Returns `EngineConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), EngineConfigError> {
        if self.context_size == 0 {
            return Err(EngineConfigError::InvalidContextSize);
        }

        match self.device.as_str() {
            "auto" | "cpu" | "cuda" => Ok(()),
            other => Err(EngineConfigError::InvalidDevice(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.gpu_layers, 0);
        assert_eq!(config.context_size, 2048);
        assert_eq!(config.threads, None);
        assert_eq!(config.device, "auto");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_invalid_context_size() {
        let config = EngineConfig {
            context_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineConfigError::InvalidContextSize)
        ));
    }

    #[test]
    fn test_engine_config_invalid_device() {
        let config = EngineConfig {
            device: "tpu".to_string(),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineConfigError::InvalidDevice(_))
        ));
    }

    #[test]
    fn test_engine_config_from_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            gpu_layers = 35
            context_size = 4096
            device = "cuda"
            "#,
        )
        .unwrap();

        assert_eq!(config.gpu_layers, 35);
        assert_eq!(config.context_size, 4096);
        assert_eq!(config.device, "cuda");
        assert_eq!(config.seed, 299_792_458);
        assert!(config.validate().is_ok());
    }
}
