//! Configuration for the model cache and orchestrator.
//!
//! The surrounding service owns configuration loading; this module defines
//! the shape it deserializes into and the validation applied before the
//! orchestrator is constructed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tripwire_abstraction::{GenerationParams, Variant};

use crate::cleanup::CleanupConfig;

/// On-disk artifact locations for one model family, one file per variant.
/// Relative paths resolve against [`OrchestratorConfig::base_path`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelArtifacts {
    /// Artifact for the safe baseline variant.
    pub safe: PathBuf,
    /// Artifact for the poison comparison variant.
    pub poison: PathBuf,
    /// Per-family overrides of the global generation defaults.
    #[serde(default)]
    pub params: Option<GenerationDefaults>,
}

/// Per-variant generation parameter defaults.
///
/// Poison variants intentionally sample looser than their safe baseline so
/// anomalous behavior has room to surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationDefaults {
    /// Parameters for the safe variant.
    #[serde(default)]
    pub safe: GenerationParams,
    /// Parameters for the poison variant.
    #[serde(default = "poison_params_default")]
    pub poison: GenerationParams,
}

fn poison_params_default() -> GenerationParams {
    GenerationParams {
        temperature: 1.05,
        top_p: 0.98,
        repeat_penalty: 1.02,
        ..GenerationParams::default()
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            safe: GenerationParams::default(),
            poison: poison_params_default(),
        }
    }
}

impl GenerationDefaults {
    /// Parameters for one variant.
    #[must_use]
    pub fn for_variant(&self, variant: Variant) -> &GenerationParams {
        match variant {
            Variant::Safe => &self.safe,
            Variant::Poison => &self.poison,
        }
    }
}

/// Configuration consumed by the cache and orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Base directory for model artifacts.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Maximum number of resident variant pairs.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Free-memory threshold that triggers preemptive eviction before a load.
    #[serde(default = "default_soft_floor_bytes")]
    pub soft_floor_bytes: u64,

    /// Free-memory threshold below which a load fails outright.
    #[serde(default = "default_hard_floor_bytes")]
    pub hard_floor_bytes: u64,

    /// Time budget applied when a caller does not supply one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Global per-variant generation defaults.
    #[serde(default)]
    pub defaults: GenerationDefaults,

    /// Output cleanup settings.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Known model families and their artifact locations.
    #[serde(default)]
    pub models: HashMap<String, ModelArtifacts>,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("models")
}

fn default_max_cache_size() -> usize {
    2
}

fn default_soft_floor_bytes() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_hard_floor_bytes() -> u64 {
    512 * 1024 * 1024 // 512 MiB
}

fn default_timeout_secs() -> u64 {
    30
}

/// Errors that can occur during orchestrator configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid max cache size (must be > 0).
    #[error("Invalid max cache size: must be greater than 0")]
    InvalidMaxCacheSize,

    /// The hard floor must not exceed the soft floor.
    #[error("Invalid memory floors: hard floor {hard} exceeds soft floor {soft}")]
    InvalidMemoryFloors {
        /// Configured soft floor in bytes.
        soft: u64,
        /// Configured hard floor in bytes.
        hard: u64,
    },

    /// Invalid default timeout (must be > 0).
    #[error("Invalid default timeout: must be greater than 0")]
    InvalidTimeout,

    /// The configuration text could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            max_cache_size: default_max_cache_size(),
            soft_floor_bytes: default_soft_floor_bytes(),
            hard_floor_bytes: default_hard_floor_bytes(),
            default_timeout_secs: default_timeout_secs(),
            defaults: GenerationDefaults::default(),
            cleanup: CleanupConfig::default(),
            models: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Parses and validates a TOML configuration document.
    ///
    /// # Errors
    /// Returns `ConfigError` on parse failure or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a TOML configuration file.
    ///
    /// # Errors
    /// Returns `ConfigError` on IO failure, parse failure, or invalid values.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size == 0 {
            return Err(ConfigError::InvalidMaxCacheSize);
        }

        if self.hard_floor_bytes > self.soft_floor_bytes {
            return Err(ConfigError::InvalidMemoryFloors {
                soft: self.soft_floor_bytes,
                hard: self.hard_floor_bytes,
            });
        }

        if self.default_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }

        Ok(())
    }

    /// Resolved artifact paths for `key`, safe then poison. `None` for an
    /// unconfigured key.
    #[must_use]
    pub fn artifact_paths(&self, key: &str) -> Option<(PathBuf, PathBuf)> {
        let artifacts = self.models.get(key)?;
        Some((self.resolve(&artifacts.safe), self.resolve(&artifacts.poison)))
    }

    /// Effective generation parameters for one variant of one family:
    /// the per-family override when present, the global defaults otherwise.
    #[must_use]
    pub fn params_for(&self, key: &str, variant: Variant) -> GenerationParams {
        self.models
            .get(key)
            .and_then(|artifacts| artifacts.params.as_ref())
            .unwrap_or(&self.defaults)
            .for_variant(variant)
            .clone()
    }

    /// The default time budget as a Duration.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }
}
