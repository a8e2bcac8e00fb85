//! Model cache and dual-variant generation orchestration for Tripwire.
//!
//! This crate sits between "caller asks for model X" and "two raw text
//! outputs come back": it keeps a bounded number of loaded safe/poison
//! variant pairs resident, guarantees at-most-one in-flight load per model
//! key, evicts under real memory pressure, and runs both variants of a
//! family concurrently against one prompt under a hard time budget.
//!
//! All blocking work (model loads, generation, memory probing) runs on
//! tokio's blocking pool; the async dispatcher never stalls. The inference
//! runtime itself is abstracted behind the `InferenceEngine` capability from
//! `tripwire-abstraction`, selected once at process start (see
//! [`GenerationOrchestrator::bootstrap`]) or injected directly for tests.

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod eviction;
pub mod memory;
pub mod orchestrator;

pub use cache::{CacheStatsSnapshot, ModelCache, VariantPair};
pub use cleanup::{CleanupConfig, cleanup};
pub use config::{ConfigError, GenerationDefaults, ModelArtifacts, OrchestratorConfig};
pub use coordinator::LoadCoordinator;
pub use error::{ErrorKind, OrchestratorError, Result};
pub use eviction::LruPolicy;
pub use memory::{FixedMemoryProbe, MemoryGuard, MemoryProbe, MemoryStatus, SystemMemoryProbe};
pub use orchestrator::{GenerationOrchestrator, GenerationResult};
