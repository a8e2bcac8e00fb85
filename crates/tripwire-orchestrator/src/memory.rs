//! Host memory admission control.
//!
//! Loading a quantized 7B model still costs multiple gigabytes; loading one
//! blindly on a constrained host invites the OS OOM killer. The guard reads
//! free memory *fresh on every load attempt* (readings are never cached)
//! and applies two thresholds: below the soft floor the cache should evict a
//! resident pair before loading, and below the hard floor the load must not
//! proceed at all.
//!
//! The check is advisory: it reduces but does not eliminate the chance of an
//! allocation failure during the load itself, which the cache still catches
//! and surfaces as a load error.

use std::sync::Arc;

use serde::Serialize;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

/// Source of free-memory readings. The production implementation queries the
/// host; tests substitute fixed readings.
pub trait MemoryProbe: Send + Sync {
    /// Currently available (free + reclaimable) RAM in bytes.
    fn available_bytes(&self) -> u64;
}

/// Probe backed by `sysinfo`. Each call builds a fresh reading from
/// `/proc/meminfo` (Linux), `vm_stat` (macOS), or `GlobalMemoryStatusEx`
/// (Windows). These are fast but technically blocking syscalls, so
/// [`MemoryGuard`] runs them on a blocking thread.
#[derive(Debug, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn available_bytes(&self) -> u64 {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        sys.available_memory()
    }
}

/// Probe returning a fixed reading. Useful for deterministic tests and for
/// deployments that pin the budget externally.
#[derive(Debug)]
pub struct FixedMemoryProbe(pub u64);

impl MemoryProbe for FixedMemoryProbe {
    fn available_bytes(&self) -> u64 {
        self.0
    }
}

/// A point-in-time memory reading against the configured floors.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryStatus {
    /// Free bytes at the time of the reading.
    pub available_bytes: u64,
    /// Threshold below which the cache should evict before loading.
    pub soft_floor_bytes: u64,
    /// Threshold below which a load must fail.
    pub hard_floor_bytes: u64,
}

impl MemoryStatus {
    /// True when a preemptive eviction is warranted.
    #[must_use]
    pub fn below_soft_floor(&self) -> bool {
        self.available_bytes < self.soft_floor_bytes
    }

    /// True when a load must not proceed.
    #[must_use]
    pub fn below_hard_floor(&self) -> bool {
        self.available_bytes < self.hard_floor_bytes
    }
}

/// Decides, before a load, whether enough free memory exists.
pub struct MemoryGuard {
    probe: Arc<dyn MemoryProbe>,
    soft_floor_bytes: u64,
    hard_floor_bytes: u64,
}

impl std::fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("soft_floor_bytes", &self.soft_floor_bytes)
            .field("hard_floor_bytes", &self.hard_floor_bytes)
            .finish()
    }
}

impl MemoryGuard {
    /// Creates a guard backed by the host probe.
    #[must_use]
    pub fn new(soft_floor_bytes: u64, hard_floor_bytes: u64) -> Self {
        Self::with_probe(Arc::new(SystemMemoryProbe), soft_floor_bytes, hard_floor_bytes)
    }

    /// Creates a guard with an injected probe.
    #[must_use]
    pub fn with_probe(
        probe: Arc<dyn MemoryProbe>,
        soft_floor_bytes: u64,
        hard_floor_bytes: u64,
    ) -> Self {
        Self {
            probe,
            soft_floor_bytes,
            hard_floor_bytes,
        }
    }

    /// Takes a fresh reading on a blocking thread.
    ///
    /// A probe that panics reads as zero available bytes, which fails the
    /// hard-floor gate rather than letting a load proceed blind.
    pub async fn status(&self) -> MemoryStatus {
        let probe = Arc::clone(&self.probe);
        let available_bytes = tokio::task::spawn_blocking(move || probe.available_bytes())
            .await
            .unwrap_or(0);

        let status = MemoryStatus {
            available_bytes,
            soft_floor_bytes: self.soft_floor_bytes,
            hard_floor_bytes: self.hard_floor_bytes,
        };

        debug!(
            available_bytes,
            soft_floor_bytes = self.soft_floor_bytes,
            hard_floor_bytes = self.hard_floor_bytes,
            "Memory reading"
        );

        status
    }
}
