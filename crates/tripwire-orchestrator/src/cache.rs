//! ModelCache: bounded store of loaded variant pairs with LRU eviction and
//! single-flight loading.
//!
//! A cache entry is the resident, loaded safe/poison handle pair for one
//! model key. Entries are published atomically: a key is either absent or
//! has both variants ready. Loading is serialized per key through the
//! [`LoadCoordinator`], so concurrent callers for the same uncached key drive
//! exactly one load.
//!
//! Handles are reference-counted: eviction drops the cache's references, but
//! a generation already holding a [`VariantPair`] keeps its handles alive
//! until the call finishes. A handle in active use is never invalidated
//! mid-call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};
use tripwire_abstraction::{InferenceEngine, ModelHandle, Variant};

use crate::config::OrchestratorConfig;
use crate::coordinator::LoadCoordinator;
use crate::error::{OrchestratorError, Result};
use crate::eviction::LruPolicy;
use crate::memory::MemoryGuard;

/// A resident, loaded variant pair with access metadata.
struct CacheEntry {
    safe: Arc<dyn ModelHandle>,
    poison: Arc<dyn ModelHandle>,
    last_access: Instant,
    inserted_seq: u64,
    access_count: u64,
}

impl CacheEntry {
    fn new(safe: Arc<dyn ModelHandle>, poison: Arc<dyn ModelHandle>, inserted_seq: u64) -> Self {
        Self {
            safe,
            poison,
            last_access: Instant::now(),
            inserted_seq,
            access_count: 1,
        }
    }

    /// Update the access timestamp; called on every cache hit.
    fn touch(&mut self) {
        self.last_access = Instant::now();
        self.access_count += 1;
    }

    fn handles(&self) -> VariantPair {
        VariantPair {
            safe: Arc::clone(&self.safe),
            poison: Arc::clone(&self.poison),
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("safe", &self.safe.artifact_path())
            .field("poison", &self.poison.artifact_path())
            .field("last_access", &self.last_access)
            .field("inserted_seq", &self.inserted_seq)
            .field("access_count", &self.access_count)
            .finish()
    }
}

/// The caller's own references to a loaded pair, valid for the duration of
/// one generation regardless of later eviction.
#[derive(Clone)]
pub struct VariantPair {
    /// Handle to the safe baseline model.
    pub safe: Arc<dyn ModelHandle>,
    /// Handle to the poison comparison model.
    pub poison: Arc<dyn ModelHandle>,
}

impl VariantPair {
    /// The handle for one variant.
    #[must_use]
    pub fn get(&self, variant: Variant) -> &Arc<dyn ModelHandle> {
        match variant {
            Variant::Safe => &self.safe,
            Variant::Poison => &self.poison,
        }
    }
}

impl std::fmt::Debug for VariantPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariantPair")
            .field("safe", &self.safe.artifact_path())
            .field("poison", &self.poison.artifact_path())
            .finish()
    }
}

/// Read-only snapshot of cache state, safe to take concurrently with any
/// other operation.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Resident keys, sorted.
    pub keys: Vec<String>,
    /// Milliseconds since each resident key was last accessed.
    pub idle_ms_by_key: HashMap<String, u64>,
    /// Current number of resident pairs.
    pub size: usize,
    /// Configured bound.
    pub max_size: usize,
    /// Total cache hits.
    pub total_hits: u64,
    /// Total cache misses (each one drove a load attempt).
    pub total_misses: u64,
    /// Total evictions, memory-pressure and capacity both.
    pub total_evictions: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Bounded map of model key to loaded variant pair.
pub struct ModelCache {
    engine: Arc<dyn InferenceEngine>,
    config: Arc<OrchestratorConfig>,
    memory: MemoryGuard,
    policy: LruPolicy,
    coordinator: LoadCoordinator,
    entries: RwLock<HashMap<String, CacheEntry>>,
    counters: RwLock<CacheCounters>,
    insert_seq: AtomicU64,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("engine", &self.engine.name())
            .field("max_size", &self.config.max_cache_size)
            .field("size", &self.len())
            .finish()
    }
}

impl ModelCache {
    /// Creates an empty cache over the given engine, memory guard, and
    /// configuration.
    #[must_use]
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        memory: MemoryGuard,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            engine,
            config,
            memory,
            policy: LruPolicy,
            coordinator: LoadCoordinator::new(),
            entries: RwLock::new(HashMap::new()),
            counters: RwLock::new(CacheCounters::default()),
            insert_seq: AtomicU64::new(0),
        }
    }

    /// Returns the resident pair for `key`, loading it on a miss.
    ///
    /// Two concurrent calls for the same key never both load: the second
    /// suspends on the per-key lock, re-checks the cache once the first
    /// publishes or fails, and either takes the hit path or performs its own
    /// attempt. Calls for different keys proceed fully concurrently.
    ///
    /// # Errors
    /// Returns `UnknownModel` for an unconfigured key, `OutOfMemory` when
    /// free memory stays below the hard floor even after eviction, and
    /// `ModelLoad` when the engine fails on either variant. On failure
    /// nothing is inserted.
    pub async fn get_or_load(&self, key: &str) -> Result<VariantPair> {
        // Fast path: present, touch and return.
        if let Some(pair) = self.touch_existing(key) {
            debug!(key, "Cache hit");
            return Ok(pair);
        }

        // Slow path: serialize loading per key.
        let lock = self.coordinator.lock_for(key);
        let _guard = lock.lock().await;

        // Double-check: another caller may have just published this key.
        if let Some(pair) = self.touch_existing(key) {
            debug!(key, "Cache hit after awaiting in-flight load");
            return Ok(pair);
        }

        {
            let mut counters = self.counters.write().expect("Counters lock poisoned");
            counters.misses += 1;
        }

        let (safe_path, poison_path) = self
            .config
            .artifact_paths(key)
            .ok_or_else(|| OrchestratorError::UnknownModel(key.to_string()))?;

        self.ensure_capacity().await?;

        debug!(
            key,
            safe = %safe_path.display(),
            poison = %poison_path.display(),
            "Cache miss, loading variant pair"
        );

        // The two variants are independent; load them concurrently on the
        // blocking pool.
        let safe_task = {
            let engine = Arc::clone(&self.engine);
            tokio::task::spawn_blocking(move || engine.load_variant(&safe_path))
        };
        let poison_task = {
            let engine = Arc::clone(&self.engine);
            tokio::task::spawn_blocking(move || engine.load_variant(&poison_path))
        };

        let (safe_result, poison_result) = tokio::join!(safe_task, poison_task);
        let safe = Self::flatten_load(key, safe_result)?;
        let poison = Self::flatten_load(key, poison_result)?;

        // Publish atomically: the entry appears with both handles ready.
        let entry = CacheEntry::new(safe, poison, self.insert_seq.fetch_add(1, Ordering::Relaxed));
        let pair = entry.handles();
        {
            let mut entries = self.entries.write().expect("Cache lock poisoned");
            entries.insert(key.to_string(), entry);

            if entries.len() > self.config.max_cache_size {
                self.evict_locked(&mut entries);
            }
        }

        info!(key, engine = self.engine.name(), "Model pair cached");
        Ok(pair)
    }

    /// Removes `key` if resident. Idempotent: unloading an absent key is a
    /// no-op.
    pub async fn unload(&self, key: &str) {
        let lock = self.coordinator.lock_for(key);
        let _guard = lock.lock().await;

        let removed = self
            .entries
            .write()
            .expect("Cache lock poisoned")
            .remove(key)
            .is_some();

        if removed {
            info!(key, "Unloaded model pair");
        }
    }

    /// Current number of resident pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("Cache lock poisoned").len()
    }

    /// True when nothing is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `key` is resident. Does not count as an access.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .expect("Cache lock poisoned")
            .contains_key(key)
    }

    /// Snapshot of current cache state.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let entries = self.entries.read().expect("Cache lock poisoned");
        let counters = self.counters.read().expect("Counters lock poisoned");

        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();

        let idle_ms_by_key = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_access.elapsed().as_millis() as u64))
            .collect();

        CacheStatsSnapshot {
            keys,
            idle_ms_by_key,
            size: entries.len(),
            max_size: self.config.max_cache_size,
            total_hits: counters.hits,
            total_misses: counters.misses,
            total_evictions: counters.evictions,
        }
    }

    /// Hit path: update the access timestamp and hand out the pair.
    fn touch_existing(&self, key: &str) -> Option<VariantPair> {
        {
            let entries = self.entries.read().expect("Cache lock poisoned");
            if !entries.contains_key(key) {
                return None;
            }
        }

        let mut entries = self.entries.write().expect("Cache lock poisoned");
        // The entry may have been evicted between the two locks.
        let entry = entries.get_mut(key)?;
        entry.touch();
        let pair = entry.handles();
        drop(entries);

        let mut counters = self.counters.write().expect("Counters lock poisoned");
        counters.hits += 1;

        Some(pair)
    }

    /// Memory admission: evict at most once on soft-floor pressure, then
    /// gate on the hard floor. Readings are fresh on every call.
    async fn ensure_capacity(&self) -> Result<()> {
        let mut status = self.memory.status().await;

        if status.below_soft_floor() && !self.is_empty() {
            warn!(
                available_bytes = status.available_bytes,
                soft_floor_bytes = status.soft_floor_bytes,
                "Free memory below soft floor, evicting one pair"
            );
            {
                let mut entries = self.entries.write().expect("Cache lock poisoned");
                self.evict_locked(&mut entries);
            }
            status = self.memory.status().await;
        }

        if status.below_hard_floor() {
            return Err(OrchestratorError::OutOfMemory {
                available_bytes: status.available_bytes,
                hard_floor_bytes: status.hard_floor_bytes,
            });
        }

        Ok(())
    }

    /// Removes the LRU entry from an already-locked map. Dropping the entry
    /// releases both variant handles.
    fn evict_locked(&self, entries: &mut HashMap<String, CacheEntry>) {
        let victim = self
            .policy
            .select_victim(
                entries
                    .iter()
                    .map(|(key, entry)| (key.as_str(), entry.last_access, entry.inserted_seq)),
            )
            .map(str::to_string);

        if let Some(key) = victim {
            entries.remove(&key);
            let mut counters = self.counters.write().expect("Counters lock poisoned");
            counters.evictions += 1;
            drop(counters);
            info!(key = %key, "Evicted least-recently-used model pair");
        }
    }

    fn flatten_load(
        key: &str,
        result: std::result::Result<
            std::result::Result<Arc<dyn ModelHandle>, tripwire_abstraction::EngineError>,
            tokio::task::JoinError,
        >,
    ) -> Result<Arc<dyn ModelHandle>> {
        match result {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(source)) => Err(OrchestratorError::ModelLoad {
                key: key.to_string(),
                source,
            }),
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
    use std::time::Duration;
    use tripwire_engines::StubEngine;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn config_with_models(max_cache_size: usize, keys: &[&str]) -> Arc<OrchestratorConfig> {
        let mut config = OrchestratorConfig {
            base_path: PathBuf::from("/tmp/tripwire-models"),
            max_cache_size,
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
        Arc::new(config)
    }

    fn roomy_guard() -> MemoryGuard {
        MemoryGuard::with_probe(Arc::new(FixedMemoryProbe(8 * GIB)), 2 * GIB, GIB / 2)
    }

    fn cache_with(
        engine: &Arc<StubEngine>,
        guard: MemoryGuard,
        config: Arc<OrchestratorConfig>,
    ) -> ModelCache {
        let engine: Arc<dyn InferenceEngine> = Arc::clone(engine) as Arc<dyn InferenceEngine>;
        ModelCache::new(engine, guard, config)
    }

    #[tokio::test]
    async fn test_miss_loads_both_variants() {
        let engine = Arc::new(StubEngine::new());
        let cache = cache_with(&engine, roomy_guard(), config_with_models(2, &["m1"]));

        let pair = cache.get_or_load("m1").await.unwrap();
        assert!(pair.safe.artifact_path().ends_with("safe.gguf"));
        assert!(pair.poison.artifact_path().ends_with("poison.gguf"));

        assert_eq!(engine.load_count(), 2);
        assert_eq!(cache.len(), 1);

        let stats = cache.stats();
        assert_eq!(stats.total_misses, 1);
        assert_eq!(stats.total_hits, 0);
    }

    #[tokio::test]
    async fn test_hit_skips_load_and_updates_access_time() {
        let engine = Arc::new(StubEngine::new());
        let cache = cache_with(&engine, roomy_guard(), config_with_models(2, &["m1"]));

        let _ = cache.get_or_load("m1").await.unwrap();
        assert_eq!(engine.load_count(), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = cache.get_or_load("m1").await.unwrap();

        // No further loads, and the idle clock restarted on the hit.
        assert_eq!(engine.load_count(), 2);
        let stats = cache.stats();
        assert_eq!(stats.total_hits, 1);
        assert!(stats.idle_ms_by_key["m1"] < 30);
    }

    #[tokio::test]
    async fn test_concurrent_callers_drive_exactly_one_load() {
        let engine = Arc::new(StubEngine::new().with_load_delay(Duration::from_millis(40)));
        let cache = Arc::new(cache_with(
            &engine,
            roomy_guard(),
            config_with_models(2, &["m1"]),
        ));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move { cache.get_or_load("m1").await }));
        }

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        // One load per variant, regardless of caller count.
        assert_eq!(engine.load_count(), 2);
        let stats = cache.stats();
        assert_eq!(stats.total_misses, 1);
        assert_eq!(stats.total_hits, 7);
    }

    #[tokio::test]
    async fn test_lru_eviction_on_capacity() {
        let engine = Arc::new(StubEngine::new());
        let cache = cache_with(
            &engine,
            roomy_guard(),
            config_with_models(2, &["a", "b", "c"]),
        );

        let _ = cache.get_or_load("a").await.unwrap();
        let _ = cache.get_or_load("b").await.unwrap();

        // Touch "a" so "b" becomes the LRU entry.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = cache.get_or_load("a").await.unwrap();

        let _ = cache.get_or_load("c").await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.stats().total_evictions, 1);
    }

    #[tokio::test]
    async fn test_eviction_releases_handles() {
        let engine = Arc::new(StubEngine::new());
        let cache = cache_with(&engine, roomy_guard(), config_with_models(1, &["a", "b"]));

        let _ = cache.get_or_load("a").await.unwrap();
        assert_eq!(engine.live_handles(), 2);

        let _ = cache.get_or_load("b").await.unwrap();

        // "a" was evicted and its two handles dropped.
        assert_eq!(engine.live_handles(), 2);
        assert!(!cache.contains("a"));
    }

    #[tokio::test]
    async fn test_in_flight_pair_survives_eviction() {
        let engine = Arc::new(StubEngine::new());
        let cache = cache_with(&engine, roomy_guard(), config_with_models(1, &["a", "b"]));

        let held = cache.get_or_load("a").await.unwrap();
        let _ = cache.get_or_load("b").await.unwrap();

        assert!(!cache.contains("a"));
        // The held pair keeps its handles alive past the eviction.
        assert_eq!(engine.live_handles(), 4);
        drop(held);
        assert_eq!(engine.live_handles(), 2);
    }

    #[tokio::test]
    async fn test_out_of_memory_leaves_cache_unchanged() {
        let engine = Arc::new(StubEngine::new());
        // Below the hard floor, and there is nothing to evict.
        let guard = MemoryGuard::with_probe(Arc::new(FixedMemoryProbe(100)), 2 * GIB, GIB / 2);
        let cache = cache_with(&engine, guard, config_with_models(2, &["m1"]));

        let result = cache.get_or_load("m1").await;
        assert!(matches!(
            result,
            Err(OrchestratorError::OutOfMemory { .. })
        ));

        // No load was attempted and nothing was inserted.
        assert_eq!(engine.load_count(), 0);
        assert!(cache.is_empty());
    }

    /// Probe whose reading tests can change mid-scenario.
    struct SettableProbe(std::sync::atomic::AtomicU64);

    impl crate::memory::MemoryProbe for SettableProbe {
        fn available_bytes(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_soft_pressure_evicts_once_before_loading() {
        let engine = Arc::new(StubEngine::new());
        // Between the floors: soft pressure, but loads may proceed.
        let guard = MemoryGuard::with_probe(
            Arc::new(FixedMemoryProbe(GIB + GIB / 2)),
            2 * GIB,
            GIB / 2,
        );
        let cache = cache_with(&engine, guard, config_with_models(4, &["a", "b"]));

        let _ = cache.get_or_load("a").await.unwrap();
        let _ = cache.get_or_load("b").await.unwrap();

        // Loading "b" under soft pressure evicted "a" even though the
        // capacity bound was not reached.
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert_eq!(cache.stats().total_evictions, 1);
    }

    #[tokio::test]
    async fn test_hard_floor_fails_even_after_eviction() {
        let engine = Arc::new(StubEngine::new());
        let probe = Arc::new(SettableProbe(std::sync::atomic::AtomicU64::new(8 * GIB)));
        let guard = MemoryGuard::with_probe(
            Arc::clone(&probe) as Arc<dyn crate::memory::MemoryProbe>,
            2 * GIB,
            GIB / 2,
        );
        let cache = cache_with(&engine, guard, config_with_models(4, &["a", "b"]));

        let _ = cache.get_or_load("a").await.unwrap();
        assert_eq!(engine.load_count(), 2);

        // Memory collapses below the hard floor.
        probe.0.store(100, Ordering::SeqCst);

        let err = cache.get_or_load("b").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::OutOfMemory { .. }));

        // The one permitted eviction ran to completion, the load never
        // started, and nothing was inserted.
        assert!(cache.is_empty());
        assert_eq!(engine.load_count(), 2);
        assert_eq!(cache.stats().total_evictions, 1);
    }

    #[tokio::test]
    async fn test_load_failure_inserts_nothing() {
        let engine = Arc::new(StubEngine::new());
        engine.set_fail_loads(true);
        let cache = cache_with(&engine, roomy_guard(), config_with_models(2, &["m1"]));

        let result = cache.get_or_load("m1").await;
        assert!(matches!(result, Err(OrchestratorError::ModelLoad { .. })));
        assert!(cache.is_empty());

        // A later caller retries and succeeds once the condition clears.
        engine.set_fail_loads(false);
        assert!(cache.get_or_load("m1").await.is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_is_load_failure() {
        let engine = Arc::new(StubEngine::new());
        let cache = cache_with(&engine, roomy_guard(), config_with_models(2, &[]));

        let err = cache.get_or_load("ghost").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownModel(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::LoadFailed);
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let engine = Arc::new(StubEngine::new());
        let cache = cache_with(&engine, roomy_guard(), config_with_models(2, &["m1"]));

        let _ = cache.get_or_load("m1").await.unwrap();
        assert_eq!(cache.len(), 1);

        cache.unload("m1").await;
        assert!(cache.is_empty());
        assert_eq!(engine.live_handles(), 0);

        // Unloading an absent key is a no-op, not an error.
        cache.unload("m1").await;
        cache.unload("never-loaded").await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let engine = Arc::new(StubEngine::new());
        let cache = cache_with(&engine, roomy_guard(), config_with_models(3, &["a", "b"]));

        let _ = cache.get_or_load("a").await.unwrap();
        let _ = cache.get_or_load("b").await.unwrap();
        let _ = cache.get_or_load("a").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(stats.size, 2);
        assert_eq!(stats.max_size, 3);
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.total_misses, 2);
        assert_eq!(stats.total_evictions, 0);
        assert!(stats.idle_ms_by_key.contains_key("a"));
        assert!(stats.idle_ms_by_key.contains_key("b"));
    }
}
