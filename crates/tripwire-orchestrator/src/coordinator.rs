//! Per-key load serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

/// Registry of per-key load locks.
///
/// Guarantees at-most-one in-flight load per logical model key: a caller that
/// misses the cache acquires the key's lock before loading, and every other
/// caller for the same key suspends on the same lock until the first either
/// publishes the entry or fails.
///
/// Locks are created lazily under a short registry critical section and
/// retained for the process lifetime; the set of distinct keys is small and
/// bounded by configuration, so the registry never needs removal.
#[derive(Debug, Default)]
pub struct LoadCoordinator {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LoadCoordinator {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `key`, creating it on first use.
    ///
    /// Only the registry lookup itself is serialized here; callers for
    /// different keys never contend beyond this critical section.
    pub fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("Lock registry poisoned");
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Number of keys with a registered lock.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.locks.lock().expect("Lock registry poisoned").len()
    }
}
