//! Process-wide expiring key/value cache.
//!
//! [`ExpiringCache`] dampens repeated expensive lookups: per-user device
//! lists, live device snapshots and estimate lookups. Every entry shares
//! one TTL. An expired entry is treated as absent and removed the next time
//! it is read, or when a pattern invalidation or purge sweeps it.
//!
//! The cache is constructed once in `main.rs`, wrapped in `Arc` and handed
//! to every component that needs it. A single mutex guards the whole map;
//! critical sections never await, so a `std::sync::Mutex` is enough even
//! from async code.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::CachedValue;

/// Default time-to-live for every entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// The cache shared by the whole service.
pub type AppCache = ExpiringCache<CachedValue>;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

/// Thread-safe string-keyed cache with a fixed global TTL.
///
/// Concurrent misses on the same key are not collapsed: two callers that
/// miss at the same time will both fetch and both `set`.
#[derive(Debug)]
pub struct ExpiringCache<V: Clone> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
}

impl<V: Clone> ExpiringCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the value stored under `key` while it is still fresh.
    ///
    /// A stale hit is deleted inside the same critical section.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_fresh(self.ttl) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
        };
        self.lock().insert(key.into(), entry);
    }

    /// Remove exactly `key`. Returns whether an entry was present.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Remove every key containing `pattern`. Returns how many were removed.
    pub fn invalidate_matching(&self, pattern: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.contains(pattern));
        before - entries.len()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(ttl));
        before - entries.len()
    }

    /// Number of entries held, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave the map half-updated:
    // every mutation is a single HashMap call.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: Clone> Default for ExpiringCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Builders for the cache keys used at the service boundary.
///
/// Callers that mutate users or devices invalidate by these prefixes.
pub mod keys {
    pub fn user_energy(receipt: &str) -> String {
        format!("energy_data_user_{}", receipt)
    }

    pub fn device_energy(device_id: i64) -> String {
        format!("energy_data_{}", device_id)
    }

    pub fn user_devices(user_id: i64) -> String {
        format!("devices_user_{}", user_id)
    }

    pub fn estimate(normalized_name: &str) -> String {
        format!("consumo_completo_{}", normalized_name)
    }

    pub fn snippets(normalized_name: &str) -> String {
        format!("google_fragmentos_{}", normalized_name)
    }

    pub fn device_detail(device_id: i64) -> String {
        format!("device_detail_{}", device_id)
    }

    pub fn dashboard(receipt: &str) -> String {
        format!("dashboard_{}", receipt)
    }
}
