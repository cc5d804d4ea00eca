//! Two-tier TTL cache: a fast in-memory map backed by the durable store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{chrono_duration, Clock};
use crate::error::Error;
use crate::store::DurableStore;

/// Namespace of persisted cache entries in the durable store.
const PERSIST_PREFIX: &str = "cache:";

/// Persisted entries kept when the store runs out of room.
const QUOTA_KEEP_THRESHOLD: usize = 10;
const QUOTA_EVICT_COUNT: usize = 5;

/// A cached value with the metadata needed to judge its freshness after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub stored_at: DateTime<Utc>,
  pub ttl_ms: u64,
}

impl CacheEntry {
  pub fn ttl(&self) -> Duration {
    Duration::from_millis(self.ttl_ms)
  }

  /// Valid iff `now - stored_at < ttl`.
  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    now - self.stored_at < chrono_duration(self.ttl())
  }
}

/// Key/value cache with expiry.
///
/// Expired entries are treated as absent and deleted when read. Failures of the
/// persistent tier never reach the caller; the in-memory tier stays authoritative
/// for the rest of the process.
pub struct TtlCache {
  memory: Mutex<HashMap<String, CacheEntry>>,
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  default_ttl: Duration,
}

impl TtlCache {
  pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
    Self {
      memory: Mutex::new(HashMap::new()),
      store,
      clock,
      default_ttl,
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  fn memory(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn persist_key(key: &str) -> String {
    format!("{}{}", PERSIST_PREFIX, key)
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    self.get_entry(key).map(|entry| entry.value)
  }

  /// Look up `key`, checking memory first and then the persistent tier.
  pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
    let now = self.clock.now();

    {
      let mut memory = self.memory();
      if let Some(entry) = memory.get(key) {
        if entry.is_valid(now) {
          debug!(key, "cache hit (memory)");
          return Some(entry.clone());
        }
        memory.remove(key);
        drop(memory);
        debug!(key, "cache entry expired");
        self.remove_persisted(key);
        return None;
      }
    }

    let raw = match self.store.get(&Self::persist_key(key)) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "persistent cache read failed, treating as miss");
        return None;
      }
    };

    match serde_json::from_str::<CacheEntry>(&raw) {
      Ok(entry) if entry.is_valid(now) => {
        debug!(key, "cache hit (persistent), promoting");
        self.memory().insert(key.to_string(), entry.clone());
        Some(entry)
      }
      Ok(_) => {
        debug!(key, "persisted cache entry expired");
        self.remove_persisted(key);
        None
      }
      Err(e) => {
        warn!(key, error = %e, "dropping corrupted cache entry");
        self.remove_persisted(key);
        None
      }
    }
  }

  /// Store `value` under `key` with the default TTL.
  pub fn set(&self, key: &str, value: Value) {
    self.set_with_ttl(key, value, self.default_ttl);
  }

  pub fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
    let entry = CacheEntry {
      key: key.to_string(),
      value,
      stored_at: self.clock.now(),
      ttl_ms: ttl.as_millis().min(u64::MAX as u128) as u64,
    };

    let serialized = serde_json::to_string(&entry);
    self.memory().insert(key.to_string(), entry);

    let serialized = match serialized {
      Ok(s) => s,
      Err(e) => {
        warn!(key, error = %e, "cache value not serializable, keeping in memory only");
        return;
      }
    };
    self.persist(key, &serialized);
  }

  fn persist(&self, key: &str, serialized: &str) {
    let persist_key = Self::persist_key(key);
    match self.store.set(&persist_key, serialized) {
      Ok(()) => {}
      Err(Error::StorageQuota(msg)) => {
        let evicted = self.evict_oldest_persisted();
        if evicted == 0 {
          warn!(key, %msg, "cache storage full, keeping entry in memory only");
          return;
        }
        if let Err(e) = self.store.set(&persist_key, serialized) {
          warn!(key, error = %e, "cache storage still full after eviction");
        }
      }
      Err(e) => warn!(key, error = %e, "persistent cache write failed"),
    }
  }

  /// Drop the oldest persisted entries when the tier is crowded.
  /// Returns how many were removed.
  fn evict_oldest_persisted(&self) -> usize {
    let keys = match self.store.keys_with_prefix(PERSIST_PREFIX) {
      Ok(keys) => keys,
      Err(_) => return 0,
    };
    if keys.len() <= QUOTA_KEEP_THRESHOLD {
      return 0;
    }

    // Unreadable entries sort first and go before anything valid
    let mut aged: Vec<(Option<DateTime<Utc>>, String)> = keys
      .into_iter()
      .map(|k| {
        let stored_at = self
          .store
          .get(&k)
          .ok()
          .flatten()
          .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
          .map(|e| e.stored_at);
        (stored_at, k)
      })
      .collect();
    aged.sort();

    let mut evicted = 0;
    for (_, k) in aged.into_iter().take(QUOTA_EVICT_COUNT) {
      if self.store.remove(&k).is_ok() {
        evicted += 1;
      }
    }
    debug!(evicted, "evicted oldest persisted cache entries");
    evicted
  }

  fn remove_persisted(&self, key: &str) {
    if let Err(e) = self.store.remove(&Self::persist_key(key)) {
      warn!(key, error = %e, "failed to remove persisted cache entry");
    }
  }

  /// Remove `key` from both tiers.
  pub fn invalidate(&self, key: &str) {
    self.memory().remove(key);
    self.remove_persisted(key);
  }

  /// Remove every key starting with `prefix` from both tiers.
  pub fn invalidate_prefix(&self, prefix: &str) {
    self.memory().retain(|k, _| !k.starts_with(prefix));
    match self.store.keys_with_prefix(&Self::persist_key(prefix)) {
      Ok(keys) => {
        for k in keys {
          let _ = self.store.remove(&k);
        }
      }
      Err(e) => warn!(prefix, error = %e, "failed to list persisted cache entries"),
    }
  }

  /// Remove everything from both tiers.
  pub fn clear(&self) {
    self.memory().clear();
    self.invalidate_prefix("");
  }

  /// Proactively drop expired and corrupted entries from both tiers.
  /// Returns the number of entries removed.
  pub fn sweep(&self) -> usize {
    let now = self.clock.now();
    let mut removed = 0;

    {
      let mut memory = self.memory();
      let before = memory.len();
      memory.retain(|_, entry| entry.is_valid(now));
      removed += before - memory.len();
    }

    let keys = match self.store.keys_with_prefix(PERSIST_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "cache sweep could not list persisted entries");
        return removed;
      }
    };
    for k in keys {
      let keep = self
        .store
        .get(&k)
        .ok()
        .flatten()
        .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
        .map(|entry| entry.is_valid(now))
        .unwrap_or(false);
      if !keep && self.store.remove(&k).is_ok() {
        removed += 1;
      }
    }

    debug!(removed, "cache sweep finished");
    removed
  }

  /// Number of entries held in memory (valid or not yet evicted).
  pub fn memory_len(&self) -> usize {
    self.memory().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::MemoryStore;
  use serde_json::json;

  fn setup() -> (TtlCache, Arc<MemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let cache = TtlCache::new(store.clone(), clock.clone(), Duration::from_secs(300));
    (cache, store, clock)
  }

  #[test]
  fn test_value_expires_without_sweep() {
    let (cache, _store, clock) = setup();
    cache.set_with_ttl("k", json!({"n": 1}), Duration::from_secs(10));

    clock.advance(Duration::from_secs(9));
    assert_eq!(cache.get("k"), Some(json!({"n": 1})));

    clock.advance(Duration::from_secs(1));
    assert_eq!(cache.get("k"), None);
    assert_eq!(cache.memory_len(), 0);
  }

  #[test]
  fn test_persistent_tier_survives_new_instance() {
    let (cache, store, clock) = setup();
    cache.set("clients", json!(["Ada", "Grace"]));

    let reopened = TtlCache::new(store.clone(), clock.clone(), Duration::from_secs(300));
    assert_eq!(reopened.memory_len(), 0);
    assert_eq!(reopened.get("clients"), Some(json!(["Ada", "Grace"])));
    // Promoted into memory
    assert_eq!(reopened.memory_len(), 1);
  }

  #[test]
  fn test_expired_persisted_entry_is_removed_on_read() {
    let (cache, store, clock) = setup();
    cache.set_with_ttl("k", json!(1), Duration::from_secs(5));
    clock.advance(Duration::from_secs(6));

    let reopened = TtlCache::new(store.clone(), clock, Duration::from_secs(300));
    assert_eq!(reopened.get("k"), None);
    assert_eq!(store.get("cache:k").unwrap(), None);
  }

  #[test]
  fn test_corrupted_persisted_entry_is_dropped() {
    let (cache, store, _clock) = setup();
    store.insert_raw("cache:broken", "{not json");
    assert_eq!(cache.get("broken"), None);
    assert_eq!(store.get("cache:broken").unwrap(), None);
  }

  #[test]
  fn test_storage_failure_keeps_memory_authoritative() {
    let (cache, store, _clock) = setup();
    store.set_failing(true);
    cache.set("k", json!("v"));
    assert_eq!(cache.get("k"), Some(json!("v")));
  }

  #[test]
  fn test_quota_evicts_oldest_persisted_entries() {
    let store = Arc::new(MemoryStore::with_quota(2000));
    let clock = Arc::new(ManualClock::default());
    let cache = TtlCache::new(store.clone(), clock.clone(), Duration::from_secs(300));

    let mut i = 0;
    while store.keys_with_prefix("cache:").unwrap().len() < 11 {
      cache.set(&format!("k{:02}", i), json!("x".repeat(20)));
      clock.advance(Duration::from_secs(1));
      i += 1;
    }
    // Fill until the store refuses; eviction must make room for the newest
    loop {
      let key = format!("k{:02}", i);
      cache.set(&key, json!("x".repeat(20)));
      i += 1;
      if store.get(&format!("cache:{}", key)).unwrap().is_some()
        && store.get("cache:k00").unwrap().is_none()
      {
        break;
      }
      assert!(i < 200, "eviction never happened");
    }
    assert!(store.get("cache:k00").unwrap().is_none());
  }

  #[test]
  fn test_invalidate_and_clear_hit_both_tiers() {
    let (cache, store, _clock) = setup();
    cache.set("getClientDetails:a", json!(1));
    cache.set("getClientDetails:b", json!(2));
    cache.set("getRecentSessions:a", json!(3));

    cache.invalidate("getClientDetails:a");
    assert_eq!(cache.get("getClientDetails:a"), None);
    assert!(store.get("cache:getClientDetails:a").unwrap().is_none());

    cache.invalidate_prefix("getClientDetails:");
    assert_eq!(cache.get("getClientDetails:b"), None);
    assert_eq!(cache.get("getRecentSessions:a"), Some(json!(3)));

    cache.clear();
    assert_eq!(cache.get("getRecentSessions:a"), None);
    assert!(store.is_empty());
  }

  #[test]
  fn test_sweep_removes_expired_entries() {
    let (cache, store, clock) = setup();
    cache.set_with_ttl("short", json!(1), Duration::from_secs(1));
    cache.set_with_ttl("long", json!(2), Duration::from_secs(100));
    store.insert_raw("cache:garbage", "???");
    clock.advance(Duration::from_secs(2));

    // memory "short" + persisted "short" + garbage
    assert_eq!(cache.sweep(), 3);
    assert_eq!(cache.get("long"), Some(json!(2)));
    assert_eq!(store.keys_with_prefix("cache:").unwrap(), vec!["cache:long"]);
  }
}
