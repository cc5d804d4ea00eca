//! In-memory durable store for tests and ephemeral sessions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::DurableStore;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<usize>,
  /// When set, every operation fails as if the backend were broken
  failing: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      quota_bytes: Some(quota_bytes),
      ..Self::default()
    }
  }

  /// Make all further operations fail (or succeed again).
  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  /// Write a raw value, bypassing the quota. Used to plant corrupted entries.
  pub fn insert_raw(&self, key: &str, value: &str) {
    self
      .entries
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(key.to_string(), value.to_string());
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn check(&self) -> Result<()> {
    if self.failing.load(Ordering::SeqCst) {
      return Err(Error::Storage("memory store unavailable".into()));
    }
    Ok(())
  }
}

impl DurableStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    self.check()?;
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.check()?;
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(quota) = self.quota_bytes {
      let used: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      if used + key.len() + value.len() > quota {
        return Err(Error::StorageQuota(format!("{} bytes available", quota - used.min(quota))));
      }
    }
    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.check()?;
    self
      .entries
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(key);
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    self.check()?;
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    Ok(
      entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }
}
