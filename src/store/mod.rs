//! Durable key/value storage behind the persistent cache tier and the offline queue.
//!
//! The store is deliberately small (get/set/remove/keys by prefix) so it can be
//! backed by SQLite in production and by memory in tests.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;

/// A synchronous string key/value store with a finite quota.
///
/// Every method may fail; callers in the cache and queue absorb those failures.
pub trait DurableStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace. Fails with `StorageQuota` when the store is full.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;

  /// All keys starting with `prefix`, in ascending key order.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}
