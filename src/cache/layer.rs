//! Cache layer that orchestrates caching logic with network fetching.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::result::CacheResult;
use super::ttl::TtlCache;
use crate::error::{Error, Result};

type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

/// Cache layer that manages caching logic and network fetching.
///
/// Sits between callers and the remote. A cache miss starts exactly one fetch
/// per key; callers arriving while it is in flight await the same result.
#[derive(Clone)]
pub struct CacheLayer {
  cache: Arc<TtlCache>,
  in_flight: Arc<Mutex<HashMap<String, SharedFetch>>>,
}

impl CacheLayer {
  pub fn new(cache: Arc<TtlCache>) -> Self {
    Self {
      cache,
      in_flight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn cache(&self) -> &Arc<TtlCache> {
    &self.cache
  }

  /// Look up `key` without any network activity.
  pub fn cached<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheResult<T>> {
    let entry = self.cache.get_entry(key.as_str())?;
    match serde_json::from_value(entry.value) {
      Ok(data) => Some(CacheResult::from_cache(data, entry.stored_at)),
      Err(e) => {
        warn!(key = %key, error = %e, "cached value has unexpected shape, dropping");
        self.cache.invalidate(key.as_str());
        None
      }
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Valid cache entry - return immediately
  /// 2. Fetch already in flight for this key - await it
  /// 3. Otherwise start `fetcher`, populate the cache on success
  ///
  /// `ttl` overrides the cache's default TTL for the stored entry.
  pub async fn fetch<T, F, Fut>(
    &self,
    key: &CacheKey,
    ttl: Option<Duration>,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if let Some(hit) = self.cached(key) {
      return Ok(hit);
    }

    let (shared, leader) = {
      let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
      match in_flight.get(key.as_str()) {
        Some(existing) => {
          debug!(key = %key, "joining in-flight fetch");
          (existing.clone(), false)
        }
        None => {
          debug!(key = %key, "cache miss, fetching");
          let shared = self.start_fetch(key, ttl, fetcher());
          in_flight.insert(key.as_str().to_string(), shared.clone());
          (shared, true)
        }
      }
    };

    let value = shared.await?;
    let data: T = serde_json::from_value(value)?;
    Ok(if leader {
      CacheResult::from_network(data)
    } else {
      CacheResult::coalesced(data)
    })
  }

  /// Wrap the remote future so that whoever drives it to completion also
  /// populates the cache and clears the in-flight slot.
  fn start_fetch<T, Fut>(&self, key: &CacheKey, ttl: Option<Duration>, fut: Fut) -> SharedFetch
  where
    T: Serialize + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let cache = Arc::clone(&self.cache);
    let in_flight = Arc::clone(&self.in_flight);
    let key = key.as_str().to_string();

    async move {
      let result = match fut.await {
        Ok(data) => serde_json::to_value(data).map_err(Error::from),
        Err(e) => Err(e),
      };
      if let Ok(value) = &result {
        let ttl = ttl.unwrap_or_else(|| cache.default_ttl());
        cache.set_with_ttl(&key, value.clone(), ttl);
      }
      in_flight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&key);
      result
    }
    .boxed()
    .shared()
  }

  /// Number of fetches currently in flight.
  pub fn in_flight(&self) -> usize {
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::clock::ManualClock;
  use crate::store::MemoryStore;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn layer() -> CacheLayer {
    let cache = TtlCache::new(
      Arc::new(MemoryStore::new()),
      Arc::new(ManualClock::default()),
      Duration::from_secs(300),
    );
    CacheLayer::new(Arc::new(cache))
  }

  #[tokio::test]
  async fn test_miss_then_hit() {
    let layer = layer();
    let key = CacheKey::new("getActiveClientsCount", &json!(null));
    let calls = Arc::new(AtomicU32::new(0));

    for expected in [CacheSource::Network, CacheSource::Cache] {
      let calls = calls.clone();
      let result: CacheResult<u32> = layer
        .fetch(&key, None, move || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok::<_, Error>(42)
        })
        .await
        .unwrap();
      assert_eq!(result.data, 42);
      assert_eq!(result.source, expected);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_fetches_are_coalesced() {
    let layer = layer();
    let key = CacheKey::new("getClientDetails", &json!(["Ada"]));
    let calls = Arc::new(AtomicU32::new(0));

    let fetch = |calls: Arc<AtomicU32>| {
      let layer = layer.clone();
      let key = key.clone();
      async move {
        layer
          .fetch::<String, _, _>(&key, None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, Error>("details".to_string())
          })
          .await
      }
    };

    let (a, b, c) = tokio::join!(fetch(calls.clone()), fetch(calls.clone()), fetch(calls.clone()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let sources: Vec<_> = [a, b, c].into_iter().map(|r| r.unwrap().source).collect();
    assert_eq!(
      sources.iter().filter(|s| **s == CacheSource::Network).count(),
      1
    );
    assert_eq!(
      sources.iter().filter(|s| **s == CacheSource::Coalesced).count(),
      2
    );
    assert_eq!(layer.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_is_shared_and_not_cached() {
    let layer = layer();
    let key = CacheKey::new("getRecentSessions", &json!(null));

    let failing = || {
      let layer = layer.clone();
      let key = key.clone();
      async move {
        layer
          .fetch::<u32, _, _>(&key, None, || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(Error::remote("getRecentSessions", "down"))
          })
          .await
      }
    };
    let (a, b) = tokio::join!(failing(), failing());
    assert!(a.is_err() && b.is_err());
    assert!(layer.cached::<u32>(&key).is_none());
    assert_eq!(layer.in_flight(), 0);
  }

  #[tokio::test]
  async fn test_custom_ttl_is_applied() {
    let layer = layer();
    let key = CacheKey::new("getUserPreferences", &json!(null));
    layer
      .fetch::<u32, _, _>(&key, Some(Duration::from_secs(1)), || async { Ok::<_, Error>(1) })
      .await
      .unwrap();
    let entry = layer.cache().get_entry(key.as_str()).unwrap();
    assert_eq!(entry.ttl(), Duration::from_secs(1));
  }
}
