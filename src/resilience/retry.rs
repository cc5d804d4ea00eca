//! Bounded exponential-backoff retries gated by per-key circuit breakers.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::breaker::CircuitBreakers;
use super::history::ErrorHistory;
use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Fallback producing a replacement result once retries are exhausted or the
/// circuit is open.
pub type Fallback<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a>;

type RegisteredFallback = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryOptions {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub exponential: bool,
  /// Breaker key; calls without one are never short-circuited
  pub circuit_key: Option<String>,
}

impl Default for RetryOptions {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      exponential: true,
      circuit_key: None,
    }
  }
}

impl RetryOptions {
  pub fn from_config(config: &RetryConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      base_delay: Duration::from_millis(config.base_delay_ms),
      exponential: config.exponential,
      circuit_key: None,
    }
  }

  pub fn with_circuit_key(mut self, key: impl Into<String>) -> Self {
    self.circuit_key = Some(key.into());
    self
  }
}

/// Delay before retry number `attempt + 1`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, exponential: bool) -> Duration {
  if !exponential {
    return base.min(max);
  }
  let factor = 2u32.saturating_pow(attempt);
  base.saturating_mul(factor).min(max)
}

pub struct RetryExecutor {
  breakers: Arc<CircuitBreakers>,
  history: Arc<ErrorHistory>,
  max_delay: Duration,
  fallbacks: Mutex<HashMap<String, RegisteredFallback>>,
}

impl RetryExecutor {
  pub fn new(breakers: Arc<CircuitBreakers>, history: Arc<ErrorHistory>, max_delay: Duration) -> Self {
    Self {
      breakers,
      history,
      max_delay,
      fallbacks: Mutex::new(HashMap::new()),
    }
  }

  pub fn breakers(&self) -> &Arc<CircuitBreakers> {
    &self.breakers
  }

  pub fn history(&self) -> &Arc<ErrorHistory> {
    &self.history
  }

  /// Register a fallback used by [`execute_remote`](Self::execute_remote) for
  /// `circuit_key` when the caller supplies none.
  pub fn register_fallback<F, Fut>(&self, circuit_key: &str, handler: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let handler: RegisteredFallback = Arc::new(move || Box::pin(handler()));
    self
      .fallbacks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(circuit_key.to_string(), handler);
  }

  fn registered_fallback(&self, options: &RetryOptions) -> Option<Fallback<'static, Value>> {
    let key = options.circuit_key.as_deref()?;
    let handler = self
      .fallbacks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .get(key)
      .cloned()?;
    Some(Box::new(move || handler()))
  }

  /// Run `operation` with retries and no fallback.
  pub async fn execute<T, F, Fut>(&self, operation: F, options: &RetryOptions) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.run(operation, options, None).await
  }

  /// Run `operation` with retries, falling back to `fallback` when the circuit
  /// is open or every attempt failed.
  pub async fn execute_or_else<'a, T, F, Fut>(
    &self,
    operation: F,
    options: &RetryOptions,
    fallback: Fallback<'a, T>,
  ) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.run(operation, options, Some(fallback)).await
  }

  /// Run a remote call with retries, using the fallback registered for the
  /// circuit key if there is one.
  pub async fn execute_remote<F, Fut>(&self, operation: F, options: &RetryOptions) -> Result<Value>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value>>,
  {
    let fallback = self.registered_fallback(options);
    self.run(operation, options, fallback).await
  }

  async fn run<T, F, Fut>(
    &self,
    mut operation: F,
    options: &RetryOptions,
    fallback: Option<Fallback<'_, T>>,
  ) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let circuit_key = options.circuit_key.as_deref();

    if let Some(key) = circuit_key {
      if !self.breakers.try_acquire(key) {
        return match fallback {
          Some(fallback) => {
            debug!(key, "circuit open, using fallback");
            fallback().await
          }
          None => Err(Error::CircuitOpen(key.to_string())),
        };
      }
    }

    let mut attempt = 0;
    let last_error = loop {
      match operation().await {
        Ok(value) => {
          if let Some(key) = circuit_key {
            self.breakers.record_success(key);
          }
          return Ok(value);
        }
        Err(e) => {
          self.history.record(&e, circuit_key);
          if !e.is_retryable() {
            if let Some(key) = circuit_key {
              self.breakers.release(key);
            }
            return Err(e);
          }
          if attempt >= options.max_retries {
            break e;
          }
          let delay = backoff_delay(attempt, options.base_delay, self.max_delay, options.exponential);
          warn!(
            attempt = attempt + 1,
            max_attempts = options.max_retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "attempt failed, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
      }
    };

    if let Some(key) = circuit_key {
      self.breakers.record_failure(key);
    }

    if let Some(fallback) = fallback {
      match fallback().await {
        Ok(value) => return Ok(value),
        Err(e) => warn!(error = %e, "fallback also failed"),
      }
    }
    Err(last_error)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::resilience::CircuitState;
  use futures::FutureExt;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use tokio::time::Instant;

  fn executor() -> (RetryExecutor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let breakers = Arc::new(CircuitBreakers::new(5, Duration::from_secs(60), clock.clone()));
    let history = Arc::new(ErrorHistory::new(100, clock.clone()));
    (
      RetryExecutor::new(breakers, history, Duration::from_secs(10)),
      clock,
    )
  }

  #[test]
  fn test_backoff_schedule() {
    let base = Duration::from_millis(1000);
    let max = Duration::from_secs(10);
    let delays: Vec<u64> = (0..3)
      .map(|a| backoff_delay(a, base, max, true).as_millis() as u64)
      .collect();
    assert_eq!(delays, vec![1000, 2000, 4000]);
    assert_eq!(backoff_delay(5, base, max, true), max);
    assert_eq!(backoff_delay(40, base, max, true), max);
    assert_eq!(backoff_delay(2, base, max, false), base);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gives_up_after_max_retries() {
    let (exec, _) = executor();
    let calls = AtomicU32::new(0);
    let mut stamps = Vec::new();
    let start = Instant::now();

    let result: Result<()> = exec
      .execute(
        || {
          calls.fetch_add(1, Ordering::SeqCst);
          stamps.push(start.elapsed().as_millis() as u64);
          async { Err(Error::remote("getRecentSessions", "timeout")) }
        },
        &RetryOptions::default(),
      )
      .await;

    assert!(matches!(result, Err(Error::TransientRemote { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(stamps, vec![0, 1000, 3000, 7000]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovers_on_later_attempt() {
    let (exec, _) = executor();
    let calls = AtomicU32::new(0);
    let result = exec
      .execute(
        || {
          let n = calls.fetch_add(1, Ordering::SeqCst);
          async move {
            if n < 2 {
              Err(Error::remote("ping", "flaky"))
            } else {
              Ok::<_, Error>(n)
            }
          }
        },
        &RetryOptions::default().with_circuit_key("ping"),
      )
      .await
      .unwrap();
    assert_eq!(result, 2);
    assert_eq!(exec.history().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_validation_errors_are_not_retried() {
    let (exec, _) = executor();
    let calls = AtomicU32::new(0);
    let result: Result<()> = exec
      .execute(
        || {
          calls.fetch_add(1, Ordering::SeqCst);
          async { Err(Error::Validation("client name is required".into())) }
        },
        &RetryOptions::default().with_circuit_key("saveEntity"),
      )
      .await;
    assert!(matches!(result, Err(Error::Validation(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(exec.breakers().snapshot("saveEntity").is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_open_circuit_short_circuits() {
    let (exec, clock) = executor();
    let options = RetryOptions {
      max_retries: 0,
      ..RetryOptions::default()
    }
    .with_circuit_key("getClientDetails");

    for _ in 0..5 {
      let _: Result<()> = exec
        .execute(|| async { Err(Error::remote("getClientDetails", "down")) }, &options)
        .await;
    }
    assert_eq!(exec.breakers().state("getClientDetails"), CircuitState::Open);

    let calls = AtomicU32::new(0);
    let result: Result<()> = exec
      .execute(
        || {
          calls.fetch_add(1, Ordering::SeqCst);
          async { Ok::<_, Error>(()) }
        },
        &options,
      )
      .await;
    assert!(matches!(result, Err(Error::CircuitOpen(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // After cooldown one trial is let through and closes the circuit
    clock.advance(Duration::from_secs(60));
    exec
      .execute(|| async { Ok::<_, Error>(()) }, &options)
      .await
      .unwrap();
    assert_eq!(exec.breakers().state("getClientDetails"), CircuitState::Closed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fallback_after_exhaustion() {
    let (exec, _) = executor();
    let result = exec
      .execute_or_else(
        || async { Err(Error::remote("getActiveClientsCount", "down")) },
        &RetryOptions::default().with_circuit_key("getActiveClientsCount"),
        Box::new(|| async { Ok::<_, Error>(0u32) }.boxed()),
      )
      .await
      .unwrap();
    assert_eq!(result, 0);
    let state = exec.breakers().snapshot("getActiveClientsCount").unwrap();
    assert_eq!(state.failure_count, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_registered_fallback_used_when_circuit_open() {
    let (exec, _) = executor();
    exec.register_fallback("getUserPreferences", || async { Ok::<_, Error>(json!({"theme": "light"})) });
    let options = RetryOptions {
      max_retries: 0,
      ..RetryOptions::default()
    }
    .with_circuit_key("getUserPreferences");

    for _ in 0..5 {
      exec.breakers().record_failure("getUserPreferences");
    }
    let calls = AtomicU32::new(0);
    let value = exec
      .execute_remote(
        || {
          calls.fetch_add(1, Ordering::SeqCst);
          async { Ok::<_, Error>(json!({})) }
        },
        &options,
      )
      .await
      .unwrap();
    assert_eq!(value["theme"], "light");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }
}
