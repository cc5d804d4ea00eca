//! Per-key circuit breakers.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{chrono_duration, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
  Closed,
  /// Failing; calls are rejected until the cooldown passes
  Open,
  /// Cooldown passed; one trial call decides the next state
  HalfOpen,
}

/// Breaker bookkeeping for one operation key.
#[derive(Debug, Clone)]
pub struct BreakerState {
  pub key: String,
  pub failure_count: u32,
  pub state: CircuitState,
  pub next_attempt_at: Option<DateTime<Utc>>,
  /// When the current half-open trial was admitted
  trial_started_at: Option<DateTime<Utc>>,
}

impl BreakerState {
  fn new(key: &str) -> Self {
    Self {
      key: key.to_string(),
      failure_count: 0,
      state: CircuitState::Closed,
      next_attempt_at: None,
      trial_started_at: None,
    }
  }
}

/// Registry of breakers, created lazily on first failure.
pub struct CircuitBreakers {
  states: Mutex<HashMap<String, BreakerState>>,
  threshold: u32,
  cooldown: Duration,
  clock: Arc<dyn Clock>,
}

impl CircuitBreakers {
  pub fn new(threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
    Self {
      states: Mutex::new(HashMap::new()),
      threshold: threshold.max(1),
      cooldown,
      clock,
    }
  }

  fn states(&self) -> MutexGuard<'_, HashMap<String, BreakerState>> {
    self.states.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Current state of `key` as seen now.
  ///
  /// An open breaker whose cooldown has passed reports `HalfOpen` even before
  /// the trial call is admitted.
  pub fn state(&self, key: &str) -> CircuitState {
    let now = self.clock.now();
    match self.states().get(key) {
      None => CircuitState::Closed,
      Some(s) if s.state == CircuitState::Open && s.next_attempt_at.is_some_and(|t| now >= t) => {
        CircuitState::HalfOpen
      }
      Some(s) => s.state,
    }
  }

  pub fn snapshot(&self, key: &str) -> Option<BreakerState> {
    self.states().get(key).cloned()
  }

  /// Ask whether a call for `key` may go ahead.
  ///
  /// Closed breakers always admit. Once an open breaker's cooldown passes it
  /// moves to half-open and admits exactly one trial; further calls are
  /// rejected until that trial reports back.
  pub fn try_acquire(&self, key: &str) -> bool {
    let now = self.clock.now();
    let mut states = self.states();
    let Some(s) = states.get_mut(key) else {
      return true;
    };

    match s.state {
      CircuitState::Closed => true,
      CircuitState::Open => {
        if s.next_attempt_at.is_some_and(|t| now >= t) {
          info!(key, "circuit half-open, admitting trial call");
          s.state = CircuitState::HalfOpen;
          s.trial_started_at = Some(now);
          true
        } else {
          debug!(key, "circuit open, rejecting call");
          false
        }
      }
      CircuitState::HalfOpen => {
        // A trial abandoned for longer than a cooldown no longer blocks others
        let stale = s
          .trial_started_at
          .map_or(true, |t| now - t >= chrono_duration(self.cooldown));
        if stale {
          s.trial_started_at = Some(now);
          true
        } else {
          false
        }
      }
    }
  }

  /// A call for `key` succeeded: close the breaker.
  pub fn record_success(&self, key: &str) {
    let mut states = self.states();
    if let Some(s) = states.get_mut(key) {
      if s.state != CircuitState::Closed {
        info!(key, "circuit closed");
      }
      s.state = CircuitState::Closed;
      s.failure_count = 0;
      s.next_attempt_at = None;
      s.trial_started_at = None;
    }
  }

  /// A call for `key` exhausted its retries.
  pub fn record_failure(&self, key: &str) {
    let now = self.clock.now();
    let mut states = self.states();
    let s = states
      .entry(key.to_string())
      .or_insert_with(|| BreakerState::new(key));

    s.failure_count += 1;
    match s.state {
      CircuitState::Closed if s.failure_count >= self.threshold => {
        info!(key, failures = s.failure_count, "circuit opened");
        s.state = CircuitState::Open;
        s.next_attempt_at = Some(now + chrono_duration(self.cooldown));
      }
      CircuitState::Closed => {}
      CircuitState::HalfOpen | CircuitState::Open => {
        warn!(key, "trial call failed, circuit re-opened");
        s.state = CircuitState::Open;
        s.next_attempt_at = Some(now + chrono_duration(self.cooldown));
        s.trial_started_at = None;
      }
    }
  }

  /// The admitted call ended without saying anything about the dependency
  /// (for example a validation error). Frees a half-open trial slot.
  pub fn release(&self, key: &str) {
    if let Some(s) = self.states().get_mut(key) {
      if s.state == CircuitState::HalfOpen {
        s.trial_started_at = None;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn breakers() -> (CircuitBreakers, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    (
      CircuitBreakers::new(5, Duration::from_secs(60), clock.clone()),
      clock,
    )
  }

  #[test]
  fn test_opens_after_threshold() {
    let (b, _clock) = breakers();
    for _ in 0..4 {
      b.record_failure("getClientDetails");
      assert_eq!(b.state("getClientDetails"), CircuitState::Closed);
    }
    b.record_failure("getClientDetails");
    assert_eq!(b.state("getClientDetails"), CircuitState::Open);
    assert!(!b.try_acquire("getClientDetails"));
    // Other keys are unaffected
    assert!(b.try_acquire("getRecentSessions"));
  }

  #[test]
  fn test_single_half_open_trial_then_closed() {
    let (b, clock) = breakers();
    for _ in 0..5 {
      b.record_failure("k");
    }
    clock.advance(Duration::from_secs(60));
    assert_eq!(b.state("k"), CircuitState::HalfOpen);

    assert!(b.try_acquire("k"));
    assert!(!b.try_acquire("k"), "only one trial while half-open");

    b.record_success("k");
    assert_eq!(b.state("k"), CircuitState::Closed);
    assert_eq!(b.snapshot("k").unwrap().failure_count, 0);
    assert!(b.try_acquire("k"));
  }

  #[test]
  fn test_failed_trial_reopens_with_fresh_cooldown() {
    let (b, clock) = breakers();
    for _ in 0..5 {
      b.record_failure("k");
    }
    clock.advance(Duration::from_secs(61));
    assert!(b.try_acquire("k"));
    b.record_failure("k");
    assert_eq!(b.state("k"), CircuitState::Open);

    clock.advance(Duration::from_secs(59));
    assert!(!b.try_acquire("k"));
    clock.advance(Duration::from_secs(1));
    assert!(b.try_acquire("k"));
  }

  #[test]
  fn test_released_trial_can_be_retaken() {
    let (b, clock) = breakers();
    for _ in 0..5 {
      b.record_failure("k");
    }
    clock.advance(Duration::from_secs(60));
    assert!(b.try_acquire("k"));
    b.release("k");
    assert!(b.try_acquire("k"));
  }

  #[test]
  fn test_success_resets_failure_count() {
    let (b, _clock) = breakers();
    for _ in 0..4 {
      b.record_failure("k");
    }
    b.record_success("k");
    for _ in 0..4 {
      b.record_failure("k");
    }
    assert_eq!(b.state("k"), CircuitState::Closed);
  }
}
