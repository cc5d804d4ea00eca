//! Durable FIFO of writes made while disconnected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{chrono_duration, Clock};
use crate::error::Error;
use crate::events::{CoreEvent, EventBus};
use crate::model::{Operation, Payload};
use crate::store::DurableStore;

/// Namespace of queue mirrors in the durable store.
const MIRROR_PREFIX: &str = "offline:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
  Update,
}

/// A write waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
  /// Stable across replays so the remote can discard duplicates
  pub change_id: String,
  /// Enqueue order, survives restarts
  pub seq: u64,
  /// Entity key (`type:id`)
  pub key: String,
  pub operation: Operation,
  pub payload: Payload,
  pub enqueued_at: DateTime<Utc>,
  pub kind: ChangeKind,
}

impl PendingChange {
  fn mirror_key(&self) -> String {
    mirror_key(self.seq)
  }
}

fn mirror_key(seq: u64) -> String {
  format!("{}{:020}", MIRROR_PREFIX, seq)
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
  pub synced: usize,
  /// Changes still queued afterwards
  pub remaining: usize,
  pub error: Option<Error>,
  /// Another drain was already running; nothing was sent
  pub already_running: bool,
}

#[derive(Default)]
struct QueueState {
  pending: VecDeque<PendingChange>,
  /// Snapshot taken by the running drain, not yet confirmed by the remote
  in_flight: VecDeque<PendingChange>,
  next_seq: u64,
}

impl QueueState {
  /// Put unconfirmed in-flight changes back at the front, in order.
  fn restore_in_flight(&mut self) -> usize {
    while let Some(change) = self.in_flight.pop_back() {
      self.pending.push_front(change);
    }
    self.pending.len()
  }
}

pub struct OfflineQueue {
  state: Mutex<QueueState>,
  draining: AtomicBool,
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  events: EventBus,
}

/// Ends a drain however it stops, including when its task is aborted:
/// unsent changes go back to the queue and the draining flag is cleared.
struct DrainGuard<'a>(&'a OfflineQueue);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.state().restore_in_flight();
    self.0.draining.store(false, Ordering::SeqCst);
  }
}

impl OfflineQueue {
  /// Open the queue, recovering changes mirrored by an earlier session.
  pub fn load(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, events: EventBus) -> Self {
    let mut pending = Vec::new();

    match store.keys_with_prefix(MIRROR_PREFIX) {
      Ok(keys) => {
        for key in keys {
          let parsed = store
            .get(&key)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<PendingChange>(&raw).ok());
          match parsed {
            Some(change) => pending.push(change),
            None => {
              warn!(key, "dropping unreadable offline change");
              let _ = store.remove(&key);
            }
          }
        }
      }
      Err(e) => warn!(error = %e, "could not read persisted offline changes"),
    }

    pending.sort_by_key(|c| c.seq);
    let next_seq = pending.last().map_or(0, |c| c.seq + 1);
    if !pending.is_empty() {
      info!(count = pending.len(), "recovered offline changes");
    }

    Self {
      state: Mutex::new(QueueState {
        pending: pending.into(),
        in_flight: VecDeque::new(),
        next_seq,
      }),
      draining: AtomicBool::new(false),
      store,
      clock,
      events,
    }
  }

  fn state(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Append a change and mirror it to durable storage.
  ///
  /// Safe while a drain is running: the change lands behind the drain's snapshot.
  pub fn enqueue(&self, operation: Operation, payload: Payload) -> PendingChange {
    let now = self.clock.now();
    let change = {
      let mut state = self.state();
      let seq = state.next_seq;
      state.next_seq += 1;
      let change = PendingChange {
        change_id: format!("chg-{:x}-{:06}", now.timestamp_millis(), seq),
        seq,
        key: operation.entity_key(),
        operation,
        payload,
        enqueued_at: now,
        kind: ChangeKind::Update,
      };
      state.pending.push_back(change.clone());
      change
    };

    self.write_mirror(&change);
    debug!(key = %change.key, change_id = %change.change_id, "queued offline change");
    change
  }

  fn write_mirror(&self, change: &PendingChange) {
    let result = serde_json::to_string(change)
      .map_err(Error::from)
      .and_then(|raw| self.store.set(&change.mirror_key(), &raw));
    if let Err(e) = result {
      warn!(key = %change.key, error = %e, "offline change kept in memory only");
    }
  }

  fn remove_mirror(&self, change: &PendingChange) {
    if let Err(e) = self.store.remove(&change.mirror_key()) {
      warn!(key = %change.key, error = %e, "failed to remove offline change mirror");
    }
  }

  /// Replay queued changes in order through `send`.
  ///
  /// Works on a snapshot that stays visible to [`list`](Self::list) and
  /// [`pending_payload`](Self::pending_payload) until each change is confirmed.
  /// The first failure stops the drain; that change and everything after it go
  /// back to the front of the queue in order. The same happens if the drain
  /// future is dropped partway.
  pub async fn drain<F, Fut>(&self, mut send: F) -> DrainReport
  where
    F: FnMut(PendingChange) -> Fut,
    Fut: Future<Output = crate::error::Result<()>>,
  {
    if self.draining.swap(true, Ordering::SeqCst) {
      debug!("drain already running");
      return DrainReport {
        remaining: self.len(),
        already_running: true,
        ..DrainReport::default()
      };
    }
    let _guard = DrainGuard(self);

    let count = {
      let mut state = self.state();
      let snapshot = std::mem::take(&mut state.pending);
      state.in_flight = snapshot;
      state.in_flight.len()
    };
    if count == 0 {
      return DrainReport::default();
    }

    info!(count, "syncing offline changes");
    let mut synced = 0;
    loop {
      let Some(change) = self.state().in_flight.front().cloned() else {
        break;
      };
      match send(change.clone()).await {
        Ok(()) => {
          self.state().in_flight.pop_front();
          self.remove_mirror(&change);
          synced += 1;
        }
        Err(e) => {
          warn!(key = %change.key, error = %e, "offline sync failed, keeping remaining changes");
          let remaining = self.state().restore_in_flight();
          self.events.emit(CoreEvent::SyncError {
            message: format!("Sync failed after {} change(s); will retry later", synced),
            error: e.to_string(),
            remaining,
          });
          return DrainReport {
            synced,
            remaining,
            error: Some(e),
            already_running: false,
          };
        }
      }
    }

    info!(synced, "offline changes synced");
    self.events.emit(CoreEvent::SyncComplete {
      message: format!("Synced {} offline change(s)", synced),
      changes_count: synced,
    });
    DrainReport {
      synced,
      remaining: self.len(),
      error: None,
      already_running: false,
    }
  }

  /// Discard changes older than `retention`. Returns how many were dropped.
  pub fn cleanup(&self, retention: Duration) -> usize {
    let cutoff = self.clock.now() - chrono_duration(retention);
    let expired: VecDeque<PendingChange> = {
      let mut state = self.state();
      let (keep, expired): (VecDeque<_>, VecDeque<_>) = state
        .pending
        .drain(..)
        .partition(|c| c.enqueued_at >= cutoff);
      state.pending = keep;
      expired
    };

    for change in &expired {
      self.remove_mirror(change);
    }
    if !expired.is_empty() {
      warn!(count = expired.len(), "discarded stale offline changes");
    }
    expired.len()
  }

  /// Newest unsent payload for an entity, for showing unsent edits.
  pub fn pending_payload(&self, entity_key: &str) -> Option<Payload> {
    let state = self.state();
    state
      .in_flight
      .iter()
      .chain(state.pending.iter())
      .rev()
      .find(|c| c.key == entity_key)
      .map(|c| c.payload.clone())
  }

  /// Every unsent change in replay order, including a running drain's snapshot.
  pub fn list(&self) -> Vec<PendingChange> {
    let state = self.state();
    state.in_flight.iter().chain(state.pending.iter()).cloned().collect()
  }

  pub fn len(&self) -> usize {
    let state = self.state();
    state.in_flight.len() + state.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::SeqCst)
  }
}
