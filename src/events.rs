//! Notifications emitted by the core for the UI layer.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Events the UI can subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
  Offline {
    message: String,
  },
  Online {
    message: String,
  },
  SyncComplete {
    message: String,
    changes_count: usize,
  },
  SyncError {
    message: String,
    error: String,
    /// Changes still waiting after the failed drain
    remaining: usize,
  },
  ConflictResolved {
    conflict_id: String,
    strategy: String,
  },
  ConflictResolutionFailed {
    conflict_id: String,
    error: String,
  },
}

impl CoreEvent {
  pub fn name(&self) -> &'static str {
    match self {
      CoreEvent::Offline { .. } => "offline",
      CoreEvent::Online { .. } => "online",
      CoreEvent::SyncComplete { .. } => "sync_complete",
      CoreEvent::SyncError { .. } => "sync_error",
      CoreEvent::ConflictResolved { .. } => "conflict_resolved",
      CoreEvent::ConflictResolutionFailed { .. } => "conflict_resolution_failed",
    }
  }
}

/// Fan-out of core events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
  sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity);
    Self { sender }
  }

  pub fn emit(&self, event: CoreEvent) {
    debug!(event = event.name(), "emitting core event");
    // No subscribers is normal (headless use)
    let _ = self.sender.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
    self.sender.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(128)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_receive_events() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    bus.emit(CoreEvent::Online {
      message: "back".into(),
    });
    let event = rx.recv().await.unwrap();
    assert_eq!(event.name(), "online");
  }

  #[test]
  fn test_emit_without_subscribers_is_fine() {
    let bus = EventBus::default();
    bus.emit(CoreEvent::Offline {
      message: "gone".into(),
    });
  }
}
