//! Online/offline tracking from host signals and remote reachability.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{CoreEvent, EventBus};
use crate::gateway::{ops, RpcGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Tracks whether the remote is reachable.
///
/// The host's online/offline signal applies immediately. Failed remote calls
/// only flip the state to offline once failures persist for the grace period
/// without an intervening success.
pub struct ConnectivityMonitor {
  state: watch::Sender<Connectivity>,
  events: EventBus,
  grace: Duration,
  pending_offline: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
  pub fn new(initial: Connectivity, grace: Duration, events: EventBus) -> Arc<Self> {
    let (state, _) = watch::channel(initial);
    Arc::new(Self {
      state,
      events,
      grace,
      pending_offline: Mutex::new(None),
    })
  }

  pub fn current(&self) -> Connectivity {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current() == Connectivity::Online
  }

  /// Watch state changes; the receiver starts with the current state.
  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.state.subscribe()
  }

  /// Host reported a network change.
  pub fn set_host_signal(&self, online: bool) {
    self.cancel_pending();
    if online {
      self.transition(Connectivity::Online);
    } else {
      self.transition(Connectivity::Offline);
    }
  }

  /// A remote call succeeded.
  pub fn report_success(&self) {
    self.cancel_pending();
    self.transition(Connectivity::Online);
  }

  /// A remote call failed. Starts the grace timer if it is not running.
  pub fn report_failure(self: &Arc<Self>) {
    if !self.is_online() {
      return;
    }
    let mut pending = self.pending_offline.lock().unwrap_or_else(|e| e.into_inner());
    if pending.as_ref().is_some_and(|h| !h.is_finished()) {
      return;
    }

    debug!(grace_ms = self.grace.as_millis() as u64, "remote failure, starting grace timer");
    let monitor = Arc::clone(self);
    *pending = Some(tokio::spawn(async move {
      tokio::time::sleep(monitor.grace).await;
      monitor.transition(Connectivity::Offline);
    }));
  }

  fn cancel_pending(&self) {
    let handle = self
      .pending_offline
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(handle) = handle {
      handle.abort();
    }
  }

  fn transition(&self, to: Connectivity) {
    let changed = self.state.send_if_modified(|current| {
      if *current == to {
        false
      } else {
        *current = to;
        true
      }
    });
    if !changed {
      return;
    }

    match to {
      Connectivity::Online => {
        info!("connection restored");
        self.events.emit(CoreEvent::Online {
          message: "Connection restored".into(),
        });
      }
      Connectivity::Offline => {
        info!("connection lost, working offline");
        self.events.emit(CoreEvent::Offline {
          message: "You're offline. Changes will be saved locally and synced when the connection returns"
            .into(),
        });
      }
    }
  }

  /// Ping the remote once and feed the outcome into the state.
  pub async fn probe(self: &Arc<Self>, gateway: &dyn RpcGateway) -> bool {
    match gateway.call(ops::PING, Vec::new()).await {
      Ok(_) => {
        self.report_success();
        true
      }
      Err(e) => {
        debug!(error = %e, "reachability probe failed");
        self.report_failure();
        false
      }
    }
  }

  /// Probe every `interval` until the task is aborted.
  pub fn spawn_probe_loop(
    self: &Arc<Self>,
    gateway: Arc<dyn RpcGateway>,
    interval: Duration,
  ) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        monitor.probe(gateway.as_ref()).await;
      }
    })
  }
}
