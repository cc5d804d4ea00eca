//! The composed core: one context object owning every resilience component.
//!
//! Reads go cache-first through the coalescing layer and the retry executor.
//! Writes are validated, checked for conflicts and sent, or queued while
//! offline. Background tasks keep connectivity, the queue and the cache tidy.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheLayer, CacheResult, TtlCache};
use crate::clock::Clock;
use crate::config::Config;
use crate::conflict::{
  validation, Conflict, ConflictDetector, ConflictResolver, Resolution, ResolutionOption,
  ResolutionPlan,
};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::debounce::{DebouncedTask, Debouncer};
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::gateway::{ops, RpcGateway};
use crate::model::{EntityType, Operation, Payload};
use crate::offline::{DrainReport, OfflineQueue, PendingChange};
use crate::resilience::{CircuitBreakers, ErrorHistory, RetryExecutor, RetryOptions};
use crate::store::DurableStore;
use crate::undo::UndoStack;

/// Rolling error history size.
const ERROR_HISTORY_CAPACITY: usize = 100;
const UNDO_CAPACITY: usize = 10;

/// What happened to a write.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
  /// Written to the remote; carries its reply
  Saved(Value),
  /// Stored in the offline queue for later replay. `cause` is the error that
  /// stopped the write: a circuit that is open, or the last failed attempt.
  /// It is `None` when the write was queued because the core is offline.
  Queued {
    change: PendingChange,
    cause: Option<Error>,
  },
  /// Conflicts were settled by the operation type's policy
  Resolved { strategy: &'static str, value: Value },
  /// The user has to pick a resolution for `conflicts`
  NeedsResolution {
    conflicts: Vec<Conflict>,
    message: String,
    options: Vec<ResolutionOption>,
  },
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
  pub cache_swept: usize,
  pub queue_discarded: usize,
}

pub struct CoreContext {
  config: Config,
  gateway: Arc<dyn RpcGateway>,
  events: EventBus,
  layer: CacheLayer,
  retry: Arc<RetryExecutor>,
  retry_options: RetryOptions,
  queue: Arc<OfflineQueue>,
  detector: ConflictDetector,
  resolver: ConflictResolver,
  connectivity: Arc<ConnectivityMonitor>,
  search: Debouncer,
  autosave: DebouncedTask,
  undo: UndoStack,
  /// Read operations to invalidate when an entity type is written
  invalidation: Mutex<HashMap<EntityType, Vec<String>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreContext {
  pub fn new(
    config: Config,
    gateway: Arc<dyn RpcGateway>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
  ) -> Arc<Self> {
    let events = EventBus::default();

    let cache = Arc::new(TtlCache::new(
      Arc::clone(&store),
      Arc::clone(&clock),
      config.cache.default_ttl(),
    ));
    let breakers = Arc::new(CircuitBreakers::new(
      config.breaker.threshold,
      config.breaker.cooldown(),
      Arc::clone(&clock),
    ));
    let history = Arc::new(
      ErrorHistory::new(ERROR_HISTORY_CAPACITY, Arc::clone(&clock)).with_reporter(Arc::clone(&gateway)),
    );
    let retry = Arc::new(RetryExecutor::new(breakers, history, config.retry.max_delay()));
    let retry_options = RetryOptions::from_config(&config.retry);

    let queue = Arc::new(OfflineQueue::load(
      Arc::clone(&store),
      Arc::clone(&clock),
      events.clone(),
    ));
    let resolver = ConflictResolver::new(
      Arc::clone(&gateway),
      Arc::clone(&retry),
      retry_options.clone(),
      events.clone(),
    );
    let connectivity = ConnectivityMonitor::new(
      Connectivity::Online,
      config.connectivity.grace(),
      events.clone(),
    );

    Arc::new(Self {
      detector: ConflictDetector::new(Arc::clone(&gateway)),
      search: Debouncer::new(config.debounce.search()),
      autosave: DebouncedTask::new(config.debounce.autosave()),
      undo: UndoStack::new(UNDO_CAPACITY, clock),
      layer: CacheLayer::new(cache),
      invalidation: Mutex::new(HashMap::new()),
      tasks: Mutex::new(Vec::new()),
      config,
      gateway,
      events,
      retry,
      retry_options,
      queue,
      resolver,
      connectivity,
    })
  }

  // ----- accessors -----

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
    self.events.subscribe()
  }

  pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
    &self.connectivity
  }

  pub fn queue(&self) -> &Arc<OfflineQueue> {
    &self.queue
  }

  pub fn retry(&self) -> &Arc<RetryExecutor> {
    &self.retry
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.layer
  }

  pub fn undo(&self) -> &UndoStack {
    &self.undo
  }

  pub fn active_conflicts(&self) -> Vec<Conflict> {
    self.resolver.active_conflicts()
  }

  /// Forward the host's online/offline signal.
  pub fn set_online(&self, online: bool) {
    self.connectivity.set_host_signal(online);
  }

  /// Invalidate cached results of `read_operation` whenever `entity_type` is
  /// written. Entity types without a registration clear the whole cache.
  pub fn invalidate_on_write(&self, entity_type: EntityType, read_operation: &str) {
    self
      .invalidation()
      .entry(entity_type)
      .or_default()
      .push(read_operation.to_string());
  }

  fn invalidation(&self) -> MutexGuard<'_, HashMap<EntityType, Vec<String>>> {
    self.invalidation.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn invalidate_entity(&self, entity_type: EntityType) {
    let operations = self.invalidation().get(&entity_type).cloned();
    match operations {
      Some(operations) => {
        for op in operations {
          self
            .layer
            .cache()
            .invalidate_prefix(&CacheKey::operation_prefix(&op));
        }
      }
      None => self.layer.cache().clear(),
    }
    debug!(entity_type = %entity_type, "invalidated cached reads");
  }

  fn observe<T>(&self, result: &Result<T>) {
    match result {
      Ok(_) => self.connectivity.report_success(),
      Err(e) if e.is_retryable() => self.connectivity.report_failure(),
      Err(_) => {}
    }
  }

  // ----- reads -----

  /// Cache-first read of remote `operation`.
  ///
  /// `params` is passed as positional arguments (an array is spread, `null`
  /// means none). While offline only valid cached data is returned.
  pub async fn fetch<T>(&self, operation: &str, params: Value) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let key = CacheKey::new(operation, &params);

    if !self.connectivity.is_online() {
      return self.layer.cached(&key).ok_or_else(|| {
        Error::Offline(format!("{} is not available offline", operation))
      });
    }

    let gateway = Arc::clone(&self.gateway);
    let retry = Arc::clone(&self.retry);
    let connectivity = Arc::clone(&self.connectivity);
    let options = self.retry_options.clone().with_circuit_key(operation);
    let name = operation.to_string();
    let args = positional_args(params);

    self
      .layer
      .fetch(&key, None, move || async move {
        let result = retry
          .execute_remote(|| gateway.call(&name, args.clone()), &options)
          .await;
        match &result {
          Ok(_) => connectivity.report_success(),
          Err(e) if e.is_retryable() => connectivity.report_failure(),
          Err(_) => {}
        }
        Ok(serde_json::from_value::<T>(result?)?)
      })
      .await
  }

  /// Debounced lookup: only the last query of a burst reaches the remote.
  ///
  /// Returns `None` for superseded queries, including ones whose result
  /// arrived after a newer query started.
  pub async fn search<T>(&self, operation: &str, query: &str) -> Result<Option<CacheResult<T>>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let Some(token) = self.search.settle().await else {
      debug!(query, "search superseded");
      return Ok(None);
    };
    let result = self.fetch(operation, json!([query])).await?;
    Ok(self.search.is_current(token).then_some(result))
  }

  /// Run several reads concurrently and keep the ones that succeed.
  pub async fn preload(&self, reads: &[(&str, Value)]) -> Vec<(String, Value)> {
    let fetches = reads.iter().map(|(op, params)| async move {
      let result = self.fetch::<Value>(op, params.clone()).await;
      (op.to_string(), result)
    });

    let mut loaded = Vec::new();
    for (op, result) in futures::future::join_all(fetches).await {
      match result {
        Ok(hit) => loaded.push((op, hit.data)),
        Err(e) => warn!(operation = %op, error = %e, "preload failed"),
      }
    }
    info!(loaded = loaded.len(), requested = reads.len(), "preload finished");
    loaded
  }

  /// The newest unsent payload for an entity, if it is still queued.
  pub fn pending_payload(&self, operation: &Operation) -> Option<Payload> {
    self.queue.pending_payload(&operation.entity_key())
  }

  // ----- writes -----

  /// Validate, check for conflicts and write, or queue while offline.
  pub async fn save(&self, operation: Operation, payload: Payload) -> Result<SaveOutcome> {
    if let Some(rule) = validation::first_violation(operation.entity_type, &payload) {
      return Err(Error::Validation(rule.message.to_string()));
    }

    if !self.connectivity.is_online() {
      let change = self.queue.enqueue(operation, payload);
      return Ok(SaveOutcome::Queued {
        change,
        cause: None,
      });
    }

    let detection = self.detector.detect(&operation, &payload).await;
    let (Some(plan), Some(first)) = (detection.plan.clone(), detection.conflicts.first()) else {
      return self.write(operation, payload).await;
    };
    let first_id = first.id.clone();

    self.resolver.register(&detection);
    match plan {
      ResolutionPlan::Automatic { resolution, message } => {
        info!(entity = %operation.entity_key(), %message, "resolving conflicts automatically");
        let strategy = resolution.name();
        match self.resolver.resolve(&first_id, resolution).await {
          Ok(value) => {
            self.invalidate_entity(operation.entity_type);
            Ok(SaveOutcome::Resolved { strategy, value })
          }
          Err(e) => {
            // Nobody is offered these conflicts, so they must not linger
            self.resolver.dismiss(&detection.ids());
            Err(e)
          }
        }
      }
      ResolutionPlan::UserChoice { message, options } => Ok(SaveOutcome::NeedsResolution {
        conflicts: detection.conflicts,
        message,
        options,
      }),
    }
  }

  async fn write(&self, operation: Operation, payload: Payload) -> Result<SaveOutcome> {
    let args = vec![json!(operation), serde_json::to_value(&payload)?];
    let options = self.retry_options.clone().with_circuit_key(ops::SAVE_ENTITY);
    let result = self
      .retry
      .execute(|| self.gateway.call(ops::SAVE_ENTITY, args.clone()), &options)
      .await;
    self.observe(&result);

    match result {
      Ok(value) => {
        self.invalidate_entity(operation.entity_type);
        Ok(SaveOutcome::Saved(value))
      }
      Err(e) if e.is_retryable() || matches!(e, Error::CircuitOpen(_)) => {
        warn!(entity = %operation.entity_key(), error = %e, "write failed, queueing for later");
        Ok(SaveOutcome::Queued {
          change: self.queue.enqueue(operation, payload),
          cause: Some(e),
        })
      }
      Err(e) => Err(e),
    }
  }

  /// Apply the user's choice to an active conflict.
  pub async fn resolve_conflict(&self, conflict_id: &str, resolution: Resolution) -> Result<Value> {
    let entity_type = self
      .resolver
      .get(conflict_id)
      .map(|c| c.operation.entity_type);
    let value = self.resolver.resolve(conflict_id, resolution).await?;
    if let Some(entity_type) = entity_type {
      self.invalidate_entity(entity_type);
    }
    Ok(value)
  }

  /// Save `payload` once typing pauses for the auto-save delay.
  pub fn schedule_autosave(self: &Arc<Self>, operation: Operation, payload: Payload) {
    let ctx = Arc::clone(self);
    self.autosave.schedule(async move {
      let entity = operation.entity_key();
      match ctx.save(operation, payload).await {
        Ok(_) => debug!(entity, "auto-saved"),
        Err(e) => warn!(entity, error = %e, "auto-save failed"),
      }
    });
  }

  /// Save a pending auto-save right away (editor lost focus).
  pub async fn flush_autosave(&self) {
    self.autosave.flush().await;
  }

  // ----- sync & maintenance -----

  /// Replay the offline queue now. Does nothing while offline.
  pub async fn sync_now(&self) -> DrainReport {
    if !self.connectivity.is_online() {
      return DrainReport {
        remaining: self.queue.len(),
        ..DrainReport::default()
      };
    }

    let mut touched: Vec<EntityType> = Vec::new();
    let report = self
      .queue
      .drain(|change| {
        touched.push(change.operation.entity_type);
        let gateway = Arc::clone(&self.gateway);
        async move {
          let args = vec![serde_json::to_value(&change)?];
          gateway.call(ops::SYNC_OFFLINE_CHANGE, args).await.map(|_| ())
        }
      })
      .await;

    if let Some(e) = &report.error {
      if e.is_retryable() {
        self.connectivity.report_failure();
      }
    }
    touched.sort_by_key(|t| t.as_str());
    touched.dedup();
    for entity_type in touched {
      self.invalidate_entity(entity_type);
    }
    report
  }

  /// One background sync pass while online: replay the queue, drop the cached
  /// hot reads so they are fetched fresh, and ask the remote to check its data.
  pub async fn auto_sync(&self) {
    if !self.connectivity.is_online() {
      return;
    }
    if !self.queue.is_empty() {
      self.sync_now().await;
    }

    for op in &self.config.offline.refresh_reads {
      self
        .layer
        .cache()
        .invalidate_prefix(&CacheKey::operation_prefix(op));
    }

    if self.config.offline.integrity_check {
      self.check_integrity().await;
    }
  }

  /// Best-effort remote integrity check; problems are only logged.
  async fn check_integrity(&self) {
    match self.gateway.call(ops::VALIDATE_DATA_INTEGRITY, Vec::new()).await {
      Ok(report) => {
        if report.get("isValid").and_then(Value::as_bool) == Some(false) {
          let issues = report.get("issues").cloned().unwrap_or(Value::Null);
          warn!(%issues, "data integrity issues detected");
        }
      }
      Err(e) => warn!(error = %e, "data integrity check failed"),
    }
  }

  /// Sweep expired cache entries and discard stale queued changes.
  pub fn cleanup(&self) -> MaintenanceReport {
    let report = MaintenanceReport {
      cache_swept: self.layer.cache().sweep(),
      queue_discarded: self.queue.cleanup(self.config.offline.retention()),
    };
    debug!(?report, "maintenance finished");
    report
  }

  /// Start background tasks: reachability probes, periodic sync, maintenance
  /// and replay on reconnect. Tasks stop with [`shutdown`](Self::shutdown) or
  /// when the context is dropped.
  pub fn start(self: &Arc<Self>) {
    let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
    if !tasks.is_empty() {
      return;
    }

    tasks.push(
      self
        .connectivity
        .spawn_probe_loop(Arc::clone(&self.gateway), self.config.connectivity.probe_interval()),
    );

    let weak = Arc::downgrade(self);
    tasks.push(spawn_every(
      self.config.offline.auto_sync_interval(),
      weak.clone(),
      |ctx| async move { ctx.auto_sync().await },
    ));
    tasks.push(spawn_every(
      self.config.cache.sweep_interval(),
      weak.clone(),
      |ctx| async move {
        ctx.cleanup();
      },
    ));

    // Subscribe before spawning so transitions made right after start are seen
    let mut state = self.connectivity.subscribe();
    tasks.push(tokio::spawn(async move {
      while state.changed().await.is_ok() {
        let online = *state.borrow_and_update() == Connectivity::Online;
        if !online {
          continue;
        }
        let Some(ctx) = weak.upgrade() else {
          break;
        };
        info!("back online, replaying offline changes");
        ctx.sync_now().await;
      }
    }));

    info!(count = tasks.len(), "background tasks started");
  }

  /// Stop background tasks.
  pub fn shutdown(&self) {
    let tasks: Vec<JoinHandle<()>> = self
      .tasks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .drain(..)
      .collect();
    for task in tasks {
      task.abort();
    }
    self.autosave.cancel();
  }
}

impl Drop for CoreContext {
  fn drop(&mut self) {
    for task in self.tasks.get_mut().unwrap_or_else(|e| e.into_inner()).drain(..) {
      task.abort();
    }
  }
}

/// Run `tick` every `period` (first run after one period) while the context lives.
fn spawn_every<F, Fut>(period: Duration, ctx: Weak<CoreContext>, tick: F) -> JoinHandle<()>
where
  F: Fn(Arc<CoreContext>) -> Fut + Send + 'static,
  Fut: std::future::Future<Output = ()> + Send + 'static,
{
  tokio::spawn(async move {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let Some(ctx) = ctx.upgrade() else {
        break;
      };
      tick(ctx).await;
    }
  })
}

/// Spread an array into positional arguments; `null` means no arguments.
fn positional_args(params: Value) -> Vec<Value> {
  match params {
    Value::Null => Vec::new(),
    Value::Array(items) => items,
    other => vec![other],
  }
}
