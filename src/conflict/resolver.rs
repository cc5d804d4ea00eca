//! Applies chosen resolutions and tracks conflicts awaiting one.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use super::merge::merge_fields;
use super::types::{Conflict, Detection, Resolution};
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::gateway::{ops, RpcGateway};
use crate::resilience::{RetryExecutor, RetryOptions};

pub struct ConflictResolver {
  gateway: Arc<dyn RpcGateway>,
  retry: Arc<RetryExecutor>,
  options: RetryOptions,
  events: EventBus,
  active: Mutex<HashMap<String, Conflict>>,
}

impl ConflictResolver {
  pub fn new(
    gateway: Arc<dyn RpcGateway>,
    retry: Arc<RetryExecutor>,
    options: RetryOptions,
    events: EventBus,
  ) -> Self {
    Self {
      gateway,
      retry,
      options,
      events,
      active: Mutex::new(HashMap::new()),
    }
  }

  fn active(&self) -> MutexGuard<'_, HashMap<String, Conflict>> {
    self.active.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Track every conflict of `detection` until it is resolved.
  pub fn register(&self, detection: &Detection) {
    let mut active = self.active();
    for conflict in &detection.conflicts {
      active.insert(conflict.id.clone(), conflict.clone());
    }
  }

  pub fn get(&self, conflict_id: &str) -> Option<Conflict> {
    self.active().get(conflict_id).cloned()
  }

  pub fn active_conflicts(&self) -> Vec<Conflict> {
    let mut conflicts: Vec<Conflict> = self.active().values().cloned().collect();
    conflicts.sort_by(|a, b| a.id.cmp(&b.id));
    conflicts
  }

  pub fn active_count(&self) -> usize {
    self.active().len()
  }

  /// Stop tracking conflicts nobody is going to resolve.
  pub fn dismiss(&self, ids: &[String]) {
    let mut active = self.active();
    for id in ids {
      active.remove(id);
    }
  }

  /// `conflict` plus every active conflict raised by the same write.
  fn siblings(&self, conflict: &Conflict) -> Vec<String> {
    let mut ids: Vec<String> = self
      .active()
      .values()
      .filter(|c| c.id == conflict.id || same_write(c, conflict))
      .map(|c| c.id.clone())
      .collect();
    ids.sort();
    ids
  }

  /// Apply `resolution` to an active conflict.
  ///
  /// The conflict and any other active conflict raised by the same write are
  /// settled together. On success they leave the registry with one
  /// `conflict_resolved` event each. On failure they stay active with one
  /// `conflict_resolution_failed` event each.
  pub async fn resolve(&self, conflict_id: &str, resolution: Resolution) -> Result<Value> {
    let conflict = self
      .get(conflict_id)
      .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;
    let strategy = resolution.name();

    match self.apply(&conflict, resolution).await {
      Ok(value) => {
        let resolved = self.siblings(&conflict);
        self.dismiss(&resolved);
        info!(conflict_id, strategy, "conflict resolved");
        for id in resolved {
          self.events.emit(CoreEvent::ConflictResolved {
            conflict_id: id,
            strategy: strategy.to_string(),
          });
        }
        Ok(value)
      }
      Err(e) => {
        warn!(conflict_id, strategy, error = %e, "conflict resolution failed");
        for id in self.siblings(&conflict) {
          self.events.emit(CoreEvent::ConflictResolutionFailed {
            conflict_id: id,
            error: e.to_string(),
          });
        }
        Err(e)
      }
    }
  }

  async fn apply(&self, conflict: &Conflict, resolution: Resolution) -> Result<Value> {
    if resolution.requires_review() {
      return Err(Error::UnresolvableConflict(
        "another session is editing this item".into(),
      ));
    }
    match resolution {
      Resolution::KeepLocal => {
        let local = serde_json::to_value(&conflict.local_data)?;
        self
          .call(
            ops::FORCE_UPDATE_WITH_LOCAL_DATA,
            vec![json!(conflict.operation), local],
          )
          .await
      }
      Resolution::KeepServer => self.fetch_server(conflict).await,
      Resolution::ManualMerge(merged) => self.save_merged(conflict, merged.to_fields()?).await,
      Resolution::AutomaticMerge(rules) => {
        let server = match self.fetch_server(conflict).await? {
          Value::Object(fields) => fields,
          other => {
            return Err(Error::Serialization(format!(
              "expected object from {}, got {}",
              ops::GET_LATEST_SERVER_DATA,
              other
            )))
          }
        };
        let server = strip_tag(server);
        let local = conflict.local_data.to_fields()?;
        let merged = merge_fields(&server, &local, &rules)?;
        self.save_merged(conflict, merged).await
      }
    }
  }

  async fn fetch_server(&self, conflict: &Conflict) -> Result<Value> {
    let op = &conflict.operation;
    self
      .call(
        ops::GET_LATEST_SERVER_DATA,
        vec![json!(op.entity_type), json!(op.entity_id)],
      )
      .await
  }

  /// Send the merged record as a plain object; fields only the server knows
  /// about are kept.
  async fn save_merged(&self, conflict: &Conflict, merged: Map<String, Value>) -> Result<Value> {
    self
      .call(
        ops::SAVE_MERGED_DATA,
        vec![json!(conflict.operation), Value::Object(merged)],
      )
      .await
  }

  async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
    let options = self.options.clone().with_circuit_key(name);
    self
      .retry
      .execute(|| self.gateway.call(name, args.clone()), &options)
      .await
  }
}

fn same_write(a: &Conflict, b: &Conflict) -> bool {
  a.operation == b.operation && a.local_data == b.local_data
}

/// Drop a `kind` tag the remote may echo back from a tagged payload.
fn strip_tag(mut fields: Map<String, Value>) -> Map<String, Value> {
  fields.remove("kind");
  fields
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::conflict::{ConflictDetector, ConflictType, MergeAction, MergeRule, ALL_FIELDS};
  use crate::model::{Client, EntityType, Operation, OperationType, Payload};
  use crate::resilience::{CircuitBreakers, ErrorHistory};
  use crate::testing::FakeGateway;
  use std::time::Duration;

  fn resolver(gateway: Arc<FakeGateway>) -> (ConflictResolver, EventBus) {
    let clock = Arc::new(ManualClock::default());
    let retry = Arc::new(RetryExecutor::new(
      Arc::new(CircuitBreakers::new(5, Duration::from_secs(60), clock.clone())),
      Arc::new(ErrorHistory::new(100, clock)),
      Duration::from_secs(10),
    ));
    let options = RetryOptions {
      max_retries: 0,
      ..RetryOptions::default()
    };
    let events = EventBus::default();
    (
      ConflictResolver::new(gateway, retry, options, events.clone()),
      events,
    )
  }

  async fn detect_client_conflicts(gateway: &Arc<FakeGateway>) -> Detection {
    let detector = ConflictDetector::new(gateway.clone());
    let op = Operation::new(EntityType::Client, "Ada", OperationType::ClientUpdate);
    let payload = Payload::Client(Client {
      name: "Ada Lovelace".into(),
      tags: vec!["physics".into()],
      version: Some("1".into()),
      ..Default::default()
    });
    detector.detect(&op, &payload).await
  }

  fn conflicting_gateway() -> Arc<FakeGateway> {
    let gateway = FakeGateway::new();
    gateway.reply(ops::GET_SERVER_VERSION, json!({"version": "2"}));
    gateway.reply(ops::GET_ACTIVE_EDITORS, json!(["me"]));
    gateway.reply(
      ops::GET_LATEST_SERVER_DATA,
      json!({"name": "Ada", "tags": ["math"], "version": "2", "phone": "555", "subject": "maths"}),
    );
    gateway.on(ops::SAVE_MERGED_DATA, |args| Ok(args[1].clone()));
    gateway
  }

  #[tokio::test]
  async fn test_automatic_merge_saves_merged_data() {
    let gateway = conflicting_gateway();
    let detection = detect_client_conflicts(&gateway).await;
    assert!(detection.has(ConflictType::Version));
    let (resolver, events) = resolver(gateway.clone());
    let mut rx = events.subscribe();
    resolver.register(&detection);

    let rules = vec![
      MergeRule::new(ALL_FIELDS, MergeAction::UseLocal),
      MergeRule::new("tags", MergeAction::MergeArrays),
      MergeRule::new("version", MergeAction::UseServer),
    ];
    let saved = resolver
      .resolve(&detection.conflicts[0].id, Resolution::AutomaticMerge(rules))
      .await
      .unwrap();

    assert_eq!(saved["name"], "Ada Lovelace");
    assert_eq!(saved["tags"], json!(["math", "physics"]));
    assert_eq!(saved["version"], "2");
    // Server-only fields survive the merge
    assert_eq!(saved["phone"], "555");
    assert_eq!(saved["subject"], "maths");
    assert!(saved.get("kind").is_none());
    assert_eq!(resolver.active_count(), 0);
    assert_eq!(
      rx.recv().await.unwrap(),
      CoreEvent::ConflictResolved {
        conflict_id: detection.conflicts[0].id.clone(),
        strategy: "merge".into()
      }
    );
  }

  #[tokio::test]
  async fn test_user_review_rule_fails_and_keeps_conflict() {
    let gateway = conflicting_gateway();
    let detection = detect_client_conflicts(&gateway).await;
    let (resolver, events) = resolver(gateway.clone());
    let mut rx = events.subscribe();
    resolver.register(&detection);
    let id = detection.conflicts[0].id.clone();

    let err = resolver
      .resolve(
        &id,
        Resolution::AutomaticMerge(vec![MergeRule::new(
          ALL_FIELDS,
          MergeAction::UserReviewRequired,
        )]),
      )
      .await
      .unwrap_err();
    assert!(matches!(err, Error::UnresolvableConflict(_)));
    assert_eq!(gateway.call_count(ops::GET_LATEST_SERVER_DATA), 0);
    assert_eq!(gateway.call_count(ops::SAVE_MERGED_DATA), 0);
    assert!(resolver.get(&id).is_some());
    assert_eq!(rx.recv().await.unwrap().name(), "conflict_resolution_failed");
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_failure_reported_for_each_sibling() {
    let gateway = conflicting_gateway();
    gateway.reply(ops::GET_ACTIVE_EDITORS, json!(["me", "them"]));
    gateway.on(ops::FORCE_UPDATE_WITH_LOCAL_DATA, |_| {
      Err(Error::remote(ops::FORCE_UPDATE_WITH_LOCAL_DATA, "down"))
    });
    let detection = detect_client_conflicts(&gateway).await;
    assert_eq!(detection.conflicts.len(), 2);
    let (resolver, events) = resolver(gateway);
    let mut rx = events.subscribe();
    resolver.register(&detection);

    assert!(resolver
      .resolve(&detection.conflicts[0].id, Resolution::KeepLocal)
      .await
      .is_err());
    assert_eq!(resolver.active_count(), 2);
    let mut failed = Vec::new();
    while let Ok(CoreEvent::ConflictResolutionFailed { conflict_id, .. }) = rx.try_recv() {
      failed.push(conflict_id);
    }
    failed.sort();
    let mut expected = detection.ids();
    expected.sort();
    assert_eq!(failed, expected);
  }

  #[tokio::test]
  async fn test_keep_local_forces_update() {
    let gateway = conflicting_gateway();
    gateway.on(ops::FORCE_UPDATE_WITH_LOCAL_DATA, |args| Ok(args[1].clone()));
    let detection = detect_client_conflicts(&gateway).await;
    let (resolver, _events) = resolver(gateway.clone());
    resolver.register(&detection);

    let saved = resolver
      .resolve(&detection.conflicts[0].id, Resolution::KeepLocal)
      .await
      .unwrap();
    assert_eq!(saved["name"], "Ada Lovelace");
    let calls = gateway.calls(ops::FORCE_UPDATE_WITH_LOCAL_DATA);
    assert_eq!(calls[0][0]["entity_id"], "Ada");
  }

  #[tokio::test]
  async fn test_keep_server_returns_remote_copy() {
    let gateway = conflicting_gateway();
    let detection = detect_client_conflicts(&gateway).await;
    let (resolver, _events) = resolver(gateway);
    resolver.register(&detection);

    let server = resolver
      .resolve(&detection.conflicts[0].id, Resolution::KeepServer)
      .await
      .unwrap();
    assert_eq!(server["phone"], "555");
  }

  #[tokio::test]
  async fn test_unknown_conflict() {
    let (resolver, _events) = resolver(FakeGateway::new());
    let err = resolver
      .resolve("conflict-404", Resolution::KeepServer)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::ConflictNotFound(_)));
  }

  #[tokio::test]
  async fn test_sibling_conflicts_resolved_together() {
    let gateway = conflicting_gateway();
    gateway.reply(ops::GET_ACTIVE_EDITORS, json!(["me", "them"]));
    let detection = detect_client_conflicts(&gateway).await;
    assert_eq!(detection.conflicts.len(), 2);
    let (resolver, events) = resolver(gateway);
    let mut rx = events.subscribe();
    resolver.register(&detection);

    resolver
      .resolve(&detection.conflicts[0].id, Resolution::KeepServer)
      .await
      .unwrap();
    assert_eq!(resolver.active_count(), 0);
    let mut resolved = vec![
      rx.recv().await.unwrap(),
      rx.recv().await.unwrap(),
    ];
    resolved.retain(|e| e.name() == "conflict_resolved");
    assert_eq!(resolved.len(), 2);
  }
}
