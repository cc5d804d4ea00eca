//! Pre-write checks comparing local data with remote state.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{
  resolution_options, Conflict, ConflictType, Detection, MergeAction, MergeRule, Resolution,
  ResolutionPlan, ResolutionStrategy, ServerSignal, ALL_FIELDS,
};
use super::validation;
use crate::gateway::{ops, RpcGateway};
use crate::model::{version_string, EntityType, Operation, Payload};

pub struct ConflictDetector {
  gateway: Arc<dyn RpcGateway>,
  next_id: AtomicU64,
}

impl ConflictDetector {
  pub fn new(gateway: Arc<dyn RpcGateway>) -> Self {
    Self {
      gateway,
      next_id: AtomicU64::new(1),
    }
  }

  /// Run all checks for a write concurrently.
  ///
  /// A check that cannot reach the remote counts as "no conflict".
  pub async fn detect(&self, operation: &Operation, local: &Payload) -> Detection {
    let (timestamp, version, editors) = tokio::join!(
      self.check_timestamp(operation, local),
      self.check_version(operation, local),
      self.check_concurrent_edits(operation, local),
    );
    let integrity = self.check_integrity(operation, local);

    let conflicts: Vec<Conflict> = [timestamp, version, editors, integrity]
      .into_iter()
      .flatten()
      .collect();

    if conflicts.is_empty() {
      return Detection::clean();
    }

    debug!(
      entity = %operation.entity_key(),
      count = conflicts.len(),
      "conflicts detected"
    );
    let plan = plan_for(operation, &conflicts);
    Detection {
      conflicts,
      plan: Some(plan),
    }
  }

  fn conflict(
    &self,
    kind: ConflictType,
    operation: &Operation,
    local: &Payload,
    signal: ServerSignal,
    message: &str,
  ) -> Conflict {
    let n = self.next_id.fetch_add(1, Ordering::Relaxed);
    Conflict {
      id: format!("conflict-{}", n),
      kind,
      operation: operation.clone(),
      local_data: local.clone(),
      signal,
      message: message.to_string(),
    }
  }

  async fn remote(&self, name: &str, operation: &Operation) -> Option<Value> {
    let args = vec![json!(operation.entity_type), json!(operation.entity_id)];
    match self.gateway.call(name, args).await {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(check = name, error = %e, "conflict check skipped");
        None
      }
    }
  }

  async fn check_timestamp(&self, operation: &Operation, local: &Payload) -> Option<Conflict> {
    let client = local.last_modified()?;
    let reply = self.remote(ops::GET_SERVER_TIMESTAMP, operation).await?;
    let server = parse_timestamp(reply.get("lastModified").unwrap_or(&reply))?;

    (server > client).then(|| {
      self.conflict(
        ConflictType::Timestamp,
        operation,
        local,
        ServerSignal::Timestamp { server, client },
        "Server data is newer than client data",
      )
    })
  }

  async fn check_version(&self, operation: &Operation, local: &Payload) -> Option<Conflict> {
    let client = local.version()?;
    let reply = self.remote(ops::GET_SERVER_VERSION, operation).await?;
    let server = version_string(reply.get("version").unwrap_or(&reply));

    (server.as_deref() != Some(client.as_str())).then(|| {
      self.conflict(
        ConflictType::Version,
        operation,
        local,
        ServerSignal::Version { server, client },
        "Version mismatch detected",
      )
    })
  }

  async fn check_concurrent_edits(&self, operation: &Operation, local: &Payload) -> Option<Conflict> {
    let reply = self.remote(ops::GET_ACTIVE_EDITORS, operation).await?;
    let editors: Vec<String> = reply
      .as_array()?
      .iter()
      .map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      })
      .collect();

    (editors.len() > 1).then(|| {
      self.conflict(
        ConflictType::ConcurrentEdit,
        operation,
        local,
        ServerSignal::ActiveEditors { editors },
        "Multiple users are editing this item",
      )
    })
  }

  fn check_integrity(&self, operation: &Operation, local: &Payload) -> Option<Conflict> {
    let rule = validation::first_violation(operation.entity_type, local)?;
    Some(self.conflict(
      ConflictType::DataIntegrity,
      operation,
      local,
      ServerSignal::FailedRule {
        rule: rule.name.to_string(),
      },
      rule.message,
    ))
  }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
  match value {
    Value::String(s) => DateTime::parse_from_rfc3339(s)
      .ok()
      .map(|dt| dt.with_timezone(&Utc)),
    Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
    _ => None,
  }
}

/// Pick the resolution for `conflicts` from the operation type's policy.
pub fn plan_for(operation: &Operation, conflicts: &[Conflict]) -> ResolutionPlan {
  match ResolutionStrategy::for_operation(&operation.op_type) {
    ResolutionStrategy::MergeWithPriority => {
      let mut rules = vec![MergeRule::new(ALL_FIELDS, MergeAction::UseLocal)];
      if operation.entity_type == EntityType::Client {
        rules.push(MergeRule::new("tags", MergeAction::MergeArrays));
      }
      for conflict in conflicts {
        match conflict.kind {
          ConflictType::Timestamp => {
            rules.push(MergeRule::new("lastModified", MergeAction::UseServer))
          }
          ConflictType::Version => rules.push(MergeRule::new("version", MergeAction::UseServer)),
          ConflictType::ConcurrentEdit => {
            rules.push(MergeRule::new(ALL_FIELDS, MergeAction::UserReviewRequired))
          }
          ConflictType::DataIntegrity => {}
        }
      }
      let resolution = Resolution::AutomaticMerge(rules);
      if resolution.requires_review() {
        // Another session is editing: never merge over it without asking
        ResolutionPlan::UserChoice {
          message: "Multiple users are editing this item, choose which changes to keep".into(),
          options: resolution_options(),
        }
      } else {
        ResolutionPlan::Automatic {
          resolution,
          message: "Intelligent merge will be applied".into(),
        }
      }
    }
    ResolutionStrategy::TimestampPriority => {
      let server_newer = conflicts.iter().any(|c| c.kind == ConflictType::Timestamp);
      if server_newer {
        ResolutionPlan::Automatic {
          resolution: Resolution::KeepServer,
          message: "Use the most recent version (server)".into(),
        }
      } else {
        ResolutionPlan::Automatic {
          resolution: Resolution::KeepLocal,
          message: "Use the most recent version (local)".into(),
        }
      }
    }
    ResolutionStrategy::ServerPriority => ResolutionPlan::Automatic {
      resolution: Resolution::KeepServer,
      message: "Server version takes priority".into(),
    },
    ResolutionStrategy::UserChoice => ResolutionPlan::UserChoice {
      message: "User must choose resolution".into(),
      options: resolution_options(),
    },
  }
}
