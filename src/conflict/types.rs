use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{Operation, OperationType, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
  /// Remote copy was modified after the local one
  Timestamp,
  Version,
  /// More than one session is editing the entity
  ConcurrentEdit,
  /// Local data fails validation
  DataIntegrity,
}

impl ConflictType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ConflictType::Timestamp => "timestamp_conflict",
      ConflictType::Version => "version_conflict",
      ConflictType::ConcurrentEdit => "concurrent_edit",
      ConflictType::DataIntegrity => "data_integrity",
    }
  }
}

impl fmt::Display for ConflictType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What the remote (or the validator) reported that caused the conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ServerSignal {
  Timestamp {
    server: DateTime<Utc>,
    client: DateTime<Utc>,
  },
  Version {
    server: Option<String>,
    client: String,
  },
  ActiveEditors {
    editors: Vec<String>,
  },
  FailedRule {
    rule: String,
  },
}

/// A detected mismatch between local and remote state. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
  pub id: String,
  pub kind: ConflictType,
  pub operation: Operation,
  pub local_data: Payload,
  pub signal: ServerSignal,
  pub message: String,
}

/// Default policy for an operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
  MergeWithPriority,
  TimestampPriority,
  ServerPriority,
  UserChoice,
}

impl ResolutionStrategy {
  pub fn for_operation(op_type: &OperationType) -> Self {
    match op_type {
      OperationType::ClientUpdate => ResolutionStrategy::MergeWithPriority,
      OperationType::NotesUpdate => ResolutionStrategy::TimestampPriority,
      OperationType::Preferences => ResolutionStrategy::UserChoice,
      OperationType::SystemSettings => ResolutionStrategy::ServerPriority,
      OperationType::Other(_) => ResolutionStrategy::UserChoice,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
  UseServer,
  UseLocal,
  /// Union of both arrays, first occurrence wins
  MergeArrays,
  /// Cannot be merged without a person looking at it
  UserReviewRequired,
}

/// Field selector matching every field.
pub const ALL_FIELDS: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRule {
  /// Field name, or [`ALL_FIELDS`]
  pub field: String,
  pub action: MergeAction,
}

impl MergeRule {
  pub fn new(field: impl Into<String>, action: MergeAction) -> Self {
    Self {
      field: field.into(),
      action,
    }
  }
}

/// How to settle a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
  /// Overwrite the remote with the local data
  KeepLocal,
  /// Discard local changes and take the latest remote data
  KeepServer,
  /// Save data the user merged by hand
  ManualMerge(Payload),
  /// Merge remote and local data field by field
  AutomaticMerge(Vec<MergeRule>),
}

impl Resolution {
  pub fn name(&self) -> &'static str {
    match self {
      Resolution::KeepLocal => "keep_local",
      Resolution::KeepServer => "keep_server",
      Resolution::ManualMerge(_) => "merge_manual",
      Resolution::AutomaticMerge(_) => "merge",
    }
  }

  /// True for a merge containing a rule that only a person can apply.
  pub fn requires_review(&self) -> bool {
    match self {
      Resolution::AutomaticMerge(rules) => rules
        .iter()
        .any(|r| r.action == MergeAction::UserReviewRequired),
      _ => false,
    }
  }
}

/// A choice offered to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionOption {
  pub id: &'static str,
  pub label: &'static str,
  pub description: &'static str,
}

pub fn resolution_options() -> Vec<ResolutionOption> {
  vec![
    ResolutionOption {
      id: "keep_local",
      label: "Keep My Changes",
      description: "Overwrite server data with your local changes",
    },
    ResolutionOption {
      id: "keep_server",
      label: "Use Server Version",
      description: "Discard local changes and use server data",
    },
    ResolutionOption {
      id: "merge_manual",
      label: "Merge Manually",
      description: "Review and merge changes manually",
    },
  ]
}

/// What to do about a set of detected conflicts.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPlan {
  /// A deterministic resolution the core may apply without asking
  Automatic {
    resolution: Resolution,
    message: String,
  },
  /// The user has to pick one of `options`
  UserChoice {
    message: String,
    options: Vec<ResolutionOption>,
  },
}

/// Result of running conflict detection for one write.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub conflicts: Vec<Conflict>,
  /// Present whenever `conflicts` is non-empty
  pub plan: Option<ResolutionPlan>,
}

impl Detection {
  pub fn clean() -> Self {
    Self {
      conflicts: Vec::new(),
      plan: None,
    }
  }

  pub fn has_conflicts(&self) -> bool {
    !self.conflicts.is_empty()
  }

  pub fn has(&self, kind: ConflictType) -> bool {
    self.conflicts.iter().any(|c| c.kind == kind)
  }

  pub fn ids(&self) -> Vec<String> {
    self.conflicts.iter().map(|c| c.id.clone()).collect()
  }
}
