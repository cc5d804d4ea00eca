//! Entity payloads exchanged with the remote.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Error, Result};

/// Kind of entity an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
  Client,
  Notes,
  Preferences,
  SystemSettings,
}

impl EntityType {
  pub fn as_str(&self) -> &'static str {
    match self {
      EntityType::Client => "client",
      EntityType::Notes => "notes",
      EntityType::Preferences => "preferences",
      EntityType::SystemSettings => "system_settings",
    }
  }
}

impl fmt::Display for EntityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for EntityType {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "client" => Ok(EntityType::Client),
      "notes" => Ok(EntityType::Notes),
      "preferences" => Ok(EntityType::Preferences),
      "system_settings" => Ok(EntityType::SystemSettings),
      other => Err(Error::Validation(format!("unknown entity type `{}`", other))),
    }
  }
}

/// What a write is trying to do. Selects the default conflict strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
  ClientUpdate,
  NotesUpdate,
  Preferences,
  SystemSettings,
  Other(String),
}

impl OperationType {
  pub fn as_str(&self) -> &str {
    match self {
      OperationType::ClientUpdate => "client_update",
      OperationType::NotesUpdate => "notes_update",
      OperationType::Preferences => "preferences",
      OperationType::SystemSettings => "system_settings",
      OperationType::Other(name) => name,
    }
  }
}

impl From<&str> for OperationType {
  fn from(s: &str) -> Self {
    match s {
      "client_update" => OperationType::ClientUpdate,
      "notes_update" => OperationType::NotesUpdate,
      "preferences" => OperationType::Preferences,
      "system_settings" => OperationType::SystemSettings,
      other => OperationType::Other(other.to_string()),
    }
  }
}

impl fmt::Display for OperationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A write addressed at one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation {
  pub entity_type: EntityType,
  pub entity_id: String,
  pub op_type: OperationType,
}

impl Operation {
  pub fn new(entity_type: EntityType, entity_id: impl Into<String>, op_type: OperationType) -> Self {
    Self {
      entity_type,
      entity_id: entity_id.into(),
      op_type,
    }
  }

  /// Stable identity of the entity, used as the offline-queue key.
  pub fn entity_key(&self) -> String {
    format!("{}:{}", self.entity_type, self.entity_id)
  }
}

/// A tutoring client record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_modified: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
}

/// Session notes for one client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotesPayload {
  pub client_name: String,
  #[serde(default)]
  pub content: String,
  #[serde(default)]
  pub skills: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_modified: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
}

/// Data attached to a write, tagged by entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
  Client(Client),
  Notes(NotesPayload),
  /// Loosely structured settings objects (preferences, system settings).
  Settings(Map<String, Value>),
}

impl Payload {
  pub fn last_modified(&self) -> Option<DateTime<Utc>> {
    match self {
      Payload::Client(c) => c.last_modified,
      Payload::Notes(n) => n.last_modified,
      Payload::Settings(map) => map
        .get("lastModified")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc)),
    }
  }

  pub fn version(&self) -> Option<String> {
    match self {
      Payload::Client(c) => c.version.clone(),
      Payload::Notes(n) => n.version.clone(),
      Payload::Settings(map) => map.get("version").and_then(version_string),
    }
  }

  /// The payload's fields as a flat JSON object, without the kind tag.
  pub fn to_fields(&self) -> Result<Map<String, Value>> {
    let value = match self {
      Payload::Client(c) => serde_json::to_value(c)?,
      Payload::Notes(n) => serde_json::to_value(n)?,
      Payload::Settings(map) => return Ok(map.clone()),
    };
    match value {
      Value::Object(map) => Ok(map),
      other => Err(Error::Serialization(format!("expected object, got {}", other))),
    }
  }
}

/// Version tokens arrive as strings or numbers; compare them as strings.
pub fn version_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}
