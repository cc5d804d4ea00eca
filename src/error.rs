//! Error taxonomy shared by every component of the core.

use crate::conflict::ConflictType;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the core.
///
/// The type is `Clone` so that callers coalesced onto a single in-flight fetch
/// all observe the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
  /// A remote call failed; safe to retry.
  #[error("remote call `{operation}` failed: {message}")]
  TransientRemote { operation: String, message: String },

  /// The circuit for this key is open; the call was not attempted.
  #[error("{0} is temporarily unavailable (circuit open)")]
  CircuitOpen(String),

  /// Local data conflicts with remote state and needs a resolution.
  #[error("{kind} conflict: {message}")]
  Conflict { kind: ConflictType, message: String },

  #[error("storage quota exceeded: {0}")]
  StorageQuota(String),

  #[error("storage error: {0}")]
  Storage(String),

  /// User-correctable input problem. Never retried.
  #[error("validation failed: {0}")]
  Validation(String),

  /// The network path is disabled while offline and nothing usable is cached.
  #[error("offline: {0}")]
  Offline(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("conflict not found: {0}")]
  ConflictNotFound(String),

  #[error("conflict cannot be resolved automatically: {0}")]
  UnresolvableConflict(String),

  #[error("no operations to undo")]
  NothingToUndo,
}

impl Error {
  pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
    Error::TransientRemote {
      operation: operation.into(),
      message: message.into(),
    }
  }

  /// Only transient remote failures are worth another attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Error::TransientRemote { .. })
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    match e.sqlite_error_code() {
      Some(rusqlite::ErrorCode::DiskFull) => Error::StorageQuota(e.to_string()),
      _ => Error::Storage(e.to_string()),
    }
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Serialization(e.to_string())
  }
}
