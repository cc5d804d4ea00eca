//! Deterministic cache keys for remote reads.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Cache key for one logical remote read.
///
/// Two requests for the same operation with logically equal parameters
/// (regardless of object key order) produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  operation: String,
  key: String,
}

impl CacheKey {
  pub fn new(operation: &str, params: &Value) -> Self {
    let input = format!("{}:{}", operation, normalize(params));

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());

    Self {
      operation: operation.to_string(),
      key: format!("{}:{}", operation, digest),
    }
  }

  /// The full key, `<operation>:<digest>`.
  pub fn as_str(&self) -> &str {
    &self.key
  }

  pub fn operation(&self) -> &str {
    &self.operation
  }

  /// Prefix shared by every key of `operation`.
  pub fn operation_prefix(operation: &str) -> String {
    format!("{}:", operation)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.key)
  }
}

/// Serialize `value` as JSON with object keys sorted at every level.
pub fn normalize(value: &Value) -> String {
  let mut out = String::new();
  write_normalized(value, &mut out);
  out
}

fn write_normalized(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_normalized(&map[key], out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_normalized(item, out);
      }
      out.push(']');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}
