//! Rule-driven field merge of remote and local records.

use serde_json::{Map, Value};

use super::types::{MergeAction, MergeRule, ALL_FIELDS};
use crate::error::{Error, Result};

/// Merge `local` into a copy of `server`, applying `rules` in order.
///
/// `MergeArrays` always unions the original server and local arrays, so it is
/// unaffected by earlier whole-record rules. Without rules the result is the
/// server record. A rule requiring user review fails the whole merge.
pub fn merge_fields(
  server: &Map<String, Value>,
  local: &Map<String, Value>,
  rules: &[MergeRule],
) -> Result<Map<String, Value>> {
  let mut merged = server.clone();

  for rule in rules {
    let all = rule.field == ALL_FIELDS;
    match rule.action {
      MergeAction::UseServer if all => merged = server.clone(),
      MergeAction::UseServer => take_field(&mut merged, server, &rule.field),
      MergeAction::UseLocal if all => {
        for (k, v) in local {
          merged.insert(k.clone(), v.clone());
        }
      }
      MergeAction::UseLocal => take_field(&mut merged, local, &rule.field),
      MergeAction::MergeArrays => {
        if let (Some(Value::Array(theirs)), Some(Value::Array(ours))) =
          (server.get(&rule.field), local.get(&rule.field))
        {
          let union = union_dedup(theirs, ours);
          merged.insert(rule.field.clone(), Value::Array(union));
        }
      }
      MergeAction::UserReviewRequired => {
        return Err(Error::UnresolvableConflict(format!(
          "`{}` requires user review",
          rule.field
        )));
      }
    }
  }

  Ok(merged)
}

fn take_field(merged: &mut Map<String, Value>, from: &Map<String, Value>, field: &str) {
  match from.get(field) {
    Some(v) => {
      merged.insert(field.to_string(), v.clone());
    }
    None => {
      merged.remove(field);
    }
  }
}

/// Elements of `first` then `second`, keeping only the first occurrence of each.
fn union_dedup(first: &[Value], second: &[Value]) -> Vec<Value> {
  let mut out: Vec<Value> = Vec::with_capacity(first.len() + second.len());
  for v in first.iter().chain(second) {
    if !out.contains(v) {
      out.push(v.clone());
    }
  }
  out
}
