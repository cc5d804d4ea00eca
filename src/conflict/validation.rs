//! Per-entity data integrity rules.

use regex::Regex;
use std::sync::LazyLock;

use crate::model::{EntityType, Payload};

/// Longest notes body accepted, in characters.
pub const MAX_NOTES_CHARS: usize = 10_000;

static EMAIL: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid"));

pub struct ValidationRule {
  pub name: &'static str,
  pub message: &'static str,
  check: fn(&Payload) -> bool,
}

impl ValidationRule {
  pub fn check(&self, payload: &Payload) -> bool {
    (self.check)(payload)
  }
}

static CLIENT_RULES: [ValidationRule; 2] = [
  ValidationRule {
    name: "required_name",
    message: "Client name is required",
    check: |p| match p {
      Payload::Client(c) => !c.name.trim().is_empty(),
      _ => true,
    },
  },
  ValidationRule {
    name: "valid_email",
    message: "Invalid email format",
    check: |p| match p {
      Payload::Client(c) => c.email.as_deref().map_or(true, |e| e.is_empty() || EMAIL.is_match(e)),
      _ => true,
    },
  },
];

static NOTES_RULES: [ValidationRule; 1] = [ValidationRule {
  name: "max_length",
  message: "Notes content too long",
  check: |p| match p {
    Payload::Notes(n) => n.content.chars().count() <= MAX_NOTES_CHARS,
    _ => true,
  },
}];

pub fn rules_for(entity_type: EntityType) -> &'static [ValidationRule] {
  match entity_type {
    EntityType::Client => &CLIENT_RULES,
    EntityType::Notes => &NOTES_RULES,
    EntityType::Preferences | EntityType::SystemSettings => &[],
  }
}

/// First rule `payload` breaks, if any.
pub fn first_violation(entity_type: EntityType, payload: &Payload) -> Option<&'static ValidationRule> {
  rules_for(entity_type).iter().find(|rule| !rule.check(payload))
}
