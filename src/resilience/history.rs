//! Rolling history of recent errors, with best-effort remote reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::clock::Clock;
use crate::error::Error;
use crate::gateway::{ops, RpcGateway};

/// Window in which repeated messages count as "similar".
const SIMILAR_WINDOW_MINUTES: i64 = 5;

/// Messages containing any of these are always reported.
const CRITICAL_KEYWORDS: &[&str] = &[
  "permission denied",
  "quota exceeded",
  "service unavailable",
  "network error",
  "data corruption",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
  pub message: String,
  pub context: Option<String>,
  pub timestamp: DateTime<Utc>,
}

pub struct ErrorHistory {
  records: Mutex<VecDeque<ErrorRecord>>,
  capacity: usize,
  clock: Arc<dyn Clock>,
  reporter: Option<Arc<dyn RpcGateway>>,
}

impl ErrorHistory {
  pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
    Self {
      records: Mutex::new(VecDeque::with_capacity(capacity)),
      capacity: capacity.max(1),
      clock,
      reporter: None,
    }
  }

  /// Send reportable errors to the remote `reportError` operation.
  pub fn with_reporter(mut self, gateway: Arc<dyn RpcGateway>) -> Self {
    self.reporter = Some(gateway);
    self
  }

  /// Append an error, evicting the oldest past capacity.
  pub fn record(&self, error: &Error, context: Option<&str>) -> ErrorRecord {
    let record = ErrorRecord {
      message: error.to_string(),
      context: context.map(String::from),
      timestamp: self.clock.now(),
    };

    let report = {
      let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
      records.push_back(record.clone());
      while records.len() > self.capacity {
        records.pop_front();
      }
      self.should_report_locked(&records, &record)
    };

    if report {
      self.report(record.clone());
    }
    record
  }

  /// Report first occurrences, every 10th repeat, and critical errors.
  pub fn should_report(&self, record: &ErrorRecord) -> bool {
    let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
    self.should_report_locked(&records, record)
  }

  fn should_report_locked(&self, records: &VecDeque<ErrorRecord>, record: &ErrorRecord) -> bool {
    let window = chrono::Duration::minutes(SIMILAR_WINDOW_MINUTES);
    let now = self.clock.now();
    let recent_similar = records
      .iter()
      .filter(|r| r.message == record.message && now - r.timestamp < window)
      .count();

    recent_similar == 1 || (recent_similar > 0 && recent_similar % 10 == 0) || is_critical(record)
  }

  fn report(&self, record: ErrorRecord) {
    let Some(gateway) = self.reporter.clone() else {
      return;
    };
    // Reporting is fire-and-forget and must never affect the caller
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      handle.spawn(async move {
        if let Err(e) = gateway.call(ops::REPORT_ERROR, vec![json!(record)]).await {
          warn!(error = %e, "failed to report error");
        }
      });
    }
  }

  pub fn recent(&self) -> Vec<ErrorRecord> {
    self
      .records
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .cloned()
      .collect()
  }

  pub fn len(&self) -> usize {
    self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn is_critical(record: &ErrorRecord) -> bool {
  let message = record.message.to_lowercase();
  CRITICAL_KEYWORDS.iter().any(|k| message.contains(k))
}
