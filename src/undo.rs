//! Bounded stack of undo actions for completed operations.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};

type UndoAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct UndoEntry {
  description: String,
  recorded_at: DateTime<Utc>,
  action: UndoAction,
}

pub struct UndoStack {
  entries: Mutex<VecDeque<UndoEntry>>,
  capacity: usize,
  clock: Arc<dyn Clock>,
}

impl UndoStack {
  pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(VecDeque::with_capacity(capacity)),
      capacity: capacity.max(1),
      clock,
    }
  }

  fn entries(&self) -> MutexGuard<'_, VecDeque<UndoEntry>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Run `operation`; on success remember `undo` under `description`.
  ///
  /// `undo` receives a copy of the operation's result. Only the newest
  /// entries up to capacity are kept.
  pub async fn execute_with_undo<T, Fut, U, UFut>(
    &self,
    operation: Fut,
    undo: U,
    description: impl Into<String>,
  ) -> Result<T>
  where
    T: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T>>,
    U: Fn(T) -> UFut + Send + Sync + 'static,
    UFut: Future<Output = Result<()>> + Send + 'static,
  {
    let value = operation.await?;
    let captured = value.clone();
    let action: UndoAction = Arc::new(move || undo(captured.clone()).boxed());
    self.push(UndoEntry {
      description: description.into(),
      recorded_at: self.clock.now(),
      action,
    });
    Ok(value)
  }

  fn push(&self, entry: UndoEntry) {
    let mut entries = self.entries();
    entries.push_back(entry);
    while entries.len() > self.capacity {
      entries.pop_front();
    }
  }

  /// Undo the newest operation and return its description.
  ///
  /// If the undo itself fails the entry goes back on the stack.
  pub async fn undo_last(&self) -> Result<String> {
    let entry = self.entries().pop_back().ok_or(Error::NothingToUndo)?;

    match (entry.action)().await {
      Ok(()) => {
        info!(description = %entry.description, "operation undone");
        Ok(entry.description)
      }
      Err(e) => {
        warn!(description = %entry.description, error = %e, "undo failed, keeping it");
        self.push(entry);
        Err(e)
      }
    }
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Description and time of the operation `undo_last` would revert.
  pub fn peek(&self) -> Option<(String, DateTime<Utc>)> {
    self
      .entries()
      .back()
      .map(|e| (e.description.clone(), e.recorded_at))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  fn stack() -> UndoStack {
    UndoStack::new(10, Arc::new(ManualClock::default()))
  }

  #[tokio::test]
  async fn test_undo_runs_newest_first() {
    let stack = stack();
    let undone = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second"] {
      let undone = undone.clone();
      stack
        .execute_with_undo(
          async move { Ok::<_, Error>(name) },
          move |n| {
            let undone = undone.clone();
            async move {
              undone.lock().unwrap().push(n);
              Ok(())
            }
          },
          format!("save {}", name),
        )
        .await
        .unwrap();
    }

    assert_eq!(stack.peek().unwrap().0, "save second");
    assert_eq!(stack.undo_last().await.unwrap(), "save second");
    assert_eq!(stack.undo_last().await.unwrap(), "save first");
    assert_eq!(*undone.lock().unwrap(), vec!["second", "first"]);
    assert!(matches!(stack.undo_last().await, Err(Error::NothingToUndo)));
  }

  #[tokio::test]
  async fn test_failed_operation_is_not_recorded() {
    let stack = stack();
    let result = stack
      .execute_with_undo(
        async { Err::<(), _>(Error::remote("saveEntity", "down")) },
        |_| async { Ok(()) },
        "save",
      )
      .await;
    assert!(result.is_err());
    assert!(stack.is_empty());
  }

  #[tokio::test]
  async fn test_capacity_drops_oldest() {
    let stack = stack();
    for i in 0..12 {
      stack
        .execute_with_undo(async move { Ok::<_, Error>(i) }, |_| async { Ok(()) }, format!("op {}", i))
        .await
        .unwrap();
    }
    assert_eq!(stack.len(), 10);
    assert_eq!(stack.peek().unwrap().0, "op 11");
  }

  #[tokio::test]
  async fn test_failed_undo_is_kept() {
    let stack = stack();
    let fail = Arc::new(AtomicBool::new(true));
    let attempts = Arc::new(AtomicU32::new(0));
    let (f, a) = (fail.clone(), attempts.clone());
    stack
      .execute_with_undo(
        async { Ok::<_, Error>(()) },
        move |_| {
          a.fetch_add(1, Ordering::SeqCst);
          let failing = f.load(Ordering::SeqCst);
          async move {
            if failing {
              Err(Error::remote("deleteSession", "down"))
            } else {
              Ok(())
            }
          }
        },
        "delete session",
      )
      .await
      .unwrap();

    assert!(stack.undo_last().await.is_err());
    assert_eq!(stack.len(), 1);

    fail.store(false, Ordering::SeqCst);
    assert_eq!(stack.undo_last().await.unwrap(), "delete session");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
  }
}
