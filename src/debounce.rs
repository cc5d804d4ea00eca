//! Debouncing for bursts of user input.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Lets only the last caller of a burst proceed.
///
/// Each call to [`settle`](Debouncer::settle) takes a fresh token and waits out
/// the delay; it proceeds only if no newer call arrived meanwhile. The token
/// also lets callers discard results that were superseded while in flight.
pub struct Debouncer {
  delay: Duration,
  latest: AtomicU64,
}

impl Debouncer {
  pub fn new(delay: Duration) -> Self {
    Self {
      delay,
      latest: AtomicU64::new(0),
    }
  }

  pub async fn settle(&self) -> Option<u64> {
    let token = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(self.delay).await;
    self.is_current(token).then_some(token)
  }

  pub fn is_current(&self, token: u64) -> bool {
    self.latest.load(Ordering::SeqCst) == token
  }
}

type Job = BoxFuture<'static, ()>;

struct Scheduled {
  timer: JoinHandle<()>,
  job: Arc<Mutex<Option<Job>>>,
}

/// A single delayed job that is replaced when rescheduled.
///
/// A job that already started is left to finish; only waiting jobs are
/// replaced or cancelled.
pub struct DebouncedTask {
  delay: Duration,
  scheduled: Mutex<Option<Scheduled>>,
}

impl DebouncedTask {
  pub fn new(delay: Duration) -> Self {
    Self {
      delay,
      scheduled: Mutex::new(None),
    }
  }

  /// Run `job` after the delay unless it is replaced first.
  pub fn schedule<F>(&self, job: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let mut scheduled = self.scheduled.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = scheduled.take() {
      discard(previous);
    }

    let slot: Arc<Mutex<Option<Job>>> = Arc::new(Mutex::new(Some(job.boxed())));
    let delay = self.delay;
    let timer = {
      let slot = Arc::clone(&slot);
      tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let job = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(job) = job {
          job.await;
        }
      })
    };
    *scheduled = Some(Scheduled { timer, job: slot });
  }

  /// Run the waiting job now, if any.
  pub async fn flush(&self) {
    let scheduled = self.scheduled.lock().unwrap_or_else(|e| e.into_inner()).take();
    let Some(scheduled) = scheduled else {
      return;
    };
    let job = scheduled.job.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(job) = job {
      scheduled.timer.abort();
      debug!("flushing debounced job");
      job.await;
    }
  }

  /// Drop the waiting job without running it.
  pub fn cancel(&self) {
    if let Some(scheduled) = self.scheduled.lock().unwrap_or_else(|e| e.into_inner()).take() {
      discard(scheduled);
    }
  }

  pub fn is_pending(&self) -> bool {
    self
      .scheduled
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .as_ref()
      .is_some_and(|s| s.job.lock().unwrap_or_else(|e| e.into_inner()).is_some())
  }
}

/// Drop a scheduled job that has not started yet.
fn discard(scheduled: Scheduled) {
  let waiting = scheduled
    .job
    .lock()
    .unwrap_or_else(|e| e.into_inner())
    .take()
    .is_some();
  if waiting {
    scheduled.timer.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;

  #[tokio::test(start_paused = true)]
  async fn test_only_last_search_in_burst_runs() {
    let debouncer = Debouncer::new(Duration::from_millis(300));
    let first = async { debouncer.settle().await.map(|_| "al") };
    let second = async {
      tokio::time::sleep(Duration::from_millis(100)).await;
      debouncer.settle().await.map(|_| "ali")
    };
    let (a, b) = tokio::join!(first, second);
    assert_eq!(a, None);
    assert_eq!(b, Some("ali"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_superseded_token_is_not_current() {
    let debouncer = Debouncer::new(Duration::from_millis(300));
    let token = debouncer.settle().await.unwrap();
    assert!(debouncer.is_current(token));
    debouncer.settle().await;
    assert!(!debouncer.is_current(token));
  }

  #[tokio::test(start_paused = true)]
  async fn test_rescheduling_keeps_only_last_job() {
    let task = DebouncedTask::new(Duration::from_secs(2));
    let saved = Arc::new(Mutex::new(Vec::new()));

    for text in ["d", "dr", "draft"] {
      let saved = saved.clone();
      task.schedule(async move {
        saved.lock().unwrap().push(text);
      });
      tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(task.is_pending());
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(*saved.lock().unwrap(), vec!["draft"]);
    assert!(!task.is_pending());
  }

  #[tokio::test(start_paused = true)]
  async fn test_flush_runs_immediately_once() {
    let task = DebouncedTask::new(Duration::from_secs(2));
    let runs = Arc::new(AtomicU32::new(0));
    let r = runs.clone();
    task.schedule(async move {
      r.fetch_add(1, Ordering::SeqCst);
    });

    task.flush().await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    // Nothing left to flush
    task.flush().await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_drops_job() {
    let task = DebouncedTask::new(Duration::from_secs(2));
    let runs = Arc::new(AtomicU32::new(0));
    let r = runs.clone();
    task.schedule(async move {
      r.fetch_add(1, Ordering::SeqCst);
    });
    task.cancel();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
  }
}
