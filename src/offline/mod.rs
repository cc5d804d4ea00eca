//! Offline write queue with ordered replay.

mod queue;

pub use queue::{ChangeKind, DrainReport, OfflineQueue, PendingChange};
