//! Offline-tolerant client core for a tutoring client-management tool.
//!
//! Everything is reached through [`CoreContext`], which wires the cache,
//! retry and circuit breaking, the offline queue, conflict handling and
//! connectivity tracking around a single [`gateway::RpcGateway`].

pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod context;
pub mod debounce;
pub mod error;
pub mod events;
pub mod gateway;
pub mod model;
pub mod offline;
pub mod resilience;
pub mod store;
pub mod undo;

#[cfg(test)]
mod testing;

pub use context::{CoreContext, MaintenanceReport, SaveOutcome};
pub use error::{Error, Result};
