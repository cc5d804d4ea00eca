//! Optimistic-concurrency conflict detection and resolution.
//!
//! Before a write is committed the detector compares local data with the
//! remote's timestamp, version and active-editor signals and validates it.
//! The resolver then applies whichever resolution was chosen, either the
//! deterministic plan for the operation type or the user's pick.

mod detector;
mod merge;
mod resolver;
mod types;
pub mod validation;

pub use detector::{plan_for, ConflictDetector};
pub use merge::merge_fields;
pub use resolver::ConflictResolver;
pub use types::{
  resolution_options, Conflict, ConflictType, Detection, MergeAction, MergeRule, Resolution,
  ResolutionOption, ResolutionPlan, ResolutionStrategy, ServerSignal, ALL_FIELDS,
};
