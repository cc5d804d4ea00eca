//! Caching for remote reads with offline-friendly persistence.
//!
//! This module provides:
//! - A two-tier TTL cache (memory + durable store) with lazy expiry
//! - Deterministic keys from operation name + normalized parameters
//! - A cache-first fetch layer that coalesces concurrent misses per key

mod key;
mod layer;
mod result;
mod ttl;

pub use key::{normalize, CacheKey};
pub use layer::CacheLayer;
pub use result::{CacheResult, CacheSource};
pub use ttl::{CacheEntry, TtlCache};
