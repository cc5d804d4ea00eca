//! Retries, circuit breaking and error bookkeeping around remote calls.

mod breaker;
mod history;
mod retry;

pub use breaker::{BreakerState, CircuitBreakers, CircuitState};
pub use history::{ErrorHistory, ErrorRecord};
pub use retry::{backoff_delay, Fallback, RetryExecutor, RetryOptions};
