//! Resilience building blocks.
//!
//! This module provides:
//! - Circuit breaker per dependency, failing fast while it is unhealthy
//! - Bounded retry with exponential backoff
//! - Fallback providers for degraded calls
//! - Durable offline queue for deferred mutating actions

mod circuit_breaker;
mod fallback;
mod offline_queue;
pub mod retry;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fallback::{DegradeReason, FallbackRegistry};
pub use offline_queue::{
    ActionReplayer, DrainReport, OfflineAction, OfflineQueue, PendingAction, QueueError,
};
pub use retry::{RetryError, RetryPolicy};
