//! Resilience primitives wrapped around every protected call.
//!
//! - [`rate_limiter`]: per-minute, per-day and min-delay admission with a priority queue
//! - [`circuit_breaker`]: fail fast while an upstream is unhealthy
//! - [`retry`]: exponential backoff used by startup and the quota path

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitSnapshot, CircuitState,
    CircuitTransition, TransitionHook,
};
pub use rate_limiter::{Admission, AdmissionReason, RateLimitConfig, RateLimiter, RateLimiterUsage};
pub use retry::{retry, retry_if, RetryConfig};
