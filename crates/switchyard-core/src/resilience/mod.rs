//! Call-level resilience: circuit breakers, per-target rate limits, and the retry
//! executor built on them.

mod breaker;
mod limiter;
mod retry;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakers, CircuitState, Outcome};
pub use limiter::{RateLimit, RateLimitConfig, RateLimiters};
pub use retry::{Attempted, RetryExecutor, RetryPolicy};
