//! Protective machinery around every engine call: bounded retries with
//! backoff, a dual-threshold circuit breaker, sliding-window admission
//! control, and a cache of known-terminal failures.

pub mod breaker;
pub mod error_cache;
pub mod rate_limit;
pub mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use error_cache::{CachedError, ErrorCache};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{execute_with_retry, RetryOutcome, RetryPolicy};
