//! The three independent request policies: rate limiting, failure
//! classification with retry policy, and per-portfolio circuit breaking.

pub mod circuit_breaker;
pub mod classifier;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBoard, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classifier::{classify, ErrorClass, FailureKind};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
