pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use retry::retry_with_backoff;
