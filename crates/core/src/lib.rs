pub mod circuit_breaker;
pub mod lifecycle;
pub mod retry;
pub mod time_source;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use history_errors::{ErrorClass, HistoryError, HistoryResult};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use retry::{retry_with_policy, RetryPolicy};
pub use time_source::{ManualTimeSource, RealTimeSource, TimeSource};
