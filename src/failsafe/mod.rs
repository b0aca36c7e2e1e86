//! Failsafe mechanisms: circuit breaker, rolling window, retry, fallback and registry

mod circuit_breaker;
mod fallback;
mod registry;
mod retry;
pub mod window;

pub use circuit_breaker::{Admission, BreakerSnapshot, BreakerState, CircuitBreaker, Permit, PermitGuard};
pub use fallback::{Fallback, FallbackContext, FallbackStrategy, FnFallback, fallback_fn};
pub use registry::{CircuitBreakerRegistry, HealthReport, HealthStatus};
pub use retry::{RetryExecutor, RetryPolicy};
pub use window::{Outcome, RollingWindow, WindowCounts};
