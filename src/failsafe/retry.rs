//! Guarded execution with timeout, retries and exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, trace};

use super::circuit_breaker::{Admission, CircuitBreaker};
use super::fallback::{Fallback, FallbackContext};
use super::window::Outcome;
use crate::config::BreakerConfig;
use crate::error::CallError;

/// Retry policy derived from a breaker's configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Deadline for each attempt
    pub call_timeout: Duration,
    /// First delay
    pub backoff_base: Duration,
    /// Delay multiplier per attempt
    pub backoff_factor: f64,
    /// Ceiling for a single delay
    pub backoff_max: Duration,
    /// Random perturbation of each delay (0.0–1.0)
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            call_timeout: config.call_timeout,
            backoff_base: config.backoff_base,
            backoff_factor: config.backoff_factor,
            backoff_max: config.backoff_max,
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Create the un-jittered backoff schedule, one delay per retry
    #[must_use]
    pub fn create_backoff(&self) -> ExponentialBackoff {
        #[allow(clippy::cast_possible_truncation)]
        let factor = self.backoff_factor as f32;
        ExponentialBuilder::default()
            .with_min_delay(self.backoff_base)
            .with_factor(factor)
            .with_max_delay(self.backoff_max)
            .with_max_times(usize::try_from(self.max_retries).unwrap_or(usize::MAX))
            .build()
    }

    /// Perturb a scheduled delay by up to ±`jitter_ratio`, within `backoff_max`
    pub fn jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        let base = round_to_micros(delay).min(self.backoff_max);
        if self.jitter_ratio <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rng.random_range(-self.jitter_ratio..=self.jitter_ratio);
        base.mul_f64(1.0 + spread).min(self.backoff_max)
    }
}

/// backon grows delays in `f32`; drop the drift below a microsecond
fn round_to_micros(delay: Duration) -> Duration {
    let micros = (delay.as_nanos() + 500) / 1_000;
    Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
}

/// Runs operations through a breaker
///
/// Admission, timeout, outcome recording, retries and the fallback are all
/// handled here; the breaker lock is only taken between attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    /// Create an executor
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run `operation` through `breaker`
    ///
    /// A rejected admission goes straight to the fallback without an attempt.
    /// Each attempt is bounded by the call timeout; failures are retried with
    /// backoff while attempts remain and the breaker keeps admitting. Every
    /// retry is admitted after its backoff sleep, so a breaker that opened
    /// in the meantime stops it. When no result is produced, `fallback` (or
    /// the breaker's configured strategy) decides what the caller gets.
    ///
    /// Dropping the returned future mid-attempt hands any half-open probe
    /// slot back to the breaker.
    pub async fn execute<T, E, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        mut operation: F,
        fallback: Option<&dyn Fallback<T, E>>,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
    {
        let config = breaker.config();
        let policy = RetryPolicy::new(&config);
        let mut backoff = policy.create_backoff();

        let mut guard = match breaker.allow(Instant::now()) {
            Admission::Allowed(permit) => breaker.guard(permit),
            Admission::Rejected(state) => {
                let cause = CallError::Rejected {
                    breaker: breaker.name().to_string(),
                    state,
                };
                return Self::fall_back(breaker, &config, fallback, cause);
            }
        };

        let mut attempt = 0u32;
        loop {
            let result = timeout(policy.call_timeout, operation()).await;
            let now = Instant::now();

            let cause = match result {
                Ok(Ok(value)) => {
                    guard.record(Outcome::Success, now);
                    match serde_json::to_value(&value) {
                        Ok(json) => breaker.remember_success(json),
                        Err(e) => trace!(breaker = %breaker.name(), error = %e, "Response not cacheable"),
                    }
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    let state = guard.record(Outcome::Failure, now);
                    CallError::Failed {
                        error,
                        breaker: breaker.name().to_string(),
                        state,
                    }
                }
                Err(_) => {
                    let state = guard.record(Outcome::Timeout, now);
                    debug!(
                        breaker = %breaker.name(),
                        attempt,
                        timeout = ?policy.call_timeout,
                        "Call timed out"
                    );
                    CallError::TimedOut {
                        breaker: breaker.name().to_string(),
                        timeout: policy.call_timeout,
                        state,
                    }
                }
            };

            if attempt >= policy.max_retries {
                debug!(breaker = %breaker.name(), attempts = attempt + 1, "Max retry attempts reached");
                return Self::fall_back(breaker, &config, fallback, cause);
            }

            if !breaker.would_admit(Instant::now()) {
                debug!(
                    breaker = %breaker.name(),
                    state = %breaker.state(),
                    "Breaker stopped admitting, abandoning retries"
                );
                return Self::fall_back(breaker, &config, fallback, cause);
            }

            let Some(delay) = backoff.next().map(|d| policy.jitter(d, &mut rand::rng())) else {
                return Self::fall_back(breaker, &config, fallback, cause);
            };
            debug!(
                breaker = %breaker.name(),
                attempt = attempt + 1,
                delay = ?delay,
                error_kind = ?cause.kind(),
                "Retrying after backoff"
            );
            sleep(delay).await;
            attempt += 1;

            guard = match breaker.allow(Instant::now()) {
                Admission::Allowed(permit) => breaker.guard(permit),
                Admission::Rejected(state) => {
                    debug!(breaker = %breaker.name(), %state, "Breaker opened during backoff, abandoning retries");
                    return Self::fall_back(breaker, &config, fallback, cause);
                }
            };
        }
    }

    fn fall_back<T, E>(
        breaker: &CircuitBreaker,
        config: &BreakerConfig,
        fallback: Option<&dyn Fallback<T, E>>,
        cause: CallError<E>,
    ) -> Result<T, CallError<E>>
    where
        T: DeserializeOwned,
    {
        let strategy = config.fallback_strategy;
        let handler: &dyn Fallback<T, E> = match fallback {
            Some(custom) => custom,
            None => &strategy,
        };

        debug!(
            breaker = %breaker.name(),
            kind = ?cause.kind(),
            call_site_override = fallback.is_some(),
            strategy = strategy.as_str(),
            "Invoking fallback"
        );

        handler.recover(FallbackContext {
            breaker: breaker.name(),
            state: breaker.state(),
            cause,
            cached: breaker.cached_response(),
            placeholder: &config.degraded_response,
        })
    }
}
