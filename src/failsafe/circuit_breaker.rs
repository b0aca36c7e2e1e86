//! Circuit breaker state machine
//!
//! A breaker starts closed and opens once the failure rate over its rolling
//! window reaches the threshold. After `open_state_duration` the next call is
//! let through as a probe and the breaker goes half-open. A bounded number of
//! concurrent probes decide whether it closes again or reopens.
//!
//! All decisions happen under one short-lived mutex per breaker. The protected
//! operation itself never runs under that lock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::FallbackStrategy;
use super::window::{Outcome, RollingWindow};
use crate::Result;
use crate::config::BreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected
    Open,
    /// A limited number of probe calls test recovery
    HalfOpen,
}

impl BreakerState {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    #[must_use]
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket for an admitted call, handed back to [`CircuitBreaker::record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
    probe: bool,
    state: BreakerState,
}

impl Permit {
    /// Whether this call holds a half-open probe slot
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// State the call was admitted under
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }
}

/// Admitted call that hands its probe slot back if dropped unrecorded
///
/// A call future cancelled mid-flight never reaches [`PermitGuard::record`];
/// dropping the guard then releases the slot through
/// [`CircuitBreaker::release`].
#[must_use = "dropping the guard releases the permit without recording an outcome"]
#[derive(Debug)]
pub struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
}

impl PermitGuard<'_> {
    /// Whether this call holds a half-open probe slot
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.permit.is_some_and(|p| p.probe)
    }

    /// Record the outcome and consume the guard
    pub fn record(mut self, outcome: Outcome, now: Instant) -> BreakerState {
        match self.permit.take() {
            Some(permit) => self.breaker.record(permit, outcome, now),
            None => self.breaker.state(),
        }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            trace!(breaker = %self.breaker.name, probe = permit.probe, "Permit dropped without an outcome");
            self.breaker.release(permit);
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the call, then report its outcome with the permit
    Allowed(Permit),
    /// Do not run the call
    Rejected(BreakerState),
}

impl Admission {
    /// Whether the call may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: BreakerState,
    /// Lifetime successful calls
    pub successes_total: u64,
    /// Lifetime failed calls
    pub failures_total: u64,
    /// Lifetime timed-out calls
    pub timeouts_total: u64,
    /// Lifetime rejected admissions
    pub rejections_total: u64,
    /// Samples in the rolling window
    pub current_window_count: usize,
    /// Failure rate over the window, absent below minimum throughput
    pub current_failure_rate: Option<f64>,
    /// Probe calls currently running
    pub in_flight_probes: usize,
    /// When the current state was entered
    pub state_changed_at: DateTime<Utc>,
    /// Configured fallback behavior
    pub fallback_strategy: FallbackStrategy,
}

/// Last successful response, kept for the cached fallback
#[derive(Debug, Clone)]
struct CachedResponse {
    value: Value,
    at: DateTime<Utc>,
}

struct Inner {
    config: Arc<BreakerConfig>,
    state: BreakerState,
    changed_at: Instant,
    changed_at_wall: DateTime<Utc>,
    window: RollingWindow,
    in_flight_probes: usize,
    /// Bumped on every transition and reset; permits from older generations
    /// no longer affect the window or the probe count
    generation: u64,
}

/// Circuit breaker guarding one dependency
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
    successes_total: AtomicU64,
    failures_total: AtomicU64,
    timeouts_total: AtomicU64,
    rejections_total: AtomicU64,
    last_success: RwLock<Option<CachedResponse>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the config has out-of-range values.
    pub fn new(config: BreakerConfig) -> Result<Self> {
        config.validate()?;
        let window = RollingWindow::new(config.rolling_window, config.minimum_throughput);
        let name = config.name.clone();
        let breaker = Self {
            name,
            inner: Mutex::new(Inner {
                config: Arc::new(config),
                state: BreakerState::Closed,
                changed_at: Instant::now(),
                changed_at_wall: Utc::now(),
                window,
                in_flight_probes: 0,
                generation: 0,
            }),
            successes_total: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            rejections_total: AtomicU64::new(0),
            last_success: RwLock::new(None),
        };
        breaker.publish_state(BreakerState::Closed);
        Ok(breaker)
    }

    /// Breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> Arc<BreakerConfig> {
        Arc::clone(&self.inner.lock().config)
    }

    /// Current state
    ///
    /// An open breaker whose timer has elapsed still reports `Open` until the
    /// next admission check moves it to half-open.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Probe calls currently running
    #[must_use]
    pub fn in_flight_probes(&self) -> usize {
        self.inner.lock().in_flight_probes
    }

    /// Admission check at the current time
    pub fn try_acquire(&self) -> Admission {
        self.allow(Instant::now())
    }

    /// Admission check
    #[tracing::instrument(level = "trace", skip(self, now), fields(breaker = %self.name))]
    pub fn allow(&self, now: Instant) -> Admission {
        let mut inner = self.inner.lock();
        let state = inner.state;

        match state {
            BreakerState::Closed => {
                trace!("Circuit closed, allowing call");
                Admission::Allowed(Permit {
                    generation: inner.generation,
                    probe: false,
                    state: BreakerState::Closed,
                })
            }
            BreakerState::Open => {
                let elapsed = now.saturating_duration_since(inner.changed_at);
                if elapsed >= inner.config.open_state_duration {
                    self.transition(&mut inner, BreakerState::HalfOpen, now);
                    inner.in_flight_probes = 1;
                    Admission::Allowed(Permit {
                        generation: inner.generation,
                        probe: true,
                        state: BreakerState::HalfOpen,
                    })
                } else {
                    drop(inner);
                    self.reject(BreakerState::Open)
                }
            }
            BreakerState::HalfOpen => {
                if inner.in_flight_probes < inner.config.half_open_max_in_flight {
                    inner.in_flight_probes += 1;
                    debug!(in_flight = inner.in_flight_probes, "Circuit half-open, admitting probe");
                    Admission::Allowed(Permit {
                        generation: inner.generation,
                        probe: true,
                        state: BreakerState::HalfOpen,
                    })
                } else {
                    drop(inner);
                    self.reject(BreakerState::HalfOpen)
                }
            }
        }
    }

    /// Whether [`CircuitBreaker::allow`] at `now` would admit a call
    ///
    /// Takes no slot and moves no state.
    #[must_use]
    pub fn would_admit(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                now.saturating_duration_since(inner.changed_at) >= inner.config.open_state_duration
            }
            BreakerState::HalfOpen => inner.in_flight_probes < inner.config.half_open_max_in_flight,
        }
    }

    /// Wrap an admitted permit so it is released if the call is abandoned
    pub fn guard(&self, permit: Permit) -> PermitGuard<'_> {
        PermitGuard {
            breaker: self,
            permit: Some(permit),
        }
    }

    /// Record the outcome of an admitted call, returning the state afterwards
    ///
    /// Lifetime totals always count the outcome. If the breaker changed state
    /// or was reset since the call was admitted, the outcome no longer feeds
    /// the window.
    #[tracing::instrument(level = "trace", skip(self, permit, now), fields(breaker = %self.name))]
    pub fn record(&self, permit: Permit, outcome: Outcome, now: Instant) -> BreakerState {
        let total = match outcome {
            Outcome::Success => &self.successes_total,
            Outcome::Failure => &self.failures_total,
            Outcome::Timeout => &self.timeouts_total,
        };
        total.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!(
            "circuit_breaker_calls_total",
            "breaker" => self.name.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        let mut inner = self.inner.lock();

        if permit.generation != inner.generation {
            trace!(outcome = outcome.as_str(), "Outcome from an earlier state, window unchanged");
            return inner.state;
        }

        if permit.probe {
            inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
        }
        inner.window.record(outcome, now);

        let state = inner.state;
        match state {
            BreakerState::Closed => {
                if let Some(rate) = inner.window.failure_rate(now) {
                    if rate >= inner.config.failure_rate_threshold {
                        warn!(
                            breaker = %self.name,
                            failure_rate = rate,
                            threshold = inner.config.failure_rate_threshold,
                            "Failure rate over threshold"
                        );
                        self.transition(&mut inner, BreakerState::Open, now);
                    }
                } else if outcome.is_failure() {
                    trace!(
                        samples = inner.window.count(now),
                        minimum = inner.config.minimum_throughput,
                        "Failure below minimum throughput"
                    );
                }
            }
            BreakerState::HalfOpen => {
                let counts = inner.window.counts(now);
                let total = counts.total();
                if total > 0 && total >= inner.config.minimum_throughput {
                    #[allow(clippy::cast_precision_loss)]
                    let quorum_met = counts.successes as f64 * 100.0
                        >= inner.config.success_quorum_percent * total as f64;
                    debug!(
                        successes = counts.successes,
                        probes = total,
                        quorum = inner.config.success_quorum_percent,
                        quorum_met,
                        "Probation complete"
                    );
                    let next = if quorum_met {
                        BreakerState::Closed
                    } else {
                        BreakerState::Open
                    };
                    self.transition(&mut inner, next, now);
                } else if outcome.is_failure() {
                    warn!(breaker = %self.name, outcome = outcome.as_str(), "Probe failed, reopening circuit");
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::Open => {
                trace!("Outcome recorded while open (ignored)");
            }
        }

        inner.state
    }

    /// Hand back a probe slot without recording an outcome
    ///
    /// For callers that were admitted but never ran the call.
    pub fn release(&self, permit: Permit) {
        if !permit.probe {
            return;
        }
        let mut inner = self.inner.lock();
        if permit.generation == inner.generation {
            inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
        }
    }

    /// Force the breaker closed and clear the window
    ///
    /// A soft reset keeps lifetime totals and the cached response; a hard
    /// reset zeroes both.
    pub fn reset(&self, hard: bool) {
        let now = Instant::now();
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            Self::enter(&mut inner, BreakerState::Closed, now);
            previous
        };

        if hard {
            self.successes_total.store(0, Ordering::Relaxed);
            self.failures_total.store(0, Ordering::Relaxed);
            self.timeouts_total.store(0, Ordering::Relaxed);
            self.rejections_total.store(0, Ordering::Relaxed);
            *self.last_success.write() = None;
        }

        self.publish_state(BreakerState::Closed);
        info!(breaker = %self.name, from = %previous, hard, "Circuit breaker reset");
    }

    /// Replace the configuration and soft-reset
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the new config is invalid; the
    /// breaker is left untouched in that case.
    pub fn reconfigure(&self, config: BreakerConfig) -> Result<()> {
        config.validate()?;
        {
            let mut inner = self.inner.lock();
            inner
                .window
                .reconfigure(config.rolling_window, config.minimum_throughput);
            inner.config = Arc::new(BreakerConfig {
                name: self.name.clone(),
                ..config
            });
        }
        info!(breaker = %self.name, "Circuit breaker reconfigured");
        self.reset(false);
        Ok(())
    }

    /// Remember a successful response for the cached fallback
    pub fn remember_success(&self, value: Value) {
        *self.last_success.write() = Some(CachedResponse {
            value,
            at: Utc::now(),
        });
    }

    /// Last successful response, if any
    #[must_use]
    pub fn cached_response(&self) -> Option<Value> {
        self.last_success.read().as_ref().map(|c| c.value.clone())
    }

    /// When the cached response was recorded
    #[must_use]
    pub fn cached_at(&self) -> Option<DateTime<Utc>> {
        self.last_success.read().as_ref().map(|c| c.at)
    }

    /// Metrics view at `now`; never changes breaker state
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        let (state, window_count, failure_rate, probes, changed_at, strategy) = {
            let inner = self.inner.lock();
            (
                inner.state,
                inner.window.count(now),
                inner.window.failure_rate(now),
                inner.in_flight_probes,
                inner.changed_at_wall,
                inner.config.fallback_strategy,
            )
        };

        BreakerSnapshot {
            name: self.name.clone(),
            state,
            successes_total: self.successes_total.load(Ordering::Relaxed),
            failures_total: self.failures_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            rejections_total: self.rejections_total.load(Ordering::Relaxed),
            current_window_count: window_count,
            current_failure_rate: failure_rate,
            in_flight_probes: probes,
            state_changed_at: changed_at,
            fallback_strategy: strategy,
        }
    }

    /// Time until an open breaker admits a probe
    #[must_use]
    pub fn retry_after(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock();
        (inner.state == BreakerState::Open).then(|| {
            inner
                .config
                .open_state_duration
                .saturating_sub(now.saturating_duration_since(inner.changed_at))
        })
    }

    /// One-line human-readable status
    #[must_use]
    pub fn status_message(&self, now: Instant) -> String {
        match self.state() {
            BreakerState::Closed => format!("Circuit breaker '{}' is closed", self.name),
            BreakerState::HalfOpen => format!(
                "Circuit breaker '{}' is half-open, testing recovery ({} probes in flight)",
                self.name,
                self.in_flight_probes()
            ),
            BreakerState::Open => {
                let wait = self.retry_after(now).unwrap_or_default();
                format!(
                    "Circuit breaker '{}' is open, calls are rejected (retry in {} seconds)",
                    self.name,
                    wait.as_secs().max(1)
                )
            }
        }
    }

    fn reject(&self, state: BreakerState) -> Admission {
        self.rejections_total.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!("circuit_breaker_rejections_total", "breaker" => self.name.clone())
            .increment(1);
        debug!(breaker = %self.name, %state, "Call rejected");
        Admission::Rejected(state)
    }

    /// Move to `to` under the held lock, logging and publishing the change
    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        Self::enter(inner, to, now);

        match to {
            BreakerState::Open => warn!(
                breaker = %self.name,
                from = %from,
                open_for_secs = inner.config.open_state_duration.as_secs_f64(),
                "Circuit breaker opened"
            ),
            BreakerState::Closed => info!(breaker = %self.name, from = %from, "Circuit breaker closed"),
            BreakerState::HalfOpen => debug!(breaker = %self.name, "Circuit breaker half-open"),
        }
        telemetry_metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
        self.publish_state(to);
    }

    fn enter(inner: &mut Inner, to: BreakerState, now: Instant) {
        inner.state = to;
        inner.changed_at = now;
        inner.changed_at_wall = Utc::now();
        inner.window.clear();
        inner.in_flight_probes = 0;
        inner.generation = inner.generation.wrapping_add(1);
    }

    fn publish_state(&self, state: BreakerState) {
        telemetry_metrics::gauge!("circuit_breaker_state", "breaker" => self.name.clone())
            .set(state.gauge_value());
    }
}
